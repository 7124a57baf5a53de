//! The interface used to operate on one image.
//!
//! [`ImageInterface`] ties an opened image to its linked state, the
//! planner and the operation context.  Package operations are planned
//! against the constraints the image's parent imposes and, for images
//! with children, are carried out in two phases: every affected child is
//! planned first, and only if all of them can follow does the parent
//! execute, followed by the children.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::context::OpContext;
use crate::errors::{ExitStatus, LinkedError};
use crate::image::{Image, ImageConfig};
use crate::linked::dispatch::{self, ChildJob, ChildResult, Selection};
use crate::linked::inherit::ParentState;
use crate::linked::props::Role;
use crate::linked::request::ChildRequest;
use crate::linked::store::ParentMetadata;
use crate::linked::LinkedImage;
use crate::plan::{self, LinkedPlan, PlanDescription, PlanSummary, Stage};
use crate::planner::{Constraints, PkgOp, PkgPlan, Planner, SimplePlanner};
use crate::varcet::{Facets, Variants, VarcetEntry};
use anyhow::{Context, Result};
use camino::Utf8Path;
use fn_error_context::context;
use serde_derive::Serialize;
use std::collections::BTreeMap;

/// What an operation did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct OpOutcome {
    pub status: ExitStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildResult>,
    /// Free-form report lines, e.g. audit findings.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
}

impl OpOutcome {
    pub fn new(status: ExitStatus) -> Self {
        Self {
            status,
            plan: None,
            children: Vec::new(),
            output: Vec::new(),
        }
    }

    pub(crate) fn with_plan(status: ExitStatus, plan: PlanSummary) -> Self {
        Self {
            plan: Some(plan),
            ..Self::new(status)
        }
    }

    /// The outcome of fanning out to children.
    pub(crate) fn from_children(children: Vec<ChildResult>) -> Self {
        Self {
            status: dispatch::reduce(&children),
            children,
            ..Self::new(ExitStatus::Nop)
        }
    }

    pub fn canceled(&self) -> bool {
        self.children.iter().any(|c| c.canceled)
    }
}

/// Options for package operations.
#[derive(Debug, Clone)]
pub struct PkgOpOptions {
    pub stage: Stage,
    pub noexecute: bool,
    /// Children the operation itself is run in.
    pub recurse: Selection,
    /// Children which are synced to the new parent state; explicitly
    /// recursed children are left out of this.
    pub implicit: Selection,
    pub no_parent_sync: bool,
    pub ignore_unknown: bool,
}

impl Default for PkgOpOptions {
    fn default() -> Self {
        Self {
            stage: Stage::Default,
            noexecute: false,
            recurse: Selection::None,
            implicit: Selection::All,
            no_parent_sync: false,
            ignore_unknown: false,
        }
    }
}

#[derive(Debug)]
pub struct ImageInterface {
    pub(crate) img: Image,
    pub(crate) li: LinkedImage,
    pub(crate) ctx: OpContext,
    planner: Box<dyn Planner>,
}

/// Create a new image.
pub fn image_create(root: &Utf8Path, cfg: ImageConfig) -> Result<()> {
    Image::create(root, cfg)?;
    Ok(())
}

impl ImageInterface {
    #[context("Opening image {root}")]
    pub fn open(ctx: &OpContext, root: &Utf8Path) -> Result<Self> {
        let img = Image::open(root)?;
        let li = LinkedImage::load(&img)?;
        Ok(Self {
            img,
            li,
            ctx: ctx.clone(),
            planner: Box::new(SimplePlanner),
        })
    }

    pub fn with_planner(mut self, planner: Box<dyn Planner>) -> Self {
        self.planner = planner;
        self
    }

    pub fn img(&self) -> &Image {
        &self.img
    }

    pub fn linked(&self) -> &LinkedImage {
        &self.li
    }

    pub(crate) fn lock(&mut self) -> Result<()> {
        self.img.lock()
    }

    /// Effective facets and variants given new local values.
    fn effective_varcets(
        &self,
        local_facets: Option<&BTreeMap<String, bool>>,
        local_variants: Option<&BTreeMap<String, String>>,
        inherit: bool,
    ) -> Result<(Facets, Variants)> {
        let pmd = self.li.parent_md().filter(|_| inherit);
        let facets = Facets::new(
            local_facets.unwrap_or(&self.img.cfg.facets).clone(),
            pmd.map(|p| p.pvarcets.facets.clone()).unwrap_or_default(),
        )?;
        let variants = Variants::new(
            local_variants.unwrap_or(&self.img.cfg.variants).clone(),
            pmd.map(|p| p.pvarcets.variants.clone()).unwrap_or_default(),
        )?;
        Ok((facets, variants))
    }

    pub fn facets(&self) -> Result<Vec<VarcetEntry<bool>>> {
        Ok(self.li.facets(&self.img)?.entries())
    }

    pub fn variants(&self) -> Result<Vec<VarcetEntry<String>>> {
        Ok(self.li.variants(&self.img)?.entries())
    }

    /// The snapshot of this image handed to its children.
    pub fn parent_metadata(&self) -> Result<ParentMetadata> {
        let (facets, variants) = self.effective_varcets(None, None, true)?;
        Ok(ParentState {
            img: &self.img,
            installed: self.img.installed(),
            facets: &facets,
            variants: &variants,
        }
        .parent_metadata())
    }

    /// The snapshot this image will hand to its children once `plan` is
    /// executed.
    fn planned_parent_metadata(&self, plan: &PlanDescription) -> Result<ParentMetadata> {
        let (facets, variants) = self.effective_varcets(
            plan.new_facets.as_ref(),
            plan.new_variants.as_ref(),
            plan.linked.pmd.is_some(),
        )?;
        Ok(ParentState {
            img: &self.img,
            installed: &plan.pkgs.new_installed,
            facets: &facets,
            variants: &variants,
        }
        .parent_metadata())
    }

    /// Read the parent's current state; only the in-memory snapshot is
    /// updated.
    pub(crate) fn refresh_parent(&mut self) -> Result<()> {
        let ppath = self
            .li
            .parent_path()
            .map(|p| p.to_string())
            .ok_or(LinkedError::NoParent)?;
        tracing::debug!("Refreshing parent state from {ppath}");
        let parent = ImageInterface::open(&self.ctx, Utf8Path::new(&ppath))
            .context("Reading parent image")?;
        let pmd = parent.parent_metadata()?;
        self.li.set_parent_md(Some(pmd));
        Ok(())
    }

    /// Install holds in force.  For a linked child, holds on packages
    /// which depend on the parent are relaxed; all others stay.
    fn holds(&self, facets: &Facets, variants: &Variants, relax: bool) -> BTreeMap<String, String> {
        let img = &self.img;
        img.cfg
            .install_holds
            .iter()
            .filter(|(stem, _)| {
                if !relax {
                    return true;
                }
                let m = match img.installed_stem(stem) {
                    Some(f) => Some(img.manifest(f)),
                    None => img.catalog().versions_of(stem).last().map(|m| (*m).clone()),
                };
                let constrained = m.is_some_and(|m| {
                    m.depends
                        .iter()
                        .any(|d| d.is_parent_self() && facets.allows(d) && variants.allows(d))
                });
                if constrained {
                    tracing::debug!("Relaxing install hold on {stem}");
                }
                !constrained
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    /// Constraints for `op` given the in-memory linked state.
    pub fn constraints(&self, op: &PkgOp) -> Result<Constraints> {
        let linked = self.li.is_child() && !matches!(op, PkgOp::Detach);
        let (new_facets, new_variants) = new_local_varcets(&self.img, op);
        let (facets, variants) =
            self.effective_varcets(new_facets.as_ref(), new_variants.as_ref(), linked)?;
        let holds = self.holds(&facets, &variants, linked);
        Ok(Constraints {
            facets,
            variants,
            parent: self.li.parent_md().filter(|_| linked).cloned(),
            holds,
        })
    }

    /// Plan `op` against the in-memory linked state.
    pub fn plan(&self, op: &PkgOp) -> Result<PlanDescription> {
        let c = self.constraints(op)?;
        let pkgs = self.planner.plan(&self.img, op, &c)?;
        Ok(self.describe(op, pkgs))
    }

    /// A plan which only brings the linked metadata up to date.
    pub(crate) fn md_only_plan(&self, op: &PkgOp) -> PlanDescription {
        self.describe(op, PkgPlan::unchanged(self.img.installed()))
    }

    fn describe(&self, op: &PkgOp, pkgs: PkgPlan) -> PlanDescription {
        let linked = LinkedPlan {
            props: self.li.props().persistent(),
            pmd: self.li.parent_md().cloned(),
        };
        let mut plan = PlanDescription::new(&self.img, op.clone(), pkgs, linked);
        let (new_facets, new_variants) = new_local_varcets(&self.img, op);
        plan.new_facets = new_facets;
        plan.new_variants = new_variants;
        plan.md_changed = self.li.md_changed();
        plan
    }

    /// Carry out a plan: packages, then configuration, then linked
    /// metadata.
    #[context("Executing {} plan", plan.op.name())]
    pub fn execute(&mut self, plan: &PlanDescription) -> Result<()> {
        self.ctx.check_canceled()?;
        self.lock()?;
        plan.verify(&self.img)?;
        fail::fail_point!("plan-execute", |_| Err(anyhow::anyhow!(
            "Failpoint plan-execute"
        )));
        if !plan.pkgs.is_empty() {
            self.img.set_installed(plan.pkgs.new_installed.clone())?;
        }
        let mut cfg_changed = false;
        if let Some(f) = plan.new_facets.as_ref().filter(|f| **f != self.img.cfg.facets) {
            self.img.cfg.facets = f.clone();
            cfg_changed = true;
        }
        if let Some(v) = plan
            .new_variants
            .as_ref()
            .filter(|v| **v != self.img.cfg.variants)
        {
            self.img.cfg.variants = v.clone();
            cfg_changed = true;
        }
        if cfg_changed {
            self.img.save_config()?;
        }
        match plan.linked.props.role() {
            Role::None => {
                if self.li.is_child() {
                    self.li.unlink();
                }
            }
            _ => self.li.set_props(plan.linked.props.clone())?,
        }
        self.li.set_parent_md(plan.linked.pmd.clone());
        if self.li.md_changed() {
            self.li.save(&self.img)?;
        }
        tracing::info!(
            "Executed {} on {}: {} packages changed",
            plan.op.name(),
            self.img.root(),
            plan.pkgs.changed_pkgs().len()
        );
        Ok(())
    }

    /// Requests for children affected by a package operation: the
    /// operation itself for explicitly selected children, a sync for the
    /// others.  Each entry records whether the child was selected.
    fn pkg_op_jobs(
        &self,
        plan: &PlanDescription,
        opts: &PkgOpOptions,
        noexecute: bool,
    ) -> Result<Vec<(ChildJob, bool)>> {
        let known = self.li.child_names();
        if known.is_empty() {
            return Ok(Vec::new());
        }
        let explicit = opts.recurse.apply(&known, opts.ignore_unknown)?;
        let implicit = opts.implicit.apply(&known, opts.ignore_unknown)?;
        let pmd = self.planned_parent_metadata(plan)?;
        let mut r = Vec::new();
        for entry in self.li.children(&self.img) {
            let props = self.li.props_for_child(&entry)?;
            let selected = explicit.contains(&entry.name);
            let req = if selected {
                ChildRequest::PkgOp {
                    operation: plan.op.clone(),
                    recurse: props.recurse(),
                    props,
                    pmd: pmd.clone(),
                    noexecute,
                }
            } else if implicit.contains(&entry.name) {
                ChildRequest::Sync {
                    md_only: props.md_only(),
                    props,
                    pmd: pmd.clone(),
                    pkg_updates: true,
                    noexecute,
                }
            } else {
                continue;
            };
            let job = ChildJob {
                name: entry.name,
                path: entry.location,
                req,
            };
            r.push((job, selected));
        }
        Ok(r)
    }

    /// Run a package operation, recursing into children as requested.
    pub fn pkg_op(&mut self, op: PkgOp, opts: &PkgOpOptions) -> Result<OpOutcome> {
        if matches!(op, PkgOp::Sync | PkgOp::Detach) {
            return Err(LinkedError::BadOption(format!(
                "use {}-linked to {} linked images",
                op.name(),
                op.name()
            ))
            .into());
        }
        self.ctx.check_canceled()?;
        if !opts.noexecute {
            self.lock()?;
        }
        if self.li.role() == Role::PullChild && !opts.no_parent_sync {
            self.refresh_parent()?;
        }
        let plan = match opts.stage {
            Stage::Default | Stage::Plan => self.plan(&op)?,
            Stage::Prepare | Stage::Execute => {
                let p = plan::load_staged(&self.img)?;
                p.verify(&self.img)?;
                p
            }
        };
        let summary = plan.summary(&self.img);
        if opts.stage == Stage::Prepare {
            return Ok(OpOutcome::with_plan(ExitStatus::Ok, summary));
        }

        // Phase one: every affected child must be able to follow.
        let jobs = self.pkg_op_jobs(&plan, opts, true)?;
        let (jobs, selected): (Vec<ChildJob>, Vec<bool>) = jobs.into_iter().unzip();
        let planned = dispatch::run_jobs(&self.ctx, &jobs, "Planning children")?;
        if planned.iter().any(|r| r.is_failure()) {
            let failed: Vec<ChildResult> =
                planned.iter().filter(|r| r.is_failure()).cloned().collect();
            tracing::warn!(
                "Not executing {}: {} child image(s) cannot follow",
                op.name(),
                failed.len()
            );
            return Ok(OpOutcome {
                status: dispatch::reduce(&failed),
                plan: Some(summary),
                children: planned,
                output: Vec::new(),
            });
        }
        let nothingtodo = plan.nothingtodo(&self.img);
        let children_nop = planned.iter().all(|r| r.status == ExitStatus::Nop);
        if opts.noexecute || opts.stage == Stage::Plan {
            if opts.stage == Stage::Plan {
                plan::save_staged(&self.img, &plan)?;
            }
            let status = if nothingtodo && children_nop {
                ExitStatus::Nop
            } else {
                ExitStatus::Ok
            };
            return Ok(OpOutcome {
                status,
                plan: Some(summary),
                children: planned,
                output: Vec::new(),
            });
        }

        let parent_status = if nothingtodo {
            ExitStatus::Nop
        } else {
            self.execute(&plan)?;
            ExitStatus::Ok
        };
        if opts.stage == Stage::Execute {
            plan::clear_staged(&self.img)?;
        }

        // Phase two.  Implicit syncs which found nothing to do are skipped.
        let jobs = self.pkg_op_jobs(&plan, opts, false)?;
        let jobs: Vec<ChildJob> = jobs
            .into_iter()
            .zip(selected.iter().zip(planned.iter()))
            .filter(|(_, (sel, p))| **sel || p.status != ExitStatus::Nop)
            .map(|((job, _), _)| job)
            .collect();
        let results = dispatch::run_jobs(&self.ctx, &jobs, "Updating children")?;
        let status = if results.iter().any(|r| r.canceled) {
            ExitStatus::Oops
        } else {
            dispatch::reduce_statuses(
                std::iter::once(parent_status).chain(results.iter().map(|r| r.status)),
            )
        };
        Ok(OpOutcome {
            status,
            plan: Some(summary),
            children: results,
            output: Vec::new(),
        })
    }
}

/// The new local facets and variants an operation asks for.
fn new_local_varcets(
    img: &Image,
    op: &PkgOp,
) -> (
    Option<BTreeMap<String, bool>>,
    Option<BTreeMap<String, String>>,
) {
    let PkgOp::ChangeVarcets { facets, variants } = op else {
        return (None, None);
    };
    let new_facets = (!facets.is_empty()).then(|| {
        let mut f = img.cfg.facets.clone();
        for (k, v) in facets {
            match v {
                Some(v) => f.insert(k.clone(), *v),
                None => f.remove(k),
            };
        }
        f
    });
    let new_variants = (!variants.is_empty()).then(|| {
        let mut r = img.cfg.variants.clone();
        r.extend(variants.iter().map(|(k, v)| (k.clone(), v.clone())));
        r
    });
    (new_facets, new_variants)
}
