//! Attaching, detaching, syncing and auditing linked images.
//!
//! Operations on an image's own relationship run here directly.
//! Operations on children are turned into [`ChildRequest`]s, fanned out
//! by the dispatcher, and handled by [`ImageInterface::handle_request`]
//! in the context of each child.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::audit::{self, AuditReport};
use super::dispatch::{self, ChildJob, ChildResult, Selection};
use super::name::LinkedImageName;
use super::props::{LinkedProps, Model, Role, PROP_CURRENT_PATH};
use super::request::{ChildRequest, ResponseError};
use super::validate;
use super::ChildEntry;
use crate::api::{ImageInterface, OpOutcome, PkgOpOptions};
use crate::errors::{ExitStatus, LinkedError};
use crate::image::Image;
use crate::paths;
use crate::plan::{self, PlanDescription, Stage};
use crate::planner::PkgOp;
use anyhow::Result;
use camino::Utf8Path;
use imgpkg_client::LinkedEntry;
use std::collections::BTreeMap;

/// Options shared by the linked image operations.
#[derive(Debug, Clone, Default)]
pub struct LinkedOpOptions {
    /// Only update linked metadata; leave packages alone.
    pub md_only: bool,
    /// Fail rather than change packages.
    pub no_pkg_updates: bool,
    pub noexecute: bool,
    pub stage: Stage,
    /// Use the cached parent snapshot instead of reading the parent.
    pub no_parent_sync: bool,
    pub allow_relink: bool,
    /// Override plugin restrictions.
    pub force: bool,
    pub ignore_unknown: bool,
}

fn report_outcome(report: AuditReport) -> OpOutcome {
    let status = if report.is_insync() {
        ExitStatus::Ok
    } else {
        ExitStatus::Diverged
    };
    OpOutcome {
        output: report.diverged.iter().map(|d| d.to_string()).collect(),
        ..OpOutcome::new(status)
    }
}

impl ImageInterface {
    fn child_op_options(md_only: bool, pkg_updates: bool, noexecute: bool) -> LinkedOpOptions {
        LinkedOpOptions {
            md_only,
            no_pkg_updates: !pkg_updates,
            noexecute,
            ..Default::default()
        }
    }

    /// Load a staged plan or build a new one.
    fn staged_or(
        &self,
        opts: &LinkedOpOptions,
        f: impl FnOnce(&Self) -> Result<PlanDescription>,
    ) -> Result<PlanDescription> {
        match opts.stage {
            Stage::Prepare | Stage::Execute => {
                let p = plan::load_staged(&self.img)?;
                p.verify(&self.img)?;
                Ok(p)
            }
            Stage::Default | Stage::Plan => f(self),
        }
    }

    /// Enforce `--no-pkg-updates`, then execute (or stage) the plan.
    fn finish_plan(&mut self, plan: PlanDescription, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        let summary = plan.summary(&self.img);
        if opts.no_pkg_updates && !plan.pkgs.is_empty() {
            return Err(LinkedError::NoPkgUpdatesViolation {
                pkgs: plan.pkgs.changed_pkgs(),
            }
            .into());
        }
        if plan.nothingtodo(&self.img) {
            if opts.stage == Stage::Execute {
                plan::clear_staged(&self.img)?;
            }
            return Ok(OpOutcome::with_plan(ExitStatus::Nop, summary));
        }
        match opts.stage {
            Stage::Plan => {
                plan::save_staged(&self.img, &plan)?;
                return Ok(OpOutcome::with_plan(ExitStatus::Ok, summary));
            }
            Stage::Prepare => return Ok(OpOutcome::with_plan(ExitStatus::Ok, summary)),
            Stage::Default | Stage::Execute => {}
        }
        if opts.noexecute {
            return Ok(OpOutcome::with_plan(ExitStatus::Ok, summary));
        }
        self.execute(&plan)?;
        if opts.stage == Stage::Execute {
            plan::clear_staged(&self.img)?;
        }
        Ok(OpOutcome::with_plan(ExitStatus::Ok, summary))
    }

    /// Bring this image in line with the in-memory parent snapshot.
    fn sync_to_parent(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        let plan = self.staged_or(opts, |api| {
            if opts.md_only {
                Ok(api.md_only_plan(&PkgOp::Sync))
            } else {
                api.plan(&PkgOp::Sync)
            }
        })?;
        self.finish_plan(plan, opts)
    }

    /// Drop this image's parent, planning whatever package changes that
    /// requires.  Nothing is written if planning fails.
    fn detach_local(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        self.li.unlink();
        let plan = self.staged_or(opts, |api| {
            if opts.md_only {
                Ok(api.md_only_plan(&PkgOp::Detach))
            } else {
                api.plan(&PkgOp::Detach)
            }
        })?;
        let r = self.finish_plan(plan, opts)?;
        if r.status != ExitStatus::Nop && !opts.noexecute {
            tracing::info!("Detached {} from its parent", self.img.root());
        }
        Ok(r)
    }

    fn self_name(&self) -> String {
        self.li
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| self.img.root_str())
    }

    /// Register the image at `path` as a push child named `name`.
    pub fn attach_child(
        &mut self,
        name: &LinkedImageName,
        path: &Utf8Path,
        user_props: &[(String, String)],
        opts: &LinkedOpOptions,
    ) -> Result<OpOutcome> {
        let plugin = self.li.plugin(name.kind)?;
        if !plugin.support_attach() && !opts.force {
            return Err(LinkedError::Unsupported {
                kind: name.kind.to_string(),
                op: "attach".into(),
            }
            .into());
        }
        let default_recurse = plugin.default_recurse();
        let child_path = paths::dirpath(paths::normalize(path)?.as_str());
        validate::validate_attach_child(
            &self.ctx,
            &self.img,
            &self.li,
            name,
            &child_path,
            opts.allow_relink,
        )?;
        if !opts.noexecute {
            self.lock()?;
        }
        let mut reg = LinkedProps {
            name: Some(name.clone()),
            model: Some(Model::Push),
            path: self.li.path_transform().revert(&child_path),
            recurse: Some(default_recurse),
            ..Default::default()
        };
        for (k, v) in user_props {
            reg.set_user_prop(k, v)?;
        }
        reg.verify()?;
        let entry = ChildEntry {
            name: name.clone(),
            props: reg.clone(),
            location: Ok(child_path.clone()),
        };
        let job = ChildJob {
            name: name.clone(),
            path: Ok(child_path.clone()),
            req: ChildRequest::Attach {
                props: self.li.props_for_child(&entry)?,
                pmd: self.parent_metadata()?,
                md_only: opts.md_only,
                pkg_updates: !opts.no_pkg_updates,
                noexecute: opts.noexecute,
                allow_relink: opts.allow_relink,
            },
        };
        let results = dispatch::run_jobs(&self.ctx, &[job], "Attaching child")?;
        let outcome = OpOutcome::from_children(results);
        if outcome.status.is_failure() || opts.noexecute {
            return Ok(outcome);
        }
        self.li.attach_child(reg)?;
        self.li.save(&self.img)?;
        tracing::info!("Attached {name} at {child_path}");
        Ok(OpOutcome {
            status: ExitStatus::Ok,
            ..outcome
        })
    }

    /// Make this image a pull child of the image at `parent`.
    pub fn attach_parent(
        &mut self,
        name: &LinkedImageName,
        parent: &Utf8Path,
        user_props: &[(String, String)],
        opts: &LinkedOpOptions,
    ) -> Result<OpOutcome> {
        if !self.li.plugin(name.kind)?.support_attach() && !opts.force {
            return Err(LinkedError::Unsupported {
                kind: name.kind.to_string(),
                op: "attach".into(),
            }
            .into());
        }
        if self.li.role() == Role::PushChild {
            return Err(LinkedError::ParentOp {
                name: self.self_name(),
                op: "attach-linked".into(),
            }
            .into());
        }
        let parent = paths::dirpath(paths::normalize(parent)?.as_str());
        validate::validate_attach_parent(&self.ctx, &self.img, &self.li, &parent, opts.allow_relink)?;
        if !opts.noexecute {
            self.lock()?;
        }
        let mut props = LinkedProps {
            name: Some(name.clone()),
            model: Some(Model::Pull),
            path: self.li.props().path.clone(),
            parent_path: Some(parent.clone()),
            ..Default::default()
        };
        for (k, v) in user_props {
            props.set_user_prop(k, v)?;
        }
        self.li.set_props(props)?;
        self.refresh_parent()?;
        if let Some(pmd) = self.li.parent_md() {
            audit::pubcheck(&self.img.cfg.publishers, &pmd.ppubs)?;
        }
        let r = self.sync_to_parent(opts)?;
        if !opts.noexecute && opts.stage == Stage::Default {
            tracing::info!("Attached {} to parent {parent}", self.img.root());
        }
        Ok(r)
    }

    /// Requests for the selected children, built by `f` from each child's
    /// entry and the properties it should hold.
    fn child_jobs(
        &self,
        sel: &Selection,
        ignore_unknown: bool,
        mut f: impl FnMut(&ChildEntry, LinkedProps) -> ChildRequest,
    ) -> Result<Vec<ChildJob>> {
        let names = sel.apply(&self.li.child_names(), ignore_unknown)?;
        let mut r = Vec::new();
        for entry in self.li.children(&self.img) {
            if !names.contains(&entry.name) {
                continue;
            }
            let props = self.li.props_for_child(&entry)?;
            let req = f(&entry, props);
            r.push(ChildJob {
                name: entry.name,
                path: entry.location,
                req,
            });
        }
        Ok(r)
    }

    /// Sync the selected children to this image.
    pub fn sync_children(&mut self, sel: &Selection, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        let pmd = self.parent_metadata()?;
        let jobs = self.child_jobs(sel, opts.ignore_unknown, |_, props| ChildRequest::Sync {
            props,
            pmd: pmd.clone(),
            md_only: opts.md_only,
            pkg_updates: !opts.no_pkg_updates,
            noexecute: opts.noexecute,
        })?;
        let results = dispatch::run_jobs(&self.ctx, &jobs, "Syncing children")?;
        Ok(OpOutcome::from_children(results))
    }

    /// Sync this image with its parent.  Only pull children drive their
    /// own syncs.
    pub fn sync_self(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        match self.li.role() {
            Role::None => return Err(LinkedError::NoParent.into()),
            Role::PushChild => {
                return Err(LinkedError::ParentOp {
                    name: self.self_name(),
                    op: "sync-linked".into(),
                }
                .into())
            }
            Role::PullChild => {}
        }
        if !opts.noexecute {
            self.lock()?;
        }
        if !opts.no_parent_sync {
            self.refresh_parent()?;
        }
        self.sync_to_parent(opts)
    }

    /// Audit the selected children against this image's current state.
    pub fn audit_children(&self, sel: &Selection, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        let pmd = self.parent_metadata()?;
        let jobs = self.child_jobs(sel, opts.ignore_unknown, |_, props| {
            ChildRequest::AuditLinked {
                props,
                pmd: pmd.clone(),
            }
        })?;
        let results = dispatch::run_jobs(&self.ctx, &jobs, "Auditing children")?;
        Ok(OpOutcome::from_children(results))
    }

    fn audit_current(&self) -> Result<OpOutcome> {
        let report = audit::audit_pkgs(
            &self.img,
            self.img.installed(),
            &self.li.facets(&self.img)?,
            &self.li.variants(&self.img)?,
            self.li.parent_md(),
        );
        Ok(report_outcome(report))
    }

    /// Audit this image against its parent.  A pull child reads the parent
    /// live unless told not to; the result is never written.
    pub fn audit_self(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        if !self.li.is_child() {
            return Err(LinkedError::NoParent.into());
        }
        if self.li.role() == Role::PullChild && !opts.no_parent_sync {
            self.refresh_parent()?;
        }
        self.audit_current()
    }

    /// Check publishers of the selected children.
    pub fn pubcheck_children(&self, sel: &Selection, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        let pmd = self.parent_metadata()?;
        let jobs = self.child_jobs(sel, opts.ignore_unknown, |_, _| ChildRequest::Pubcheck {
            pmd: pmd.clone(),
        })?;
        let results = dispatch::run_jobs(&self.ctx, &jobs, "Checking child publishers")?;
        Ok(OpOutcome::from_children(results))
    }

    /// Check this image's publishers against its parent's.  There is
    /// nothing to check for an image without a parent.
    pub fn pubcheck(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        if !self.li.is_child() {
            return Ok(OpOutcome::new(ExitStatus::Ok));
        }
        if self.li.role() == Role::PullChild && !opts.no_parent_sync {
            self.refresh_parent()?;
        }
        if let Some(pmd) = self.li.parent_md() {
            audit::pubcheck(&self.img.cfg.publishers, &pmd.ppubs)?;
        }
        Ok(OpOutcome::new(ExitStatus::Ok))
    }

    /// Detach the selected children.  Children that can't detach stay
    /// registered.
    pub fn detach_children(&mut self, sel: &Selection, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        if !opts.noexecute {
            self.lock()?;
        }
        let mut refused = Vec::new();
        let mut unsupported = Vec::new();
        let jobs = self.child_jobs(sel, opts.ignore_unknown, |entry, _| {
            let supported = self
                .li
                .plugin(entry.name.kind)
                .map(|p| p.support_detach())
                .unwrap_or(false);
            if !supported && !opts.force {
                unsupported.push(entry.name.clone());
            }
            ChildRequest::Detach {
                md_only: opts.md_only,
                pkg_updates: !opts.no_pkg_updates,
                noexecute: opts.noexecute,
            }
        })?;
        let jobs: Vec<ChildJob> = jobs
            .into_iter()
            .filter(|j| {
                if !unsupported.contains(&j.name) {
                    return true;
                }
                let e = anyhow::Error::new(LinkedError::Unsupported {
                    kind: j.name.kind.to_string(),
                    op: "detach".into(),
                });
                refused.push(ChildResult {
                    name: j.name.to_string(),
                    status: ExitStatus::Oops,
                    canceled: false,
                    error: Some(ResponseError::from_error(&e)),
                    output: Vec::new(),
                    plan: None,
                    children: Vec::new(),
                });
                false
            })
            .collect();
        let mut results = dispatch::run_jobs(&self.ctx, &jobs, "Detaching children")?;
        if !opts.noexecute {
            let mut changed = false;
            for (job, r) in jobs.iter().zip(results.iter()) {
                // A child which can no longer be found can only be
                // forgotten.
                let forget = opts.force && job.path.is_err();
                if forget || !r.is_failure() {
                    self.li.detach_child(&job.name)?;
                    changed = true;
                }
            }
            if changed {
                self.li.save(&self.img)?;
            }
        }
        results.extend(refused);
        results.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(OpOutcome::from_children(results))
    }

    /// Detach this image from its parent.  Push children are normally
    /// detached by their parent.
    pub fn detach_self(&mut self, opts: &LinkedOpOptions) -> Result<OpOutcome> {
        match self.li.role() {
            Role::None => return Err(LinkedError::NoParent.into()),
            Role::PushChild if !opts.force => {
                return Err(LinkedError::ParentOp {
                    name: self.self_name(),
                    op: "detach-linked".into(),
                }
                .into())
            }
            _ => {}
        }
        if !opts.noexecute {
            self.lock()?;
        }
        self.detach_local(opts)
    }

    /// The image's relationships: itself and its parent if it is a
    /// child, then every registered child.
    pub fn list(&self) -> Vec<LinkedEntry> {
        let mut r = Vec::new();
        if self.li.is_child() {
            let props = self.li.props();
            let model = props.model.map(|m| m.to_string()).unwrap_or_default();
            r.push(LinkedEntry {
                name: self.self_name(),
                relationship: "self".into(),
                path: self.img.root_str(),
                model: model.clone(),
                reachable: true,
            });
            let ppath = self.li.parent_path().map(|p| p.to_string());
            r.push(LinkedEntry {
                name: "-".into(),
                relationship: "parent".into(),
                reachable: ppath
                    .as_deref()
                    .is_some_and(|p| Image::exists(Utf8Path::new(p))),
                path: ppath.unwrap_or_else(|| "-".into()),
                model,
            });
        }
        for c in self.li.children(&self.img) {
            let path = match c.location.as_ref() {
                Ok(p) => p.clone(),
                Err(_) => self.li.path_transform().apply(&c.props.path),
            };
            r.push(LinkedEntry {
                name: c.name.to_string(),
                relationship: "child".into(),
                reachable: c.is_reachable(),
                path,
                model: c.props.model.map(|m| m.to_string()).unwrap_or_default(),
            });
        }
        r
    }

    /// Linked properties of this image or of one of its children,
    /// optionally restricted to `keys`.
    pub fn properties(
        &self,
        child: Option<&LinkedImageName>,
        keys: &[String],
    ) -> Result<BTreeMap<String, String>> {
        let props = match child {
            Some(name) => self.li.child(&self.img, name)?.props,
            None => {
                if !self.li.is_child() && !self.li.has_children() {
                    return Err(LinkedError::NoParent.into());
                }
                self.li.props().clone()
            }
        };
        let mut all = props.to_strings();
        if child.is_some() && !all.contains_key(PROP_CURRENT_PATH) {
            all.insert(PROP_CURRENT_PATH.into(), "-".into());
        }
        if keys.is_empty() {
            return Ok(all);
        }
        let mut r = BTreeMap::new();
        for k in keys {
            let v = all.get(k).ok_or_else(|| LinkedError::InvalidProperty {
                prop: k.to_string(),
            })?;
            r.insert(k.clone(), v.clone());
        }
        Ok(r)
    }

    /// Change user-settable properties of this image, or of a child's
    /// registration.
    pub fn set_properties(
        &mut self,
        child: Option<&LinkedImageName>,
        kvs: &[(String, String)],
    ) -> Result<OpOutcome> {
        self.lock()?;
        match child {
            Some(name) => {
                let mut props = self.li.child(&self.img, name)?.props.persistent();
                let before = props.clone();
                for (k, v) in kvs {
                    props.set_user_prop(k, v)?;
                }
                props.verify()?;
                if props == before {
                    return Ok(OpOutcome::new(ExitStatus::Nop));
                }
                self.li.update_child(props)?;
            }
            None => {
                match self.li.role() {
                    Role::None => return Err(LinkedError::NoParent.into()),
                    Role::PushChild => {
                        return Err(LinkedError::ParentOp {
                            name: self.self_name(),
                            op: "set-property-linked".into(),
                        }
                        .into())
                    }
                    Role::PullChild => {}
                }
                for (k, v) in kvs {
                    self.li.set_user_prop(k, v)?;
                }
                if !self.li.md_changed() {
                    return Ok(OpOutcome::new(ExitStatus::Nop));
                }
            }
        }
        self.li.save(&self.img)?;
        Ok(OpOutcome::new(ExitStatus::Ok))
    }

    /// Carry out a request from this image's parent.
    pub fn handle_request(&mut self, req: &ChildRequest) -> Result<OpOutcome> {
        match req {
            ChildRequest::AuditLinked { props, pmd } => {
                // In memory only; an audit never writes.
                self.li.set_props(props.clone())?;
                self.li.set_parent_md(Some(pmd.clone()));
                self.audit_current()
            }
            ChildRequest::Pubcheck { pmd } => {
                audit::pubcheck(&self.img.cfg.publishers, &pmd.ppubs)?;
                Ok(OpOutcome::new(ExitStatus::Ok))
            }
            ChildRequest::Attach {
                props,
                pmd,
                md_only,
                pkg_updates,
                noexecute,
                allow_relink,
            } => {
                if self.li.is_child() && !allow_relink {
                    return Err(LinkedError::AlreadyLinked {
                        path: self.img.root_str(),
                    }
                    .into());
                }
                if !noexecute {
                    self.lock()?;
                }
                self.li.set_props(props.clone())?;
                self.li.set_parent_md(Some(pmd.clone()));
                let opts = Self::child_op_options(*md_only, *pkg_updates, *noexecute);
                self.sync_to_parent(&opts)
            }
            ChildRequest::Sync {
                props,
                pmd,
                md_only,
                pkg_updates,
                noexecute,
            } => {
                if !noexecute {
                    self.lock()?;
                }
                self.li.set_props(props.clone())?;
                self.li.set_parent_md(Some(pmd.clone()));
                let opts = Self::child_op_options(*md_only, *pkg_updates, *noexecute);
                self.sync_to_parent(&opts)
            }
            ChildRequest::Detach {
                md_only,
                pkg_updates,
                noexecute,
            } => {
                if !self.li.is_child() {
                    return Ok(OpOutcome::new(ExitStatus::Nop));
                }
                if !noexecute {
                    self.lock()?;
                }
                let opts = Self::child_op_options(*md_only, *pkg_updates, *noexecute);
                self.detach_local(&opts)
            }
            ChildRequest::PkgOp {
                operation,
                props,
                pmd,
                noexecute,
                recurse,
            } => {
                self.li.set_props(props.clone())?;
                self.li.set_parent_md(Some(pmd.clone()));
                let opts = PkgOpOptions {
                    noexecute: *noexecute,
                    recurse: if *recurse {
                        Selection::All
                    } else {
                        Selection::None
                    },
                    no_parent_sync: true,
                    ..Default::default()
                };
                self.pkg_op(operation.clone(), &opts)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::super::request::ChildResponse;
    use super::super::store::{MetadataStore, PPKGS_FILE, PROPS_FILE};
    use super::*;
    use crate::api::tests::{inline_ctx, make_image};
    use crate::context::OpContext;
    use crate::errors::{error_kind_of, exit_status_of, ErrorKind};
    use crate::fmri::Fmri;
    use crate::image::tests::utf8_tempdir;
    use crate::varcet::Source;
    use camino::Utf8PathBuf;
    use maplit::btreemap;
    use std::collections::BTreeSet;

    struct Tree {
        _td: tempfile::TempDir,
        base: Utf8PathBuf,
        ctx: OpContext,
    }

    impl Tree {
        fn new() -> Result<Self> {
            let (td, base) = utf8_tempdir()?;
            Ok(Self {
                _td: td,
                base,
                ctx: inline_ctx(),
            })
        }

        fn path(&self, p: &str) -> Utf8PathBuf {
            self.base.join(p)
        }

        fn open(&self, p: &str) -> Result<ImageInterface> {
            ImageInterface::open(&self.ctx, &self.path(p))
        }

        fn attach(&self, parent: &str, name: &str, child: &str, opts: &LinkedOpOptions) -> Result<OpOutcome> {
            self.open(parent)?
                .attach_child(&name.parse()?, &self.path(child), &[], opts)
        }

        fn audit(&self, p: &str) -> Result<OpOutcome> {
            self.open(p)?.audit_self(&LinkedOpOptions::default())
        }

        fn sync(&self, parent: &str, name: &str, opts: &LinkedOpOptions) -> Result<OpOutcome> {
            self.open(parent)?.sync_children(&only(name)?, opts)
        }

        fn installed(&self, p: &str, stem: &str) -> Result<Option<String>> {
            Ok(self
                .open(p)?
                .img()
                .installed_stem(stem)
                .map(|f| f.to_string()))
        }
    }

    fn only(name: &str) -> Result<Selection> {
        let name: LinkedImageName = name.parse()?;
        Ok(Selection::Include(BTreeSet::from([name])))
    }

    fn md_only() -> LinkedOpOptions {
        LinkedOpOptions {
            md_only: true,
            ..Default::default()
        }
    }

    #[test]
    fn empty_images_attach_insync() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/c"), &[])?;
        let r = t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(t.audit("p/c")?.status, ExitStatus::Ok);
        let r = t
            .open("p")?
            .audit_children(&Selection::All, &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(r.children.len(), 1);
        Ok(())
    }

    #[test]
    fn diverged_child_converges() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("p/c"), &["pkg://test/foo@2.0"])?;
        t.attach("p", "system:c", "p/c", &md_only())?;
        let r = t.audit("p/c")?;
        assert_eq!(r.status, ExitStatus::Diverged);
        assert_eq!(r.output.len(), 1);
        let r = t
            .open("p")?
            .audit_children(&Selection::All, &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Diverged);

        let r = t.sync("p", "system:c", &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(t.installed("p/c", "foo")?.as_deref(), Some("pkg://test/foo@1.0"));
        assert_eq!(t.audit("p/c")?.status, ExitStatus::Ok);
        Ok(())
    }

    #[test]
    fn sync_then_nop() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("p/c"), &["pkg://test/foo@1.0"])?;
        t.attach("p", "system:c", "p/c", &md_only())?;
        // Change the parent behind the child's back.
        {
            let mut p = Image::open(&t.path("p"))?;
            p.cfg.publishers.push(crate::image::Publisher::new("extra"));
            p.save_config()?;
        }
        let r = t.sync("p", "system:c", &md_only())?;
        assert_eq!(r.status, ExitStatus::Ok, "metadata refresh is not a no-op");
        let r = t.sync("p", "system:c", &md_only())?;
        assert_eq!(r.status, ExitStatus::Nop);
        Ok(())
    }

    #[test]
    fn inherited_facet_is_visible_in_child() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/entire@1.0", "pkg://test/foo@1.0"])?;
        make_image(&t.path("p/c"), &["pkg://test/foo@1.0"])?;
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        let r = t.open("p")?.pkg_op(
            PkgOp::ChangeVarcets {
                facets: btreemap! { "facet.version-lock.foo".to_string() => Some(false) },
                variants: BTreeMap::new(),
            },
            &PkgOpOptions::default(),
        )?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(r.children.len(), 1);
        let c = t.open("p/c")?;
        assert!(c.img().cfg.facets.is_empty());
        let facets = c.facets()?;
        let f = facets
            .iter()
            .find(|e| e.name == "facet.version-lock.foo")
            .unwrap();
        assert!(!f.value);
        assert_eq!(f.source, Source::Parent);
        Ok(())
    }

    #[test]
    fn relocated_tree_still_audits() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("a/p"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("a/p/c"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("a/pull"), &["pkg://test/foo@1.0"])?;
        t.attach("a/p", "system:c", "a/p/c", &LinkedOpOptions::default())?;
        t.open("a/pull")?.attach_parent(
            &"system:pull".parse()?,
            &t.path("a/p"),
            &[],
            &LinkedOpOptions::default(),
        )?;
        std::fs::rename(t.path("a"), t.path("b"))?;

        let p = t.open("b/p")?;
        let list = p.list();
        assert_eq!(list.len(), 1);
        assert!(list[0].reachable);
        assert_eq!(list[0].path, format!("{}/b/p/c/", t.base));
        assert_eq!(t.audit("b/p/c")?.status, ExitStatus::Ok);
        let pull = t.open("b/pull")?;
        assert_eq!(pull.linked().role(), Role::PullChild);
        assert_eq!(t.audit("b/pull")?.status, ExitStatus::Ok);
        let r = t
            .open("b/p")?
            .audit_children(&Selection::All, &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        Ok(())
    }

    #[test]
    fn detach_without_pkg_updates_keeps_child() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/foo@2.0"])?;
        make_image(&t.path("p/c"), &["pkg://test/foo@2.0"])?;
        {
            let mut c = Image::open(&t.path("p/c"))?;
            c.cfg.install_holds.insert("foo".into(), "1".into());
            c.save_config()?;
        }
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        let opts = LinkedOpOptions {
            no_pkg_updates: true,
            ..Default::default()
        };
        let sel = Selection::All;
        let r = t.open("p")?.detach_children(&sel, &opts)?;
        assert_eq!(r.status, ExitStatus::Oops);
        let err = r.children[0].error.as_ref().unwrap();
        assert_eq!(err.kind, ErrorKind::Constraint);
        assert_eq!(t.open("p")?.linked().child_names().len(), 1);
        assert_eq!(t.open("p/c")?.linked().role(), Role::PushChild);

        let r = t.open("p")?.detach_children(&sel, &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert!(t.open("p")?.linked().child_names().is_empty());
        assert_eq!(t.open("p/c")?.linked().role(), Role::None);
        assert_eq!(t.installed("p/c", "foo")?.as_deref(), Some("pkg://test/foo@1.0"));
        Ok(())
    }

    #[test]
    fn audit_writes_nothing() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/c"), &[])?;
        t.attach("p", "system:c", "p/c", &md_only())?;
        let c = Image::open(&t.path("p/c"))?;
        c.imgdir().remove_file(PPKGS_FILE)?;
        drop(c);

        assert_eq!(t.audit("p/c")?.status, ExitStatus::Diverged);
        let r = t
            .open("p")?
            .audit_children(&Selection::All, &LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        let c = Image::open(&t.path("p/c"))?;
        assert!(!c.imgdir().try_exists(PPKGS_FILE)?);
        assert!(MetadataStore::new(c.imgdir()).load_parent_md().is_none());

        // Without its own properties the image is simply not linked.
        c.imgdir().remove_file(PROPS_FILE)?;
        let e = t.audit("p/c").unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::NoParent);
        Ok(())
    }

    #[test]
    fn push_children_are_driven_by_the_parent() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/c"), &[])?;
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        let mut c = t.open("p/c")?;
        let e = c.sync_self(&LinkedOpOptions::default()).unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::ParentOp);
        let e = c.detach_self(&LinkedOpOptions::default()).unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::ParentOp);
        let e = c
            .set_properties(None, &[("li-md-only".into(), "true".into())])
            .unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::ParentOp);

        let mut p = t.open("p")?;
        let e = p.sync_self(&LinkedOpOptions::default()).unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::NoParent);
        Ok(())
    }

    #[test]
    fn attach_rejections() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/c"), &[])?;
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        let e = t
            .attach("p", "system:c", "p/c", &LinkedOpOptions::default())
            .unwrap_err();
        assert_eq!(error_kind_of(&e), ErrorKind::Topology);
        let e = t
            .attach("p/c", "system:p", "p", &LinkedOpOptions::default())
            .unwrap_err();
        assert_eq!(error_kind_of(&e), ErrorKind::Topology);
        let e = t
            .attach("p", "sandbox:c", "p/c", &LinkedOpOptions::default())
            .unwrap_err();
        assert!(matches!(
            crate::errors::find_linked_error(&e),
            Some(LinkedError::Unsupported { .. })
        ));
        let r = t.attach(
            "p",
            "system:c",
            "p/c",
            &LinkedOpOptions {
                allow_relink: true,
                ..Default::default()
            },
        )?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(t.open("p")?.linked().child_names().len(), 1);
        Ok(())
    }

    #[test]
    fn unknown_children() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        let sel = only("system:nope")?;
        let e = t
            .open("p")?
            .sync_children(&sel, &LinkedOpOptions::default())
            .unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::BadOpt);
        let r = t.open("p")?.sync_children(
            &sel,
            &LinkedOpOptions {
                ignore_unknown: true,
                ..Default::default()
            },
        )?;
        assert_eq!(r.status, ExitStatus::Nop);
        Ok(())
    }

    #[test]
    fn explicit_recursion() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/a"), &[])?;
        make_image(&t.path("p/b"), &[])?;
        t.attach("p", "system:a", "p/a", &LinkedOpOptions::default())?;
        t.attach("p", "system:b", "p/b", &LinkedOpOptions::default())?;
        let opts = PkgOpOptions {
            recurse: only("system:a")?,
            ..Default::default()
        };
        let r = t.open("p")?.pkg_op(
            PkgOp::Install {
                pkgs: vec!["tool".into()],
            },
            &opts,
        )?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert!(t.installed("p", "tool")?.is_some());
        assert!(t.installed("p/a", "tool")?.is_some());
        assert!(t.installed("p/b", "tool")?.is_none());
        Ok(())
    }

    #[test]
    fn child_that_cannot_follow_aborts_parent() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("p/c"), &["pkg://test/foo@1.0"])?;
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        {
            let mut c = Image::open(&t.path("p/c"))?;
            // Not relaxed: tool has no parent dependency.
            c.cfg.install_holds.insert("tool".into(), "1".into());
            let foo: Fmri = "pkg://test/foo@1.0".parse()?;
            let tool: Fmri = "pkg://test/tool@1.0".parse()?;
            c.set_installed(BTreeSet::from([foo, tool]))?;
            c.save_config()?;
        }
        let opts = PkgOpOptions {
            recurse: Selection::All,
            ..Default::default()
        };
        let r = t.open("p")?.pkg_op(
            PkgOp::Install {
                pkgs: vec!["tool@2.0".into()],
            },
            &opts,
        )?;
        assert!(r.status.is_failure());
        assert!(t.installed("p", "tool")?.is_none(), "parent was not touched");
        Ok(())
    }

    #[test]
    fn grandchild_failure_is_reported() -> Result<()> {
        let t = Tree::new()?;
        for p in ["p", "p/c", "p/c/g"] {
            make_image(&t.path(p), &["pkg://test/foo@1.0"])?;
        }
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        t.attach("p/c", "system:g", "p/c/g", &LinkedOpOptions::default())?;
        {
            let mut g = Image::open(&t.path("p/c/g"))?;
            g.cfg.install_holds.insert("tool".into(), "1".into());
            let foo: Fmri = "pkg://test/foo@1.0".parse()?;
            let tool: Fmri = "pkg://test/tool@1.0".parse()?;
            g.set_installed(BTreeSet::from([foo, tool]))?;
            g.save_config()?;
        }
        let opts = PkgOpOptions {
            recurse: Selection::All,
            ..Default::default()
        };
        let r = t.open("p")?.pkg_op(
            PkgOp::Install {
                pkgs: vec!["tool@2.0".into()],
            },
            &opts,
        )?;
        assert!(r.status.is_failure());
        let c = &r.children[0];
        assert_eq!(c.name, "system:c");
        assert!(c.status.is_failure());
        let g = &c.children[0];
        assert_eq!(g.name, "system:g");
        assert_eq!(g.error.as_ref().unwrap().kind, ErrorKind::Constraint);
        assert!(t.installed("p", "tool")?.is_none());
        assert!(t.installed("p/c", "tool")?.is_none());

        // The nesting survives the trip through a response.
        let resp = ChildResponse::from_result(Ok(r.clone()));
        let json = serde_json::to_string(&resp)?;
        let back: ChildResponse = serde_json::from_str(&json)?;
        assert_eq!(back.children[0].children[0].name, "system:g");
        Ok(())
    }

    #[test]
    fn properties() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &[])?;
        make_image(&t.path("p/c"), &[])?;
        let e = t.open("p")?.properties(None, &[]).unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::NoParent);
        t.attach("p", "system:c", "p/c", &LinkedOpOptions::default())?;
        let name: LinkedImageName = "system:c".parse()?;
        let mut p = t.open("p")?;
        let props = p.properties(Some(&name), &[])?;
        assert_eq!(props.get("li-model").map(|s| s.as_str()), Some("push"));
        assert_eq!(props.get("li-recurse").map(|s| s.as_str()), Some("true"));
        let r = p.set_properties(Some(&name), &[("li-recurse".into(), "false".into())])?;
        assert_eq!(r.status, ExitStatus::Ok);
        let r = p.set_properties(Some(&name), &[("li-recurse".into(), "false".into())])?;
        assert_eq!(r.status, ExitStatus::Nop);
        let e = p
            .set_properties(Some(&name), &[("li-path".into(), "/x".into())])
            .unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::BadOpt);
        let props = t.open("p")?.properties(Some(&name), &["li-recurse".into()])?;
        assert_eq!(props, btreemap! { "li-recurse".to_string() => "false".to_string() });
        assert!(t
            .open("p")?
            .properties(Some(&name), &["li-bogus".into()])
            .is_err());
        Ok(())
    }

    #[test]
    fn pull_child_lifecycle() -> Result<()> {
        let t = Tree::new()?;
        make_image(&t.path("p"), &["pkg://test/foo@1.0"])?;
        make_image(&t.path("c"), &["pkg://test/foo@2.0"])?;
        let mut c = t.open("c")?;
        let r = c.attach_parent(
            &"system:c".parse()?,
            &t.path("p"),
            &[],
            &LinkedOpOptions::default(),
        )?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(t.installed("c", "foo")?.as_deref(), Some("pkg://test/foo@1.0"));
        assert_eq!(t.open("c")?.sync_self(&LinkedOpOptions::default())?.status, ExitStatus::Nop);
        assert_eq!(t.open("c")?.pubcheck(&LinkedOpOptions::default())?.status, ExitStatus::Ok);
        let list = t.open("c")?.list();
        assert_eq!(list[1].relationship, "parent");
        assert_eq!(list[1].path, t.open("p")?.img().root_str());

        let r = t.open("c")?.detach_self(&LinkedOpOptions::default())?;
        assert_eq!(r.status, ExitStatus::Ok);
        assert_eq!(t.open("c")?.linked().role(), Role::None);
        Ok(())
    }
}
