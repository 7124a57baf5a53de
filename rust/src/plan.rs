//! Plan descriptions and staged operations.
//!
//! A plan carries everything needed to execute an operation later: the
//! package changes, new local facets and variants, and the linked state
//! the image should end up with.  `--stage plan` saves it below the image
//! directory; `--stage prepare` checks it still applies and
//! `--stage execute` carries it out.  The image may have been moved (for
//! example mounted as a boot environment clone) between stages, so the
//! root recorded in the plan is only used to recompute path transforms.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::fmri::Fmri;
use crate::image::{read_json_optional, write_json, Image};
use crate::linked::props::LinkedProps;
use crate::linked::store::ParentMetadata;
use crate::paths::PathTransform;
use crate::planner::{PkgOp, PkgPlan};
use anyhow::{Context, Result};
use cap_std_ext::dirext::CapStdExtDirExt;
use chrono::{DateTime, Utc};
use fn_error_context::context;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

const PLAN_DIR: &str = "plan";
const PLAN_FILE: &str = "plan/plan.json";

/// How much of an operation to perform in this invocation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum Stage {
    /// Plan, prepare and execute.
    #[default]
    Default,
    /// Plan and save the plan.
    Plan,
    /// Check that a saved plan still applies.
    Prepare,
    /// Execute a saved plan.
    Execute,
}

/// The linked state an image has after a plan is executed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct LinkedPlan {
    pub props: LinkedProps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pmd: Option<ParentMetadata>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PlanDescription {
    pub op: PkgOp,
    pub created: DateTime<Utc>,
    /// Image root at planning time.
    pub root: String,
    /// Installed packages at planning time.
    pub installed: BTreeSet<Fmri>,
    pub pkgs: PkgPlan,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_facets: Option<BTreeMap<String, bool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_variants: Option<BTreeMap<String, String>>,
    pub linked: LinkedPlan,
    /// Whether the linked metadata differs from what is on disk.
    #[serde(default)]
    pub md_changed: bool,
}

/// What a plan will do, in a form suitable for output.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PlanSummary {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub install: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub remove: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub update: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub varcets: Vec<String>,
    #[serde(default)]
    pub md_changed: bool,
}

impl PlanSummary {
    pub fn pkgs_changed(&self) -> bool {
        !(self.install.is_empty() && self.remove.is_empty() && self.update.is_empty())
    }

    /// Lines describing the plan, for plain output.
    pub fn lines(&self) -> Vec<String> {
        let mut r = Vec::new();
        r.extend(self.install.iter().map(|p| format!("install {p}")));
        r.extend(self.remove.iter().map(|p| format!("remove {p}")));
        r.extend(self.update.iter().map(|p| format!("update {p}")));
        r.extend(self.varcets.iter().map(|v| format!("change {v}")));
        if self.md_changed && !self.pkgs_changed() {
            r.push("update linked image metadata".into());
        }
        r
    }
}

fn diff_map<V: PartialEq + std::fmt::Display>(
    old: &BTreeMap<String, V>,
    new: &BTreeMap<String, V>,
    out: &mut Vec<String>,
) {
    for (k, v) in new.iter() {
        match old.get(k) {
            Some(o) if o == v => {}
            Some(o) => out.push(format!("{k}: {o} -> {v}")),
            None => out.push(format!("{k}: {v}")),
        }
    }
    for (k, o) in old.iter() {
        if !new.contains_key(k) {
            out.push(format!("{k}: {o} -> (default)"));
        }
    }
}

impl PlanDescription {
    pub fn new(img: &Image, op: PkgOp, pkgs: PkgPlan, linked: LinkedPlan) -> Self {
        Self {
            op,
            created: Utc::now(),
            root: img.root_str(),
            installed: img.installed().clone(),
            pkgs,
            new_facets: None,
            new_variants: None,
            linked,
            md_changed: false,
        }
    }

    fn varcets_changed(&self, img: &Image) -> bool {
        self.new_facets.as_ref().is_some_and(|f| f != &img.cfg.facets)
            || self
                .new_variants
                .as_ref()
                .is_some_and(|v| v != &img.cfg.variants)
    }

    /// Nothing at all would change.
    pub fn nothingtodo(&self, img: &Image) -> bool {
        self.pkgs.is_empty() && !self.varcets_changed(img) && !self.md_changed
    }

    pub fn summary(&self, img: &Image) -> PlanSummary {
        let mut varcets = Vec::new();
        if let Some(f) = self.new_facets.as_ref() {
            diff_map(&img.cfg.facets, f, &mut varcets);
        }
        if let Some(v) = self.new_variants.as_ref() {
            diff_map(&img.cfg.variants, v, &mut varcets);
        }
        PlanSummary {
            install: self.pkgs.install.iter().map(|f| f.to_string()).collect(),
            remove: self.pkgs.remove.iter().map(|f| f.to_string()).collect(),
            update: self
                .pkgs
                .update
                .iter()
                .map(|(a, b)| format!("{a} -> {b}"))
                .collect(),
            varcets,
            md_changed: self.md_changed,
        }
    }

    /// The transform from the root recorded at planning time to `img`.
    pub fn relocation(&self, img: &Image) -> PathTransform {
        PathTransform::compute(&self.root, &img.root_str())
    }

    /// Check that the plan can still be applied to `img`.
    pub fn verify(&self, img: &Image) -> Result<()> {
        if &self.installed != img.installed() {
            anyhow::bail!(
                "Installed packages changed since the plan was created at {}",
                self.created
            );
        }
        Ok(())
    }
}

#[context("Saving staged plan")]
pub fn save_staged(img: &Image, plan: &PlanDescription) -> Result<()> {
    img.imgdir().create_dir_all(PLAN_DIR)?;
    write_json(img.imgdir(), PLAN_FILE, plan)
}

/// Load the staged plan.  If the image has moved since planning the
/// move is logged; callers recompute linked paths from the new root.
#[context("Loading staged plan")]
pub fn load_staged(img: &Image) -> Result<PlanDescription> {
    let plan: PlanDescription = read_json_optional(img.imgdir(), PLAN_FILE)?
        .with_context(|| format!("No staged plan in {}", img.root()))?;
    let t = plan.relocation(img);
    if !t.is_none() {
        tracing::info!(
            "Image planned at {} is now at {}; re-resolving paths",
            plan.root,
            img.root()
        );
    }
    Ok(plan)
}

pub fn clear_staged(img: &Image) -> Result<()> {
    img.imgdir().remove_file_optional(PLAN_FILE)?;
    Ok(())
}
