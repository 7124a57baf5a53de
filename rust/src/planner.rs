//! Package planning.
//!
//! The linked image code does not care how a plan is found, only which
//! packages it adds, removes and updates.  [`SimplePlanner`] works over
//! the image's own catalog: it applies the requested change and then
//! repeatedly fixes up parent constraints, install holds, incorporations
//! and requirements until nothing else needs to move.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::errors::LinkedError;
use crate::fmri::{Fmri, Version};
use crate::image::Image;
use crate::linked::audit::pkg_insync;
use crate::linked::store::ParentMetadata;
use crate::manifest::{Depend, DependKind, Manifest};
use crate::varcet::{Facets, Variants};
use anyhow::Result;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Upper bound on fix-up passes.
const MAX_PASSES: usize = 32;

/// The packaging operation being planned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum PkgOp {
    Install {
        pkgs: Vec<String>,
    },
    /// Update the named packages, or everything when empty.
    Update {
        pkgs: Vec<String>,
    },
    Uninstall {
        pkgs: Vec<String>,
    },
    /// Change local facets (`None` resets to the default) and variants.
    ChangeVarcets {
        #[serde(default)]
        facets: BTreeMap<String, Option<bool>>,
        #[serde(default)]
        variants: BTreeMap<String, String>,
    },
    /// Bring parent-constrained packages in line with the parent.
    Sync,
    /// Drop parent constraints and honor all install holds again.
    Detach,
}

impl PkgOp {
    pub fn name(&self) -> &'static str {
        match self {
            PkgOp::Install { .. } => "install",
            PkgOp::Update { .. } => "update",
            PkgOp::Uninstall { .. } => "uninstall",
            PkgOp::ChangeVarcets { .. } => "change-varcets",
            PkgOp::Sync => "sync",
            PkgOp::Detach => "detach",
        }
    }
}

/// Everything besides the operation that restricts a plan.
#[derive(Debug, Clone, Default)]
pub struct Constraints {
    /// Effective facets after the operation.
    pub facets: Facets,
    /// Effective variants after the operation.
    pub variants: Variants,
    /// Parent snapshot; parent-constrained packages must match it.
    pub parent: Option<ParentMetadata>,
    /// Install holds in force (stem to version); relaxed holds are
    /// already left out.
    pub holds: BTreeMap<String, String>,
}

impl Constraints {
    fn applies(&self, d: &Depend) -> bool {
        self.facets.allows(d) && self.variants.allows(d)
    }

    fn is_constrained(&self, m: &Manifest) -> bool {
        m.depends
            .iter()
            .any(|d| d.is_parent_self() && self.applies(d))
    }

    fn hold(&self, stem: &str) -> Option<Version> {
        let v = self.holds.get(stem)?;
        match v.parse::<Version>() {
            Ok(v) => Some(v),
            Err(e) => {
                tracing::warn!("Ignoring install hold on {stem}: {e}");
                None
            }
        }
    }
}

/// Package changes of a plan.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PkgPlan {
    pub install: Vec<Fmri>,
    pub remove: Vec<Fmri>,
    pub update: Vec<(Fmri, Fmri)>,
    /// The installed set once the plan is executed.
    pub new_installed: BTreeSet<Fmri>,
}

impl PkgPlan {
    /// A plan that keeps everything as installed.
    pub fn unchanged(installed: &BTreeSet<Fmri>) -> Self {
        Self {
            new_installed: installed.clone(),
            ..Default::default()
        }
    }

    pub fn is_empty(&self) -> bool {
        self.install.is_empty() && self.remove.is_empty() && self.update.is_empty()
    }

    /// Every package the plan touches, for error messages.
    pub fn changed_pkgs(&self) -> Vec<String> {
        let mut r: Vec<String> = self.install.iter().map(|f| f.to_string()).collect();
        r.extend(self.remove.iter().map(|f| f.to_string()));
        r.extend(self.update.iter().map(|(a, b)| format!("{a} -> {b}")));
        r
    }
}

pub trait Planner: std::fmt::Debug + Send + Sync {
    fn plan(&self, img: &Image, op: &PkgOp, c: &Constraints) -> Result<PkgPlan>;
}

#[derive(Debug, Default)]
pub struct SimplePlanner;

struct Solver<'a> {
    img: &'a Image,
    c: &'a Constraints,
    target: BTreeMap<String, Fmri>,
    /// Packages the user explicitly asked for; never moved by fix-ups.
    pinned: BTreeSet<String>,
    removed: BTreeSet<String>,
    problems: Vec<String>,
}

impl<'a> Solver<'a> {
    fn new(img: &'a Image, c: &'a Constraints) -> Self {
        let target = img
            .installed()
            .iter()
            .map(|f| (f.stem.clone(), f.clone()))
            .collect();
        Self {
            img,
            c,
            target,
            pinned: BTreeSet::new(),
            removed: BTreeSet::new(),
            problems: Vec::new(),
        }
    }

    fn manifest(&self, f: &Fmri) -> Manifest {
        self.img.manifest(f)
    }

    fn problem(&mut self, s: String) {
        if !self.problems.contains(&s) {
            self.problems.push(s);
        }
    }

    /// Whether a candidate agrees with the parent and with every
    /// incorporation of the other target packages.
    fn acceptable(&self, cand: &Manifest) -> bool {
        if let Some(pmd) = self.c.parent.as_ref() {
            if self.c.is_constrained(cand) {
                match pmd.ppkg(&cand.fmri.stem) {
                    Some(pf) if pkg_insync(&cand.fmri, pf) => {}
                    _ => return false,
                }
            }
        }
        if let Some(hv) = self.c.hold(&cand.fmri.stem) {
            if !cand.fmri.version_or_default().is_successor_auto(&hv) {
                return false;
            }
        }
        for (stem, f) in self.target.iter() {
            if stem == &cand.fmri.stem {
                continue;
            }
            let m = self.manifest(f);
            for d in m.depends_of(DependKind::Incorporate) {
                if !self.c.applies(d) {
                    continue;
                }
                for t in d.targets() {
                    if t.stem == cand.fmri.stem && !t.matches(&cand.fmri) {
                        return false;
                    }
                }
            }
        }
        true
    }

    /// The newest acceptable catalog version matching a pattern.
    fn choose(&self, pattern: &Fmri) -> Option<Fmri> {
        self.img
            .catalog()
            .versions_of(&pattern.stem)
            .into_iter()
            .rev()
            .filter(|m| pattern.matches(&m.fmri))
            .find(|m| self.acceptable(m))
            .map(|m| m.fmri.clone())
    }

    fn set(&mut self, f: Fmri) {
        tracing::trace!("Planning {f}");
        self.target.insert(f.stem.clone(), f);
    }

    fn apply_op(&mut self, op: &PkgOp) -> Result<()> {
        match op {
            PkgOp::Install { pkgs } => {
                for p in pkgs {
                    let pat: Fmri = p.parse()?;
                    match self.choose(&pat) {
                        Some(f) => {
                            self.pinned.insert(f.stem.clone());
                            self.set(f);
                        }
                        None => self.problem(format!("no acceptable version of {p} is available")),
                    }
                }
            }
            PkgOp::Update { pkgs } => {
                let stems: Vec<(String, bool)> = if pkgs.is_empty() {
                    self.target.keys().map(|s| (s.clone(), false)).collect()
                } else {
                    let mut r = Vec::new();
                    for p in pkgs {
                        let pat: Fmri = p.parse()?;
                        if !self.target.contains_key(&pat.stem) {
                            self.problem(format!("{p} is not installed"));
                            continue;
                        }
                        r.push((pat.stem, true));
                    }
                    r
                };
                for (stem, named) in stems {
                    if self.c.holds.contains_key(&stem) {
                        if named {
                            self.problem(format!("{stem} is held and cannot be updated"));
                        }
                        continue;
                    }
                    let pat = Fmri {
                        publisher: None,
                        stem: stem.clone(),
                        version: None,
                    };
                    if let Some(f) = self.choose(&pat) {
                        let newer = self
                            .target
                            .get(&stem)
                            .map(|cur| f.version > cur.version)
                            .unwrap_or(true);
                        if newer {
                            self.set(f);
                        }
                    }
                }
            }
            PkgOp::Uninstall { pkgs } => {
                for p in pkgs {
                    let pat: Fmri = p.parse()?;
                    match self.target.get(&pat.stem) {
                        Some(f) if pat.matches(f) => {
                            self.target.remove(&pat.stem);
                            self.removed.insert(pat.stem.clone());
                            self.pinned.insert(pat.stem);
                        }
                        _ => self.problem(format!("{p} is not installed")),
                    }
                }
            }
            PkgOp::ChangeVarcets { .. } | PkgOp::Sync | PkgOp::Detach => {}
        }
        Ok(())
    }

    /// Move a package to `want`, if allowed.
    fn move_to(&mut self, stem: &str, want: Option<Fmri>, why: String) -> bool {
        if self.pinned.contains(stem) {
            self.problem(why);
            return false;
        }
        match want {
            Some(f) => {
                self.set(f);
                true
            }
            None => {
                self.problem(why);
                false
            }
        }
    }

    /// One pass of fix-ups; returns true if anything moved.
    fn fixup(&mut self) -> bool {
        let mut changed = false;
        let current: Vec<Fmri> = self.target.values().cloned().collect();

        if let Some(pmd) = self.c.parent.clone() {
            for f in current.iter() {
                let m = self.manifest(f);
                if !self.c.is_constrained(&m) {
                    continue;
                }
                match pmd.ppkg(&f.stem) {
                    None => self.problem(format!(
                        "{f} depends on the parent, but {} is not installed there",
                        f.stem
                    )),
                    Some(pf) if !pkg_insync(f, pf) => {
                        let want = Fmri {
                            publisher: None,
                            stem: f.stem.clone(),
                            version: None,
                        };
                        let want = self.choose(&want);
                        let why = match self.c.holds.get(&f.stem) {
                            Some(hv) => format!("{} is held at {hv}, parent has {pf}", f.stem),
                            None => format!("{f} must match {pf} in the parent image"),
                        };
                        changed |= self.move_to(&f.stem, want, why);
                    }
                    Some(_) => {}
                }
            }
        }

        for (stem, _) in self.c.holds.clone() {
            let Some(hv) = self.c.hold(&stem) else {
                continue;
            };
            let Some(f) = self.target.get(&stem).cloned() else {
                continue;
            };
            if f.version_or_default().is_successor_auto(&hv) {
                continue;
            }
            let want = Fmri {
                publisher: None,
                stem: stem.clone(),
                version: Some(hv.clone()),
            };
            let want = self.choose(&want);
            changed |= self.move_to(&stem, want, format!("{stem} is held at {hv}"));
        }

        let current: Vec<Fmri> = self.target.values().cloned().collect();
        for f in current.iter() {
            let m = self.manifest(f);
            for d in m.depends.iter() {
                if !self.c.applies(d) {
                    continue;
                }
                let require = match d.kind {
                    DependKind::Require => true,
                    DependKind::Incorporate => false,
                    DependKind::Parent => continue,
                };
                for t in d.targets() {
                    match self.target.get(&t.stem).cloned() {
                        None if require && self.removed.contains(&t.stem) => {
                            self.problem(format!("{} is required by {f}", t.stem))
                        }
                        None if require => {
                            let want = self.choose(&t);
                            let why = format!("no acceptable version of {t} (required by {f})");
                            changed |= self.move_to(&t.stem, want, why);
                        }
                        None => {}
                        Some(cur) if !t.matches(&cur) => {
                            let want = self.choose(&t);
                            let why = match self.c.holds.get(&t.stem) {
                                Some(hv) => format!("{} is held at {hv}, but {f} requires {t}", t.stem),
                                None => format!("{f} requires {t}, which is not available"),
                            };
                            changed |= self.move_to(&t.stem, want, why);
                        }
                        Some(_) => {}
                    }
                }
            }
        }
        changed
    }

    fn finish(self) -> Result<PkgPlan> {
        if !self.problems.is_empty() {
            return Err(LinkedError::ConstraintUnsatisfiable {
                details: self.problems,
            }
            .into());
        }
        let before: BTreeMap<&str, &Fmri> = self
            .img
            .installed()
            .iter()
            .map(|f| (f.stem.as_str(), f))
            .collect();
        let mut plan = PkgPlan::default();
        for (stem, f) in self.target.iter() {
            match before.get(stem.as_str()) {
                None => plan.install.push(f.clone()),
                Some(old) if old.version != f.version => {
                    plan.update.push(((*old).clone(), f.clone()))
                }
                Some(_) => {}
            }
        }
        for (stem, f) in before.iter() {
            if !self.target.contains_key(*stem) {
                plan.remove.push((*f).clone());
            }
        }
        plan.new_installed = self.target.into_values().collect();
        Ok(plan)
    }
}

impl Planner for SimplePlanner {
    fn plan(&self, img: &Image, op: &PkgOp, c: &Constraints) -> Result<PkgPlan> {
        let mut s = Solver::new(img, c);
        s.apply_op(op)?;
        let mut passes = 0;
        while s.problems.is_empty() && s.fixup() {
            passes += 1;
            if passes >= MAX_PASSES {
                s.problem("no stable set of packages was found".into());
            }
        }
        let plan = s.finish()?;
        tracing::debug!(
            "Planned {} for {}: {} install, {} remove, {} update",
            op.name(),
            img.root(),
            plan.install.len(),
            plan.remove.len(),
            plan.update.len()
        );
        Ok(plan)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{error_kind_of, ErrorKind};
    use crate::image::tests::utf8_tempdir;
    use crate::image::ImageConfig;
    use crate::manifest::Catalog;
    use indoc::indoc;
    use maplit::btreemap;

    const CATALOG: &str = indoc! {r#"
        {"packages": [
          {"fmri": "pkg://test/foo@1.0", "depends": [
            {"type": "parent", "fmri": ["feature/package/dependency/self"]}
          ]},
          {"fmri": "pkg://test/foo@2.0", "depends": [
            {"type": "parent", "fmri": ["feature/package/dependency/self"]},
            {"type": "incorporate", "fmri": ["lib@2"]}
          ]},
          {"fmri": "pkg://test/lib@1.0"},
          {"fmri": "pkg://test/lib@2.0"},
          {"fmri": "pkg://test/app@1.0", "depends": [
            {"type": "require", "fmri": ["lib@1"]}
          ]},
          {"fmri": "pkg://test/tool@1.0", "depends": [
            {"type": "require", "fmri": ["lib"]}
          ]}
        ]}
    "#};

    fn image(installed: &[&str]) -> Result<(tempfile::TempDir, Image)> {
        let (td, base) = utf8_tempdir()?;
        let mut img = Image::create(&base.join("img"), ImageConfig::default())?;
        img.set_catalog(serde_json::from_str::<Catalog>(CATALOG)?)?;
        let installed: Result<BTreeSet<Fmri>> =
            installed.iter().map(|s| Ok(s.parse()?)).collect();
        img.set_installed(installed?)?;
        Ok((td, img))
    }

    fn parent(ppkgs: &[&str]) -> Option<ParentMetadata> {
        Some(ParentMetadata {
            ppkgs: ppkgs.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        })
    }

    fn names(v: &[Fmri]) -> Vec<String> {
        v.iter().map(|f| f.to_string()).collect()
    }

    #[test]
    fn install_pulls_requirements() -> Result<()> {
        let (_td, img) = image(&[])?;
        let op = PkgOp::Install {
            pkgs: vec!["tool".into()],
        };
        let plan = SimplePlanner.plan(&img, &op, &Constraints::default())?;
        assert_eq!(
            names(&plan.install),
            ["pkg://test/lib@2.0", "pkg://test/tool@1.0"]
        );
        assert!(plan.remove.is_empty());
        Ok(())
    }

    #[test]
    fn sync_follows_parent() -> Result<()> {
        let (_td, img) = image(&["pkg://test/foo@2.0", "pkg://test/lib@2.0"])?;
        let c = Constraints {
            parent: parent(&["pkg://test/foo@1.0"]),
            ..Default::default()
        };
        let plan = SimplePlanner.plan(&img, &PkgOp::Sync, &c)?;
        assert_eq!(plan.update.len(), 1);
        assert_eq!(plan.update[0].1.to_string(), "pkg://test/foo@1.0");

        let c = Constraints {
            parent: parent(&["pkg://test/foo@2.0"]),
            ..Default::default()
        };
        assert!(SimplePlanner.plan(&img, &PkgOp::Sync, &c)?.is_empty());
        Ok(())
    }

    #[test]
    fn sync_missing_parent_package() -> Result<()> {
        let (_td, img) = image(&["pkg://test/foo@1.0"])?;
        let c = Constraints {
            parent: parent(&[]),
            ..Default::default()
        };
        let e = SimplePlanner.plan(&img, &PkgOp::Sync, &c).unwrap_err();
        assert_eq!(error_kind_of(&e), ErrorKind::Constraint);
        Ok(())
    }

    #[test]
    fn unrelated_hold_blocks_sync() -> Result<()> {
        // foo@2.0 incorporates lib@2, but lib is held at 1.
        let (_td, img) = image(&["pkg://test/foo@1.0", "pkg://test/lib@1.0"])?;
        let c = Constraints {
            parent: parent(&["pkg://test/foo@2.0"]),
            holds: btreemap! { "lib".to_string() => "1".to_string() },
            ..Default::default()
        };
        let e = SimplePlanner.plan(&img, &PkgOp::Sync, &c).unwrap_err();
        assert_eq!(error_kind_of(&e), ErrorKind::Constraint);
        assert!(format!("{e}").contains("lib is held at 1"));

        let c = Constraints {
            holds: BTreeMap::new(),
            ..c
        };
        let plan = SimplePlanner.plan(&img, &PkgOp::Sync, &c)?;
        assert_eq!(plan.update.len(), 2);
        Ok(())
    }

    #[test]
    fn detach_reasserts_holds() -> Result<()> {
        let (_td, img) = image(&["pkg://test/foo@2.0", "pkg://test/lib@2.0"])?;
        let c = Constraints {
            holds: btreemap! { "foo".to_string() => "1.0".to_string() },
            ..Default::default()
        };
        let plan = SimplePlanner.plan(&img, &PkgOp::Detach, &c)?;
        assert_eq!(plan.changed_pkgs(), ["pkg://test/foo@2.0 -> pkg://test/foo@1.0"]);
        Ok(())
    }

    #[test]
    fn uninstall_required() -> Result<()> {
        let (_td, img) = image(&["pkg://test/app@1.0", "pkg://test/lib@1.0"])?;
        let op = PkgOp::Uninstall {
            pkgs: vec!["lib".into()],
        };
        assert!(SimplePlanner.plan(&img, &op, &Constraints::default()).is_err());
        let op = PkgOp::Uninstall {
            pkgs: vec!["app".into(), "lib".into()],
        };
        let plan = SimplePlanner.plan(&img, &op, &Constraints::default())?;
        assert_eq!(plan.remove.len(), 2);
        assert!(plan.new_installed.is_empty());
        Ok(())
    }

    #[test]
    fn update_respects_incorporations() -> Result<()> {
        let (_td, img) = image(&["pkg://test/app@1.0", "pkg://test/lib@1.0"])?;
        let op = PkgOp::Update { pkgs: vec![] };
        let plan = SimplePlanner.plan(&img, &op, &Constraints::default())?;
        // app requires lib@1, so lib@2 is moved straight back
        assert!(plan.is_empty());
        Ok(())
    }
}
