//! Computing the snapshot of parent state handed to children.
//!
//! A parent package makes a facet or variant inheritable by carrying an
//! `incorporate` dependency gated on it, where the incorporated package
//! is itself installed in the parent and constrained to the parent
//! (it has a `parent` dependency on itself).  Children then see the
//! parent's value for that key, masking any local setting.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::store::{InheritedVarcets, ParentMetadata};
use crate::fmri::Fmri;
use crate::image::Image;
use crate::manifest::DependKind;
use crate::varcet::{Facets, Variants};
use std::collections::{BTreeMap, BTreeSet};

/// Parent state a snapshot is computed from; either what is installed
/// now or what a plan is about to install.
#[derive(Debug)]
pub struct ParentState<'a> {
    pub img: &'a Image,
    pub installed: &'a BTreeSet<Fmri>,
    pub facets: &'a Facets,
    pub variants: &'a Variants,
}

impl<'a> ParentState<'a> {
    /// Stems of installed packages which are themselves parent-constrained.
    fn constrained_stems(&self) -> BTreeSet<&'a str> {
        self.installed
            .iter()
            .filter(|f| self.img.manifest(f).has_parent_dep())
            .map(|f| f.stem.as_str())
            .collect()
    }

    /// Facets and variants children inherit.
    pub fn inheritable_varcets(&self) -> InheritedVarcets {
        let constrained = self.constrained_stems();
        let mut facets = BTreeMap::new();
        let mut variants = BTreeMap::new();
        for pfmri in self.installed.iter() {
            let m = self.img.manifest(pfmri);
            for dep in m.depends_of(DependKind::Incorporate) {
                let fmatch = self.facets.action_match(dep.facet_attrs().map(|(k, _)| k));
                // Facets default to true, so an all-true match says nothing.
                let fmatch_relevant = !fmatch.is_empty() && !fmatch.iter().all(|(_, v)| *v);
                let vmatch = self
                    .variants
                    .action_match(dep.variant_attrs().map(|(k, _)| k));
                if !fmatch_relevant && vmatch.is_empty() {
                    continue;
                }
                if !dep.targets().any(|t| constrained.contains(t.stem.as_str())) {
                    continue;
                }
                if fmatch_relevant {
                    facets.extend(fmatch);
                }
                variants.extend(vmatch);
            }
        }
        InheritedVarcets { facets, variants }
    }

    pub fn parent_metadata(&self) -> ParentMetadata {
        let pmd = ParentMetadata {
            ppkgs: self.installed.clone(),
            ppubs: self.img.cfg.publishers.clone(),
            pvarcets: self.inheritable_varcets(),
        };
        tracing::debug!(
            "Parent snapshot of {}: {} packages, {} inherited facets, {} inherited variants",
            self.img.root(),
            pmd.ppkgs.len(),
            pmd.pvarcets.facets.len(),
            pmd.pvarcets.variants.len()
        );
        pmd
    }
}
