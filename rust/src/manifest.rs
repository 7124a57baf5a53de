//! Package manifests, as far as dependency handling is concerned.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::fmri::Fmri;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// The target of a parent dependency that constrains a package to the
/// version installed in the parent image.
pub const DEPEND_SELF: &str = "feature/package/dependency/self";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependKind {
    Require,
    Incorporate,
    Parent,
}

/// A `depend` action.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Depend {
    #[serde(rename = "type")]
    pub kind: DependKind,
    pub fmri: Vec<String>,
    /// `facet.*` and `variant.*` attributes gating this action.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub attrs: BTreeMap<String, String>,
}

impl Depend {
    /// Iterate over facet attributes as `(name, value)`; values which are
    /// not booleans never match anything.
    pub fn facet_attrs(&self) -> impl Iterator<Item = (&str, Option<bool>)> {
        self.attrs
            .iter()
            .filter(|(k, _)| k.starts_with("facet."))
            .map(|(k, v)| (k.as_str(), v.parse::<bool>().ok()))
    }

    pub fn variant_attrs(&self) -> impl Iterator<Item = (&str, &str)> {
        self.attrs
            .iter()
            .filter(|(k, _)| k.starts_with("variant."))
            .map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Targets that parse as FMRIs; the special self target is skipped.
    pub fn targets(&self) -> impl Iterator<Item = Fmri> + '_ {
        self.fmri
            .iter()
            .filter(|f| f.as_str() != DEPEND_SELF)
            .filter_map(|f| match f.parse::<Fmri>() {
                Ok(f) => Some(f),
                Err(e) => {
                    tracing::warn!("Ignoring invalid dependency target {f}: {e}");
                    None
                }
            })
    }

    pub fn is_parent_self(&self) -> bool {
        self.kind == DependKind::Parent && self.fmri.iter().any(|f| f == DEPEND_SELF)
    }
}

/// The parts of a package manifest we care about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Manifest {
    pub fmri: Fmri,
    #[serde(default)]
    pub depends: Vec<Depend>,
}

impl Manifest {
    /// Returns true if this package must track the version installed in
    /// the parent image.
    pub fn has_parent_dep(&self) -> bool {
        self.depends.iter().any(|d| d.is_parent_self())
    }

    pub fn depends_of(&self, kind: DependKind) -> impl Iterator<Item = &Depend> {
        self.depends.iter().filter(move |d| d.kind == kind)
    }
}

/// The set of packages known to an image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Catalog {
    #[serde(default)]
    pub packages: Vec<Manifest>,
}

impl Catalog {
    /// Look up a manifest by exact FMRI (ignoring publisher).
    pub fn get(&self, fmri: &Fmri) -> Option<&Manifest> {
        self.packages
            .iter()
            .find(|m| m.fmri.stem == fmri.stem && m.fmri.version == fmri.version)
    }

    /// All versions of a package, oldest first.
    pub fn versions_of(&self, stem: &str) -> Vec<&Manifest> {
        let mut r: Vec<_> = self
            .packages
            .iter()
            .filter(|m| m.fmri.stem == stem)
            .collect();
        r.sort_by(|a, b| a.fmri.cmp(&b.fmri));
        r
    }

    /// The newest package matching a pattern.
    pub fn newest_matching(&self, pattern: &Fmri) -> Option<&Manifest> {
        self.versions_of(&pattern.stem)
            .into_iter()
            .filter(|m| pattern.matches(&m.fmri))
            .last()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    const CATALOG: &str = indoc! {r#"
        {
          "packages": [
            {"fmri": "pkg://test/foo@1.0", "depends": [
              {"type": "parent", "fmri": ["feature/package/dependency/self"]}
            ]},
            {"fmri": "pkg://test/foo@2.0", "depends": [
              {"type": "parent", "fmri": ["feature/package/dependency/self"]},
              {"type": "incorporate", "fmri": ["bar@2"], "attrs": {"facet.version-lock.bar": "true"}}
            ]},
            {"fmri": "pkg://test/foo@1.5"},
            {"fmri": "pkg://test/bar@2.1"}
          ]
        }
    "#};

    #[test]
    fn catalog_lookup() {
        let cat: Catalog = serde_json::from_str(CATALOG).unwrap();
        let foo: Fmri = "foo".parse().unwrap();
        let newest = cat.newest_matching(&foo).unwrap();
        assert_eq!(newest.fmri.to_string(), "pkg://test/foo@2.0");
        assert!(newest.has_parent_dep());
        let vers: Vec<_> = cat
            .versions_of("foo")
            .iter()
            .map(|m| m.fmri.to_string())
            .collect();
        assert_eq!(
            vers,
            ["pkg://test/foo@1.0", "pkg://test/foo@1.5", "pkg://test/foo@2.0"]
        );
        assert!(!cat.get(&"foo@1.5".parse().unwrap()).unwrap().has_parent_dep());
        let inc = newest.depends_of(DependKind::Incorporate).next().unwrap();
        let facets: Vec<_> = inc.facet_attrs().collect();
        assert_eq!(facets, [("facet.version-lock.bar", Some(true))]);
        assert_eq!(inc.targets().count(), 1);
    }

    #[test]
    fn unknown_fields_rejected() {
        let r: Result<Manifest, _> = serde_json::from_str(r#"{"fmri": "a@1", "bogus": 1}"#);
        assert!(r.is_err());
    }
}
