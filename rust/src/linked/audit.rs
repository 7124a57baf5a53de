//! Checking a child against the state of its parent.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::store::ParentMetadata;
use crate::errors::LinkedError;
use crate::fmri::Fmri;
use crate::image::{Image, Publisher};
use crate::varcet::{Facets, Variants};
use anyhow::Result;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// One way in which a child does not match its parent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Divergence {
    /// The child package, or empty when the whole image is affected.
    pub pkg: String,
    pub reason: String,
}

impl std::fmt::Display for Divergence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.pkg.is_empty() {
            f.write_str(&self.reason)
        } else {
            write!(f, "{}: {}", self.pkg, self.reason)
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct AuditReport {
    pub diverged: Vec<Divergence>,
}

impl AuditReport {
    pub fn is_insync(&self) -> bool {
        self.diverged.is_empty()
    }
}

/// Whether a child package version satisfies the parent's: equal, or the
/// parent's version is a successor of the child's.
pub fn pkg_insync(child: &Fmri, parent: &Fmri) -> bool {
    let c = child.version_or_default();
    let p = parent.version_or_default();
    c == p || p.is_successor_auto(&c)
}

/// Audit an installed package set against a parent snapshot.  Without a
/// snapshot nothing can be proven, so the image is reported diverged.
pub fn audit_pkgs(
    img: &Image,
    installed: &BTreeSet<Fmri>,
    facets: &Facets,
    variants: &Variants,
    pmd: Option<&ParentMetadata>,
) -> AuditReport {
    let mut report = AuditReport::default();
    let Some(pmd) = pmd else {
        report.diverged.push(Divergence {
            pkg: String::new(),
            reason: "no parent package snapshot is available".into(),
        });
        return report;
    };
    for f in installed.iter() {
        let m = img.manifest(f);
        let constrained = m
            .depends
            .iter()
            .any(|d| d.is_parent_self() && facets.allows(d) && variants.allows(d));
        if !constrained {
            continue;
        }
        match pmd.ppkg(&f.stem) {
            None => report.diverged.push(Divergence {
                pkg: f.to_string(),
                reason: "not installed in the parent image".into(),
            }),
            Some(pf) if !pkg_insync(f, pf) => report.diverged.push(Divergence {
                pkg: f.to_string(),
                reason: format!("parent image has {pf}"),
            }),
            Some(_) => {}
        }
    }
    report
}

/// A child must be configured with every publisher of its parent, in the
/// parent's relative order and with the same sticky and disabled flags.
pub fn pubcheck(child: &[Publisher], parent: &[Publisher]) -> Result<()> {
    let mut details = Vec::new();
    let mut last_pos: Option<usize> = None;
    for pp in parent.iter() {
        let Some((pos, cp)) = child.iter().enumerate().find(|(_, c)| c.name == pp.name) else {
            details.push(format!("publisher {} is missing", pp.name));
            continue;
        };
        if cp.sticky != pp.sticky {
            details.push(format!(
                "publisher {} has sticky={}, parent has sticky={}",
                pp.name, cp.sticky, pp.sticky
            ));
        }
        if cp.disabled != pp.disabled {
            details.push(format!(
                "publisher {} has disabled={}, parent has disabled={}",
                pp.name, cp.disabled, pp.disabled
            ));
        }
        if matches!(last_pos, Some(l) if pos < l) {
            details.push(format!("publisher {} is ranked differently", pp.name));
        }
        last_pos = Some(pos);
    }
    if !details.is_empty() {
        return Err(LinkedError::PublisherMismatch { details }.into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::utf8_tempdir;
    use crate::image::ImageConfig;
    use crate::manifest::Catalog;
    use indoc::indoc;

    const CATALOG: &str = indoc! {r#"
        {"packages": [
          {"fmri": "pkg://test/foo@1.0", "depends": [
            {"type": "parent", "fmri": ["feature/package/dependency/self"]}
          ]},
          {"fmri": "pkg://test/foo@2.0", "depends": [
            {"type": "parent", "fmri": ["feature/package/dependency/self"]}
          ]},
          {"fmri": "pkg://test/docs@1.0", "depends": [
            {"type": "parent", "fmri": ["feature/package/dependency/self"],
             "attrs": {"facet.doc": "true"}}
          ]},
          {"fmri": "pkg://test/free@1.0"}
        ]}
    "#};

    fn child(installed: &[&str]) -> Result<(tempfile::TempDir, Image)> {
        let (td, base) = utf8_tempdir()?;
        let mut img = Image::create(&base.join("c"), ImageConfig::default())?;
        img.set_catalog(serde_json::from_str::<Catalog>(CATALOG)?)?;
        let installed: Result<BTreeSet<Fmri>> =
            installed.iter().map(|s| Ok(s.parse()?)).collect();
        img.set_installed(installed?)?;
        Ok((td, img))
    }

    fn pmd(ppkgs: &[&str]) -> ParentMetadata {
        ParentMetadata {
            ppkgs: ppkgs.iter().map(|s| s.parse().unwrap()).collect(),
            ..Default::default()
        }
    }

    fn audit(img: &Image, pmd: Option<&ParentMetadata>) -> Result<AuditReport> {
        let facets = img.local_facets()?;
        let variants = img.local_variants()?;
        Ok(audit_pkgs(img, img.installed(), &facets, &variants, pmd))
    }

    #[test]
    fn versions() {
        let f = |s: &str| -> Fmri { s.parse().unwrap() };
        assert!(pkg_insync(&f("foo@1.0"), &f("foo@1.0")));
        assert!(pkg_insync(&f("foo@1.0"), &f("foo@1.0.1")));
        assert!(!pkg_insync(&f("foo@1.0.1"), &f("foo@1.0")));
        assert!(!pkg_insync(&f("foo@2.0"), &f("foo@1.0")));
    }

    #[test]
    fn empty_images_are_insync() -> Result<()> {
        let (_td, img) = child(&[])?;
        assert!(audit(&img, Some(&pmd(&[])))?.is_insync());
        assert!(!audit(&img, None)?.is_insync());
        Ok(())
    }

    #[test]
    fn constrained_packages() -> Result<()> {
        let (_td, img) = child(&["pkg://test/foo@2.0", "pkg://test/free@1.0"])?;
        let r = audit(&img, Some(&pmd(&["pkg://test/foo@1.0"])))?;
        assert_eq!(r.diverged.len(), 1);
        assert_eq!(r.diverged[0].pkg, "pkg://test/foo@2.0");
        assert!(audit(&img, Some(&pmd(&["pkg://test/foo@2.0"])))?.is_insync());
        let r = audit(&img, Some(&pmd(&[])))?;
        assert_eq!(r.diverged[0].reason, "not installed in the parent image");
        Ok(())
    }

    #[test]
    fn gated_parent_dependency() -> Result<()> {
        let (_td, mut img) = child(&["pkg://test/docs@1.0"])?;
        assert!(!audit(&img, Some(&pmd(&[])))?.is_insync());
        img.cfg.facets.insert("facet.doc".into(), false);
        assert!(audit(&img, Some(&pmd(&[])))?.is_insync());
        Ok(())
    }

    #[test]
    fn publishers() {
        let p = |n: &str| Publisher::new(n);
        let parent = [p("a"), p("b")];
        assert!(pubcheck(&[p("a"), p("x"), p("b")], &parent).is_ok());
        assert!(pubcheck(&[p("a")], &parent).is_err());
        assert!(pubcheck(&[p("b"), p("a")], &parent).is_err());
        let mut a = p("a");
        a.sticky = false;
        let e = pubcheck(&[a, p("b")], &parent).unwrap_err();
        assert!(e.to_string().contains("sticky"));
        assert_eq!(
            crate::errors::error_kind_of(&e),
            crate::errors::ErrorKind::Constraint
        );
    }
}
