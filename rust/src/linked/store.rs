//! On-disk linked image metadata.
//!
//! Each file is independently optional and regenerable; readers must
//! cope with any subset being absent.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::LinkedImageName;
use super::props::LinkedProps;
use crate::errors::LinkedError;
use crate::fmri::Fmri;
use crate::image::{read_json_optional, write_json, Publisher};
use anyhow::Result;
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::de::DeserializeOwned;
use serde_derive::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

pub const LINKED_DIR: &str = "linked";
pub const PROPS_FILE: &str = "linked/linked_prop";
pub const CHILDREN_FILE: &str = "linked/linked_children";
pub const PPKGS_FILE: &str = "linked/linked_ppkgs";
pub const PPUBS_FILE: &str = "linked/linked_ppubs";
pub const PFACETS_FILE: &str = "linked/linked_pfacets";


/// Facet and variant values a child inherits from its parent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct InheritedVarcets {
    #[serde(default)]
    pub facets: BTreeMap<String, bool>,
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
}

/// A snapshot of parent state relevant to a child.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ParentMetadata {
    pub ppkgs: BTreeSet<Fmri>,
    #[serde(default)]
    pub ppubs: Vec<Publisher>,
    #[serde(default)]
    pub pvarcets: InheritedVarcets,
}

impl ParentMetadata {
    /// The parent's package with the given stem.
    pub fn ppkg(&self, stem: &str) -> Option<&Fmri> {
        self.ppkgs.iter().find(|f| f.stem == stem)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct PkgList {
    packages: BTreeSet<Fmri>,
}

/// Accessor for the linked metadata stored in an image directory.
#[derive(Debug)]
pub struct MetadataStore<'a> {
    imgdir: &'a Dir,
}

impl<'a> MetadataStore<'a> {
    pub fn new(imgdir: &'a Dir) -> Self {
        Self { imgdir }
    }

    /// Read a metadata file; parse failures are reported as recoverable
    /// metadata errors.
    fn read<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>> {
        read_json_optional(self.imgdir, path).map_err(|e| {
            LinkedError::MetadataCorrupt {
                file: path.to_string(),
                reason: format!("{e:#}"),
            }
            .into()
        })
    }

    /// Like [`Self::read`] but downgrades unreadable files to absent.
    fn read_lenient<T: DeserializeOwned>(&self, path: &str) -> Option<T> {
        match self.read(path) {
            Ok(v) => v,
            Err(e) => {
                tracing::warn!("Ignoring linked metadata: {e:#}");
                None
            }
        }
    }

    fn write<T: serde::Serialize>(&self, path: &str, v: &T) -> Result<()> {
        self.imgdir.create_dir_all(LINKED_DIR)?;
        write_json(self.imgdir, path, v)
    }

    pub fn has_props(&self) -> Result<bool> {
        Ok(self.imgdir.try_exists(PROPS_FILE)?)
    }

    pub fn load_props(&self) -> Option<LinkedProps> {
        self.read_lenient(PROPS_FILE)
    }

    pub fn load_props_strict(&self) -> Result<Option<LinkedProps>> {
        self.read(PROPS_FILE)
    }

    #[context("Saving linked properties")]
    pub fn save_props(&self, props: &LinkedProps) -> Result<()> {
        props.verify()?;
        self.write(PROPS_FILE, &props.persistent())
    }

    pub fn load_children(&self) -> BTreeMap<LinkedImageName, LinkedProps> {
        self.read_lenient(CHILDREN_FILE).unwrap_or_default()
    }

    #[context("Saving child registry")]
    pub fn save_children(&self, children: &BTreeMap<LinkedImageName, LinkedProps>) -> Result<()> {
        if children.is_empty() {
            self.imgdir.remove_file_optional(CHILDREN_FILE)?;
            return Ok(());
        }
        let children: BTreeMap<_, _> = children
            .iter()
            .map(|(k, v)| (k.clone(), v.persistent()))
            .collect();
        self.write(CHILDREN_FILE, &children)
    }

    /// Load the cached parent snapshot.  Without a package list there is
    /// no snapshot; missing publisher or facet files read as empty.
    pub fn load_parent_md(&self) -> Option<ParentMetadata> {
        let ppkgs: PkgList = self.read_lenient(PPKGS_FILE)?;
        let ppubs: Vec<Publisher> = self.read_lenient(PPUBS_FILE).unwrap_or_default();
        let pvarcets: InheritedVarcets = self.read_lenient(PFACETS_FILE).unwrap_or_default();
        Some(ParentMetadata {
            ppkgs: ppkgs.packages,
            ppubs,
            pvarcets,
        })
    }

    #[context("Saving parent metadata")]
    pub fn save_parent_md(&self, pmd: &ParentMetadata) -> Result<()> {
        let ppkgs = PkgList {
            packages: pmd.ppkgs.clone(),
        };
        self.write(PPKGS_FILE, &ppkgs)?;
        self.write(PPUBS_FILE, &pmd.ppubs)?;
        self.write(PFACETS_FILE, &pmd.pvarcets)?;
        Ok(())
    }

    pub fn remove_parent_md(&self) -> Result<()> {
        for f in [PPKGS_FILE, PPUBS_FILE, PFACETS_FILE] {
            self.imgdir.remove_file_optional(f)?;
        }
        Ok(())
    }

    /// Remove this image's own properties; the child registry is kept.
    pub fn remove_props(&self) -> Result<()> {
        self.imgdir.remove_file_optional(PROPS_FILE)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::linked::props::Model;
    use cap_std_ext::cap_tempfile;

    fn pmd() -> ParentMetadata {
        ParentMetadata {
            ppkgs: ["pkg://test/foo@1.0".parse().unwrap()].into(),
            ppubs: vec![Publisher::new("test")],
            pvarcets: InheritedVarcets {
                facets: [("facet.doc".to_string(), false)].into(),
                variants: BTreeMap::new(),
            },
        }
    }

    #[test]
    fn props_roundtrip() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let store = MetadataStore::new(&td);
        assert!(store.load_props().is_none());
        assert!(!store.has_props()?);
        let props = LinkedProps {
            name: Some("system:c".parse()?),
            model: Some(Model::Push),
            path: "/c/".into(),
            current_path: Some("/elsewhere/".into()),
            ..Default::default()
        };
        store.save_props(&props)?;
        assert_eq!(store.load_props(), Some(props.persistent()));
        let bad = LinkedProps::new_unlinked("relative");
        assert!(store.save_props(&bad).is_err());
        Ok(())
    }

    #[test]
    fn corrupt_files_are_recoverable() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let store = MetadataStore::new(&td);
        td.create_dir_all(LINKED_DIR)?;
        td.atomic_write(PROPS_FILE, "{ not json")?;
        assert!(store.load_props().is_none());
        let e = store.load_props_strict().unwrap_err();
        assert_eq!(
            crate::errors::error_kind_of(&e),
            crate::errors::ErrorKind::Metadata
        );
        td.atomic_write(PPKGS_FILE, "[]")?;
        assert!(store.load_parent_md().is_none());
        Ok(())
    }

    #[test]
    fn parent_md_partial() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let store = MetadataStore::new(&td);
        assert!(store.load_parent_md().is_none());
        let pmd = pmd();
        store.save_parent_md(&pmd)?;
        assert_eq!(store.load_parent_md().as_ref(), Some(&pmd));
        // Each file is independently optional
        td.remove_file(PPUBS_FILE)?;
        td.remove_file(PFACETS_FILE)?;
        let loaded = store.load_parent_md().unwrap();
        assert_eq!(loaded.ppkgs, pmd.ppkgs);
        assert!(loaded.ppubs.is_empty());
        td.remove_file(PPKGS_FILE)?;
        assert!(store.load_parent_md().is_none());
        Ok(())
    }

    #[test]
    fn children_registry() -> Result<()> {
        let td = cap_tempfile::tempdir(cap_std::ambient_authority())?;
        let store = MetadataStore::new(&td);
        let name: LinkedImageName = "system:c".parse()?;
        let mut reg = BTreeMap::new();
        reg.insert(name.clone(), LinkedProps::new_unlinked("/c"));
        store.save_children(&reg)?;
        assert!(td.try_exists(CHILDREN_FILE)?);
        assert_eq!(store.load_children(), reg);
        store.save_children(&BTreeMap::new())?;
        assert!(!td.try_exists(CHILDREN_FILE)?);
        store.save_parent_md(&pmd())?;
        store.save_props(&LinkedProps::new_unlinked("/p"))?;
        store.remove_props()?;
        store.remove_parent_md()?;
        assert!(!store.has_props()?);
        assert!(store.load_parent_md().is_none());
        Ok(())
    }
}
