//! Linked images.
//!
//! An image may be the child of one parent (as a push or pull child) and
//! the parent of any number of children.  [`LinkedImage`] holds what an
//! image knows about those relationships: its own properties, the cached
//! snapshot of its parent, and the child registries kept by each plugin.
//!
//! Recorded paths are always passed through the image's path transform
//! before they are compared with anything live, so a tree of linked
//! images keeps working after being moved or mounted elsewhere.
// SPDX-License-Identifier: Apache-2.0 OR MIT

pub mod audit;
pub mod child;
pub mod dispatch;
pub mod inherit;
pub mod name;
pub mod ops;
pub mod plugin;
pub mod props;
pub mod request;
pub mod sandbox;
pub mod store;
pub mod system;
pub mod validate;

use self::name::{LinkedImageName, LinkedKind};
use self::plugin::LinkedPlugin;
use self::props::{LinkedProps, Role};
use self::store::{MetadataStore, ParentMetadata};
use crate::errors::LinkedError;
use crate::image::Image;
use crate::paths::{self, PathTransform};
use crate::varcet::{Facets, Variants};
use anyhow::Result;
use camino::Utf8Path;
use fn_error_context::context;

/// A registered child as seen from its parent.
#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub name: LinkedImageName,
    /// Registry properties, with the current path filled in when known.
    pub props: LinkedProps,
    /// Where the child is now, or why it couldn't be found.
    pub location: std::result::Result<String, LinkedError>,
}

impl ChildEntry {
    pub fn path(&self) -> Result<&str> {
        self.location
            .as_deref()
            .map_err(|e| anyhow::Error::new(e.clone()))
    }

    pub fn is_reachable(&self) -> bool {
        self.location.is_ok()
    }
}

/// Linked state of one image.
#[derive(Debug)]
pub struct LinkedImage {
    root: String,
    props: LinkedProps,
    ondisk_props: Option<LinkedProps>,
    pmd: Option<ParentMetadata>,
    ondisk_pmd: Option<ParentMetadata>,
    plugins: Vec<Box<dyn LinkedPlugin>>,
}

fn guess_transform(img: &Image, plugins: &[Box<dyn LinkedPlugin>]) -> Result<PathTransform> {
    for p in plugins {
        let t = p.guess_path_transform(img)?;
        if !t.is_none() {
            tracing::debug!("{} plugin guessed path transform {t}", p.kind());
            return Ok(t);
        }
    }
    Ok(PathTransform::none())
}

impl LinkedImage {
    /// Load linked state.  Unreadable metadata is treated as absent.
    #[context("Loading linked image state")]
    pub fn load(img: &Image) -> Result<Self> {
        let root = img.root_str();
        let store = MetadataStore::new(img.imgdir());
        let ondisk_props = store.load_props();
        let plugins = plugin::load_plugins(img)?;
        let transform = match ondisk_props.as_ref() {
            Some(p) => PathTransform::compute(&p.path, &root),
            None => guess_transform(img, &plugins)?,
        };
        let props = ondisk_props
            .clone()
            .unwrap_or_else(|| LinkedProps::new_unlinked(&transform.revert(&root)));
        let ondisk_pmd = match props.role() {
            Role::None => None,
            _ => store.load_parent_md(),
        };
        let mut r = Self {
            root,
            props,
            ondisk_props,
            pmd: ondisk_pmd.clone(),
            ondisk_pmd,
            plugins,
        };
        r.refresh_temporal();
        if r.in_altroot() {
            tracing::debug!(
                "Image at {} was recorded at {}; using transform {}",
                r.root,
                r.props.path,
                r.props.path_transform
            );
        }
        Ok(r)
    }

    fn refresh_temporal(&mut self) {
        let t = PathTransform::compute(&self.props.path, &self.root);
        self.props.current_path = Some(self.root.clone());
        self.props.current_parent_path = self.props.parent_path.as_deref().map(|p| t.apply(p));
        self.props.path_transform = t;
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn props(&self) -> &LinkedProps {
        &self.props
    }

    pub fn role(&self) -> Role {
        self.props.role()
    }

    pub fn is_child(&self) -> bool {
        self.role() != Role::None
    }

    pub fn name(&self) -> Option<&LinkedImageName> {
        self.props.name.as_ref()
    }

    pub fn path_transform(&self) -> &PathTransform {
        &self.props.path_transform
    }

    /// Whether the image is somewhere other than where it was recorded.
    pub fn in_altroot(&self) -> bool {
        !self.props.path_transform.is_none()
    }

    /// Current location of the parent, if known.
    pub fn parent_path(&self) -> Option<&str> {
        self.props.current_parent_path.as_deref()
    }

    /// Replace this image's own relationship.  The recorded path in
    /// `props` is kept; temporal properties are recomputed.
    pub fn set_props(&mut self, props: LinkedProps) -> Result<()> {
        let props = props.persistent();
        props.verify()?;
        self.props = props;
        self.refresh_temporal();
        Ok(())
    }

    pub fn set_user_prop(&mut self, k: &str, v: &str) -> Result<()> {
        self.props.set_user_prop(k, v)?;
        self.props.verify()
    }

    /// Forget the parent.  Inherited values go with the parent snapshot,
    /// which exposes any masked local values again.
    pub fn unlink(&mut self) {
        let path = self.props.path.clone();
        self.props = LinkedProps::new_unlinked(&path);
        self.pmd = None;
        self.refresh_temporal();
    }

    pub fn parent_md(&self) -> Option<&ParentMetadata> {
        self.pmd.as_ref()
    }

    pub fn set_parent_md(&mut self, pmd: Option<ParentMetadata>) {
        self.pmd = pmd;
    }

    /// The parent snapshot as it is on disk.
    pub fn ondisk_parent_md(&self) -> Option<&ParentMetadata> {
        self.ondisk_pmd.as_ref()
    }

    /// Effective facets: the local configuration with the inherited layer
    /// from the parent snapshot on top.
    pub fn facets(&self, img: &Image) -> Result<Facets> {
        let inherited = self
            .pmd
            .as_ref()
            .map(|p| p.pvarcets.facets.clone())
            .unwrap_or_default();
        Facets::new(img.cfg.facets.clone(), inherited)
    }

    pub fn variants(&self, img: &Image) -> Result<Variants> {
        let inherited = self
            .pmd
            .as_ref()
            .map(|p| p.pvarcets.variants.clone())
            .unwrap_or_default();
        Variants::new(img.cfg.variants.clone(), inherited)
    }

    pub fn plugin(&self, kind: LinkedKind) -> Result<&dyn LinkedPlugin> {
        self.plugins
            .iter()
            .find(|p| p.kind() == kind)
            .map(|p| p.as_ref())
            .ok_or_else(|| anyhow::anyhow!("No plugin for {kind}"))
    }

    fn plugin_mut(&mut self, kind: LinkedKind) -> Result<&mut Box<dyn LinkedPlugin>> {
        self.plugins
            .iter_mut()
            .find(|p| p.kind() == kind)
            .ok_or_else(|| anyhow::anyhow!("No plugin for {kind}"))
    }

    /// Names of all registered children, sorted.
    pub fn child_names(&self) -> Vec<LinkedImageName> {
        let mut r: Vec<_> = self
            .plugins
            .iter()
            .flat_map(|p| p.children().into_iter().map(|(n, _)| n))
            .collect();
        r.sort();
        r
    }

    pub fn has_children(&self) -> bool {
        self.plugins.iter().any(|p| !p.children().is_empty())
    }

    /// Find where an image recorded at `recorded` is now.
    pub fn resolve_path(
        &self,
        img: &Image,
        recorded: &str,
    ) -> std::result::Result<String, LinkedError> {
        let p = self.props.path_transform.apply(recorded);
        if Image::exists(Utf8Path::new(&p)) {
            return Ok(p);
        }
        if self.props.path_transform.is_none() {
            for plugin in self.plugins.iter() {
                let t = match plugin.guess_path_transform(img) {
                    Ok(t) => t,
                    Err(e) => {
                        tracing::debug!("{} plugin: {e:#}", plugin.kind());
                        continue;
                    }
                };
                if t.is_none() {
                    continue;
                }
                let q = t.apply(recorded);
                if Image::exists(Utf8Path::new(&q)) {
                    tracing::debug!("Resolved {recorded} to {q} using {t}");
                    return Ok(q);
                }
            }
        }
        Err(LinkedError::PathUnresolvable {
            path: paths::dirpath(recorded),
        })
    }

    /// All registered children, sorted by name.  Children which can't be
    /// found are included with an error location.
    pub fn children(&self, img: &Image) -> Vec<ChildEntry> {
        let mut r = Vec::new();
        for plugin in self.plugins.iter() {
            for (name, recorded) in plugin.children() {
                let Some(mut props) = plugin.child_props(&name) else {
                    continue;
                };
                let location = self.resolve_path(img, &recorded);
                props.current_path = location.as_ref().ok().cloned();
                props.path_transform = self.props.path_transform.clone();
                r.push(ChildEntry {
                    name,
                    props,
                    location,
                });
            }
        }
        r.sort_by(|a, b| a.name.cmp(&b.name));
        r
    }

    pub fn child(&self, img: &Image, name: &LinkedImageName) -> Result<ChildEntry> {
        self.children(img)
            .into_iter()
            .find(|c| &c.name == name)
            .ok_or_else(|| {
                LinkedError::NotLinked {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// The properties a child should store about itself.
    pub fn props_for_child(&self, entry: &ChildEntry) -> Result<LinkedProps> {
        let mut p = entry.props.persistent();
        p.parent_path = Some(self.props.path.clone());
        self.plugin(entry.name.kind)?.munge_child_props(&mut p);
        Ok(p)
    }

    /// Register a child in memory.
    pub fn attach_child(&mut self, props: LinkedProps) -> Result<()> {
        let name = props
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Child properties have no name"))?;
        self.plugin_mut(name.kind)?.attach_child(props);
        Ok(())
    }

    pub fn update_child(&mut self, props: LinkedProps) -> Result<()> {
        let name = props
            .name
            .clone()
            .ok_or_else(|| anyhow::anyhow!("Child properties have no name"))?;
        self.plugin_mut(name.kind)?.update_child(props);
        Ok(())
    }

    pub fn detach_child(&mut self, name: &LinkedImageName) -> Result<LinkedProps> {
        self.plugin_mut(name.kind)?
            .detach_child(name)
            .ok_or_else(|| {
                LinkedError::NotLinked {
                    name: name.to_string(),
                }
                .into()
            })
    }

    /// Own properties as they should be stored.  An image with neither a
    /// parent nor children keeps no record.
    fn props_to_store(&self) -> Option<LinkedProps> {
        if self.is_child() || self.has_children() {
            Some(self.props.persistent())
        } else {
            None
        }
    }

    /// Whether the in-memory relationship and parent snapshot differ from
    /// what is stored.
    pub fn md_changed(&self) -> bool {
        self.props_to_store() != self.ondisk_props.as_ref().map(|p| p.persistent())
            || self.pmd != self.ondisk_pmd
    }

    /// Write this image's own linked metadata and every plugin's child
    /// registry.
    #[context("Saving linked image metadata")]
    pub fn save(&mut self, img: &Image) -> Result<()> {
        let store = MetadataStore::new(img.imgdir());
        match self.props_to_store() {
            None => store.remove_props()?,
            Some(props) => {
                store.save_props(&props)?;
                fail::fail_point!("linked-save-props", |_| Err(anyhow::anyhow!(
                    "Failpoint linked-save-props"
                )));
            }
        }
        match self.pmd.as_ref().filter(|_| self.is_child()) {
            Some(pmd) => store.save_parent_md(pmd)?,
            None => store.remove_parent_md()?,
        }
        self.ondisk_props = self.props_to_store();
        self.ondisk_pmd = self.pmd.clone();
        for p in self.plugins.iter() {
            p.save(img)?;
        }
        fail::fail_point!("linked-save-registry", |_| Err(anyhow::anyhow!(
            "Failpoint linked-save-registry"
        )));
        tracing::debug!("Saved linked metadata for {}", self.root);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::props::Model;
    use super::store::InheritedVarcets;
    use super::*;
    use crate::image::tests::utf8_tempdir;
    use crate::image::ImageConfig;
    use std::collections::BTreeMap;

    fn child_props(name: &str, path: &str) -> LinkedProps {
        LinkedProps {
            name: Some(name.parse().unwrap()),
            model: Some(Model::Push),
            path: paths::dirpath(path),
            recurse: Some(true),
            ..Default::default()
        }
    }

    #[test]
    fn unlinked() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let img = Image::create(&base.join("p"), ImageConfig::default())?;
        let li = LinkedImage::load(&img)?;
        assert_eq!(li.role(), Role::None);
        assert!(!li.in_altroot());
        assert!(!li.has_children());
        assert!(!li.md_changed());
        assert_eq!(li.props().path, img.root_str());
        Ok(())
    }

    #[test]
    fn children_follow_a_move() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let p = Image::create(&base.join("a/p"), ImageConfig::default())?;
        Image::create(&base.join("a/p/c"), ImageConfig::default())?;
        let mut li = LinkedImage::load(&p)?;
        li.attach_child(child_props("system:c", base.join("a/p/c").as_str()))?;
        assert!(li.md_changed());
        li.save(&p)?;
        assert!(!li.md_changed());

        std::fs::rename(base.join("a"), base.join("b"))?;
        let p = Image::open(&base.join("b/p"))?;
        let li = LinkedImage::load(&p)?;
        assert!(li.in_altroot());
        assert_eq!(
            li.path_transform(),
            &PathTransform::new(&format!("{base}/a"), &format!("{base}/b"))
        );
        let children = li.children(&p);
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].path()?, format!("{base}/b/p/c/"));
        assert_eq!(
            children[0].props.path,
            format!("{base}/a/p/c/"),
            "registry keeps the recorded path"
        );
        Ok(())
    }

    #[test]
    fn unresolvable_child() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let p = Image::create(&base.join("p"), ImageConfig::default())?;
        let mut li = LinkedImage::load(&p)?;
        li.attach_child(child_props("system:gone", "/nonexistent/gone"))?;
        let c = li.child(&p, &"system:gone".parse()?)?;
        assert!(!c.is_reachable());
        let e = c.path().unwrap_err();
        assert_eq!(
            crate::errors::exit_status_of(&e),
            crate::errors::ExitStatus::EAccess
        );
        assert!(li.child(&p, &"system:other".parse()?).is_err());
        Ok(())
    }

    #[test]
    fn unlink_restores_local_facets() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let mut cfg = ImageConfig::default();
        cfg.facets.insert("facet.doc".into(), true);
        let c = Image::create(&base.join("c"), cfg)?;
        let mut li = LinkedImage::load(&c)?;
        let mut props = child_props("system:c", c.root().as_str());
        props.parent_path = Some("/".into());
        li.set_props(props)?;
        li.set_parent_md(Some(ParentMetadata {
            pvarcets: InheritedVarcets {
                facets: BTreeMap::from([("facet.doc".to_string(), false)]),
                variants: BTreeMap::new(),
            },
            ..Default::default()
        }));
        assert!(li.md_changed());
        li.save(&c)?;
        assert!(!li.md_changed());
        let f = li.facets(&c)?;
        assert_eq!(f.get("facet.doc"), Some(&false));
        assert_eq!(f.masked("facet.doc"), Some(&true));

        li.unlink();
        assert!(li.md_changed());
        li.save(&c)?;
        let li = LinkedImage::load(&c)?;
        assert_eq!(li.role(), Role::None);
        assert_eq!(li.facets(&c)?.get("facet.doc"), Some(&true));
        assert!(!MetadataStore::new(c.imgdir()).has_props()?);
        Ok(())
    }
}
