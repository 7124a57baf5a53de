//! Children registered explicitly by attach; the registry lives in the
//! parent's metadata directory.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::{LinkedImageName, LinkedKind};
use super::plugin::LinkedPlugin;
use super::props::LinkedProps;
use super::store::MetadataStore;
use crate::image::Image;
use crate::paths::PathTransform;
use anyhow::Result;
use std::collections::BTreeMap;

#[derive(Debug, Default)]
pub struct SystemPlugin {
    children: BTreeMap<LinkedImageName, LinkedProps>,
}

impl SystemPlugin {
    pub fn load(img: &Image) -> Self {
        let children = MetadataStore::new(img.imgdir())
            .load_children()
            .into_iter()
            .filter(|(name, _)| name.kind == LinkedKind::System)
            .collect();
        Self { children }
    }
}

impl LinkedPlugin for SystemPlugin {
    fn kind(&self) -> LinkedKind {
        LinkedKind::System
    }

    fn support_attach(&self) -> bool {
        true
    }

    fn support_detach(&self) -> bool {
        true
    }

    fn default_recurse(&self) -> bool {
        true
    }

    fn guess_path_transform(&self, _img: &Image) -> Result<PathTransform> {
        Ok(PathTransform::none())
    }

    fn children(&self) -> Vec<(LinkedImageName, String)> {
        self.children
            .iter()
            .map(|(n, p)| (n.clone(), p.path.clone()))
            .collect()
    }

    fn child_props(&self, name: &LinkedImageName) -> Option<LinkedProps> {
        self.children.get(name).cloned()
    }

    fn attach_child(&mut self, props: LinkedProps) {
        if let Some(name) = props.name.clone() {
            self.children.insert(name, props.persistent());
        }
    }

    fn detach_child(&mut self, name: &LinkedImageName) -> Option<LinkedProps> {
        self.children.remove(name)
    }

    fn save(&self, img: &Image) -> Result<()> {
        MetadataStore::new(img.imgdir()).save_children(&self.children)
    }
}
