//! Sandboxes: sub-roots created and managed by the sandbox tooling.
//!
//! The tooling records its sandboxes in `etc/sandboxes.json` within the
//! parent image, with each root expressed as seen from that image's own
//! `/`.  Only installed or running sandboxes are linked children.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::{LinkedImageName, LinkedKind};
use super::plugin::LinkedPlugin;
use super::props::{LinkedProps, Model};
use crate::image::{read_json_optional, Image};
use crate::paths::{self, PathTransform};
use anyhow::{Context, Result};
use cap_std::fs::Dir;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const SANDBOX_REGISTRY: &str = "etc/sandboxes.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxState {
    Configured,
    Installed,
    Running,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxEntry {
    pub name: String,
    pub state: SandboxState,
    pub root: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct SandboxRegistry {
    #[serde(default)]
    pub sandboxes: Vec<SandboxEntry>,
}

#[derive(Debug, Default)]
pub struct SandboxPlugin {
    /// Children from the sandbox registry.
    listed: BTreeMap<LinkedImageName, String>,
    /// Children attached in this process.
    attached: BTreeMap<LinkedImageName, LinkedProps>,
}

impl SandboxPlugin {
    pub fn load(img: &Image) -> Result<Self> {
        let root = Dir::open_ambient_dir(img.root(), cap_std::ambient_authority())
            .with_context(|| format!("Opening {}", img.root()))?;
        let reg: SandboxRegistry = match read_json_optional(&root, SANDBOX_REGISTRY) {
            Ok(r) => r.unwrap_or_default(),
            Err(e) => {
                tracing::warn!("Ignoring sandbox registry: {e:#}");
                SandboxRegistry::default()
            }
        };
        let mut listed = BTreeMap::new();
        for sb in reg.sandboxes {
            if sb.state == SandboxState::Configured {
                continue;
            }
            match LinkedImageName::new(LinkedKind::Sandbox, &sb.name) {
                Ok(name) => {
                    listed.insert(name, paths::dirpath(&sb.root));
                }
                Err(e) => tracing::warn!("Skipping sandbox: {e}"),
            }
        }
        Ok(Self {
            listed,
            attached: BTreeMap::new(),
        })
    }
}

impl LinkedPlugin for SandboxPlugin {
    fn kind(&self) -> LinkedKind {
        LinkedKind::Sandbox
    }

    fn support_attach(&self) -> bool {
        false
    }

    fn support_detach(&self) -> bool {
        false
    }

    fn default_recurse(&self) -> bool {
        false
    }

    fn guess_path_transform(&self, img: &Image) -> Result<PathTransform> {
        // Only an image at the live root can hold sandboxes, so an image
        // with sandboxes elsewhere must be in an alternate root.
        if self.listed.is_empty() {
            return Ok(PathTransform::none());
        }
        Ok(PathTransform::new("/", img.root().as_str()))
    }

    fn children(&self) -> Vec<(LinkedImageName, String)> {
        let mut r: BTreeMap<_, _> = self.listed.clone();
        for (name, props) in self.attached.iter() {
            r.insert(name.clone(), props.path.clone());
        }
        r.into_iter().collect()
    }

    fn child_props(&self, name: &LinkedImageName) -> Option<LinkedProps> {
        if let Some(p) = self.attached.get(name) {
            return Some(p.clone());
        }
        let path = self.listed.get(name)?;
        Some(LinkedProps {
            name: Some(name.clone()),
            model: Some(Model::Push),
            path: path.clone(),
            recurse: Some(self.default_recurse()),
            ..Default::default()
        })
    }

    fn attach_child(&mut self, props: LinkedProps) {
        if let Some(name) = props.name.clone() {
            self.attached.insert(name, props.persistent());
        }
    }

    fn detach_child(&mut self, name: &LinkedImageName) -> Option<LinkedProps> {
        let a = self.attached.remove(name);
        let l = self.listed.remove(name);
        a.or_else(|| {
            l.map(|path| LinkedProps {
                name: Some(name.clone()),
                model: Some(Model::Push),
                path,
                ..Default::default()
            })
        })
    }

    fn save(&self, _img: &Image) -> Result<()> {
        // The sandbox tooling owns the registry.
        Ok(())
    }

    fn munge_child_props(&self, props: &mut LinkedProps) {
        // A sandbox always sees itself at its own root, and its parent
        // is outside of its namespace.
        props.path = "/".into();
        props.parent_path = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::image::tests::utf8_tempdir;
    use crate::image::ImageConfig;
    use indoc::indoc;

    #[test]
    fn registry() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let img = Image::create(&base.join("gz"), ImageConfig::default())?;
        let p = SandboxPlugin::load(&img)?;
        assert!(p.children().is_empty());
        assert!(p.guess_path_transform(&img)?.is_none());

        std::fs::create_dir_all(base.join("gz/etc"))?;
        std::fs::write(
            base.join("gz").join(SANDBOX_REGISTRY),
            indoc! {r#"
                {"sandboxes": [
                  {"name": "web", "state": "installed", "root": "/sandboxes/web/root"},
                  {"name": "db", "state": "configured", "root": "/sandboxes/db/root"}
                ]}
            "#},
        )?;
        let mut p = SandboxPlugin::load(&img)?;
        let children = p.children();
        assert_eq!(children.len(), 1);
        let (name, path) = &children[0];
        assert_eq!(name.to_string(), "sandbox:web");
        assert_eq!(path, "/sandboxes/web/root/");
        let t = p.guess_path_transform(&img)?;
        assert_eq!(t, PathTransform::new("/", img.root().as_str()));
        let props = p.child_props(name).unwrap();
        assert_eq!(props.model, Some(Model::Push));
        assert!(!props.recurse());
        let mut mine = props.clone();
        p.munge_child_props(&mut mine);
        assert_eq!(mine.path, "/");
        assert!(p.detach_child(name).is_some());
        assert!(p.children().is_empty());
        Ok(())
    }
}
