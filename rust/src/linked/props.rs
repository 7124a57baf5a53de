//! Linked image properties.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::LinkedImageName;
use crate::errors::LinkedError;
use crate::paths::PathTransform;
use anyhow::Result;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const PROP_NAME: &str = "li-name";
pub const PROP_MODEL: &str = "li-model";
pub const PROP_PATH: &str = "li-path";
pub const PROP_PARENT_PATH: &str = "li-parent";
pub const PROP_RECURSE: &str = "li-recurse";
pub const PROP_MD_ONLY: &str = "li-md-only";
pub const PROP_CURRENT_PATH: &str = "li-current-path";
pub const PROP_CURRENT_PARENT_PATH: &str = "li-current-parent";
pub const PROP_PATH_TRANSFORM: &str = "li-path-transform";

/// Properties a user may change after attach.
pub const USER_PROPS: &[&str] = &[PROP_RECURSE, PROP_MD_ONLY];

/// Who drives synchronization of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Model {
    /// The parent drives all operations on the child.
    Push,
    /// The child points at its parent and syncs itself.
    Pull,
}

impl std::fmt::Display for Model {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Model::Push => "push",
            Model::Pull => "pull",
        })
    }
}

/// The relationship an image has with a parent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Role {
    None,
    PushChild,
    PullChild,
}

/// Properties of a linked image.  The same structure describes an
/// image's own relationship (stored in the image) and a child
/// registration (stored in the parent).
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkedProps {
    #[serde(rename = "li-name", default, skip_serializing_if = "Option::is_none")]
    pub name: Option<LinkedImageName>,
    #[serde(rename = "li-model", default, skip_serializing_if = "Option::is_none")]
    pub model: Option<Model>,
    /// The image root when these properties were recorded.
    #[serde(rename = "li-path")]
    pub path: String,
    /// Root of the parent image; required for pull children, recorded
    /// for push children so that ancestry can be walked.
    #[serde(rename = "li-parent", default, skip_serializing_if = "Option::is_none")]
    pub parent_path: Option<String>,
    #[serde(rename = "li-recurse", default, skip_serializing_if = "Option::is_none")]
    pub recurse: Option<bool>,
    #[serde(rename = "li-md-only", default, skip_serializing_if = "Option::is_none")]
    pub md_only: Option<bool>,

    // Temporal; derived on every load and never saved.
    #[serde(skip)]
    pub current_path: Option<String>,
    #[serde(skip)]
    pub current_parent_path: Option<String>,
    #[serde(skip)]
    pub path_transform: PathTransform,
}

fn parse_bool_prop(k: &str, v: &str) -> Result<bool> {
    match v {
        "true" | "True" => Ok(true),
        "false" | "False" => Ok(false),
        _ => Err(LinkedError::InvalidProperty {
            prop: format!("{k}={v}"),
        }
        .into()),
    }
}

impl LinkedProps {
    /// Properties for an image with no parent (possibly a parent itself).
    pub fn new_unlinked(path: &str) -> Self {
        Self {
            path: crate::paths::dirpath(path),
            ..Default::default()
        }
    }

    pub fn role(&self) -> Role {
        match (self.name.as_ref(), self.model) {
            (Some(_), Some(Model::Push)) => Role::PushChild,
            (Some(_), Some(Model::Pull)) => Role::PullChild,
            _ => Role::None,
        }
    }

    /// A copy with the temporal properties dropped, for comparisons
    /// against what is stored on disk.
    pub fn persistent(&self) -> Self {
        Self {
            current_path: None,
            current_parent_path: None,
            path_transform: PathTransform::none(),
            ..self.clone()
        }
    }

    /// Verify that the right properties are present for the role.
    pub fn verify(&self) -> Result<()> {
        let bad = |p: &str| -> anyhow::Error {
            LinkedError::InvalidProperty {
                prop: p.to_string(),
            }
            .into()
        };
        if !self.path.starts_with('/') {
            return Err(bad(PROP_PATH));
        }
        match self.role() {
            Role::None => {
                if self.name.is_some() {
                    return Err(bad(PROP_MODEL));
                }
                if self.model.is_some() {
                    return Err(bad(PROP_NAME));
                }
                if self.parent_path.is_some() {
                    return Err(bad(PROP_PARENT_PATH));
                }
            }
            Role::PushChild => {
                if matches!(self.parent_path.as_deref(), Some(p) if !p.starts_with('/')) {
                    return Err(bad(PROP_PARENT_PATH));
                }
            }
            Role::PullChild => {
                if self.recurse.is_some() {
                    return Err(bad(PROP_RECURSE));
                }
                match self.parent_path.as_deref() {
                    Some(p) if p.starts_with('/') => {}
                    _ => return Err(bad(PROP_PARENT_PATH)),
                }
            }
        }
        Ok(())
    }

    /// Set a user-settable property from its string form.
    pub fn set_user_prop(&mut self, k: &str, v: &str) -> Result<()> {
        match k {
            PROP_RECURSE => {
                if self.role() == Role::PullChild {
                    return Err(LinkedError::InvalidProperty {
                        prop: k.to_string(),
                    }
                    .into());
                }
                self.recurse = Some(parse_bool_prop(k, v)?);
            }
            PROP_MD_ONLY => self.md_only = Some(parse_bool_prop(k, v)?),
            _ => {
                return Err(LinkedError::InvalidProperty {
                    prop: k.to_string(),
                }
                .into())
            }
        }
        Ok(())
    }

    pub fn recurse(&self) -> bool {
        self.recurse.unwrap_or(false)
    }

    pub fn md_only(&self) -> bool {
        self.md_only.unwrap_or(false)
    }

    /// All properties (including temporal ones) as strings, for display.
    pub fn to_strings(&self) -> BTreeMap<String, String> {
        let mut r = BTreeMap::new();
        let mut put = |k: &str, v: Option<String>| {
            if let Some(v) = v {
                r.insert(k.to_string(), v);
            }
        };
        put(PROP_NAME, self.name.as_ref().map(|n| n.to_string()));
        put(PROP_MODEL, self.model.map(|m| m.to_string()));
        put(PROP_PATH, Some(self.path.clone()));
        put(PROP_PARENT_PATH, self.parent_path.clone());
        put(PROP_RECURSE, self.recurse.map(|v| v.to_string()));
        put(PROP_MD_ONLY, self.md_only.map(|v| v.to_string()));
        put(PROP_CURRENT_PATH, self.current_path.clone());
        put(PROP_CURRENT_PARENT_PATH, self.current_parent_path.clone());
        if !self.path_transform.is_none() {
            put(PROP_PATH_TRANSFORM, Some(self.path_transform.to_string()));
        }
        r
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use indoc::indoc;

    fn child(model: Model) -> LinkedProps {
        LinkedProps {
            name: Some("system:c".parse().unwrap()),
            model: Some(model),
            path: "/c/".into(),
            ..Default::default()
        }
    }

    #[test]
    fn roles() {
        assert_eq!(LinkedProps::new_unlinked("/p").role(), Role::None);
        assert_eq!(child(Model::Push).role(), Role::PushChild);
        assert_eq!(child(Model::Pull).role(), Role::PullChild);
    }

    #[test]
    fn verify() {
        assert!(LinkedProps::new_unlinked("/p").verify().is_ok());
        assert!(LinkedProps::new_unlinked("p").verify().is_err());
        assert!(child(Model::Push).verify().is_ok());
        let mut p = child(Model::Pull);
        assert!(p.verify().is_err());
        p.parent_path = Some("/p/".into());
        assert!(p.verify().is_ok());
        p.recurse = Some(true);
        assert!(p.verify().is_err());
    }

    #[test]
    fn user_props() -> Result<()> {
        let mut p = child(Model::Push);
        p.set_user_prop(PROP_RECURSE, "false")?;
        assert!(!p.recurse());
        p.set_user_prop(PROP_MD_ONLY, "true")?;
        assert!(p.md_only());
        assert!(p.set_user_prop(PROP_MD_ONLY, "maybe").is_err());
        assert!(p.set_user_prop(PROP_NAME, "system:x").is_err());
        let mut p = child(Model::Pull);
        assert!(p.set_user_prop(PROP_RECURSE, "true").is_err());
        Ok(())
    }

    #[test]
    fn serialization_skips_temporal() -> Result<()> {
        let mut p = child(Model::Push);
        p.recurse = Some(true);
        p.current_path = Some("/mnt/c/".into());
        p.path_transform = PathTransform::new("/", "/mnt");
        let s = serde_json::to_string_pretty(&p)?;
        let expected = indoc! {r#"
            {
              "li-name": "system:c",
              "li-model": "push",
              "li-path": "/c/",
              "li-recurse": true
            }"#};
        similar_asserts::assert_eq!(s, expected);
        let back: LinkedProps = serde_json::from_str(&s)?;
        assert_eq!(back, p.persistent());
        let strings = p.to_strings();
        assert_eq!(strings[PROP_CURRENT_PATH], "/mnt/c/");
        assert_eq!(strings[PROP_PATH_TRANSFORM], "(/, /mnt/)");
        Ok(())
    }
}
