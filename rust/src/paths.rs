//! Path handling for images that may be mounted somewhere other than
//! where they were when their paths were recorded.
//!
//! All image paths are absolute and carried as directory strings with a
//! trailing `/`, which makes prefix checks component-safe.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use serde_derive::{Deserialize, Serialize};

/// Make a path absolute and lexically clean it (`.` and `..` are
/// resolved without consulting the filesystem).
pub fn normalize(p: &Utf8Path) -> Result<Utf8PathBuf> {
    let p = if p.is_absolute() {
        p.to_path_buf()
    } else {
        let cwd = std::env::current_dir().context("Querying working directory")?;
        let cwd = Utf8PathBuf::try_from(cwd)?;
        cwd.join(p)
    };
    let mut r = Utf8PathBuf::from("/");
    for c in p.components() {
        match c {
            Utf8Component::Prefix(_) | Utf8Component::RootDir | Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                r.pop();
            }
            Utf8Component::Normal(n) => r.push(n),
        }
    }
    Ok(r)
}

/// Return `p` with exactly one trailing `/`.
pub fn dirpath(p: &str) -> String {
    let t = p.trim_end_matches('/');
    format!("{t}/")
}

/// Returns true if `inner` is `outer` or lies below it.
pub fn is_within(inner: &str, outer: &str) -> bool {
    dirpath(inner).starts_with(&dirpath(outer))
}

/// A `(recorded_root, current_root)` pair used to rewrite recorded paths
/// after an image tree has been moved.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct PathTransform {
    pub old_root: String,
    pub new_root: String,
}

impl Default for PathTransform {
    fn default() -> Self {
        Self::none()
    }
}

impl std::fmt::Display for PathTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.old_root, self.new_root)
    }
}

impl PathTransform {
    /// The identity transform.
    pub fn none() -> Self {
        Self {
            old_root: "/".into(),
            new_root: "/".into(),
        }
    }

    pub fn new(old_root: &str, new_root: &str) -> Self {
        let r = Self {
            old_root: dirpath(old_root),
            new_root: dirpath(new_root),
        };
        if r.old_root == r.new_root {
            return Self::none();
        }
        r
    }

    pub fn is_none(&self) -> bool {
        self.old_root == self.new_root
    }

    /// Compute the transform that maps `opath` to `npath` by dropping their
    /// longest common trailing components.  Moving `/a/b/img` to
    /// `/x/img` yields `(/a/b/, /x/)`, which also maps any sibling
    /// image recorded under `/a/b/`.
    pub fn compute(opath: &str, npath: &str) -> Self {
        let ocomp: Vec<&str> = opath.split('/').filter(|c| !c.is_empty()).collect();
        let ncomp: Vec<&str> = npath.split('/').filter(|c| !c.is_empty()).collect();
        let common = ocomp
            .iter()
            .rev()
            .zip(ncomp.iter().rev())
            .take_while(|(a, b)| a == b)
            .count();
        let root = |c: &[&str]| dirpath(&format!("/{}", c.join("/")));
        Self::new(
            &root(&ocomp[..ocomp.len() - common]),
            &root(&ncomp[..ncomp.len() - common]),
        )
    }

    fn reversed(&self) -> Self {
        Self {
            old_root: self.new_root.clone(),
            new_root: self.old_root.clone(),
        }
    }

    /// Whether `path` lies below the recorded root.
    pub fn applicable(&self, path: &str) -> bool {
        self.is_none() || dirpath(path).starts_with(&self.old_root)
    }

    /// Whether `path` already lies below the current root.
    pub fn applied(&self, path: &str) -> bool {
        self.reversed().applicable(path)
    }

    /// Rewrite a recorded path into the current namespace.  Paths outside
    /// the recorded root are returned unchanged.
    pub fn apply(&self, path: &str) -> String {
        let path = dirpath(path);
        if self.is_none() {
            return path;
        }
        match path.strip_prefix(&self.old_root) {
            Some(rest) => format!("{}{rest}", self.new_root),
            None => {
                tracing::debug!("Transform {self} does not apply to {path}");
                path
            }
        }
    }

    /// Undo [`Self::apply`].
    pub fn revert(&self, path: &str) -> String {
        self.reversed().apply(path)
    }
}
