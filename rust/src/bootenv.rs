//! Boot environment integration.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::paths;

/// Knowledge about boot environments, which may be cloned (and thus
/// mounted at temporary locations) by tooling outside our control.
pub trait BootEnv: std::fmt::Debug + Send + Sync {
    /// Whether the image rooted at `root` is the root of a cloneable boot
    /// environment.
    fn is_cloneable(&self, root: &str) -> bool;
}

/// A fixed list of boot environment roots.
#[derive(Debug, Clone, Default)]
pub struct StaticBootEnv {
    roots: Vec<String>,
}

impl StaticBootEnv {
    pub fn new<S: AsRef<str>>(roots: impl IntoIterator<Item = S>) -> Self {
        Self {
            roots: roots
                .into_iter()
                .map(|r| paths::dirpath(r.as_ref()))
                .collect(),
        }
    }
}

impl BootEnv for StaticBootEnv {
    fn is_cloneable(&self, root: &str) -> bool {
        let root = paths::dirpath(root);
        self.roots.iter().any(|r| *r == root)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cloneable() {
        let be = StaticBootEnv::new(["/", "/mnt/be"]);
        assert!(be.is_cloneable("/"));
        assert!(be.is_cloneable("/mnt/be/"));
        assert!(!be.is_cloneable("/mnt"));
        assert!(!StaticBootEnv::default().is_cloneable("/"));
    }
}
