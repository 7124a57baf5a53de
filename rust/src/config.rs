//! Client configuration taken from the environment.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{Context, Result};
use camino::Utf8PathBuf;

pub const ENV_IMAGE: &str = "IMGPKG_IMAGE";
pub const ENV_CONCURRENCY: &str = "IMGPKG_CONCURRENCY";
pub const ENV_LIVE_ROOT: &str = "IMGPKG_LIVE_ROOT";
pub const ENV_CHILD_RUNNER: &str = "IMGPKG_CHILD_RUNNER";
pub const ENV_BE_ROOTS: &str = "IMGPKG_BE_ROOTS";

/// How operations on child images are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunnerKind {
    /// Re-execute ourselves against the child image.
    Exec,
    /// Operate on the child within this process.
    Inline,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Image to operate on when no root is given on the command line.
    pub image_root: Option<Utf8PathBuf>,
    /// Maximum number of children operated on concurrently; `None` is
    /// unbounded.
    pub concurrency: Option<usize>,
    pub live_root: String,
    pub runner: RunnerKind,
    /// Roots of cloneable boot environments.
    pub be_roots: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            image_root: None,
            concurrency: None,
            live_root: "/".into(),
            runner: RunnerKind::Exec,
            be_roots: Vec::new(),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    pub(crate) fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut r = Self::default();
        if let Some(v) = get(ENV_IMAGE).filter(|v| !v.is_empty()) {
            r.image_root = Some(v.into());
        }
        if let Some(v) = get(ENV_CONCURRENCY).filter(|v| !v.is_empty()) {
            let n: usize = v
                .parse()
                .with_context(|| format!("Parsing {ENV_CONCURRENCY}={v}"))?;
            r.concurrency = (n > 0).then_some(n);
        }
        if let Some(v) = get(ENV_LIVE_ROOT).filter(|v| !v.is_empty()) {
            if !v.starts_with('/') {
                anyhow::bail!("{ENV_LIVE_ROOT} must be an absolute path: {v}");
            }
            r.live_root = crate::paths::dirpath(&v);
        }
        match get(ENV_CHILD_RUNNER).as_deref() {
            None | Some("") | Some("exec") => {}
            Some("inline") => r.runner = RunnerKind::Inline,
            Some(o) => anyhow::bail!("Invalid {ENV_CHILD_RUNNER}: {o}"),
        }
        if let Some(v) = get(ENV_BE_ROOTS) {
            r.be_roots = v
                .split(':')
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
                .collect();
        }
        Ok(r)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use maplit::hashmap;
    use std::collections::HashMap;

    fn from_map(m: HashMap<&str, &str>) -> Result<ClientConfig> {
        ClientConfig::from_lookup(|k| m.get(k).map(|v| v.to_string()))
    }

    #[test]
    fn defaults() -> Result<()> {
        assert_eq!(from_map(HashMap::new())?, ClientConfig::default());
        Ok(())
    }

    #[test]
    fn parse_env() -> Result<()> {
        let c = from_map(hashmap! {
            ENV_IMAGE => "/srv/img",
            ENV_CONCURRENCY => "4",
            ENV_LIVE_ROOT => "/alt",
            ENV_CHILD_RUNNER => "inline",
            ENV_BE_ROOTS => "/:/mnt/be",
        })?;
        assert_eq!(c.image_root, Some(Utf8PathBuf::from("/srv/img")));
        assert_eq!(c.concurrency, Some(4));
        assert_eq!(c.live_root, "/alt/");
        assert_eq!(c.runner, RunnerKind::Inline);
        assert_eq!(c.be_roots, ["/", "/mnt/be"]);
        let c = from_map(hashmap! { ENV_CONCURRENCY => "0" })?;
        assert_eq!(c.concurrency, None);
        Ok(())
    }

    #[test]
    fn invalid() {
        assert!(from_map(hashmap! { ENV_CONCURRENCY => "many" }).is_err());
        assert!(from_map(hashmap! { ENV_LIVE_ROOT => "rel" }).is_err());
        assert!(from_map(hashmap! { ENV_CHILD_RUNNER => "thread" }).is_err());
    }
}
