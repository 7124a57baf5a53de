//! Package identifiers (FMRIs) and versions.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::{anyhow, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// A package version: a dotted release with an optional dotted branch,
/// e.g. `5.11-0.175.1`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Version {
    pub release: Vec<u64>,
    pub branch: Vec<u64>,
}

fn parse_dotted(s: &str, whole: &str) -> Result<Vec<u64>> {
    s.split('.')
        .map(|c| {
            c.parse::<u64>()
                .map_err(|_| anyhow!("Invalid version component {c:?} in {whole:?}"))
        })
        .collect()
}

impl FromStr for Version {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (release, branch) = match s.split_once('-') {
            Some((r, b)) => (r, Some(b)),
            None => (s, None),
        };
        if release.is_empty() {
            anyhow::bail!("Empty version: {s:?}");
        }
        let release = parse_dotted(release, s)?;
        let branch = match branch {
            Some(b) => parse_dotted(b, s)?,
            None => Vec::new(),
        };
        Ok(Self { release, branch })
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let join = |v: &[u64]| {
            v.iter()
                .map(|c| c.to_string())
                .collect::<Vec<_>>()
                .join(".")
        };
        write!(f, "{}", join(&self.release))?;
        if !self.branch.is_empty() {
            write!(f, "-{}", join(&self.branch))?;
        }
        Ok(())
    }
}

impl Ord for Version {
    fn cmp(&self, other: &Self) -> Ordering {
        self.release
            .cmp(&other.release)
            .then_with(|| self.branch.cmp(&other.branch))
    }
}

impl PartialOrd for Version {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Version {
    /// Returns true if `self` satisfies an automatic constraint rooted at
    /// `base`: every component `base` specifies matches.  A branch is only
    /// compared once the release fully matches.
    pub fn is_successor_auto(&self, base: &Version) -> bool {
        if base.release.len() > self.release.len()
            || self.release[..base.release.len()] != base.release[..]
        {
            return false;
        }
        if base.branch.is_empty() {
            return true;
        }
        base.release.len() == self.release.len()
            && base.branch.len() <= self.branch.len()
            && self.branch[..base.branch.len()] == base.branch[..]
    }
}

/// A package identifier; the publisher and version are optional when the
/// FMRI is used as a pattern.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Fmri {
    pub publisher: Option<String>,
    pub stem: String,
    pub version: Option<Version>,
}

impl FromStr for Fmri {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        let (publisher, rest) = if let Some(rest) = s.strip_prefix("pkg://") {
            let (p, r) = rest
                .split_once('/')
                .ok_or_else(|| anyhow!("Missing package name in {s:?}"))?;
            if p.is_empty() {
                anyhow::bail!("Empty publisher in {s:?}");
            }
            (Some(p.to_string()), r)
        } else if let Some(rest) = s.strip_prefix("pkg:/") {
            (None, rest)
        } else {
            (None, s)
        };
        let (stem, version) = match rest.split_once('@') {
            Some((stem, v)) => (stem, Some(v.parse::<Version>()?)),
            None => (rest, None),
        };
        if stem.is_empty() || stem.starts_with('/') {
            anyhow::bail!("Invalid package name in {s:?}");
        }
        Ok(Self {
            publisher,
            stem: stem.to_string(),
            version,
        })
    }
}

impl fmt::Display for Fmri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.publisher.as_deref() {
            Some(p) => write!(f, "pkg://{p}/{}", self.stem)?,
            None => write!(f, "pkg:/{}", self.stem)?,
        }
        if let Some(v) = self.version.as_ref() {
            write!(f, "@{v}")?;
        }
        Ok(())
    }
}

impl Ord for Fmri {
    fn cmp(&self, other: &Self) -> Ordering {
        self.stem
            .cmp(&other.stem)
            .then_with(|| self.version.cmp(&other.version))
            .then_with(|| self.publisher.cmp(&other.publisher))
    }
}

impl PartialOrd for Fmri {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Serialize for Fmri {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fmri {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Fmri {
    /// Whether this FMRI (used as a pattern) matches `other`: the stems
    /// are equal and any version given here is satisfied automatically.
    pub fn matches(&self, other: &Fmri) -> bool {
        if self.stem != other.stem {
            return false;
        }
        match (self.version.as_ref(), other.version.as_ref()) {
            (None, _) => true,
            (Some(_), None) => false,
            (Some(base), Some(v)) => v.is_successor_auto(base),
        }
    }

    /// The version; installed and catalog FMRIs always carry one.
    pub fn version_or_default(&self) -> Version {
        self.version.clone().unwrap_or(Version {
            release: vec![0],
            branch: Vec::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(s: &str) -> Version {
        s.parse().unwrap()
    }

    #[test]
    fn parse_fmri() {
        let f: Fmri = "pkg://test/system/foo@1.2-3".parse().unwrap();
        assert_eq!(f.publisher.as_deref(), Some("test"));
        assert_eq!(f.stem, "system/foo");
        assert_eq!(f.version, Some(v("1.2-3")));
        assert_eq!(f.to_string(), "pkg://test/system/foo@1.2-3");
        let f: Fmri = "foo".parse().unwrap();
        assert_eq!(f.to_string(), "pkg:/foo");
        let f: Fmri = "pkg:/foo@2".parse().unwrap();
        assert_eq!(f.version, Some(v("2")));
        for bad in ["", "pkg://", "pkg://x", "foo@", "foo@1.a", "pkg:///x"] {
            assert!(bad.parse::<Fmri>().is_err(), "{bad}");
        }
    }

    #[test]
    fn version_order() {
        assert!(v("1.10") > v("1.9"));
        assert!(v("1.0") < v("1.0-1"));
        assert!(v("2") > v("1.99-5"));
    }

    #[test]
    fn successor_auto() {
        assert!(v("1.2.3").is_successor_auto(&v("1.2")));
        assert!(v("1.2").is_successor_auto(&v("1.2")));
        assert!(!v("1.2").is_successor_auto(&v("1.2.3")));
        assert!(!v("1.3").is_successor_auto(&v("1.2")));
        assert!(v("1.2-5.1").is_successor_auto(&v("1.2-5")));
        assert!(!v("1.2.1-5").is_successor_auto(&v("1.2-5")));
        assert!(v("1.2-5").is_successor_auto(&v("1.2")));
    }

    #[test]
    fn pattern_match() {
        let pat: Fmri = "foo@1".parse().unwrap();
        assert!(pat.matches(&"pkg://p/foo@1.4".parse().unwrap()));
        assert!(!pat.matches(&"pkg://p/foo@2".parse().unwrap()));
        assert!(!pat.matches(&"pkg://p/bar@1".parse().unwrap()));
        let pat: Fmri = "foo".parse().unwrap();
        assert!(pat.matches(&"pkg://p/foo@9".parse().unwrap()));
    }
}
