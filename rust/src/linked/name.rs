//! Linked image names: `kind:label`.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::errors::LinkedError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// The kinds of linked images we know how to manage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum LinkedKind {
    /// Children registered explicitly via attach.
    System,
    /// Sub-roots managed by the sandbox tooling.
    Sandbox,
}

impl LinkedKind {
    pub const ALL: [LinkedKind; 2] = [LinkedKind::System, LinkedKind::Sandbox];

    pub fn as_str(self) -> &'static str {
        match self {
            LinkedKind::System => "system",
            LinkedKind::Sandbox => "sandbox",
        }
    }
}

impl fmt::Display for LinkedKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinkedKind {
    type Err = LinkedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LinkedKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| LinkedError::InvalidName { name: s.to_string() })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct LinkedImageName {
    pub kind: LinkedKind,
    pub label: String,
}

impl LinkedImageName {
    pub fn new(kind: LinkedKind, label: &str) -> Result<Self, LinkedError> {
        let valid = label
            .chars()
            .next()
            .map(|c| c.is_ascii_alphanumeric())
            .unwrap_or(false)
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
        if !valid {
            return Err(LinkedError::InvalidName {
                name: format!("{kind}:{label}"),
            });
        }
        Ok(Self {
            kind,
            label: label.to_string(),
        })
    }
}

impl FromStr for LinkedImageName {
    type Err = LinkedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || LinkedError::InvalidName { name: s.to_string() };
        let (kind, label) = s.split_once(':').ok_or_else(invalid)?;
        let kind: LinkedKind = kind.parse().map_err(|_| invalid())?;
        Self::new(kind, label).map_err(|_| invalid())
    }
}

impl fmt::Display for LinkedImageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.label)
    }
}

impl Serialize for LinkedImageName {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for LinkedImageName {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let s = String::deserialize(d)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse() {
        let n: LinkedImageName = "system:child-1".parse().unwrap();
        assert_eq!(n.kind, LinkedKind::System);
        assert_eq!(n.label, "child-1");
        assert_eq!(n.to_string(), "system:child-1");
        let n: LinkedImageName = "sandbox:web".parse().unwrap();
        assert_eq!(n.kind, LinkedKind::Sandbox);
        for bad in ["", "system", "system:", "bogus:x", "system:-x", "system:a/b", ":x"] {
            assert!(bad.parse::<LinkedImageName>().is_err(), "{bad}");
        }
    }

    #[test]
    fn ordering() {
        let mut v: Vec<LinkedImageName> = ["system:b", "system:a", "sandbox:z"]
            .iter()
            .map(|s| s.parse().unwrap())
            .collect();
        v.sort();
        let v: Vec<_> = v.iter().map(|n| n.to_string()).collect();
        assert_eq!(v, ["system:a", "system:b", "sandbox:z"]);
    }
}
