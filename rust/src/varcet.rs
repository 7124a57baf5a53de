//! Facets and variants ("varcets"): named configuration values which
//! decide what package content applies to an image.  A child image may
//! inherit values from its parent; an inherited value masks any local
//! value for the same key without destroying it, so that the local
//! setting reappears once the key stops being inherited.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::manifest::Depend;
use anyhow::{bail, Result};
use globset::{Glob, GlobMatcher};
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Debug, Display};

pub const FACET_PREFIX: &str = "facet.";
pub const VARIANT_PREFIX: &str = "variant.";

/// Values a varcet may hold.
pub trait VarcetValue: Clone + PartialEq + Debug + Display + Send + Sync {
    const PREFIX: &'static str;

    fn parse_value(s: &str) -> Result<Self>;

    /// Value reported for a key nobody has set.
    fn unset_default() -> Option<Self>;
}

impl VarcetValue for bool {
    const PREFIX: &'static str = FACET_PREFIX;

    fn parse_value(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "true" => Ok(true),
            "false" => Ok(false),
            o => bail!("Invalid facet value {o:?}; expected true or false"),
        }
    }

    fn unset_default() -> Option<Self> {
        // Facets are inclusive by default
        Some(true)
    }
}

impl VarcetValue for String {
    const PREFIX: &'static str = VARIANT_PREFIX;

    fn parse_value(s: &str) -> Result<Self> {
        if s.is_empty() {
            bail!("Variant values must not be empty");
        }
        Ok(s.to_string())
    }

    fn unset_default() -> Option<Self> {
        None
    }
}

/// Where the effective value of a key comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Source {
    Local,
    Parent,
    System,
}

impl Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Local => "local",
            Source::Parent => "parent",
            Source::System => "system",
        };
        f.write_str(s)
    }
}

/// One row of an effective varcet listing.
#[derive(Debug, Clone, PartialEq)]
pub struct VarcetEntry<V> {
    pub name: String,
    pub value: V,
    pub source: Source,
    /// The local value hidden by an inherited one.
    pub masked: Option<V>,
}

/// Result of replacing the inherited set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InheritDelta {
    /// Keys whose local value became hidden.
    pub masked: Vec<String>,
    /// Keys whose local value became visible again.
    pub restored: Vec<String>,
    /// Keys whose effective value changed.
    pub changed: Vec<String>,
}

impl InheritDelta {
    pub fn is_empty(&self) -> bool {
        self.masked.is_empty() && self.restored.is_empty() && self.changed.is_empty()
    }
}

/// Compile a shell-style key pattern.  `*` also matches `.`; an invalid
/// pattern only ever matches itself.
fn compile_pattern(pat: &str) -> Option<GlobMatcher> {
    match Glob::new(pat) {
        Ok(g) => Some(g.compile_matcher()),
        Err(e) => {
            tracing::warn!("Invalid pattern {pat}: {e}");
            None
        }
    }
}

fn is_pattern(k: &str) -> bool {
    k.contains(['*', '?', '['])
}

/// A set of facets or variants with local and inherited layers.
#[derive(Debug, Clone)]
pub struct Varcets<V: VarcetValue> {
    local: BTreeMap<String, V>,
    inherited: BTreeMap<String, V>,
    /// Compiled pattern keys of both layers, longest first.
    patterns: Vec<(String, GlobMatcher)>,
}

impl<V: VarcetValue> PartialEq for Varcets<V> {
    fn eq(&self, other: &Self) -> bool {
        self.local == other.local && self.inherited == other.inherited
    }
}

pub type Facets = Varcets<bool>;
pub type Variants = Varcets<String>;

impl<V: VarcetValue> Default for Varcets<V> {
    fn default() -> Self {
        Self {
            local: BTreeMap::new(),
            inherited: BTreeMap::new(),
            patterns: Vec::new(),
        }
    }
}

fn check_key<V: VarcetValue>(k: &str) -> Result<()> {
    match k.strip_prefix(V::PREFIX) {
        Some(rest) if !rest.is_empty() => Ok(()),
        _ => bail!("Invalid name {k:?}; must start with {:?}", V::PREFIX),
    }
}

impl<V: VarcetValue> Varcets<V> {
    pub fn new(local: BTreeMap<String, V>, inherited: BTreeMap<String, V>) -> Result<Self> {
        for k in local.keys().chain(inherited.keys()) {
            check_key::<V>(k)?;
        }
        let mut r = Self {
            local,
            inherited,
            patterns: Vec::new(),
        };
        r.compile_patterns();
        Ok(r)
    }

    fn compile_patterns(&mut self) {
        let mut keys: Vec<&String> = self
            .local
            .keys()
            .chain(self.inherited.keys())
            .filter(|k| is_pattern(k))
            .collect();
        keys.sort_by(|a, b| b.len().cmp(&a.len()).then_with(|| a.cmp(b)));
        keys.dedup();
        self.patterns = keys
            .into_iter()
            .filter_map(|k| compile_pattern(k).map(|m| (k.clone(), m)))
            .collect();
    }

    pub fn local(&self) -> &BTreeMap<String, V> {
        &self.local
    }

    pub fn inherited(&self) -> &BTreeMap<String, V> {
        &self.inherited
    }

    /// Set a local value.  If the key is currently inherited the new
    /// value stays hidden until inheritance is withdrawn.
    pub fn set_local(&mut self, k: &str, v: V) -> Result<()> {
        check_key::<V>(k)?;
        self.local.insert(k.to_string(), v);
        self.compile_patterns();
        Ok(())
    }

    pub fn unset_local(&mut self, k: &str) -> Option<V> {
        let r = self.local.remove(k);
        self.compile_patterns();
        r
    }

    /// Inherit a value, masking any local one.  Inheriting the same key
    /// again only updates the inherited value; the masked local value is
    /// never touched.
    pub fn set_inherited(&mut self, k: &str, v: V) -> Result<()> {
        check_key::<V>(k)?;
        self.inherited.insert(k.to_string(), v);
        self.compile_patterns();
        Ok(())
    }

    /// Stop inheriting a key; the masked local value (if any) becomes
    /// effective again.
    pub fn clear_inherited(&mut self, k: &str) -> Option<V> {
        let r = self.inherited.remove(k);
        self.compile_patterns();
        r
    }

    /// Replace the whole inherited layer.
    pub fn replace_inherited(&mut self, new: BTreeMap<String, V>) -> Result<InheritDelta> {
        for k in new.keys() {
            check_key::<V>(k)?;
        }
        let mut delta = InheritDelta::default();
        let before = self.effective();
        for k in new.keys() {
            if !self.inherited.contains_key(k) && self.local.contains_key(k) {
                delta.masked.push(k.clone());
            }
        }
        for k in self.inherited.keys() {
            if !new.contains_key(k) && self.local.contains_key(k) {
                delta.restored.push(k.clone());
            }
        }
        self.inherited = new;
        self.compile_patterns();
        let after = self.effective();
        let keys: std::collections::BTreeSet<_> = before.keys().chain(after.keys()).collect();
        for k in keys {
            if before.get(k) != after.get(k) {
                delta.changed.push(k.clone());
            }
        }
        Ok(delta)
    }

    pub fn is_masked(&self, k: &str) -> bool {
        self.inherited.contains_key(k) && self.local.contains_key(k)
    }

    /// The local value currently hidden by inheritance.
    pub fn masked(&self, k: &str) -> Option<&V> {
        if self.inherited.contains_key(k) {
            self.local.get(k)
        } else {
            None
        }
    }

    /// Effective value of exactly this key.
    pub fn get(&self, k: &str) -> Option<&V> {
        self.inherited.get(k).or_else(|| self.local.get(k))
    }

    pub fn source(&self, k: &str) -> Option<Source> {
        if self.inherited.contains_key(k) {
            Some(Source::Parent)
        } else if self.local.contains_key(k) {
            Some(Source::Local)
        } else {
            None
        }
    }

    /// Effective values of all explicitly set keys.
    pub fn effective(&self) -> BTreeMap<String, V> {
        let mut r = self.local.clone();
        for (k, v) in self.inherited.iter() {
            r.insert(k.clone(), v.clone());
        }
        r
    }

    /// Find the key governing `name`: the exact key if set, otherwise the
    /// longest matching pattern.
    pub fn governing_key(&self, name: &str) -> Option<&str> {
        if self.get(name).is_some() {
            return self
                .local
                .get_key_value(name)
                .or_else(|| self.inherited.get_key_value(name))
                .map(|(k, _)| k.as_str());
        }
        self.patterns
            .iter()
            .find(|(_, m)| m.is_match(name))
            .map(|(k, _)| k.as_str())
    }

    /// Look up the value for a concrete name, falling back to pattern
    /// keys and finally to the system default.
    pub fn lookup(&self, name: &str) -> Option<V> {
        self.governing_key(name)
            .and_then(|k| self.get(k).cloned())
            .or_else(V::unset_default)
    }

    /// For each named attribute, the explicitly set key that governs it
    /// and its effective value.
    pub fn action_match<'a>(&self, names: impl Iterator<Item = &'a str>) -> Vec<(String, V)> {
        let mut r = Vec::new();
        for name in names {
            if let Some(k) = self.governing_key(name) {
                if let Some(v) = self.get(k) {
                    let ent = (k.to_string(), v.clone());
                    if !r.contains(&ent) {
                        r.push(ent);
                    }
                }
            }
        }
        r
    }

    /// Every explicitly set key with its source and masked local value.
    pub fn entries(&self) -> Vec<VarcetEntry<V>> {
        self.effective()
            .into_iter()
            .map(|(name, value)| {
                let source = self.source(&name).unwrap_or(Source::System);
                let masked = self.masked(&name).cloned();
                VarcetEntry {
                    name,
                    value,
                    source,
                    masked,
                }
            })
            .collect()
    }
}

impl Facets {
    /// Whether an action gated by facets applies: untagged actions always
    /// do, tagged ones apply if any of their facets is enabled.
    pub fn allows(&self, d: &Depend) -> bool {
        let mut tagged = false;
        for (name, v) in d.facet_attrs() {
            tagged = true;
            if v == Some(true) && self.lookup(name).unwrap_or(true) {
                return true;
            }
        }
        !tagged
    }
}

impl Variants {
    /// Whether an action gated by variants applies: every variant it names
    /// must match the image's value, unset variants match anything.
    pub fn allows(&self, d: &Depend) -> bool {
        d.variant_attrs()
            .all(|(name, v)| self.lookup(name).map(|iv| iv == v).unwrap_or(true))
    }
}
