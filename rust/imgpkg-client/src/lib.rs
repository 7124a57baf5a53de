//! APIs for interacting with imgpkg linked images from the client side.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use anyhow::Context;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Command;

/// Our generic catchall fatal error, expected to be converted
/// to a string to output to a terminal or logs.
type Result<T> = std::result::Result<T, Box<dyn std::error::Error + Send + Sync + 'static>>;

/// Version of the `--parsable` output format.
pub const PARSABLE_VERSION: u32 = 0;

/// Exit code of a successful command.
pub const EXIT_OK: i32 = 0;
/// Exit code when there was nothing to do.
pub const EXIT_NOP: i32 = 4;
/// Exit code of an audit which found divergence.
pub const EXIT_DIVERGED: i32 = 52;

/// Used for methods that invoke the `imgpkg` binary directly, always
/// against one image root.
#[derive(Debug, Clone)]
pub struct CliClient {
    binary: String,
    root: String,
}

/// One row of `list-linked`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct LinkedEntry {
    pub name: String,
    /// `self`, `parent` or `child`.
    pub relationship: String,
    pub path: String,
    pub model: String,
    pub reachable: bool,
}

/// An error as reported in parsable output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ErrorInfo {
    /// Broad class, e.g. `topology` or `access`.
    pub kind: String,
    pub message: String,
}

/// The outcome of an operation in one child image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChildOutcome {
    pub name: String,
    pub exit: i32,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    /// Results from this child's own children.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildOutcome>,
}

/// A facet or variant with its effective value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VarcetRow {
    pub name: String,
    pub value: String,
    /// `local`, `parent` or `system`.
    pub source: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub masked: Option<String>,
}

/// Output of any `imgpkg` command run with `--parsable`.  Only the
/// fields relevant to the command are present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Parsable {
    pub version: u32,
    pub exit: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub plan: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildOutcome>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub linked: Vec<LinkedEntry>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub facets: Vec<VarcetRow>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub variants: Vec<VarcetRow>,
}

impl Parsable {
    /// Find the result for a child, if it was operated on.
    pub fn child(&self, name: &str) -> Option<&ChildOutcome> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Names of children whose audit found divergence.
    pub fn diverged_children(&self) -> Vec<&str> {
        self.children
            .iter()
            .filter(|c| c.exit == EXIT_DIVERGED)
            .map(|c| c.name.as_str())
            .collect()
    }

    /// Whether an audit found everything in sync.
    pub fn is_insync(&self) -> bool {
        self.exit == EXIT_OK && self.children.iter().all(|c| c.exit != EXIT_DIVERGED)
    }

    /// The entry describing this image's parent, if it has one.
    pub fn parent(&self) -> Option<&LinkedEntry> {
        self.linked.iter().find(|e| e.relationship == "parent")
    }
}

impl CliClient {
    /// Create a client for the image at `root`.
    pub fn new<S: AsRef<str>>(root: S) -> Self {
        Self {
            binary: "imgpkg".to_string(),
            root: root.as_ref().to_string(),
        }
    }

    /// Use a specific `imgpkg` binary rather than looking it up in `$PATH`.
    pub fn with_binary<S: AsRef<str>>(mut self, binary: S) -> Self {
        self.binary = binary.as_ref().to_string();
        self
    }

    /// Create an invocation of the client binary
    fn cli_cmd(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        cmd.args(["-R", self.root.as_str()]);
        cmd
    }

    /// Run a subcommand with `--parsable` and parse what it prints.  Exit
    /// codes which carry a result (nothing to do, diverged, ...) are not
    /// errors; the code is available in [`Parsable::exit`].
    pub fn run_parsable(&self, args: &[&str]) -> Result<Parsable> {
        let sub = args.first().copied().unwrap_or_default();
        let res = self
            .cli_cmd()
            .args(args)
            .arg("--parsable")
            .output()
            .with_context(|| format!("failed to spawn 'imgpkg {sub}'"))?;
        let parsed: Parsable = match serde_json::from_slice(&res.stdout) {
            Ok(p) => p,
            Err(e) => {
                return Err(format!(
                    "running 'imgpkg {sub}' failed: {e}: {}",
                    String::from_utf8_lossy(&res.stderr)
                )
                .into())
            }
        };
        if parsed.version != PARSABLE_VERSION {
            return Err(format!("unsupported parsable version {}", parsed.version).into());
        }
        Ok(parsed)
    }

    /// List this image's linked relationships.
    pub fn list_linked(&self) -> Result<Vec<LinkedEntry>> {
        Ok(self.run_parsable(&["list-linked"])?.linked)
    }

    /// Audit this image against its parent, or all children with `all`.
    pub fn audit_linked(&self, all: bool) -> Result<Parsable> {
        let args: &[&str] = if all {
            &["audit-linked", "-a"]
        } else {
            &["audit-linked"]
        };
        self.run_parsable(args)
    }

    /// Linked properties of this image, or of one of its children.
    pub fn property_linked(&self, child: Option<&str>) -> Result<BTreeMap<String, String>> {
        let mut args = vec!["property-linked"];
        if let Some(c) = child {
            args.extend(["-l", c]);
        }
        let p = self.run_parsable(&args)?;
        if let Some(e) = p.error {
            return Err(format!("{}: {}", e.kind, e.message).into());
        }
        Ok(p.properties)
    }
}
