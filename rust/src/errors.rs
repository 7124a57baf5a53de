//! Error taxonomy and exit codes for linked image operations.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use serde_derive::{Deserialize, Serialize};
use thiserror::Error;

/// Process exit codes.  These values are part of the CLI interface and
/// must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(into = "i32", try_from = "i32")]
#[repr(i32)]
pub enum ExitStatus {
    /// Command succeeded.
    Ok = 0,
    /// An error occurred.
    Oops = 1,
    /// Invalid command line options were specified.
    BadOpt = 2,
    /// Multiple operations were requested, but not all succeeded.
    Partial = 3,
    /// No changes were made, nothing to do.
    Nop = 4,
    /// Image is currently locked by another process.
    Locked = 7,
    /// Can't access the requested image.
    EAccess = 51,
    /// Image is not in sync with its constraints.
    Diverged = 52,
    /// Image is not linked to a parent image.
    NoParent = 53,
    /// Linked operation must be done from the parent.
    ParentOp = 54,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        self as i32
    }

    /// Whether this status represents a hard failure (as opposed to
    /// success, a no-op, or a divergence report).
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Ok | Self::Nop | Self::Diverged)
    }
}

impl From<ExitStatus> for i32 {
    fn from(v: ExitStatus) -> i32 {
        v.code()
    }
}

impl TryFrom<i32> for ExitStatus {
    type Error = String;

    fn try_from(v: i32) -> Result<Self, Self::Error> {
        let r = match v {
            0 => Self::Ok,
            1 => Self::Oops,
            2 => Self::BadOpt,
            3 => Self::Partial,
            4 => Self::Nop,
            7 => Self::Locked,
            51 => Self::EAccess,
            52 => Self::Diverged,
            53 => Self::NoParent,
            54 => Self::ParentOp,
            o => return Err(format!("unknown exit status {o}")),
        };
        Ok(r)
    }
}

/// Broad classes of failures; used to decide how an error propagates
/// and how it is rendered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    /// Invalid relationship change; never retried.
    Topology,
    /// An image could not be read or located.
    Access,
    /// Parent imposed constraints could not be honored.
    Constraint,
    /// Linked metadata is missing or unreadable; recoverable.
    Metadata,
    /// Bad options or arguments.
    Usage,
    /// The operation was interrupted.
    Canceled,
    /// Anything else.
    Internal,
}

/// Errors specific to linked image handling.  These are carried inside
/// [`anyhow::Error`] and recovered via `downcast_ref` where an exit code
/// or kind is needed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum LinkedError {
    #[error("cannot link an image to itself: {path}")]
    SelfLink { path: String },

    #[error("parent image {parent} is nested inside child image {child}")]
    NestedParent { parent: String, child: String },

    #[error("child image {child} is not nested inside parent image {parent}, which lives in a cloneable boot environment")]
    NestedChild { parent: String, child: String },

    #[error("image at {path} lies between parent {parent} and child {child}")]
    IntermediateImage {
        path: String,
        parent: String,
        child: String,
    },

    #[error("linking {child} below {parent} would create a cycle")]
    Cycle { parent: String, child: String },

    #[error("a child named {name} is already attached (use --allow-relink to override)")]
    ChildDuplicate { name: String },

    #[error("image at {path} is already linked (use --allow-relink to override)")]
    AlreadyLinked { path: String },

    #[error("the live root {path} cannot be attached as a child")]
    LiveRootChild { path: String },

    #[error("image at {path} is a temporary copy of a linked image and cannot be linked")]
    TemporaryLocation { path: String },

    #[error("cannot attach a parent from within an alternate root ({root})")]
    ParentInAltroot { root: String },

    #[error("child path {path} is outside of the current root {root}")]
    ChildNotInAltroot { path: String, root: String },

    #[error("child path must be absolute: {path}")]
    ChildPathNotAbsolute { path: String },

    #[error("no linked child named {name}")]
    NotLinked { name: String },

    #[error("unknown linked child image(s): {}", names.join(", "))]
    UnknownChild { names: Vec<String> },

    #[error("linked image kind {kind} does not support {op} (use --force to override)")]
    Unsupported { kind: String, op: String },

    #[error("invalid linked image name: {name}")]
    InvalidName { name: String },

    #[error("invalid linked image property: {prop}")]
    InvalidProperty { prop: String },

    #[error("unable to access image at {path}: {reason}")]
    ImageAccess { path: String, reason: String },

    #[error("unable to determine current location of image recorded at {path}")]
    PathUnresolvable { path: String },

    #[error("image at {path} is locked by another process")]
    Locked { path: String },

    #[error("constraints cannot be satisfied: {}", details.join("; "))]
    ConstraintUnsatisfiable { details: Vec<String> },

    #[error("package updates required but not allowed: {}", pkgs.join(", "))]
    NoPkgUpdatesViolation { pkgs: Vec<String> },

    #[error("publisher configuration does not match parent: {}", details.join("; "))]
    PublisherMismatch { details: Vec<String> },

    #[error("unable to read linked metadata {file}: {reason}")]
    MetadataCorrupt { file: String, reason: String },

    #[error("image is not linked to a parent image")]
    NoParent,

    #[error("{op} must be performed from the parent image of {name}")]
    ParentOp { name: String, op: String },

    #[error("invalid options: {0}")]
    BadOption(String),

    #[error("operation canceled")]
    Canceled,
}

impl LinkedError {
    pub fn kind(&self) -> ErrorKind {
        use LinkedError::*;
        match self {
            SelfLink { .. }
            | NestedParent { .. }
            | NestedChild { .. }
            | IntermediateImage { .. }
            | Cycle { .. }
            | ChildDuplicate { .. }
            | AlreadyLinked { .. }
            | LiveRootChild { .. }
            | TemporaryLocation { .. }
            | ParentInAltroot { .. }
            | ChildNotInAltroot { .. }
            | ChildPathNotAbsolute { .. }
            | NotLinked { .. }
            | Unsupported { .. } => ErrorKind::Topology,
            ImageAccess { .. } | PathUnresolvable { .. } | Locked { .. } | NoParent => {
                ErrorKind::Access
            }
            ConstraintUnsatisfiable { .. }
            | NoPkgUpdatesViolation { .. }
            | PublisherMismatch { .. } => ErrorKind::Constraint,
            MetadataCorrupt { .. } => ErrorKind::Metadata,
            UnknownChild { .. }
            | InvalidName { .. }
            | InvalidProperty { .. }
            | ParentOp { .. }
            | BadOption(_) => ErrorKind::Usage,
            Canceled => ErrorKind::Canceled,
        }
    }

    pub fn exit_status(&self) -> ExitStatus {
        use LinkedError::*;
        match self {
            ImageAccess { .. } | PathUnresolvable { .. } => ExitStatus::EAccess,
            Locked { .. } => ExitStatus::Locked,
            NoParent => ExitStatus::NoParent,
            ParentOp { .. } => ExitStatus::ParentOp,
            UnknownChild { .. } | InvalidName { .. } | InvalidProperty { .. } | BadOption(_) => {
                ExitStatus::BadOpt
            }
            _ => ExitStatus::Oops,
        }
    }
}

/// Find the linked image error (if any) in an error chain.
pub fn find_linked_error(e: &anyhow::Error) -> Option<&LinkedError> {
    e.chain().find_map(|c| c.downcast_ref::<LinkedError>())
}

/// Map an arbitrary error to an exit status.
pub fn exit_status_of(e: &anyhow::Error) -> ExitStatus {
    find_linked_error(e)
        .map(|e| e.exit_status())
        .unwrap_or(ExitStatus::Oops)
}

/// Map an arbitrary error to its kind.
pub fn error_kind_of(e: &anyhow::Error) -> ErrorKind {
    find_linked_error(e)
        .map(|e| e.kind())
        .unwrap_or(ErrorKind::Internal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn exit_roundtrip() {
        for v in [0, 1, 2, 3, 4, 7, 51, 52, 53, 54] {
            let e = ExitStatus::try_from(v).unwrap();
            assert_eq!(e.code(), v);
        }
        assert!(ExitStatus::try_from(5).is_err());
        assert_eq!(serde_json::to_string(&ExitStatus::Diverged).unwrap(), "52");
    }

    #[test]
    fn classify_through_context() {
        let e: anyhow::Error = Err::<(), _>(LinkedError::Locked {
            path: "/a/".into(),
        })
        .context("Opening image")
        .unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::Locked);
        assert_eq!(error_kind_of(&e), ErrorKind::Access);
        let e = anyhow::anyhow!("something else");
        assert_eq!(exit_status_of(&e), ExitStatus::Oops);
        assert_eq!(error_kind_of(&e), ErrorKind::Internal);
    }

    #[test]
    fn failure_classes() {
        assert!(!ExitStatus::Diverged.is_failure());
        assert!(!ExitStatus::Nop.is_failure());
        assert!(ExitStatus::Partial.is_failure());
        assert!(ExitStatus::EAccess.is_failure());
    }
}
