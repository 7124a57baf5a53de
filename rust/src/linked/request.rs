//! Requests a parent sends to operate on one of its children.
//!
//! A parent never writes into a child's metadata; it describes what it
//! wants as a [`ChildRequest`], and the child carries that out in its own
//! context (in this process or in a re-executed `imgpkg child-op`),
//! answering with a [`ChildResponse`].
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::dispatch::ChildResult;
use super::props::{LinkedProps, Role};
use super::store::ParentMetadata;
use crate::api::{ImageInterface, OpOutcome};
use crate::context::OpContext;
use crate::errors::{error_kind_of, exit_status_of, ErrorKind, ExitStatus, LinkedError};
use crate::plan::PlanSummary;
use crate::planner::PkgOp;
use anyhow::Result;
use camino::Utf8Path;
use serde_derive::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    tag = "op",
    rename_all = "kebab-case",
    rename_all_fields = "kebab-case",
    deny_unknown_fields
)]
pub enum ChildRequest {
    /// Compare the child against the given parent snapshot.  Never writes.
    AuditLinked {
        props: LinkedProps,
        pmd: ParentMetadata,
    },
    /// Compare the child's publishers against the parent's.
    Pubcheck { pmd: ParentMetadata },
    /// Become a push child of the sender.
    Attach {
        props: LinkedProps,
        pmd: ParentMetadata,
        md_only: bool,
        pkg_updates: bool,
        noexecute: bool,
        allow_relink: bool,
    },
    /// Bring the child in line with the parent snapshot.
    Sync {
        props: LinkedProps,
        pmd: ParentMetadata,
        md_only: bool,
        pkg_updates: bool,
        noexecute: bool,
    },
    /// Stop being a child.
    Detach {
        md_only: bool,
        pkg_updates: bool,
        noexecute: bool,
    },
    /// Run a packaging operation explicitly in the child.
    PkgOp {
        operation: PkgOp,
        props: LinkedProps,
        pmd: ParentMetadata,
        noexecute: bool,
        /// Recurse into all of the child's own children.
        recurse: bool,
    },
}

impl ChildRequest {
    pub fn name(&self) -> &'static str {
        match self {
            ChildRequest::AuditLinked { .. } => "audit-linked",
            ChildRequest::Pubcheck { .. } => "pubcheck-linked",
            ChildRequest::Attach { .. } => "attach-linked",
            ChildRequest::Sync { .. } => "sync-linked",
            ChildRequest::Detach { .. } => "detach-linked",
            ChildRequest::PkgOp { .. } => "pkg-op",
        }
    }

    pub fn props(&self) -> Option<&LinkedProps> {
        match self {
            ChildRequest::AuditLinked { props, .. }
            | ChildRequest::Attach { props, .. }
            | ChildRequest::Sync { props, .. }
            | ChildRequest::PkgOp { props, .. } => Some(props),
            ChildRequest::Pubcheck { .. } | ChildRequest::Detach { .. } => None,
        }
    }

    /// Whether executing the request may modify the child.
    pub fn is_readonly(&self) -> bool {
        match self {
            ChildRequest::AuditLinked { .. } | ChildRequest::Pubcheck { .. } => true,
            ChildRequest::Attach { noexecute, .. }
            | ChildRequest::Sync { noexecute, .. }
            | ChildRequest::Detach { noexecute, .. }
            | ChildRequest::PkgOp { noexecute, .. } => *noexecute,
        }
    }

    /// Reject requests that could not have come from a parent.
    pub fn validate(&self) -> Result<()> {
        if let Some(props) = self.props() {
            props.verify()?;
            if props.role() != Role::PushChild {
                return Err(LinkedError::InvalidProperty {
                    prop: format!("li-model (expected push for {})", self.name()),
                }
                .into());
            }
        }
        if let ChildRequest::PkgOp { operation, .. } = self {
            if matches!(operation, PkgOp::Detach) {
                return Err(LinkedError::BadOption(
                    "detach must be requested directly".into(),
                )
                .into());
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ResponseError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ResponseError {
    pub fn from_error(e: &anyhow::Error) -> Self {
        Self {
            kind: error_kind_of(e),
            message: format!("{e:#}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChildResponse {
    pub exit: ExitStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildResult>,
}

impl ChildResponse {
    pub fn from_result(r: Result<OpOutcome>) -> Self {
        match r {
            Ok(o) => Self {
                exit: o.status,
                error: None,
                plan: o.plan,
                output: o.output,
                children: o.children,
            },
            Err(e) => Self {
                exit: exit_status_of(&e),
                error: Some(ResponseError::from_error(&e)),
                plan: None,
                output: Vec::new(),
                children: Vec::new(),
            },
        }
    }

    pub fn is_canceled(&self) -> bool {
        matches!(&self.error, Some(e) if e.kind == ErrorKind::Canceled)
    }
}

fn handle_inner(ctx: &OpContext, root: &Utf8Path, req: &ChildRequest) -> Result<OpOutcome> {
    req.validate()?;
    ctx.check_canceled()?;
    let mut api = ImageInterface::open(ctx, root)?;
    api.handle_request(req)
}

/// Carry out `req` against the image at `root`.  Failures become part of
/// the response.
pub fn handle(ctx: &OpContext, root: &Utf8Path, req: &ChildRequest) -> ChildResponse {
    tracing::debug!("Handling {} for {root}", req.name());
    let r = ChildResponse::from_result(handle_inner(ctx, root, req));
    if let Some(e) = r.error.as_ref() {
        tracing::debug!("{} for {root} failed: {}", req.name(), e.message);
    }
    r
}

#[cfg(test)]
mod tests {
    use super::super::props::Model;
    use super::*;
    use indoc::indoc;

    fn push_props() -> LinkedProps {
        LinkedProps {
            name: Some("system:c".parse().unwrap()),
            model: Some(Model::Push),
            path: "/p/c/".into(),
            parent_path: Some("/p/".into()),
            ..Default::default()
        }
    }

    #[test]
    fn wire_format() -> Result<()> {
        let req = ChildRequest::Detach {
            md_only: false,
            pkg_updates: true,
            noexecute: true,
        };
        let s = serde_json::to_string(&req)?;
        assert_eq!(
            s,
            r#"{"op":"detach","md-only":false,"pkg-updates":true,"noexecute":true}"#
        );
        let req: ChildRequest = serde_json::from_str(indoc! {r#"
            {"op": "sync", "props": {"li-name": "system:c", "li-model": "push",
             "li-path": "/p/c/"}, "pmd": {"ppkgs": []}, "md-only": true,
             "pkg-updates": true, "noexecute": false}
        "#})?;
        assert!(!req.is_readonly());
        req.validate()?;
        assert!(serde_json::from_str::<ChildRequest>(r#"{"op": "frobnicate"}"#).is_err());
        assert!(serde_json::from_str::<ChildRequest>(
            r#"{"op": "detach", "md-only": false, "pkg-updates": true, "noexecute": true, "x": 1}"#
        )
        .is_err());
        Ok(())
    }

    #[test]
    fn validation() {
        let mut props = push_props();
        let ok = ChildRequest::AuditLinked {
            props: props.clone(),
            pmd: ParentMetadata::default(),
        };
        assert!(ok.validate().is_ok());
        assert!(ok.is_readonly());
        props.model = Some(Model::Pull);
        let bad = ChildRequest::AuditLinked {
            props,
            pmd: ParentMetadata::default(),
        };
        let e = bad.validate().unwrap_err();
        assert_eq!(exit_status_of(&e), ExitStatus::BadOpt);
        let bad = ChildRequest::PkgOp {
            operation: PkgOp::Detach,
            props: push_props(),
            pmd: ParentMetadata::default(),
            noexecute: false,
            recurse: false,
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn responses() {
        let r = ChildResponse::from_result(Err(LinkedError::Canceled.into()));
        assert_eq!(r.exit, ExitStatus::Oops);
        assert!(r.is_canceled());
        let r = ChildResponse::from_result(Err(LinkedError::NoParent.into()));
        assert_eq!(r.exit, ExitStatus::NoParent);
        assert!(!r.is_canceled());
        let r = ChildResponse::from_result(Ok(OpOutcome::new(ExitStatus::Nop)));
        assert_eq!(r.exit, ExitStatus::Nop);
        assert!(r.error.is_none());
    }

    #[test]
    fn missing_image() {
        let ctx = OpContext::new(crate::config::ClientConfig::default());
        let r = handle(
            &ctx,
            Utf8Path::new("/nonexistent/child"),
            &ChildRequest::Pubcheck {
                pmd: ParentMetadata::default(),
            },
        );
        assert_eq!(r.exit, ExitStatus::EAccess);
        assert_eq!(r.error.unwrap().kind, ErrorKind::Access);
    }
}
