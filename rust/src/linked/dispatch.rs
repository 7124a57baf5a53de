//! Selecting children and fanning requests out to them.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::LinkedImageName;
use super::request::{ChildRequest, ResponseError};
use crate::context::OpContext;
use crate::errors::{error_kind_of, exit_status_of, ErrorKind, ExitStatus, LinkedError};
use crate::plan::PlanSummary;
use anyhow::Result;
use rayon::prelude::*;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Which children an operation explicitly recurses into.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Selection {
    All,
    #[default]
    None,
    Include(BTreeSet<LinkedImageName>),
    Exclude(BTreeSet<LinkedImageName>),
}

impl Selection {
    /// Build a selection from `-a`/`-r` style flags plus include and
    /// exclude lists.  Naming children implies selecting them.
    pub fn from_args(
        all: bool,
        include: &[LinkedImageName],
        exclude: &[LinkedImageName],
    ) -> Result<Self> {
        if !include.is_empty() && !exclude.is_empty() {
            return Err(LinkedError::BadOption(
                "children may be included or excluded, not both".into(),
            )
            .into());
        }
        let r = if !include.is_empty() {
            Selection::Include(include.iter().cloned().collect())
        } else if !exclude.is_empty() {
            if !all {
                return Err(LinkedError::BadOption(
                    "excluding children requires selecting all of them".into(),
                )
                .into());
            }
            Selection::Exclude(exclude.iter().cloned().collect())
        } else if all {
            Selection::All
        } else {
            Selection::None
        };
        Ok(r)
    }

    /// The selected subset of `known`, in order.  Naming a child which
    /// isn't known is an error unless `ignore_unknown` is set.
    pub fn apply(
        &self,
        known: &[LinkedImageName],
        ignore_unknown: bool,
    ) -> Result<Vec<LinkedImageName>> {
        let named = match self {
            Selection::Include(s) | Selection::Exclude(s) => Some(s),
            Selection::All | Selection::None => None,
        };
        if let Some(named) = named {
            let unknown: Vec<String> = named
                .iter()
                .filter(|n| !known.contains(n))
                .map(|n| n.to_string())
                .collect();
            if !unknown.is_empty() {
                if !ignore_unknown {
                    return Err(LinkedError::UnknownChild { names: unknown }.into());
                }
                tracing::debug!("Ignoring unknown children: {}", unknown.join(", "));
            }
        }
        let r = known
            .iter()
            .filter(|n| match self {
                Selection::All => true,
                Selection::None => false,
                Selection::Include(s) => s.contains(n),
                Selection::Exclude(s) => !s.contains(n),
            })
            .cloned()
            .collect();
        Ok(r)
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Selection::None)
    }
}

/// One request to send, to a child which may not have been found.
#[derive(Debug)]
pub struct ChildJob {
    pub name: LinkedImageName,
    pub path: std::result::Result<String, LinkedError>,
    pub req: ChildRequest,
}

/// Outcome of one child operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ChildResult {
    pub name: String,
    pub status: ExitStatus,
    #[serde(default)]
    pub canceled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ResponseError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub output: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan: Option<PlanSummary>,
    /// Results from this child's own children, for recursive operations.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<ChildResult>,
}

impl ChildResult {
    fn from_error(name: &LinkedImageName, e: anyhow::Error) -> Self {
        Self {
            name: name.to_string(),
            status: exit_status_of(&e),
            canceled: error_kind_of(&e) == ErrorKind::Canceled,
            error: Some(ResponseError::from_error(&e)),
            output: Vec::new(),
            plan: None,
            children: Vec::new(),
        }
    }

    pub fn is_failure(&self) -> bool {
        self.canceled || self.status.is_failure()
    }
}

fn run_job(ctx: &OpContext, job: &ChildJob) -> ChildResult {
    if let Err(e) = ctx.check_canceled() {
        return ChildResult::from_error(&job.name, e);
    }
    let path = match job.path.as_ref() {
        Ok(p) => p,
        Err(e) => return ChildResult::from_error(&job.name, e.clone().into()),
    };
    tracing::debug!("Running {} in {} ({path})", job.req.name(), job.name);
    match ctx.runner.run(ctx, path, &job.req) {
        Ok(r) => ChildResult {
            name: job.name.to_string(),
            status: r.exit,
            canceled: r.is_canceled() || r.children.iter().any(|c| c.canceled),
            error: r.error,
            output: r.output,
            plan: r.plan,
            children: r.children,
        },
        Err(e) => ChildResult::from_error(&job.name, e),
    }
}

/// Run every job, concurrently up to the configured limit.  A failing
/// child never stops its siblings; results come back in job order.
pub fn run_jobs(ctx: &OpContext, jobs: &[ChildJob], what: &str) -> Result<Vec<ChildResult>> {
    if jobs.is_empty() {
        return Ok(Vec::new());
    }
    let threads = ctx
        .config
        .concurrency
        .unwrap_or(jobs.len())
        .clamp(1, jobs.len());
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .thread_name(|i| format!("child-{i}"))
        .build()?;
    tracing::debug!("{what}: {} children, {threads} at a time", jobs.len());
    if ctx.progress {
        crate::progress::begin_n_items(what, jobs.len() as u64);
    }
    let results: Vec<ChildResult> = pool.install(|| {
        jobs.par_iter()
            .map(|job| {
                let r = run_job(ctx, job);
                if ctx.progress {
                    crate::progress::set_sub_message(&r.name);
                    crate::progress::inc();
                }
                r
            })
            .collect()
    });
    if ctx.progress {
        let failed = results.iter().filter(|r| r.is_failure()).count();
        match failed {
            0 => crate::progress::end(None),
            n => crate::progress::end(Some(&format!("{n} failed"))),
        }
    }
    Ok(results)
}

/// Combine statuses: failures outrank divergence, which outranks
/// success.  Several different failures, or failures next to successes,
/// are a partial failure.
pub fn reduce_statuses(statuses: impl IntoIterator<Item = ExitStatus>) -> ExitStatus {
    let statuses: Vec<ExitStatus> = statuses.into_iter().collect();
    if statuses.is_empty() {
        return ExitStatus::Nop;
    }
    let failures: BTreeSet<ExitStatus> =
        statuses.iter().copied().filter(|s| s.is_failure()).collect();
    let nfailed = statuses.iter().filter(|s| s.is_failure()).count();
    if let Some(first) = failures.first() {
        if failures.len() == 1 && nfailed == statuses.len() {
            return *first;
        }
        return ExitStatus::Partial;
    }
    if statuses.contains(&ExitStatus::Diverged) {
        ExitStatus::Diverged
    } else if statuses.contains(&ExitStatus::Ok) {
        ExitStatus::Ok
    } else {
        ExitStatus::Nop
    }
}

/// The aggregate status of a set of child results; a canceled child
/// makes the whole operation a (canceled) failure.
pub fn reduce(results: &[ChildResult]) -> ExitStatus {
    if results.iter().any(|r| r.canceled) {
        return ExitStatus::Oops;
    }
    reduce_statuses(results.iter().map(|r| r.status))
}
