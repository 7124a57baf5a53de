//! Rendering results as plain text or `--parsable` JSON.
//!
//! Plain output is line oriented and every line about a child is prefixed
//! with the child's name, so results of concurrent child operations can be
//! told apart.  Parsable output uses the types from `imgpkg-client`.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::api::OpOutcome;
use crate::errors::{error_kind_of, exit_status_of, ExitStatus};
use crate::linked::dispatch::ChildResult;
use crate::varcet::VarcetEntry;
use anyhow::Result;
use imgpkg_client::{ChildOutcome, ErrorInfo, LinkedEntry, Parsable, VarcetRow, PARSABLE_VERSION};
use std::collections::BTreeMap;
use std::fmt::Display;
use std::io::Write;

fn status_word(st: ExitStatus) -> String {
    match st {
        ExitStatus::Ok => "ok".into(),
        ExitStatus::Nop => "nothing to do".into(),
        ExitStatus::Diverged => "diverged".into(),
        o => format!("failed (exit {})", o.code()),
    }
}

fn error_kind_str(kind: crate::errors::ErrorKind) -> String {
    serde_json::to_value(kind)
        .ok()
        .and_then(|v| v.as_str().map(|s| s.to_string()))
        .unwrap_or_else(|| "internal".into())
}

fn child_outcome(c: &ChildResult) -> ChildOutcome {
    ChildOutcome {
        name: c.name.clone(),
        exit: c.status.code(),
        canceled: c.canceled,
        error: c.error.as_ref().map(|e| ErrorInfo {
            kind: error_kind_str(e.kind),
            message: e.message.clone(),
        }),
        plan: c.plan.as_ref().map(|p| p.lines()).unwrap_or_default(),
        output: c.output.clone(),
        children: c.children.iter().map(child_outcome).collect(),
    }
}

/// Parsable form of an operation's outcome.
pub fn outcome_to_parsable(o: &OpOutcome) -> Parsable {
    Parsable {
        version: PARSABLE_VERSION,
        exit: o.status.code(),
        plan: o.plan.as_ref().map(|p| p.lines()).unwrap_or_default(),
        output: o.output.clone(),
        children: o.children.iter().map(child_outcome).collect(),
        ..Default::default()
    }
}

/// Parsable form of a fatal error.
pub fn error_to_parsable(e: &anyhow::Error) -> Parsable {
    Parsable {
        version: PARSABLE_VERSION,
        exit: exit_status_of(e).code(),
        error: Some(ErrorInfo {
            kind: error_kind_str(error_kind_of(e)),
            message: format!("{e:#}"),
        }),
        ..Default::default()
    }
}

pub fn list_to_parsable(entries: Vec<LinkedEntry>) -> Parsable {
    Parsable {
        version: PARSABLE_VERSION,
        exit: ExitStatus::Ok.code(),
        linked: entries,
        ..Default::default()
    }
}

pub fn properties_to_parsable(props: BTreeMap<String, String>) -> Parsable {
    Parsable {
        version: PARSABLE_VERSION,
        exit: ExitStatus::Ok.code(),
        properties: props,
        ..Default::default()
    }
}

/// Rows for an effective facet or variant listing.
pub fn varcet_rows<V: Display>(entries: &[VarcetEntry<V>]) -> Vec<VarcetRow> {
    entries
        .iter()
        .map(|e| VarcetRow {
            name: e.name.clone(),
            value: e.value.to_string(),
            source: e.source.to_string(),
            masked: e.masked.as_ref().map(|m| m.to_string()),
        })
        .collect()
}

pub fn print_parsable(out: &mut impl Write, p: &Parsable) -> Result<()> {
    serde_json::to_writer(&mut *out, p)?;
    writeln!(out)?;
    Ok(())
}

/// Plain rendering of an outcome: the plan, report lines, then one block
/// per child.
pub fn print_outcome(out: &mut impl Write, o: &OpOutcome) -> Result<()> {
    if let Some(plan) = o.plan.as_ref() {
        for l in plan.lines() {
            writeln!(out, "{l}")?;
        }
    }
    for l in o.output.iter() {
        writeln!(out, "{l}")?;
    }
    print_children(out, "", &o.children)
}

/// One block per child; a grandchild's lines carry both names.
fn print_children(out: &mut impl Write, prefix: &str, children: &[ChildResult]) -> Result<()> {
    for c in children {
        let name = format!("{prefix}{}", c.name);
        if c.canceled {
            writeln!(out, "{name}: canceled")?;
        } else {
            writeln!(out, "{name}: {}", status_word(c.status))?;
        }
        if let Some(plan) = c.plan.as_ref() {
            for l in plan.lines() {
                writeln!(out, "{name}:   {l}")?;
            }
        }
        for l in c.output.iter() {
            writeln!(out, "{name}:   {l}")?;
        }
        if let Some(e) = c.error.as_ref() {
            writeln!(out, "{name}:   error: {}", e.message)?;
        }
        print_children(out, &format!("{name}: "), &c.children)?;
    }
    Ok(())
}

pub fn print_list(out: &mut impl Write, entries: &[LinkedEntry]) -> Result<()> {
    if entries.is_empty() {
        return Ok(());
    }
    let w = entries
        .iter()
        .map(|e| e.name.len())
        .max()
        .unwrap_or_default()
        .max("NAME".len());
    writeln!(out, "{:w$}  {:12}  {:5}  PATH", "NAME", "RELATIONSHIP", "MODEL")?;
    for e in entries {
        let path = if e.reachable {
            e.path.clone()
        } else {
            format!("{} (unreachable)", e.path)
        };
        writeln!(
            out,
            "{:w$}  {:12}  {:5}  {path}",
            e.name, e.relationship, e.model
        )?;
    }
    Ok(())
}

pub fn print_properties(out: &mut impl Write, props: &BTreeMap<String, String>) -> Result<()> {
    let w = props.keys().map(|k| k.len()).max().unwrap_or_default();
    for (k, v) in props {
        writeln!(out, "{k:w$}  {v}")?;
    }
    Ok(())
}

pub fn print_varcets(out: &mut impl Write, rows: &[VarcetRow]) -> Result<()> {
    let w = rows.iter().map(|r| r.name.len()).max().unwrap_or_default();
    for r in rows {
        write!(out, "{:w$}  {}  {}", r.name, r.value, r.source)?;
        match r.masked.as_ref() {
            Some(m) => writeln!(out, "  (masks local {m})")?,
            None => writeln!(out)?,
        }
    }
    Ok(())
}
