// SPDX-License-Identifier: Apache-2.0 OR MIT
use anyhow::Result;
use imgpkg_client::{Parsable, EXIT_DIVERGED};

#[test]
fn parse_audit() -> Result<()> {
    let data = include_str!("fixtures/audit-children.json");
    let p: Parsable = serde_json::from_str(data)?;
    assert_eq!(p.exit, 3);
    assert_eq!(p.children.len(), 3);
    assert!(!p.is_insync());
    assert_eq!(p.diverged_children(), ["system:build"]);
    let build = p.child("system:build").unwrap();
    assert_eq!(build.exit, EXIT_DIVERGED);
    assert_eq!(build.output.len(), 1);
    let gone = p.child("system:gone").unwrap();
    assert_eq!(gone.error.as_ref().unwrap().kind, "access");
    assert!(p.child("system:web").unwrap().error.is_none());
    assert!(p.child("system:other").is_none());
    Ok(())
}

#[test]
fn parse_list() -> Result<()> {
    let data = include_str!("fixtures/list-linked.json");
    let p: Parsable = serde_json::from_str(data)?;
    assert!(p.is_insync());
    assert_eq!(p.linked.len(), 2);
    assert_eq!(p.linked[0].relationship, "self");
    let parent = p.parent().unwrap();
    assert_eq!(parent.path, "/mnt/alt/");
    assert!(parent.reachable);
    Ok(())
}

#[test]
fn parse_properties() -> Result<()> {
    let data = include_str!("fixtures/property-linked.json");
    let p: Parsable = serde_json::from_str(data)?;
    assert_eq!(p.properties["li-model"], "pull");
    assert_eq!(p.properties["li-path-transform"], "(/, /mnt/alt/)");
    assert!(p.linked.is_empty());
    assert!(p.error.is_none());
    // Empty fields are left out again.
    let back = serde_json::to_value(&p)?;
    assert!(back.get("linked").is_none());
    assert_eq!(back["properties"]["li-parent"], "/");
    Ok(())
}
