//! Checks made before two images are linked.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::LinkedImageName;
use super::LinkedImage;
use crate::context::OpContext;
use crate::errors::LinkedError;
use crate::image::Image;
use crate::paths::{dirpath, is_within};
use anyhow::Result;
use camino::Utf8Path;
use std::collections::{BTreeSet, VecDeque};

/// Limit on how far relationship walks go; a deeper tree is assumed to
/// be broken.
const MAX_DEPTH: usize = 256;

/// Checks common to both directions of attach.
pub fn validate_attach_paths(ctx: &OpContext, parent: &str, child: &str) -> Result<()> {
    let p = dirpath(parent);
    let c = dirpath(child);
    if p == c {
        return Err(LinkedError::SelfLink { path: c }.into());
    }
    if c == dirpath(ctx.live_root()) {
        return Err(LinkedError::LiveRootChild { path: c }.into());
    }
    if is_within(&p, &c) {
        return Err(LinkedError::NestedParent {
            parent: p,
            child: c,
        }
        .into());
    }
    // No image may sit between the two: not at their common directory
    // (unless that is the parent itself) and not above either of them
    // below it.
    let common = common_dir(&p, &c);
    let abort_if_image = |d: &Utf8Path| -> Result<()> {
        if Image::exists(d) {
            return Err(LinkedError::IntermediateImage {
                path: dirpath(d.as_str()),
                parent: p.clone(),
                child: c.clone(),
            }
            .into());
        }
        Ok(())
    };
    if p != common && c != common {
        abort_if_image(Utf8Path::new(&common))?;
    }
    for start in [&p, &c] {
        let mut dir = Utf8Path::new(start).parent();
        while let Some(d) = dir {
            let dp = dirpath(d.as_str());
            if dp == common || !is_within(&dp, &common) {
                break;
            }
            abort_if_image(d)?;
            dir = d.parent();
        }
    }
    Ok(())
}

fn common_dir(a: &str, b: &str) -> String {
    let common: Vec<&str> = a
        .split('/')
        .zip(b.split('/'))
        .take_while(|(x, y)| x == y)
        .map(|(x, _)| x)
        .collect();
    dirpath(&common.join("/"))
}

/// Checks for registering `child_path` as a push child named `name`.
pub fn validate_attach_child(
    ctx: &OpContext,
    img: &Image,
    li: &LinkedImage,
    name: &LinkedImageName,
    child_path: &str,
    allow_relink: bool,
) -> Result<()> {
    if !child_path.starts_with('/') {
        return Err(LinkedError::ChildPathNotAbsolute {
            path: child_path.to_string(),
        }
        .into());
    }
    let root = img.root_str();
    if li.in_altroot() && !is_within(child_path, &root) {
        return Err(LinkedError::ChildNotInAltroot {
            path: dirpath(child_path),
            root,
        }
        .into());
    }
    if !allow_relink {
        for c in li.children(img) {
            if &c.name == name {
                return Err(LinkedError::ChildDuplicate {
                    name: name.to_string(),
                }
                .into());
            }
            if c.location.as_deref().ok() == Some(dirpath(child_path).as_str()) {
                return Err(LinkedError::AlreadyLinked {
                    path: dirpath(child_path),
                }
                .into());
            }
        }
    }
    validate_attach_paths(ctx, &root, child_path)?;
    if ctx.bootenv.is_cloneable(&root) && !is_within(child_path, &root) {
        return Err(LinkedError::NestedChild {
            parent: root,
            child: dirpath(child_path),
        }
        .into());
    }
    let cimg = Image::open(Utf8Path::new(child_path))?;
    let cli = LinkedImage::load(&cimg)?;
    if cli.is_child() {
        if cli.in_altroot() {
            return Err(LinkedError::TemporaryLocation {
                path: cimg.root_str(),
            }
            .into());
        }
        if !allow_relink {
            return Err(LinkedError::AlreadyLinked {
                path: cimg.root_str(),
            }
            .into());
        }
    }
    check_acyclic(&root, &cimg.root_str())
}

/// Checks for linking this image to the parent at `parent_path`.
pub fn validate_attach_parent(
    ctx: &OpContext,
    img: &Image,
    li: &LinkedImage,
    parent_path: &str,
    allow_relink: bool,
) -> Result<()> {
    let root = img.root_str();
    if li.in_altroot() {
        if li.is_child() {
            return Err(LinkedError::TemporaryLocation { path: root }.into());
        }
        return Err(LinkedError::ParentInAltroot {
            root: li.path_transform().new_root.clone(),
        }
        .into());
    }
    if li.is_child() && !allow_relink {
        return Err(LinkedError::AlreadyLinked { path: root }.into());
    }
    let pimg = Image::open(Utf8Path::new(parent_path))?;
    let pli = LinkedImage::load(&pimg)?;
    if pli.is_child() && pli.in_altroot() {
        return Err(LinkedError::TemporaryLocation {
            path: pimg.root_str(),
        }
        .into());
    }
    validate_attach_paths(ctx, &pimg.root_str(), &root)?;
    check_acyclic(&pimg.root_str(), &root)
}

/// Images above `path`, nearest first, following recorded parents.
pub fn ancestors(path: &str) -> Vec<String> {
    let mut r = Vec::new();
    let mut seen = BTreeSet::new();
    let mut cur = dirpath(path);
    while r.len() < MAX_DEPTH && seen.insert(cur.clone()) {
        let Ok(img) = Image::open(Utf8Path::new(&cur)) else {
            break;
        };
        let Ok(li) = LinkedImage::load(&img) else {
            break;
        };
        let Some(p) = li.parent_path().map(dirpath) else {
            break;
        };
        r.push(p.clone());
        cur = p;
    }
    r
}

/// Reachable images below `path`, following child registries.
pub fn descendants(path: &str) -> BTreeSet<String> {
    let mut r = BTreeSet::new();
    let mut queue = VecDeque::from([(dirpath(path), 0usize)]);
    while let Some((cur, depth)) = queue.pop_front() {
        if depth >= MAX_DEPTH {
            tracing::warn!("Linked image tree below {path} is too deep");
            break;
        }
        let Ok(img) = Image::open(Utf8Path::new(&cur)) else {
            continue;
        };
        let Ok(li) = LinkedImage::load(&img) else {
            continue;
        };
        for c in li.children(&img) {
            if let Ok(p) = c.location {
                if r.insert(p.clone()) {
                    queue.push_back((p, depth + 1));
                }
            }
        }
    }
    r
}

/// Linking `child` below `parent` must not make any image its own
/// ancestor.
pub fn check_acyclic(parent: &str, child: &str) -> Result<()> {
    let p = dirpath(parent);
    let c = dirpath(child);
    if ancestors(&p).contains(&c) || descendants(&c).contains(&p) {
        return Err(LinkedError::Cycle {
            parent: p,
            child: c,
        }
        .into());
    }
    Ok(())
}
