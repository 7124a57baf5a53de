//! Package images linked into parent/child trees.
//!
//! An image is a directory tree with installed packages plus the metadata
//! under `var/pkg`.  Images can be linked so that a child follows the
//! packages, facets, variants and publishers of its parent; see
//! [`linked`] for the relationships and [`api::ImageInterface`] for the
//! operations.
/*
 * SPDX-License-Identifier: Apache-2.0 OR MIT
 */

pub mod api;
pub mod bootenv;
pub mod cli;
pub(crate) mod cmdutils;
pub mod config;
pub mod context;
pub mod errors;
pub mod fmri;
pub mod image;
pub mod linked;
pub mod manifest;
pub mod output;
pub mod paths;
pub mod plan;
pub mod planner;
pub(crate) mod progress;
pub mod varcet;
