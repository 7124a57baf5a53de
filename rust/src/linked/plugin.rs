//! Per-kind handling of child registration.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use super::name::{LinkedImageName, LinkedKind};
use super::props::LinkedProps;
use crate::image::Image;
use crate::paths::PathTransform;
use anyhow::Result;

/// Each linked image kind knows where its children are recorded and how
/// to reconstruct paths when an image has been moved.
pub trait LinkedPlugin: std::fmt::Debug + Send + Sync {
    fn kind(&self) -> LinkedKind;

    /// Whether children of this kind may be attached by the user.
    fn support_attach(&self) -> bool;

    /// Whether children of this kind may be detached by the user.
    fn support_detach(&self) -> bool;

    /// Default for the recurse property of new children.
    fn default_recurse(&self) -> bool;

    /// Best-effort guess at how the image has been moved, used when the
    /// image has no record of its own path.
    fn guess_path_transform(&self, img: &Image) -> Result<PathTransform>;

    /// Registered children with their recorded paths.
    fn children(&self) -> Vec<(LinkedImageName, String)>;

    fn child_props(&self, name: &LinkedImageName) -> Option<LinkedProps>;

    /// Register a child in memory; nothing is written until [`Self::save`].
    fn attach_child(&mut self, props: LinkedProps);

    fn detach_child(&mut self, name: &LinkedImageName) -> Option<LinkedProps>;

    /// Update properties of an already registered child.
    fn update_child(&mut self, props: LinkedProps) {
        self.attach_child(props)
    }

    fn save(&self, img: &Image) -> Result<()>;

    /// Adjust the properties a child stores about itself.
    fn munge_child_props(&self, _props: &mut LinkedProps) {}
}

/// Load every plugin for an image.
pub fn load_plugins(img: &Image) -> Result<Vec<Box<dyn LinkedPlugin>>> {
    Ok(vec![
        Box::new(super::system::SystemPlugin::load(img)),
        Box::new(super::sandbox::SandboxPlugin::load(img)?),
    ])
}
