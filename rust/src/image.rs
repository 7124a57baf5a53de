//! A package-managed filesystem root.
//!
//! Everything private to the packaging system lives below `var/pkg`:
//! the image configuration, the installed package set, the catalog of
//! known packages, linked image metadata and staged plans.
// SPDX-License-Identifier: Apache-2.0 OR MIT

use crate::errors::LinkedError;
use crate::fmri::Fmri;
use crate::manifest::{Catalog, Manifest};
use crate::paths;
use crate::varcet::{Facets, Variants};
use anyhow::{Context, Result};
use camino::{Utf8Path, Utf8PathBuf};
use cap_std::fs::Dir;
use cap_std_ext::dirext::CapStdExtDirExt;
use fn_error_context::context;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_derive::Deserialize;
use std::collections::{BTreeMap, BTreeSet};
use std::io::BufReader;

/// The image-private directory, relative to the root.
pub const IMGDIR: &str = "var/pkg";
const CONFIG: &str = "image.json";
const INSTALLED: &str = "state/installed.json";
const CATALOG: &str = "state/catalog.json";
const LOCKFILE: &str = "lock";

/// A configured publisher; rank is the position in the publisher list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Publisher {
    pub name: String,
    #[serde(default = "default_true")]
    pub sticky: bool,
    #[serde(default)]
    pub disabled: bool,
}

fn default_true() -> bool {
    true
}

impl Publisher {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sticky: true,
            disabled: false,
        }
    }
}

/// Persistent per-image configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ImageConfig {
    #[serde(default)]
    pub publishers: Vec<Publisher>,
    #[serde(default)]
    pub variants: BTreeMap<String, String>,
    #[serde(default)]
    pub facets: BTreeMap<String, bool>,
    /// Package stem to the version it is held at.
    #[serde(default)]
    pub install_holds: BTreeMap<String, String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct InstalledState {
    packages: BTreeSet<Fmri>,
}

/// Read and parse a JSON file, returning `None` if it doesn't exist.
pub(crate) fn read_json_optional<T: DeserializeOwned>(d: &Dir, path: &str) -> Result<Option<T>> {
    let Some(f) = d.open_optional(path)? else {
        return Ok(None);
    };
    let v = serde_json::from_reader(BufReader::new(f)).with_context(|| format!("Parsing {path}"))?;
    Ok(Some(v))
}

/// Atomically replace a JSON file.
pub(crate) fn write_json<T: Serialize>(d: &Dir, path: &str, v: &T) -> Result<()> {
    let mut buf = serde_json::to_vec_pretty(v)?;
    buf.push(b'\n');
    d.atomic_write(path, buf)
        .with_context(|| format!("Writing {path}"))?;
    Ok(())
}

fn access_error(root: &Utf8Path, e: impl std::fmt::Display) -> anyhow::Error {
    LinkedError::ImageAccess {
        path: paths::dirpath(root.as_str()),
        reason: e.to_string(),
    }
    .into()
}

/// An opened image.
#[derive(Debug)]
pub struct Image {
    root: Utf8PathBuf,
    imgdir: Dir,
    pub cfg: ImageConfig,
    installed: BTreeSet<Fmri>,
    catalog: Catalog,
    lock: Option<cap_std::fs::File>,
}

impl Image {
    /// Returns true if `root` holds an image.
    pub fn exists(root: &Utf8Path) -> bool {
        root.join(IMGDIR).join(CONFIG).is_file()
    }

    /// Create a new image at `root`.
    #[context("Creating image at {root}")]
    pub fn create(root: &Utf8Path, cfg: ImageConfig) -> Result<Self> {
        let root = paths::normalize(root)?;
        if Self::exists(&root) {
            anyhow::bail!("An image already exists at {root}");
        }
        Facets::new(cfg.facets.clone(), BTreeMap::new())?;
        Variants::new(cfg.variants.clone(), BTreeMap::new())?;
        std::fs::create_dir_all(&root)?;
        let rootdir = Dir::open_ambient_dir(&root, cap_std::ambient_authority())?;
        rootdir.create_dir_all(IMGDIR)?;
        let imgdir = rootdir.open_dir(IMGDIR)?;
        imgdir.create_dir_all("state")?;
        write_json(&imgdir, CONFIG, &cfg)?;
        write_json(&imgdir, INSTALLED, &InstalledState::default())?;
        tracing::info!("Created image at {root}");
        Ok(Self {
            root,
            imgdir,
            cfg,
            installed: BTreeSet::new(),
            catalog: Catalog::default(),
            lock: None,
        })
    }

    /// Open an existing image.  Failures are reported as access errors.
    pub fn open(root: &Utf8Path) -> Result<Self> {
        let root = paths::normalize(root)?;
        let rootdir = Dir::open_ambient_dir(&root, cap_std::ambient_authority())
            .map_err(|e| access_error(&root, e))?;
        let imgdir = match rootdir.open_dir_optional(IMGDIR) {
            Ok(Some(d)) => d,
            Ok(None) => return Err(access_error(&root, "not an image")),
            Err(e) => return Err(access_error(&root, e)),
        };
        let cfg: ImageConfig = read_json_optional(&imgdir, CONFIG)
            .map_err(|e| access_error(&root, format!("{e:#}")))?
            .ok_or_else(|| access_error(&root, "missing image configuration"))?;
        let installed: InstalledState = read_json_optional(&imgdir, INSTALLED)
            .map_err(|e| access_error(&root, format!("{e:#}")))?
            .unwrap_or_default();
        let catalog: Catalog = read_json_optional(&imgdir, CATALOG)
            .map_err(|e| access_error(&root, format!("{e:#}")))?
            .unwrap_or_default();
        tracing::debug!(
            "Opened image {root}: {} installed, {} known",
            installed.packages.len(),
            catalog.packages.len()
        );
        Ok(Self {
            root,
            imgdir,
            cfg,
            installed: installed.packages,
            catalog,
            lock: None,
        })
    }

    /// Take the image lock.  The lock is held until the image is dropped.
    pub fn lock(&mut self) -> Result<()> {
        if self.lock.is_some() {
            return Ok(());
        }
        let f = self
            .imgdir
            .open_with(
                LOCKFILE,
                cap_std::fs::OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(false),
            )
            .context("Opening lock file")?;
        match rustix::fs::flock(&f, rustix::fs::FlockOperation::NonBlockingLockExclusive) {
            Ok(()) => {}
            Err(e) if e == rustix::io::Errno::WOULDBLOCK => {
                return Err(LinkedError::Locked {
                    path: self.root_str(),
                }
                .into())
            }
            Err(e) => return Err(anyhow::Error::new(e).context("Locking image")),
        }
        self.lock = Some(f);
        Ok(())
    }

    pub fn is_locked(&self) -> bool {
        self.lock.is_some()
    }

    pub fn root(&self) -> &Utf8Path {
        &self.root
    }

    /// The root as a directory string with a trailing `/`.
    pub fn root_str(&self) -> String {
        paths::dirpath(self.root.as_str())
    }

    pub fn imgdir(&self) -> &Dir {
        &self.imgdir
    }

    pub fn installed(&self) -> &BTreeSet<Fmri> {
        &self.installed
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// The installed package with this stem, if any.
    pub fn installed_stem(&self, stem: &str) -> Option<&Fmri> {
        self.installed.iter().find(|f| f.stem == stem)
    }

    /// Manifest of an installed or known package.  A package missing
    /// from the catalog is treated as having no dependencies.
    pub fn manifest(&self, fmri: &Fmri) -> Manifest {
        match self.catalog.get(fmri) {
            Some(m) => m.clone(),
            None => {
                tracing::debug!("No manifest for {fmri} in {}", self.root);
                Manifest {
                    fmri: fmri.clone(),
                    depends: Vec::new(),
                }
            }
        }
    }

    pub fn local_facets(&self) -> Result<Facets> {
        Facets::new(self.cfg.facets.clone(), BTreeMap::new())
    }

    pub fn local_variants(&self) -> Result<Variants> {
        Variants::new(self.cfg.variants.clone(), BTreeMap::new())
    }

    pub fn save_config(&self) -> Result<()> {
        write_json(&self.imgdir, CONFIG, &self.cfg)
    }

    /// Replace the installed package set on disk.
    pub fn set_installed(&mut self, installed: BTreeSet<Fmri>) -> Result<()> {
        let state = InstalledState {
            packages: installed,
        };
        write_json(&self.imgdir, INSTALLED, &state)?;
        self.installed = state.packages;
        Ok(())
    }

    pub fn set_catalog(&mut self, catalog: Catalog) -> Result<()> {
        write_json(&self.imgdir, CATALOG, &catalog)?;
        self.catalog = catalog;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn utf8_tempdir() -> Result<(tempfile::TempDir, Utf8PathBuf)> {
        let td = tempfile::tempdir()?;
        let p = Utf8PathBuf::try_from(td.path().to_path_buf())?;
        let p = paths::normalize(&p)?;
        Ok((td, p))
    }

    #[test]
    fn create_and_open() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let root = base.join("img");
        assert!(!Image::exists(&root));
        let mut cfg = ImageConfig::default();
        cfg.publishers.push(Publisher::new("test"));
        cfg.facets.insert("facet.doc".into(), false);
        Image::create(&root, cfg.clone())?;
        assert!(Image::exists(&root));
        assert!(Image::create(&root, cfg.clone()).is_err());
        let mut img = Image::open(&root)?;
        assert_eq!(img.cfg, cfg);
        assert_eq!(img.root_str(), format!("{root}/"));
        assert!(img.installed().is_empty());
        let foo: Fmri = "pkg://test/foo@1.0".parse()?;
        img.set_installed([foo.clone()].into())?;
        let img = Image::open(&root)?;
        assert_eq!(img.installed_stem("foo"), Some(&foo));
        assert!(img.manifest(&foo).depends.is_empty());
        assert_eq!(img.local_facets()?.get("facet.doc"), Some(&false));
        Ok(())
    }

    #[test]
    fn bad_facet_rejected() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let mut cfg = ImageConfig::default();
        cfg.facets.insert("doc".into(), false);
        assert!(Image::create(&base.join("img"), cfg).is_err());
        Ok(())
    }

    #[test]
    fn open_missing() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let e = Image::open(&base.join("nope")).unwrap_err();
        assert_eq!(
            crate::errors::exit_status_of(&e),
            crate::errors::ExitStatus::EAccess
        );
        std::fs::create_dir(base.join("empty"))?;
        let e = Image::open(&base.join("empty")).unwrap_err();
        assert!(format!("{e:#}").contains("not an image"));
        Ok(())
    }

    #[test]
    fn locking() -> Result<()> {
        let (_td, base) = utf8_tempdir()?;
        let root = base.join("img");
        Image::create(&root, ImageConfig::default())?;
        let mut a = Image::open(&root)?;
        let mut b = Image::open(&root)?;
        a.lock()?;
        assert!(a.is_locked());
        let e = b.lock().unwrap_err();
        assert_eq!(
            crate::errors::exit_status_of(&e),
            crate::errors::ExitStatus::Locked
        );
        drop(a);
        b.lock()?;
        Ok(())
    }
}
