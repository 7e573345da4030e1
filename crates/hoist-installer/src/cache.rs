use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hoist_security::verify_integrity;
use tracing::{debug, warn};

use crate::fs_utils::remove_file_if_exists;

/// Registry tarballs kept by name and version, reused only while their
/// integrity still checks out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TarballCache {
    root: PathBuf,
}

impl TarballCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tarball_path(&self, name: &str, version: &str) -> PathBuf {
        name.split('/')
            .fold(self.root.join("tarballs"), |path, part| path.join(part))
            .join(format!("{version}.tgz"))
    }

    pub fn load(&self, name: &str, version: &str, integrity: &str) -> Option<Vec<u8>> {
        let path = self.tarball_path(name, version);
        let bytes = fs::read(&path).ok()?;
        if let Err(err) = verify_integrity(&bytes, integrity) {
            warn!(path = %path.display(), error = %err, "discarding corrupt cached tarball");
            let _ = remove_file_if_exists(&path);
            return None;
        }
        debug!(path = %path.display(), "cache-hit");
        Some(bytes)
    }

    pub fn store(&self, name: &str, version: &str, bytes: &[u8]) -> Result<PathBuf> {
        let path = self.tarball_path(name, version);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create cache dir: {}", parent.display()))?;
        }
        let part_path = path.with_file_name(format!("{version}.tgz.part"));
        fs::write(&part_path, bytes)
            .with_context(|| format!("failed to write cache file: {}", part_path.display()))?;
        if let Err(err) = fs::rename(&part_path, &path) {
            let _ = remove_file_if_exists(&part_path);
            return Err(err).with_context(|| {
                format!("failed to move tarball into cache: {}", path.display())
            });
        }
        Ok(path)
    }
}
