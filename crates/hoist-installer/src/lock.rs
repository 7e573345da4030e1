use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::{debug, info};

use crate::layout::GlobalNamespace;

/// Exclusive hold on a namespace; released when dropped.
#[derive(Debug)]
pub struct NamespaceLock {
    file: File,
    path: PathBuf,
}

impl NamespaceLock {
    /// Blocks until no other process is mutating the namespace.
    pub fn acquire(namespace: &GlobalNamespace) -> Result<Self> {
        let (file, path) = open_lock_file(namespace)?;
        if file.try_lock_exclusive().is_err() {
            info!(
                lock = %path.display(),
                "another install is using this namespace; waiting"
            );
            file.lock_exclusive()
                .with_context(|| format!("failed to lock namespace: {}", path.display()))?;
        }
        debug!(lock = %path.display(), "namespace lock acquired");
        Ok(Self { file, path })
    }

    /// Returns `None` instead of waiting when the namespace is busy.
    pub fn try_acquire(namespace: &GlobalNamespace) -> Result<Option<Self>> {
        let (file, path) = open_lock_file(namespace)?;
        if file.try_lock_exclusive().is_err() {
            return Ok(None);
        }
        Ok(Some(Self { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for NamespaceLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

fn open_lock_file(namespace: &GlobalNamespace) -> Result<(File, PathBuf)> {
    let path = namespace.lock_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(&path)
        .with_context(|| format!("failed to open namespace lock: {}", path.display()))?;
    Ok((file, path))
}
