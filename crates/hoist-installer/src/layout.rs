use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hoist_core::MODULES_DIR;

/// Engine-private directory inside the module root.
pub const STATE_DIR: &str = ".hoist";

/// A global bin directory paired with the module root its entries point into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GlobalNamespace {
    bin_dir: PathBuf,
    module_root: PathBuf,
}

impl GlobalNamespace {
    pub fn new(bin_dir: impl Into<PathBuf>, module_root: impl Into<PathBuf>) -> Self {
        Self {
            bin_dir: bin_dir.into(),
            module_root: module_root.into(),
        }
    }

    /// Layout of a global prefix: `bin/` and `lib/node_modules/` on unix, the
    /// prefix itself and `node_modules/` on windows.
    pub fn for_prefix(prefix: impl AsRef<Path>) -> Self {
        let prefix = prefix.as_ref();
        if cfg!(windows) {
            Self::new(prefix, prefix.join(MODULES_DIR))
        } else {
            Self::new(prefix.join("bin"), prefix.join("lib").join(MODULES_DIR))
        }
    }

    pub fn bin_dir(&self) -> &Path {
        &self.bin_dir
    }

    pub fn module_root(&self) -> &Path {
        &self.module_root
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.module_root.clone(), |path, part| path.join(part))
    }

    pub fn state_dir(&self) -> PathBuf {
        self.module_root.join(STATE_DIR)
    }

    pub fn lock_path(&self) -> PathBuf {
        self.state_dir().join("lock")
    }

    pub fn staging_dir(&self) -> PathBuf {
        self.state_dir().join("staging")
    }

    pub fn trash_dir(&self) -> PathBuf {
        self.state_dir().join("trash")
    }

    pub fn active_marker_path(&self) -> PathBuf {
        self.state_dir().join("active")
    }

    pub fn ensure_base_dirs(&self) -> Result<()> {
        for dir in [
            self.bin_dir.clone(),
            self.module_root.clone(),
            self.state_dir(),
            self.staging_dir(),
            self.trash_dir(),
        ] {
            fs::create_dir_all(&dir)
                .with_context(|| format!("failed to create {}", dir.display()))?;
        }
        Ok(())
    }
}

pub fn default_user_prefix() -> Result<PathBuf> {
    if cfg!(windows) {
        let app_data = std::env::var("LOCALAPPDATA")
            .context("LOCALAPPDATA is not set; cannot resolve Windows user prefix")?;
        return Ok(PathBuf::from(app_data).join("Hoist"));
    }

    let home = std::env::var("HOME").context("HOME is not set; cannot resolve user prefix")?;
    Ok(PathBuf::from(home).join(".hoist"))
}
