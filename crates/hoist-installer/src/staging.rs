use std::fs;
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use hoist_core::{unpack_tarball, PackageManifest};
use tracing::{debug, warn};

use crate::fs_utils::{remove_path_if_exists, unique_suffix};
use crate::layout::GlobalNamespace;
use crate::snapshot::read_sorted_entries;

/// A package tree unpacked next to the module root, not yet visible.
#[derive(Debug)]
pub struct StagedPackage {
    pub dir: PathBuf,
}

impl StagedPackage {
    pub fn discard(self) {
        if let Err(err) = remove_path_if_exists(&self.dir) {
            warn!(path = %self.dir.display(), error = %err, "failed to remove staged package");
        }
    }
}

pub fn stage_tarball(namespace: &GlobalNamespace, tarball: &[u8]) -> Result<StagedPackage> {
    let dir = namespace.staging_dir().join(unique_suffix());
    fs::create_dir_all(&dir).with_context(|| format!("failed to create {}", dir.display()))?;
    debug!(path = %dir.display(), bytes = tarball.len(), "unpacking package");

    let staged = StagedPackage { dir };
    if let Err(err) = unpack_tarball(tarball, &staged.dir) {
        staged.discard();
        return Err(err);
    }
    Ok(staged)
}

/// Loads the staged manifest and checks every declared command exists.
pub fn load_staged_manifest(staged: &StagedPackage) -> Result<PackageManifest> {
    let manifest = PackageManifest::load(&staged.dir)?;
    for (command, relative) in manifest.commands()? {
        let target = staged.dir.join(&relative);
        if !target.is_file() {
            return Err(anyhow!(
                "command '{command}' of {}@{} points at missing file '{relative}'",
                manifest.name,
                manifest.version
            ));
        }
    }
    Ok(manifest)
}

/// Removes leftovers of interrupted installs from staging and trash.
pub fn purge_leftovers(namespace: &GlobalNamespace) -> Result<usize> {
    let mut removed = 0;
    for dir in [namespace.staging_dir(), namespace.trash_dir()] {
        for entry in read_sorted_entries(&dir)?.unwrap_or_default() {
            let path = dir.join(entry);
            match remove_path_if_exists(&path) {
                Ok(()) => removed += 1,
                // A retired executable may still be running on windows.
                Err(err) => warn!(path = %path.display(), error = %err, "failed to purge leftover"),
            }
        }
    }
    if removed > 0 {
        debug!(removed, "purged leftovers of earlier installs");
    }
    Ok(removed)
}
