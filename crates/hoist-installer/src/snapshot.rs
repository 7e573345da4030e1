use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use hoist_core::MODULES_DIR;

use crate::layout::GlobalNamespace;

/// Bin directory names that never count as command entries.
pub const IGNORED_BIN_ENTRIES: &[&str] = &[".hoistrc", ".npmrc", MODULES_DIR];

/// Prefix of the temporary names used while an entry is being replaced.
pub(crate) const TEMP_ENTRY_PREFIX: &str = ".hoist-tmp-";

/// Observable state of one package in a namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackageSnapshot {
    pub package: String,
    pub root_path: PathBuf,
    /// Sorted bin directory entries, or `None` if the directory is missing.
    pub bin_entries: Option<Vec<String>>,
    /// Sorted top-level entries of the package directory, or `None` if absent.
    pub module_dir_entries: Option<Vec<String>>,
    /// Whether the package carries its own dependency tree.
    pub embedded_modules: bool,
}

impl PackageSnapshot {
    pub fn is_installed(&self) -> bool {
        self.module_dir_entries.is_some()
    }
}

pub fn snapshot(namespace: &GlobalNamespace, package: &str) -> Result<PackageSnapshot> {
    let root_path = namespace.package_dir(package);
    let bin_entries = read_sorted_entries(namespace.bin_dir())?.map(|entries| {
        entries
            .into_iter()
            .filter(|entry| is_command_entry(entry))
            .collect()
    });
    let module_dir_entries = read_sorted_entries(&root_path)?;
    let embedded_modules = module_dir_entries
        .as_ref()
        .is_some_and(|entries| entries.iter().any(|entry| entry == MODULES_DIR));

    Ok(PackageSnapshot {
        package: package.to_string(),
        root_path,
        bin_entries,
        module_dir_entries,
        embedded_modules,
    })
}

/// Package names present under the module root, scoped ones as `@scope/name`.
pub fn installed_packages(namespace: &GlobalNamespace) -> Result<Vec<String>> {
    let Some(entries) = read_sorted_entries(namespace.module_root())? else {
        return Ok(Vec::new());
    };

    let mut packages = Vec::new();
    for entry in entries.into_iter().filter(|entry| !entry.starts_with('.')) {
        if entry.starts_with('@') {
            let scope_dir = namespace.module_root().join(&entry);
            for scoped in read_sorted_entries(&scope_dir)?.unwrap_or_default() {
                if !scoped.starts_with('.') {
                    packages.push(format!("{entry}/{scoped}"));
                }
            }
        } else {
            packages.push(entry);
        }
    }
    Ok(packages)
}

pub(crate) fn is_command_entry(name: &str) -> bool {
    !IGNORED_BIN_ENTRIES.contains(&name) && !name.starts_with(TEMP_ENTRY_PREFIX)
}

pub(crate) fn read_sorted_entries(dir: &Path) -> Result<Option<Vec<String>>> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| format!("failed to read {}", dir.display()));
        }
    };

    let mut entries = Vec::new();
    for entry in read_dir {
        let entry = entry.with_context(|| format!("failed to iterate {}", dir.display()))?;
        entries.push(entry.file_name().to_string_lossy().into_owned());
    }
    entries.sort();
    Ok(Some(entries))
}
