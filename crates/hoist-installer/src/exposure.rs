use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use tracing::{debug, warn};

use crate::fs_utils::{normalize_lexical, remove_file_if_exists, unique_suffix};
use crate::layout::GlobalNamespace;
use crate::snapshot::{is_command_entry, read_sorted_entries, TEMP_ENTRY_PREFIX};

const WINDOWS_SHIM_EXTENSIONS: &[&str] = &["cmd", "ps1"];

/// Commands the relink pass created and removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LinkReport {
    pub linked: Vec<String>,
    pub removed: Vec<String>,
}

/// Primary entry for a command: the link itself on unix, the `.cmd` shim on
/// windows.
pub fn bin_path(namespace: &GlobalNamespace, command: &str) -> PathBuf {
    let mut file_name = command.to_string();
    if cfg!(windows) {
        file_name.push_str(".cmd");
    }
    namespace.bin_dir().join(file_name)
}

/// Every file that makes up a command's entry.
pub fn bin_entry_paths(namespace: &GlobalNamespace, command: &str) -> Vec<PathBuf> {
    let mut paths = vec![namespace.bin_dir().join(command)];
    if cfg!(windows) {
        paths.extend(
            WINDOWS_SHIM_EXTENSIONS
                .iter()
                .map(|extension| namespace.bin_dir().join(format!("{command}.{extension}"))),
        );
    }
    paths
}

/// Points `command` at `package_dir/relative`, replacing any existing entry
/// without a window where the command is missing.
pub fn expose_command(
    namespace: &GlobalNamespace,
    package_dir: &Path,
    command: &str,
    relative: &str,
) -> Result<()> {
    let source_path = package_dir.join(relative);
    if !source_path.is_file() {
        return Err(anyhow!(
            "declared command path '{}' was not found in package: {}",
            relative,
            source_path.display()
        ));
    }
    make_executable(&source_path)?;

    fs::create_dir_all(namespace.bin_dir())
        .with_context(|| format!("failed to create {}", namespace.bin_dir().display()))?;
    create_command_entry(namespace, command, &source_path)
}

pub fn remove_exposed_command(namespace: &GlobalNamespace, command: &str) -> Result<bool> {
    let mut removed = false;
    for path in bin_entry_paths(namespace, command) {
        if fs::symlink_metadata(&path).is_err() {
            continue;
        }
        remove_file_if_exists(&path)
            .with_context(|| format!("failed to remove command entry: {}", path.display()))?;
        removed = true;
    }
    Ok(removed)
}

/// Where an entry created by [`expose_command`] points, if it is one.
pub fn entry_target(namespace: &GlobalNamespace, entry: &Path) -> Option<PathBuf> {
    let metadata = fs::symlink_metadata(entry).ok()?;
    if metadata.file_type().is_symlink() {
        let target = fs::read_link(entry).ok()?;
        return Some(normalize_lexical(&namespace.bin_dir().join(target)));
    }

    let is_cmd_shim = entry
        .extension()
        .is_some_and(|extension| extension.eq_ignore_ascii_case("cmd"));
    if metadata.is_file() && is_cmd_shim {
        let raw = fs::read_to_string(entry).ok()?;
        return parse_cmd_shim_target(&raw);
    }
    None
}

/// Commands in the bin directory whose entries point into `package_dir`.
pub fn commands_targeting(
    namespace: &GlobalNamespace,
    package_dir: &Path,
) -> Result<BTreeSet<String>> {
    let package_dir = normalize_lexical(package_dir);
    let mut commands = BTreeSet::new();
    for (command, entry) in command_entries(namespace)? {
        if entry_target(namespace, &entry).is_some_and(|target| target.starts_with(&package_dir)) {
            commands.insert(command);
        }
    }
    Ok(commands)
}

/// Command names with their primary entry path, for every entry this engine
/// could have created.
pub fn command_entries(namespace: &GlobalNamespace) -> Result<BTreeMap<String, PathBuf>> {
    let mut entries = BTreeMap::new();
    for name in read_sorted_entries(namespace.bin_dir())?.unwrap_or_default() {
        if !is_command_entry(&name) {
            continue;
        }
        let path = namespace.bin_dir().join(&name);
        if cfg!(windows) {
            if let Some(command) = name.strip_suffix(".cmd") {
                entries.insert(command.to_string(), path);
            }
        } else if fs::symlink_metadata(&path).is_ok_and(|metadata| metadata.file_type().is_symlink())
        {
            entries.insert(name, path);
        }
    }
    Ok(entries)
}

/// Makes the bin directory reflect exactly `commands` for the package at
/// `package_dir`: declared commands are (re)linked, and commands that were
/// declared before or still point into the package are removed.
pub fn relink_package(
    namespace: &GlobalNamespace,
    package_dir: &Path,
    commands: &BTreeMap<String, String>,
    previous: &BTreeSet<String>,
) -> Result<LinkReport> {
    let mut report = LinkReport::default();
    let package_root = normalize_lexical(package_dir);

    let mut stale = commands_targeting(namespace, package_dir)?;
    for command in previous {
        let owned_elsewhere = entry_target(namespace, &bin_path(namespace, command))
            .is_some_and(|target| !target.starts_with(&package_root));
        if owned_elsewhere {
            debug!(command = %command, "leaving command entry owned by another package");
        } else {
            stale.insert(command.clone());
        }
    }
    for command in stale.iter().filter(|command| !commands.contains_key(*command)) {
        if remove_exposed_command(namespace, command)? {
            debug!(command = %command, "removed command entry");
            report.removed.push(command.clone());
        }
    }

    for (command, relative) in commands {
        if let Some(owner) = bin_entry_paths(namespace, command)
            .iter()
            .find_map(|entry| entry_target(namespace, entry))
            .filter(|target| !target.starts_with(&package_root))
        {
            warn!(
                command = %command,
                previous = %owner.display(),
                "taking over command entry that pointed elsewhere"
            );
        }
        expose_command(namespace, package_dir, command, relative)?;
        report.linked.push(command.clone());
    }

    Ok(report)
}

fn temp_entry_path(namespace: &GlobalNamespace, file_name: &str) -> PathBuf {
    namespace
        .bin_dir()
        .join(format!("{TEMP_ENTRY_PREFIX}{file_name}-{}", unique_suffix()))
}

fn create_command_entry(namespace: &GlobalNamespace, command: &str, source_path: &Path) -> Result<()> {
    #[cfg(unix)]
    {
        let destination = namespace.bin_dir().join(command);
        let temp = temp_entry_path(namespace, command);
        std::os::unix::fs::symlink(source_path, &temp).with_context(|| {
            format!(
                "failed to create symlink {} -> {}",
                temp.display(),
                source_path.display()
            )
        })?;
        replace_entry(&temp, &destination)
    }

    #[cfg(windows)]
    {
        let target = source_path.display();
        let shims = [
            (
                command.to_string(),
                format!("#!/bin/sh\nexec \"{target}\" \"$@\"\n"),
            ),
            (
                format!("{command}.cmd"),
                format!("@echo off\r\n\"{target}\" %*\r\n"),
            ),
            (
                format!("{command}.ps1"),
                format!("#!/usr/bin/env pwsh\n& \"{target}\" $args\nexit $LASTEXITCODE\n"),
            ),
        ];
        for (file_name, body) in shims {
            let destination = namespace.bin_dir().join(&file_name);
            let temp = temp_entry_path(namespace, &file_name);
            fs::write(&temp, body.as_bytes())
                .with_context(|| format!("failed to write shim: {}", temp.display()))?;
            replace_entry(&temp, &destination)?;
        }
        Ok(())
    }
}

fn replace_entry(temp: &Path, destination: &Path) -> Result<()> {
    if let Err(err) = fs::rename(temp, destination) {
        let _ = remove_file_if_exists(temp);
        return Err(err).with_context(|| {
            format!(
                "failed to replace command entry: {}",
                destination.display()
            )
        });
    }
    Ok(())
}

fn parse_cmd_shim_target(raw: &str) -> Option<PathBuf> {
    raw.lines()
        .map(str::trim)
        .find(|line| line.ends_with("%*"))
        .and_then(|line| {
            let rest = line.strip_prefix('"')?;
            let (target, _) = rest.split_once('"')?;
            Some(PathBuf::from(target))
        })
}

#[cfg(unix)]
fn make_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)
        .with_context(|| format!("failed to inspect command target: {}", path.display()))?;
    let mut permissions = metadata.permissions();
    let mode = permissions.mode();
    if mode & 0o111 == 0o111 {
        return Ok(());
    }
    permissions.set_mode(mode | 0o111);
    fs::set_permissions(path, permissions)
        .with_context(|| format!("failed to mark command executable: {}", path.display()))
}

#[cfg(not(unix))]
fn make_executable(_path: &Path) -> Result<()> {
    Ok(())
}
