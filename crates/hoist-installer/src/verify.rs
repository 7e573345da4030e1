use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;

use anyhow::Result;
use hoist_core::PackageManifest;
use tracing::{debug, warn};

use crate::exposure::{
    bin_path, command_entries, entry_target, relink_package, remove_exposed_command, LinkReport,
};
use crate::fs_utils::normalize_lexical;
use crate::layout::GlobalNamespace;
use crate::lock::NamespaceLock;
use crate::marker::{clear_active_operation, read_active_operation, ActiveOperation};
use crate::snapshot::installed_packages;
use crate::staging::purge_leftovers;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamespaceProblem {
    /// A bin entry whose target no longer exists.
    DanglingEntry {
        command: String,
        entry: PathBuf,
        target: PathBuf,
    },
    /// A declared command with no entry pointing at its file.
    MissingCommand { package: String, command: String },
    UnreadableManifest { package: String, detail: String },
    InterruptedInstall(ActiveOperation),
    /// An `active` marker that cannot be parsed, e.g. after a crash while it
    /// was being written.
    UnreadableMarker { detail: String },
}

impl fmt::Display for NamespaceProblem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::DanglingEntry {
                command,
                entry,
                target,
            } => write!(
                f,
                "command '{command}' ({}) points at missing {}",
                entry.display(),
                target.display()
            ),
            Self::MissingCommand { package, command } => {
                write!(f, "package '{package}' declares command '{command}' but it is not linked")
            }
            Self::UnreadableManifest { package, detail } => {
                write!(f, "package '{package}' has an unreadable manifest: {detail}")
            }
            Self::InterruptedInstall(operation) => {
                write!(f, "an install was interrupted: {operation}")
            }
            Self::UnreadableMarker { detail } => {
                write!(f, "the active install marker is unreadable: {detail}")
            }
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RepairReport {
    pub cleared_marker: Option<ActiveOperation>,
    pub relinked_packages: Vec<String>,
    pub removed_commands: Vec<String>,
}

/// Checks that every bin entry resolves and every declared command is linked.
pub fn verify_namespace(namespace: &GlobalNamespace) -> Result<Vec<NamespaceProblem>> {
    let mut problems = Vec::new();

    match read_active_operation(namespace) {
        Ok(Some(operation)) => problems.push(NamespaceProblem::InterruptedInstall(operation)),
        Ok(None) => {}
        Err(err) => problems.push(NamespaceProblem::UnreadableMarker {
            detail: format!("{err:#}"),
        }),
    }

    for (command, entry) in command_entries(namespace)? {
        if let Some(target) = entry_target(namespace, &entry) {
            if !target.exists() {
                problems.push(NamespaceProblem::DanglingEntry {
                    command,
                    entry,
                    target,
                });
            }
        }
    }

    for package in installed_packages(namespace)? {
        let package_dir = namespace.package_dir(&package);
        let commands = match PackageManifest::load(&package_dir).and_then(|m| m.commands()) {
            Ok(commands) => commands,
            Err(err) => {
                problems.push(NamespaceProblem::UnreadableManifest {
                    package,
                    detail: format!("{err:#}"),
                });
                continue;
            }
        };
        for (command, relative) in commands {
            let expected = normalize_lexical(&package_dir.join(&relative));
            let linked = entry_target(namespace, &bin_path(namespace, &command))
                .is_some_and(|target| normalize_lexical(&target) == expected);
            if !linked {
                problems.push(NamespaceProblem::MissingCommand {
                    package: package.clone(),
                    command,
                });
            }
        }
    }

    Ok(problems)
}

/// Re-runs the link pass for one installed package.
pub fn relink_installed(namespace: &GlobalNamespace, package: &str) -> Result<LinkReport> {
    let package_dir = namespace.package_dir(package);
    if !package_dir.exists() {
        return relink_package(namespace, &package_dir, &Default::default(), &BTreeSet::new());
    }
    let manifest = PackageManifest::load(&package_dir)?;
    relink_package(namespace, &package_dir, &manifest.commands()?, &BTreeSet::new())
}

/// Brings the namespace back to a consistent state after an interrupted
/// install: clears the marker, purges leftovers, relinks every package and
/// drops dangling entries.
pub fn repair_namespace(namespace: &GlobalNamespace) -> Result<RepairReport> {
    namespace.ensure_base_dirs()?;
    let _lock = NamespaceLock::acquire(namespace)?;
    let mut report = RepairReport::default();

    report.cleared_marker = read_active_operation(namespace).unwrap_or_else(|err| {
        warn!(error = %err, "discarding unreadable active install marker");
        None
    });
    clear_active_operation(namespace)?;
    purge_leftovers(namespace)?;

    for package in installed_packages(namespace)? {
        match relink_installed(namespace, &package) {
            Ok(links) => {
                report.removed_commands.extend(links.removed);
                report.relinked_packages.push(package);
            }
            Err(err) => warn!(
                package = %package,
                error = %format!("{err:#}"),
                "skipping package with unreadable manifest"
            ),
        }
    }

    for (command, entry) in command_entries(namespace)? {
        let dangling = entry_target(namespace, &entry).is_some_and(|target| !target.exists());
        if dangling && remove_exposed_command(namespace, &command)? {
            debug!(command = %command, "removed dangling command entry");
            report.removed_commands.push(command);
        }
    }

    Ok(report)
}
