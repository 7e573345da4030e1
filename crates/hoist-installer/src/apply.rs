use std::collections::BTreeSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hoist_core::PackageManifest;
use hoist_registry::{RegistrySource, VersionSelector};
use hoist_security::verify_integrity;
use tracing::{debug, info, warn};

use crate::cache::TarballCache;
use crate::error::{InstallError, InstallFailure, InstallStep, StepContext};
use crate::exposure::relink_package;
use crate::finalize::FinalizationRunner;
use crate::layout::GlobalNamespace;
use crate::lock::NamespaceLock;
use crate::marker::{
    clear_active_operation, read_active_operation, set_active_operation, update_active_phase,
    ActiveOperation, OperationPhase,
};
use crate::staging::{load_staged_manifest, purge_leftovers, stage_tarball};
use crate::swap::{
    discard_retired, restore_running_executable, retire_running_executable, swap_into_place,
    SwapOutcome,
};
use crate::verify::relink_installed;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstallSource {
    Tarball(PathBuf),
    Registry {
        name: String,
        selector: VersionSelector,
    },
}

impl InstallSource {
    /// A tarball path, or `name`, `name@version`, `name@tag` (scoped names
    /// keep their leading `@`).
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Err(anyhow!("install source must not be empty"));
        }
        let looks_like_tarball = input.ends_with(".tgz") || input.ends_with(".tar.gz");
        if looks_like_tarball || Path::new(input).is_file() {
            return Ok(Self::Tarball(PathBuf::from(input)));
        }

        let split_at = match input.strip_prefix('@') {
            Some(scoped) => scoped.find('@').map(|index| index + 1),
            None => input.find('@'),
        };
        let (name, selector) = match split_at {
            Some(index) => (&input[..index], &input[index + 1..]),
            None => (input, ""),
        };
        if name.is_empty() {
            return Err(anyhow!("install source is missing a package name: {input}"));
        }
        Ok(Self::Registry {
            name: name.to_string(),
            selector: VersionSelector::parse(selector)
                .with_context(|| format!("invalid install source '{input}'"))?,
        })
    }
}

impl fmt::Display for InstallSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tarball(path) => write!(f, "{}", path.display()),
            Self::Registry { name, selector } => write!(f, "{name}@{selector}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstallMode {
    Fresh,
    Replace,
    /// The package being replaced contains the running executable.
    SelfReplace,
}

impl InstallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Fresh => "fresh",
            Self::Replace => "replace",
            Self::SelfReplace => "self-replace",
        }
    }
}

impl fmt::Display for InstallMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One install into one namespace.
#[derive(Debug, Clone)]
pub struct InstallOperation {
    pub source: InstallSource,
    pub namespace: GlobalNamespace,
    pub running_executable: Option<PathBuf>,
    pub cache: Option<TarballCache>,
}

impl InstallOperation {
    pub fn new(source: InstallSource, namespace: GlobalNamespace) -> Self {
        let running_executable = std::env::current_exe()
            .ok()
            .and_then(|path| fs::canonicalize(path).ok());
        Self {
            source,
            namespace,
            running_executable,
            cache: None,
        }
    }

    pub fn with_running_executable(mut self, executable: Option<PathBuf>) -> Self {
        self.running_executable = executable;
        self
    }

    pub fn with_cache(mut self, cache: TarballCache) -> Self {
        self.cache = Some(cache);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplyReport {
    pub manifest: PackageManifest,
    pub mode: InstallMode,
    pub package_dir: PathBuf,
    pub linked_commands: Vec<String>,
    pub removed_commands: Vec<String>,
    /// An interrupted earlier install that this one healed.
    pub recovered: Option<ActiveOperation>,
}

impl ApplyReport {
    pub fn name(&self) -> &str {
        &self.manifest.name
    }

    pub fn version(&self) -> String {
        self.manifest.version.to_string()
    }
}

/// Applies the operation and then runs the package's finalization hook. The
/// namespace lock is released before the hook runs.
pub fn install(
    operation: InstallOperation,
    registry: &dyn RegistrySource,
) -> Result<ApplyReport, InstallError> {
    let report = apply(operation, registry)?;
    let outcome = FinalizationRunner::new(&report.package_dir, report.manifest.clone()).run();
    match outcome.into_result() {
        Ok(()) => Ok(report),
        Err(error) => Err(InstallError::Finalization {
            report: Box::new(report),
            error,
        }),
    }
}

/// Makes the package at the operation's source the one installed in the
/// namespace: module tree first, then bin entries.
pub fn apply(
    operation: InstallOperation,
    registry: &dyn RegistrySource,
) -> Result<ApplyReport, InstallFailure> {
    let InstallOperation {
        source,
        namespace,
        running_executable,
        cache,
    } = operation;

    namespace.ensure_base_dirs().at_step(InstallStep::Lock)?;
    let _lock = NamespaceLock::acquire(&namespace).at_step(InstallStep::Lock)?;
    let recovered = match read_active_operation(&namespace) {
        Ok(recovered) => recovered,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "discarding unreadable active install marker");
            None
        }
    };
    if let Some(interrupted) = &recovered {
        warn!(%interrupted, "previous install was interrupted; repairing");
    }
    // Unparsable markers go too: the claim below refuses any existing file.
    clear_active_operation(&namespace).at_step(InstallStep::Lock)?;
    purge_leftovers(&namespace).at_step(InstallStep::Lock)?;

    let (tarball, expected) = fetch_source(&source, registry, cache.as_ref())?;
    let staged = stage_tarball(&namespace, &tarball).at_step(InstallStep::Extract)?;
    let manifest = match load_staged_manifest(&staged).and_then(|manifest| {
        check_expected(&manifest, expected.as_ref())?;
        Ok(manifest)
    }) {
        Ok(manifest) => manifest,
        Err(cause) => {
            staged.discard();
            return Err(InstallFailure::new(InstallStep::Manifest, cause));
        }
    };
    let commands = match manifest.commands() {
        Ok(commands) => commands,
        Err(cause) => {
            staged.discard();
            return Err(InstallFailure::new(InstallStep::Manifest, cause));
        }
    };

    let package_dir = namespace.package_dir(&manifest.name);
    let previous = installed_manifest(&package_dir);
    let previous_commands = previous
        .as_ref()
        .and_then(|previous| previous.commands().ok())
        .map(|commands| commands.into_keys().collect::<BTreeSet<_>>())
        .unwrap_or_default();
    let mode = detect_mode(&package_dir, running_executable.as_deref());
    info!(
        package = %manifest.name,
        version = %manifest.version,
        %mode,
        "installing package"
    );

    let mut active = ActiveOperation::new(&manifest.name, &manifest.version.to_string());
    if let Err(cause) = set_active_operation(&namespace, &active) {
        staged.discard();
        return Err(InstallFailure::new(InstallStep::Swap, cause));
    }

    let mut retired_executable = None;
    if mode == InstallMode::SelfReplace && cfg!(windows) {
        if let Some(executable) = running_executable.as_deref() {
            match retire_running_executable(executable, &namespace.trash_dir()) {
                Ok(retired) => {
                    retired_executable =
                        retired.map(|retired| (retired, executable.to_path_buf()));
                }
                Err(cause) => {
                    staged.discard();
                    let _ = clear_active_operation(&namespace);
                    return Err(InstallFailure::new(InstallStep::Swap, cause));
                }
            }
        }
    }

    let swapped = match swap_into_place(&staged.dir, &package_dir, &namespace.trash_dir()) {
        Ok(swapped) => swapped,
        Err(cause) => {
            if let Some((retired, executable)) = &retired_executable {
                if let Err(err) = restore_running_executable(retired, executable) {
                    warn!(
                        retired = %retired.display(),
                        error = %format!("{err:#}"),
                        "failed to restore running executable"
                    );
                }
            }
            staged.discard();
            let _ = clear_active_operation(&namespace);
            return Err(InstallFailure::new(InstallStep::Swap, cause));
        }
    };
    if let SwapOutcome::Replaced { retired } = &swapped {
        discard_retired(retired);
    }

    update_active_phase(&namespace, &mut active, OperationPhase::Linking)
        .at_step(InstallStep::Link)?;
    let links = relink_package(&namespace, &package_dir, &commands, &previous_commands)
        .at_step(InstallStep::Link)?;
    clear_active_operation(&namespace).at_step(InstallStep::Link)?;

    if let Some(interrupted) = recovered.as_ref().filter(|op| op.package != manifest.name) {
        if let Err(err) = relink_installed(&namespace, &interrupted.package) {
            warn!(
                package = %interrupted.package,
                error = %format!("{err:#}"),
                "failed to relink package of interrupted install; run `hoist doctor --fix`"
            );
        }
    }

    info!(
        package = %manifest.name,
        version = %manifest.version,
        linked = links.linked.len(),
        removed = links.removed.len(),
        "package installed"
    );
    Ok(ApplyReport {
        manifest,
        mode,
        package_dir,
        linked_commands: links.linked,
        removed_commands: links.removed,
        recovered,
    })
}

fn fetch_source(
    source: &InstallSource,
    registry: &dyn RegistrySource,
    cache: Option<&TarballCache>,
) -> Result<(Vec<u8>, Option<(String, String)>), InstallFailure> {
    match source {
        InstallSource::Tarball(path) => {
            debug!(path = %path.display(), "reading local tarball");
            let bytes = fs::read(path)
                .with_context(|| format!("failed to read tarball: {}", path.display()))
                .at_step(InstallStep::Fetch)?;
            Ok((bytes, None))
        }
        InstallSource::Registry { name, selector } => {
            let packument = registry.fetch_packument(name).at_step(InstallStep::Fetch)?;
            let selected = packument.select(selector).at_step(InstallStep::Fetch)?;
            let version = selected.manifest.version.to_string();
            let expected = Some((name.clone(), version.clone()));
            let integrity = selected.dist.integrity.as_deref();

            if let (Some(cache), Some(integrity)) = (cache, integrity) {
                if let Some(bytes) = cache.load(name, &version, integrity) {
                    return Ok((bytes, expected));
                }
            }

            let bytes = registry
                .fetch_tarball(&selected.dist)
                .at_step(InstallStep::Fetch)?;
            match integrity {
                Some(integrity) => verify_integrity(&bytes, integrity)
                    .with_context(|| format!("tarball for {name}@{version} failed verification"))
                    .at_step(InstallStep::Verify)?,
                None => warn!(package = %name, %version, "registry published no integrity; skipping verification"),
            }

            if let Some(cache) = cache {
                if let Err(err) = cache.store(name, &version, &bytes) {
                    warn!(error = %err, "failed to cache tarball");
                }
            }
            Ok((bytes, expected))
        }
    }
}

fn check_expected(manifest: &PackageManifest, expected: Option<&(String, String)>) -> Result<()> {
    let Some((name, version)) = expected else {
        return Ok(());
    };
    let actual_version = manifest.version.to_string();
    if &manifest.name != name || &actual_version != version {
        return Err(anyhow!(
            "tarball contains {}@{} but registry advertised {name}@{version}",
            manifest.name,
            actual_version
        ));
    }
    Ok(())
}

fn installed_manifest(package_dir: &Path) -> Option<PackageManifest> {
    if !package_dir.exists() {
        return None;
    }
    match PackageManifest::load(package_dir) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(
                path = %package_dir.display(),
                error = %format!("{err:#}"),
                "installed package has an unreadable manifest"
            );
            None
        }
    }
}

fn detect_mode(package_dir: &Path, running_executable: Option<&Path>) -> InstallMode {
    let Ok(installed) = fs::canonicalize(package_dir) else {
        return InstallMode::Fresh;
    };
    let running_inside = running_executable.is_some_and(|executable| {
        fs::canonicalize(executable)
            .unwrap_or_else(|_| executable.to_path_buf())
            .starts_with(&installed)
    });
    if running_inside {
        InstallMode::SelfReplace
    } else {
        InstallMode::Replace
    }
}
