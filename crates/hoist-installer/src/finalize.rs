//! Post-install finalization hooks.
//!
//! A package may name a hook module in its manifest (`"finalize"`). The module
//! is a JSON document:
//!
//! ```json
//! { "requires": ["./lib/util.json"], "defer": ["./lib/late.json"], "exec": ["./bin/setup"] }
//! ```
//!
//! `requires` are loaded when the hook module loads. `defer` entries are only
//! loaded when the hook is invoked, after the new package tree is in place, so
//! a package that forgot to ship one fails at that point with the loader's
//! own error.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use hoist_core::{PackageManifest, MODULES_DIR};
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::fs_utils::normalize_lexical;

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HookModule {
    #[serde(default)]
    pub requires: Vec<String>,
    #[serde(default)]
    pub defer: Vec<String>,
    #[serde(default)]
    pub exec: Vec<String>,
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("Cannot find module '{specifier}'")]
    ModuleNotFound { specifier: String },

    #[error("module '{specifier}' resolves outside of the package")]
    OutsidePackage { specifier: String },

    #[error("failed to read module {}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid hook module {}", path.display())]
    InvalidModule {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to start finalization command '{program}'")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    #[error("finalization command '{program}' failed with {status}")]
    CommandFailed { program: String, status: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinalizationStep {
    Load,
    Require,
    Invoke,
}

impl fmt::Display for FinalizationStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Load => "load",
            Self::Require => "require",
            Self::Invoke => "invoke",
        })
    }
}

/// A hook failure. Displays exactly as the underlying error so callers can
/// surface it without rewording.
#[derive(Debug)]
pub struct FinalizationError {
    pub step: FinalizationStep,
    pub error: HookError,
}

impl fmt::Display for FinalizationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for FinalizationError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        std::error::Error::source(&self.error)
    }
}

#[derive(Debug)]
pub struct FinalizationOutcome {
    pub succeeded: bool,
    pub error: Option<FinalizationError>,
}

impl FinalizationOutcome {
    fn success() -> Self {
        Self {
            succeeded: true,
            error: None,
        }
    }

    fn failure(error: FinalizationError) -> Self {
        Self {
            succeeded: false,
            error: Some(error),
        }
    }

    pub fn into_result(self) -> Result<(), FinalizationError> {
        match self.error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadedModule {
    pub path: PathBuf,
    pub contents: String,
}

/// Resolves and caches hook modules inside one package directory.
#[derive(Debug)]
pub struct ModuleLoader {
    package_dir: PathBuf,
    cache: HashMap<PathBuf, LoadedModule>,
}

impl ModuleLoader {
    pub fn new(package_dir: impl Into<PathBuf>) -> Self {
        Self {
            package_dir: normalize_lexical(&package_dir.into()),
            cache: HashMap::new(),
        }
    }

    /// Loads the hook module named in the manifest, relative to the package.
    pub fn load_entry(&mut self, relative: &str) -> Result<LoadedModule, HookError> {
        let base = self.package_dir.clone();
        self.load_from(&base, relative, relative)
    }

    /// Loads `specifier` as seen from the module in `from_dir`. Relative
    /// specifiers start with `./` or `../`; anything else is looked up in the
    /// package's own dependency directory.
    pub fn require(&mut self, from_dir: &Path, specifier: &str) -> Result<LoadedModule, HookError> {
        if specifier.starts_with("./") || specifier.starts_with("../") {
            self.load_from(from_dir, specifier, specifier)
        } else {
            let base = self.package_dir.join(MODULES_DIR);
            self.load_from(&base, specifier, specifier)
        }
    }

    fn load_from(
        &mut self,
        base: &Path,
        relative: &str,
        specifier: &str,
    ) -> Result<LoadedModule, HookError> {
        let requested = normalize_lexical(&base.join(relative));
        if !requested.starts_with(&self.package_dir) {
            return Err(HookError::OutsidePackage {
                specifier: specifier.to_string(),
            });
        }

        for candidate in module_candidates(&requested) {
            if let Some(module) = self.cache.get(&candidate) {
                return Ok(module.clone());
            }
            if !candidate.is_file() {
                continue;
            }
            let contents = fs::read_to_string(&candidate).map_err(|source| HookError::Read {
                path: candidate.clone(),
                source,
            })?;
            debug!(module = %candidate.display(), "loaded hook module");
            let module = LoadedModule {
                path: candidate.clone(),
                contents,
            };
            self.cache.insert(candidate, module.clone());
            return Ok(module);
        }

        Err(HookError::ModuleNotFound {
            specifier: specifier.to_string(),
        })
    }
}

/// Runs a package's finalization hook once, after its files are in place.
#[derive(Debug)]
pub struct FinalizationRunner {
    package_dir: PathBuf,
    manifest: PackageManifest,
}

impl FinalizationRunner {
    pub fn new(package_dir: impl Into<PathBuf>, manifest: PackageManifest) -> Self {
        Self {
            package_dir: package_dir.into(),
            manifest,
        }
    }

    pub fn run(self) -> FinalizationOutcome {
        match self.execute() {
            Ok(()) => FinalizationOutcome::success(),
            Err(error) => {
                warn!(
                    package = %self.manifest.name,
                    step = %error.step,
                    error = %error,
                    "finalization hook failed"
                );
                FinalizationOutcome::failure(error)
            }
        }
    }

    fn execute(&self) -> Result<(), FinalizationError> {
        let Some(entry) = self.manifest.finalize.as_deref() else {
            debug!(package = %self.manifest.name, "package declares no finalization hook");
            return Ok(());
        };

        let mut loader = ModuleLoader::new(&self.package_dir);
        let module = loader
            .load_entry(entry)
            .map_err(at_step(FinalizationStep::Load))?;
        let hook: HookModule = serde_json::from_str(&module.contents)
            .map_err(|source| HookError::InvalidModule {
                path: module.path.clone(),
                source,
            })
            .map_err(at_step(FinalizationStep::Load))?;
        let module_dir = module
            .path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.package_dir.clone());

        for specifier in &hook.requires {
            loader
                .require(&module_dir, specifier)
                .map_err(at_step(FinalizationStep::Require))?;
        }

        info!(package = %self.manifest.name, "running finalization hook");
        for specifier in &hook.defer {
            loader
                .require(&module_dir, specifier)
                .map_err(at_step(FinalizationStep::Invoke))?;
        }
        if let Some((program, args)) = hook.exec.split_first() {
            self.run_command(program, args)
                .map_err(at_step(FinalizationStep::Invoke))?;
        }
        Ok(())
    }

    fn run_command(&self, program: &str, args: &[String]) -> Result<(), HookError> {
        let executable = if program.starts_with("./") || program.starts_with("../") {
            self.package_dir.join(program)
        } else {
            PathBuf::from(program)
        };
        debug!(program = %executable.display(), ?args, "running finalization command");

        let status = Command::new(&executable)
            .args(args)
            .current_dir(&self.package_dir)
            .env("HOIST_PACKAGE_DIR", &self.package_dir)
            .env("HOIST_PACKAGE_NAME", &self.manifest.name)
            .env("HOIST_PACKAGE_VERSION", self.manifest.version.to_string())
            .status()
            .map_err(|source| HookError::Spawn {
                program: program.to_string(),
                source,
            })?;
        if !status.success() {
            return Err(HookError::CommandFailed {
                program: program.to_string(),
                status: status.to_string(),
            });
        }
        Ok(())
    }
}

fn at_step(step: FinalizationStep) -> impl Fn(HookError) -> FinalizationError {
    move |error| FinalizationError { step, error }
}

fn module_candidates(requested: &Path) -> [PathBuf; 3] {
    let mut with_extension = requested.as_os_str().to_os_string();
    with_extension.push(".json");
    [
        requested.to_path_buf(),
        PathBuf::from(with_extension),
        requested.join("index.json"),
    ]
}
