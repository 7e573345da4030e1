use std::env;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::layout::GlobalNamespace;

/// Where command lookups search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SearchContext {
    /// The process `PATH`.
    Ambient,
    /// An explicit ordered directory list.
    Dirs(Vec<PathBuf>),
}

impl SearchContext {
    /// The namespace bin directory first, then the ambient `PATH`.
    pub fn namespace_first(namespace: &GlobalNamespace) -> Self {
        let mut dirs = vec![namespace.bin_dir().to_path_buf()];
        if let Some(path) = env::var_os("PATH") {
            dirs.extend(env::split_paths(&path));
        }
        Self::Dirs(dirs)
    }
}

/// The first matching entry as found, without following links.
pub fn locate_command(name: &str, context: &SearchContext) -> Option<PathBuf> {
    let found = match context {
        SearchContext::Ambient => which::which(name),
        SearchContext::Dirs(dirs) => {
            let paths = env::join_paths(dirs).ok()?;
            let cwd = env::current_dir().unwrap_or_else(|_| PathBuf::from("."));
            which::which_in(name, Some(paths), cwd)
        }
    };
    found.ok()
}

/// Canonical path of the file `name` runs, or `None` when nothing on the
/// search path answers to it.
pub fn resolve_command(name: &str, context: &SearchContext) -> Result<Option<PathBuf>> {
    let Some(entry) = locate_command(name, context) else {
        return Ok(None);
    };
    match fs::canonicalize(&entry) {
        Ok(path) => Ok(Some(path)),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(err) => {
            Err(err).with_context(|| format!("failed to resolve command entry: {}", entry.display()))
        }
    }
}

/// Drops an executable extension (`.cmd`, `.exe`, ...) so entries on
/// different platforms compare by command name.
pub fn command_stem(path: &Path) -> PathBuf {
    let is_executable_extension = path
        .extension()
        .and_then(|extension| extension.to_str())
        .is_some_and(|extension| {
            executable_extensions()
                .iter()
                .any(|known| known.eq_ignore_ascii_case(extension))
        });
    if is_executable_extension {
        path.with_extension("")
    } else {
        path.to_path_buf()
    }
}

fn executable_extensions() -> Vec<String> {
    if !cfg!(windows) {
        return Vec::new();
    }
    let pathext = env::var("PATHEXT").unwrap_or_else(|_| ".COM;.EXE;.BAT;.CMD".to_string());
    pathext
        .split(';')
        .filter_map(|extension| extension.strip_prefix('.'))
        .filter(|extension| !extension.is_empty())
        .map(str::to_string)
        .chain(["ps1".to_string()])
        .collect()
}
