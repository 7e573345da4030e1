use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::fs_utils::{current_unix_timestamp, unique_suffix};
use crate::layout::GlobalNamespace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationPhase {
    Swapping,
    Linking,
}

impl fmt::Display for OperationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Swapping => "swapping",
            Self::Linking => "linking",
        })
    }
}

/// Record of an install that is between its first and last mutation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActiveOperation {
    pub package: String,
    pub version: String,
    pub phase: OperationPhase,
    pub pid: u32,
    pub started_at_unix: u64,
}

impl ActiveOperation {
    pub fn new(package: &str, version: &str) -> Self {
        Self {
            package: package.to_string(),
            version: version.to_string(),
            phase: OperationPhase::Swapping,
            pid: std::process::id(),
            started_at_unix: current_unix_timestamp(),
        }
    }
}

impl fmt::Display for ActiveOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{} (phase={}, pid={})",
            self.package, self.version, self.phase, self.pid
        )
    }
}

/// Claims the marker; fails if one is already present.
pub fn set_active_operation(
    namespace: &GlobalNamespace,
    operation: &ActiveOperation,
) -> Result<PathBuf> {
    let path = namespace.active_marker_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    let mut file = match fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&path)
    {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
            let detail = read_active_operation(namespace)
                .ok()
                .flatten()
                .map(|existing| format!(" ({existing})"))
                .unwrap_or_default();
            return Err(anyhow!("active install marker already exists{detail}"));
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to claim active install marker: {}", path.display())
            });
        }
    };

    let body = serde_json::to_vec(operation).context("failed to encode active install marker")?;
    file.write_all(&body)
        .with_context(|| format!("failed to write active install marker: {}", path.display()))?;
    file.flush()
        .with_context(|| format!("failed to flush active install marker: {}", path.display()))?;
    Ok(path)
}

/// Moves an already claimed marker to a new phase.
pub fn update_active_phase(
    namespace: &GlobalNamespace,
    operation: &mut ActiveOperation,
    phase: OperationPhase,
) -> Result<()> {
    operation.phase = phase;
    let path = namespace.active_marker_path();
    let tmp = path.with_file_name(format!("active.{}.tmp", unique_suffix()));
    let body = serde_json::to_vec(operation).context("failed to encode active install marker")?;
    fs::write(&tmp, body)
        .with_context(|| format!("failed to write active install marker: {}", tmp.display()))?;
    fs::rename(&tmp, &path)
        .with_context(|| format!("failed to update active install marker: {}", path.display()))
}

pub fn read_active_operation(namespace: &GlobalNamespace) -> Result<Option<ActiveOperation>> {
    let path = namespace.active_marker_path();
    let raw = match fs::read_to_string(&path) {
        Ok(raw) => raw,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => {
            return Err(err).with_context(|| {
                format!("failed to read active install marker: {}", path.display())
            });
        }
    };
    if raw.trim().is_empty() {
        return Ok(None);
    }

    serde_json::from_str(&raw)
        .with_context(|| format!("failed to parse active install marker: {}", path.display()))
        .map(Some)
}

pub fn clear_active_operation(namespace: &GlobalNamespace) -> Result<()> {
    let path = namespace.active_marker_path();
    match fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| {
            format!("failed to clear active install marker: {}", path.display())
        }),
    }
}
