use std::fs;
#[cfg(target_os = "linux")]
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::{debug, warn};

use crate::fs_utils::{path_occupied, remove_path_if_exists, unique_suffix};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SwapOutcome {
    /// Nothing was at the target before.
    Installed,
    /// The previous tree now lives at `retired` and can be discarded.
    Replaced { retired: PathBuf },
}

/// Puts the staged tree at `target`. Every observer sees either the old tree
/// or the new one; on failure the old tree stays in place.
pub fn swap_into_place(staged: &Path, target: &Path, trash_dir: &Path) -> Result<SwapOutcome> {
    if let Some(parent) = target.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }

    if !path_occupied(target) {
        fs::rename(staged, target).with_context(|| {
            format!(
                "failed to move {} into {}",
                staged.display(),
                target.display()
            )
        })?;
        return Ok(SwapOutcome::Installed);
    }

    #[cfg(target_os = "linux")]
    match exchange(staged, target) {
        Ok(()) => {
            debug!(target = %target.display(), "exchanged package trees");
            return Ok(SwapOutcome::Replaced {
                retired: staged.to_path_buf(),
            });
        }
        Err(err) if exchange_unsupported(&err) => {
            debug!(error = %err, "atomic exchange unavailable; falling back to renames");
        }
        Err(err) => {
            return Err(err).with_context(|| {
                format!(
                    "failed to exchange {} with {}",
                    staged.display(),
                    target.display()
                )
            });
        }
    }

    rename_swap(staged, target, trash_dir)
}

pub(crate) fn rename_swap(staged: &Path, target: &Path, trash_dir: &Path) -> Result<SwapOutcome> {
    fs::create_dir_all(trash_dir)
        .with_context(|| format!("failed to create {}", trash_dir.display()))?;
    let retired = trash_dir.join(unique_suffix());
    fs::rename(target, &retired).with_context(|| {
        format!(
            "failed to move previous package aside: {}",
            target.display()
        )
    })?;

    if let Err(err) = fs::rename(staged, target) {
        if let Err(restore_err) = fs::rename(&retired, target) {
            warn!(
                retired = %retired.display(),
                error = %restore_err,
                "failed to restore previous package after swap failure"
            );
        }
        return Err(err).with_context(|| {
            format!(
                "failed to move {} into {}",
                staged.display(),
                target.display()
            )
        });
    }

    Ok(SwapOutcome::Replaced { retired })
}

/// Best-effort removal of a tree displaced by a swap.
pub fn discard_retired(retired: &Path) {
    if let Err(err) = remove_path_if_exists(retired) {
        warn!(
            path = %retired.display(),
            error = %err,
            "failed to remove previous package tree; it will be purged by the next install"
        );
    }
}

/// Moves a running executable out of the way. Windows refuses to delete an
/// executing image but allows renaming it within the same volume.
pub fn retire_running_executable(executable: &Path, trash_dir: &Path) -> Result<Option<PathBuf>> {
    if !path_occupied(executable) {
        return Ok(None);
    }
    fs::create_dir_all(trash_dir)
        .with_context(|| format!("failed to create {}", trash_dir.display()))?;
    let file_name = executable
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "executable".to_string());
    let retired = trash_dir.join(format!("{}-{file_name}", unique_suffix()));
    fs::rename(executable, &retired).with_context(|| {
        format!(
            "failed to move running executable aside: {}",
            executable.display()
        )
    })?;
    debug!(from = %executable.display(), to = %retired.display(), "retired running executable");
    Ok(Some(retired))
}

/// Puts an executable moved aside by [`retire_running_executable`] back where
/// it was.
pub fn restore_running_executable(retired: &Path, executable: &Path) -> Result<()> {
    fs::rename(retired, executable).with_context(|| {
        format!(
            "failed to restore running executable {} from {}",
            executable.display(),
            retired.display()
        )
    })?;
    debug!(to = %executable.display(), "restored running executable");
    Ok(())
}

#[cfg(target_os = "linux")]
fn exchange(first: &Path, second: &Path) -> io::Result<()> {
    use std::ffi::CString;
    use std::os::unix::ffi::OsStrExt;

    const RENAME_EXCHANGE: libc::c_uint = 1 << 1;

    let to_cstring = |path: &Path| {
        CString::new(path.as_os_str().as_bytes())
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "path contains NUL byte"))
    };
    let first = to_cstring(first)?;
    let second = to_cstring(second)?;

    // SAFETY: both pointers come from live CStrings and the flags are a valid
    // renameat2 argument.
    let rc = unsafe {
        libc::syscall(
            libc::SYS_renameat2,
            libc::AT_FDCWD,
            first.as_ptr(),
            libc::AT_FDCWD,
            second.as_ptr(),
            RENAME_EXCHANGE,
        )
    };
    if rc == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(target_os = "linux")]
fn exchange_unsupported(err: &io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EINVAL) | Some(libc::ENOSYS) | Some(libc::EOPNOTSUPP)
    )
}
