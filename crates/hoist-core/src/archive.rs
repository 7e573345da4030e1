use std::fs;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;

use crate::manifest::PackageManifest;

/// Every entry of a packed tarball lives under this directory.
const PACKAGE_ROOT: &str = "package";
/// Fixed mtime keeps repeated packs of the same tree byte-identical.
const PACK_MTIME: u64 = 499_162_500;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackSummary {
    pub name: String,
    pub version: String,
    pub file_name: String,
    pub files: Vec<String>,
    pub unpacked_size: u64,
}

pub fn pack_directory<W: Write>(dir: &Path, writer: W) -> Result<PackSummary> {
    let manifest = PackageManifest::load(dir)?;
    let file_name = manifest.tarball_file_name();

    let mut files = Vec::new();
    collect_pack_files(dir, dir, &file_name, &mut files)?;
    files.sort();

    let encoder = GzEncoder::new(writer, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    let mut unpacked_size = 0_u64;
    for rel in &files {
        let source = dir.join(rel);
        let metadata = fs::metadata(&source)
            .with_context(|| format!("failed to stat {}", source.display()))?;
        let contents =
            fs::read(&source).with_context(|| format!("failed to read {}", source.display()))?;

        let mut header = tar::Header::new_gnu();
        header.set_size(contents.len() as u64);
        header.set_mode(pack_mode(&metadata));
        header.set_mtime(PACK_MTIME);
        header.set_entry_type(tar::EntryType::Regular);
        header.set_cksum();
        builder
            .append_data(&mut header, format!("{PACKAGE_ROOT}/{rel}"), contents.as_slice())
            .with_context(|| format!("failed to append {rel} to tarball"))?;
        unpacked_size += contents.len() as u64;
    }

    let encoder = builder
        .into_inner()
        .context("failed to finish tarball stream")?;
    encoder.finish().context("failed to finish gzip stream")?;

    Ok(PackSummary {
        name: manifest.name.clone(),
        version: manifest.version.to_string(),
        file_name,
        files,
        unpacked_size,
    })
}

pub fn pack_to_bytes(dir: &Path) -> Result<(PackSummary, Vec<u8>)> {
    let mut bytes = Vec::new();
    let summary = pack_directory(dir, &mut bytes)?;
    Ok((summary, bytes))
}

/// Unpacks a gzipped package tarball into `dest`, dropping the leading path
/// component of every entry. Entries that would land outside `dest` are rejected.
pub fn unpack_tarball<R: Read>(reader: R, dest: &Path) -> Result<()> {
    fs::create_dir_all(dest).with_context(|| format!("failed to create {}", dest.display()))?;
    let mut archive = tar::Archive::new(GzDecoder::new(reader));

    for entry in archive.entries().context("failed to read tarball entries")? {
        let mut entry = entry.context("failed to read tarball entry")?;
        let raw_path = entry
            .path()
            .context("tarball entry has an unreadable path")?
            .into_owned();
        let Some(relative) = strip_leading_component(&raw_path)? else {
            continue;
        };

        let entry_type = entry.header().entry_type();
        ensure_no_link_on_path(dest, &relative)?;
        let destination = dest.join(&relative);
        let replaces_link = fs::symlink_metadata(&destination)
            .is_ok_and(|metadata| metadata.file_type().is_symlink());
        match entry_type {
            tar::EntryType::Directory => {
                if replaces_link {
                    return Err(anyhow!(
                        "tarball directory {} collides with a symlink",
                        raw_path.display()
                    ));
                }
                fs::create_dir_all(&destination)
                    .with_context(|| format!("failed to create {}", destination.display()))?;
                continue;
            }
            tar::EntryType::Regular | tar::EntryType::Continuous => {}
            tar::EntryType::Symlink => {
                let link_name = entry
                    .link_name()
                    .context("tarball symlink has an unreadable target")?
                    .ok_or_else(|| anyhow!("tarball symlink without target: {}", raw_path.display()))?
                    .into_owned();
                ensure_link_within(&relative, &link_name)?;
            }
            _ => continue,
        }

        if let Some(parent) = destination.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        if replaces_link {
            fs::remove_file(&destination)
                .with_context(|| format!("failed to replace {}", destination.display()))?;
        }
        entry
            .unpack(&destination)
            .with_context(|| format!("failed to unpack {}", raw_path.display()))?;
    }

    Ok(())
}

fn strip_leading_component(path: &Path) -> Result<Option<PathBuf>> {
    let mut stripped = PathBuf::new();
    let mut seen_root = false;
    for component in path.components() {
        match component {
            Component::Normal(part) if seen_root => stripped.push(part),
            Component::Normal(_) => seen_root = true,
            Component::CurDir => {}
            _ => {
                return Err(anyhow!(
                    "tarball contains unsafe path: {}",
                    path.display()
                ))
            }
        }
    }

    if stripped.as_os_str().is_empty() {
        return Ok(None);
    }
    Ok(Some(stripped))
}

/// Refuses entries whose parent directories include a symlink unpacked by an
/// earlier entry. Checking link targets as text alone misses chains such as
/// `s -> .` followed by `x -> s/..`.
fn ensure_no_link_on_path(dest: &Path, relative: &Path) -> Result<()> {
    let Some(parent) = relative.parent() else {
        return Ok(());
    };
    let mut current = dest.to_path_buf();
    for component in parent.components() {
        current.push(component);
        let is_link = fs::symlink_metadata(&current)
            .is_ok_and(|metadata| metadata.file_type().is_symlink());
        if is_link {
            return Err(anyhow!(
                "tarball entry passes through a symlink: {}",
                relative.display()
            ));
        }
    }
    Ok(())
}

fn ensure_link_within(relative: &Path, link_name: &Path) -> Result<()> {
    if link_name.is_absolute() {
        return Err(anyhow!(
            "tarball symlink target must be relative: {} -> {}",
            relative.display(),
            link_name.display()
        ));
    }

    let mut depth = relative.components().count().saturating_sub(1) as isize;
    for component in link_name.components() {
        match component {
            Component::ParentDir => depth -= 1,
            Component::Normal(_) => depth += 1,
            Component::CurDir => {}
            _ => depth = -1,
        }
        if depth < 0 {
            return Err(anyhow!(
                "tarball symlink escapes the package: {} -> {}",
                relative.display(),
                link_name.display()
            ));
        }
    }
    Ok(())
}

fn collect_pack_files(
    root: &Path,
    current: &Path,
    output_name: &str,
    files: &mut Vec<String>,
) -> Result<()> {
    for entry in
        fs::read_dir(current).with_context(|| format!("failed to read {}", current.display()))?
    {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry
            .file_type()
            .with_context(|| format!("failed to stat {}", path.display()))?;
        let name = entry.file_name();

        if file_type.is_dir() {
            if name == ".git" {
                continue;
            }
            collect_pack_files(root, &path, output_name, files)?;
            continue;
        }
        if !file_type.is_file() {
            continue;
        }
        if current == root && name == output_name {
            continue;
        }

        let rel = path
            .strip_prefix(root)
            .with_context(|| format!("failed to relativize {}", path.display()))?;
        let rel = rel
            .components()
            .map(|component| component.as_os_str().to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("/");
        files.push(rel);
    }
    Ok(())
}

#[cfg(unix)]
fn pack_mode(metadata: &fs::Metadata) -> u32 {
    use std::os::unix::fs::PermissionsExt;
    if metadata.permissions().mode() & 0o111 != 0 {
        0o755
    } else {
        0o644
    }
}

#[cfg(not(unix))]
fn pack_mode(_metadata: &fs::Metadata) -> u32 {
    0o644
}
