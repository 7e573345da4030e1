use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use hoist_security::integrity_sha512;
use tracing::debug;

use crate::client::{RegistryPublisher, RegistrySource};
use crate::packument::{Dist, Packument, PackumentVersion};
use crate::publish::PublishRequest;

const PACKUMENT_FILE: &str = "packument.json";

/// Registry kept in a plain directory: `<root>/<name>/packument.json` plus
/// tarballs under `<root>/<name>/-/`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalRegistry {
    root: PathBuf,
}

impl LocalRegistry {
    pub fn open(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn package_dir(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    pub fn packument_path(&self, name: &str) -> PathBuf {
        self.package_dir(name).join(PACKUMENT_FILE)
    }

    fn read_packument(&self, name: &str) -> Result<Option<Packument>> {
        let path = self.packument_path(name);
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read packument: {}", path.display()));
            }
        };
        Packument::from_json_str(&raw)
            .with_context(|| format!("failed to parse packument: {}", path.display()))
            .map(Some)
    }
}

impl RegistrySource for LocalRegistry {
    fn fetch_packument(&self, name: &str) -> Result<Packument> {
        self.read_packument(name)?.ok_or_else(|| {
            anyhow!(
                "package '{name}' was not found in registry {}",
                self.root.display()
            )
        })
    }

    fn fetch_tarball(&self, dist: &Dist) -> Result<Vec<u8>> {
        let path = dist
            .tarball
            .strip_prefix("file://")
            .unwrap_or(&dist.tarball);
        debug!(path, "reading tarball from directory registry");
        fs::read(path).with_context(|| format!("failed to read tarball: {path}"))
    }
}

impl RegistryPublisher for LocalRegistry {
    fn publish(&self, request: &PublishRequest) -> Result<()> {
        let manifest = &request.manifest;
        let version = manifest.version.to_string();
        let mut packument = self.read_packument(&manifest.name)?.unwrap_or(Packument {
            name: manifest.name.clone(),
            dist_tags: BTreeMap::new(),
            versions: BTreeMap::new(),
        });
        if packument.versions.contains_key(&version) {
            return Err(anyhow!(
                "cannot publish over previously published version {}@{version}",
                manifest.name
            ));
        }

        let tarball_dir = self.package_dir(&manifest.name).join("-");
        fs::create_dir_all(&tarball_dir)
            .with_context(|| format!("failed to create {}", tarball_dir.display()))?;
        let tarball_path = tarball_dir.join(request.file_name());
        fs::write(&tarball_path, &request.tarball)
            .with_context(|| format!("failed to write tarball: {}", tarball_path.display()))?;

        packument.dist_tags.insert(request.tag.clone(), version.clone());
        packument.versions.insert(
            version,
            PackumentVersion {
                dist: Dist {
                    tarball: format!("file://{}", tarball_path.display()),
                    integrity: Some(integrity_sha512(&request.tarball)),
                    shasum: None,
                },
                manifest: manifest.clone(),
            },
        );

        let path = self.packument_path(&manifest.name);
        let body =
            serde_json::to_string_pretty(&packument).context("failed to encode packument")?;
        fs::write(&path, body)
            .with_context(|| format!("failed to write packument: {}", path.display()))?;
        Ok(())
    }
}
