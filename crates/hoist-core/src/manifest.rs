use std::collections::BTreeMap;
use std::fs;
use std::path::{Component, Path};

use anyhow::{anyhow, Context, Result};
use semver::Version;
use serde::{Deserialize, Serialize};

pub const MANIFEST_FILE: &str = "package.json";
pub const MODULES_DIR: &str = "node_modules";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum BinField {
    Single(String),
    Map(BTreeMap<String, String>),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackageManifest {
    pub name: String,
    pub version: Version,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bin: Option<BinField>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub dependencies: BTreeMap<String, String>,
    /// Package-relative path of the finalization hook module.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finalize: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl PackageManifest {
    pub fn from_json_str(input: &str) -> Result<Self> {
        let manifest: Self =
            serde_json::from_str(input).context("failed to parse package manifest")?;
        validate_package_name(&manifest.name)?;
        manifest.commands()?;
        if let Some(finalize) = &manifest.finalize {
            validated_relative_path(finalize)
                .with_context(|| format!("invalid finalize path for '{}'", manifest.name))?;
        }
        Ok(manifest)
    }

    pub fn load(package_dir: &Path) -> Result<Self> {
        let path = package_dir.join(MANIFEST_FILE);
        let raw = fs::read_to_string(&path)
            .with_context(|| format!("failed to read package manifest: {}", path.display()))?;
        Self::from_json_str(&raw)
            .with_context(|| format!("failed to load package manifest: {}", path.display()))
    }

    /// Name without its `@scope/` prefix.
    pub fn unscoped_name(&self) -> &str {
        match self.name.split_once('/') {
            Some((_, name)) => name,
            None => &self.name,
        }
    }

    /// Declared commands mapped to package-relative paths, normalized so a
    /// string-valued `bin` exposes a single command named after the package.
    pub fn commands(&self) -> Result<BTreeMap<String, String>> {
        let declared = match &self.bin {
            None => return Ok(BTreeMap::new()),
            Some(BinField::Single(path)) => {
                BTreeMap::from([(self.unscoped_name().to_string(), path.clone())])
            }
            Some(BinField::Map(map)) => map.clone(),
        };

        let mut commands = BTreeMap::new();
        for (command, path) in declared {
            validate_command_name(&command)
                .with_context(|| format!("invalid bin entry in '{}'", self.name))?;
            let relative = validated_relative_path(&path)
                .with_context(|| format!("invalid path for command '{command}'"))?;
            commands.insert(command, normalize_relative(relative));
        }
        Ok(commands)
    }

    pub fn tarball_file_name(&self) -> String {
        let stem = self.name.trim_start_matches('@').replace('/', "-");
        format!("{stem}-{}.tgz", self.version)
    }

    pub fn to_json_value(&self) -> Result<serde_json::Value> {
        serde_json::to_value(self).context("failed to serialize package manifest")
    }
}

fn validate_package_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(anyhow!("package name must not be empty"));
    }
    if name.chars().any(|ch| ch.is_whitespace() || ch == '\\') {
        return Err(anyhow!("package name contains invalid characters: {name}"));
    }

    let bare = match name.strip_prefix('@') {
        Some(scoped) => {
            let Some((scope, bare)) = scoped.split_once('/') else {
                return Err(anyhow!("scoped package name must be '@scope/name': {name}"));
            };
            if scope.is_empty() {
                return Err(anyhow!("package scope must not be empty: {name}"));
            }
            bare
        }
        None => name,
    };
    if bare.is_empty() || bare.contains('/') || bare.starts_with('.') {
        return Err(anyhow!("invalid package name: {name}"));
    }
    Ok(())
}

fn validate_command_name(command: &str) -> Result<()> {
    if command.trim().is_empty() {
        return Err(anyhow!("command name must not be empty"));
    }
    if command == "." || command == ".." || command.contains(['/', '\\']) {
        return Err(anyhow!("command name must be a plain file name: {command}"));
    }
    // Dot names collide with namespace state and temporary link files.
    if command.starts_with('.') || command.eq_ignore_ascii_case(MODULES_DIR) {
        return Err(anyhow!("command name is reserved: {command}"));
    }
    Ok(())
}

fn validated_relative_path(path: &str) -> Result<&Path> {
    let relative = Path::new(path);
    if relative.as_os_str().is_empty() {
        return Err(anyhow!("path must not be empty"));
    }
    if relative.is_absolute() || path.starts_with(['/', '\\']) {
        return Err(anyhow!("path must be relative: {path}"));
    }
    if relative
        .components()
        .any(|component| matches!(component, Component::ParentDir | Component::Prefix(_)))
    {
        return Err(anyhow!("path must not include '..': {path}"));
    }
    Ok(relative)
}

fn normalize_relative(path: &Path) -> String {
    path.components()
        .filter_map(|component| match component {
            Component::Normal(part) => Some(part.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect::<Vec<_>>()
        .join("/")
}
