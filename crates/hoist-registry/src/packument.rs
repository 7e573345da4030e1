use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use hoist_core::PackageManifest;
use semver::Version;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Dist {
    pub tarball: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shasum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PackumentVersion {
    pub dist: Dist,
    #[serde(flatten)]
    pub manifest: PackageManifest,
}

/// Registry document describing every published version of one package.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Packument {
    pub name: String,
    #[serde(rename = "dist-tags", default)]
    pub dist_tags: BTreeMap<String, String>,
    #[serde(default)]
    pub versions: BTreeMap<String, PackumentVersion>,
}

impl Packument {
    pub fn from_json_str(input: &str) -> Result<Self> {
        serde_json::from_str(input).context("failed to parse packument")
    }

    pub fn select(&self, selector: &VersionSelector) -> Result<&PackumentVersion> {
        let version = match selector {
            VersionSelector::Exact(version) => version.to_string(),
            VersionSelector::Tag(tag) => self
                .dist_tags
                .get(tag)
                .cloned()
                .ok_or_else(|| anyhow!("no dist-tag '{tag}' for package '{}'", self.name))?,
        };

        self.versions.get(&version).ok_or_else(|| {
            anyhow!(
                "no version '{version}' of package '{}' in registry",
                self.name
            )
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionSelector {
    Exact(Version),
    Tag(String),
}

impl VersionSelector {
    pub fn parse(input: &str) -> Result<Self> {
        let input = input.trim();
        if input.is_empty() {
            return Ok(Self::latest());
        }
        if let Ok(version) = Version::parse(input.trim_start_matches(['v', '='])) {
            return Ok(Self::Exact(version));
        }
        if input
            .chars()
            .any(|ch| ch.is_whitespace() || matches!(ch, '^' | '~' | '<' | '>' | '*' | '|'))
            || input.starts_with(|ch: char| ch.is_ascii_digit())
        {
            return Err(anyhow!(
                "version ranges are not supported, use an exact version or a dist-tag: {input}"
            ));
        }
        Ok(Self::Tag(input.to_string()))
    }

    pub fn latest() -> Self {
        Self::Tag("latest".to_string())
    }
}

impl fmt::Display for VersionSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exact(version) => write!(f, "{version}"),
            Self::Tag(tag) => write!(f, "{tag}"),
        }
    }
}
