use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};

pub const DEFAULT_REGISTRY: &str = "https://registry.npmjs.org/";

/// User configuration in `.npmrc` syntax: `key = value` lines, `#`/`;` comments.
/// Registry credentials use "nerf-darted" keys such as
/// `//registry.example.test/:_authToken = <token>`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserConfig {
    path: Option<PathBuf>,
    entries: BTreeMap<String, String>,
}

impl UserConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Ok(Self {
                    path: Some(path.to_path_buf()),
                    entries: BTreeMap::new(),
                });
            }
            Err(err) => {
                return Err(err)
                    .with_context(|| format!("failed to read user config: {}", path.display()));
            }
        };

        let mut config = Self::parse(&raw)
            .with_context(|| format!("failed to parse user config: {}", path.display()))?;
        config.path = Some(path.to_path_buf());
        Ok(config)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let mut entries = BTreeMap::new();
        for (index, line) in raw.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                return Err(anyhow!(
                    "line {}: expected 'key = value', got '{line}'",
                    index + 1
                ));
            };
            let key = key.trim();
            if key.is_empty() {
                return Err(anyhow!("line {}: key must not be empty", index + 1));
            }
            entries.insert(key.to_string(), unquote(value.trim()).to_string());
        }

        Ok(Self {
            path: None,
            entries,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .get(key)
            .map(String::as_str)
            .filter(|value| !value.is_empty())
    }

    pub fn registry(&self) -> Option<&str> {
        self.get("registry")
    }

    pub fn prefix(&self) -> Option<PathBuf> {
        self.get("prefix").map(PathBuf::from)
    }

    pub fn cache(&self) -> Option<PathBuf> {
        self.get("cache").map(PathBuf::from)
    }

    /// Token for the most specific registry key matching `registry_url`.
    pub fn auth_token_for(&self, registry_url: &str) -> Option<&str> {
        registry_key_prefixes(registry_url)
            .iter()
            .find_map(|prefix| self.get(&format!("{prefix}:_authToken")))
    }
}

/// Credential key prefixes for a registry URL, most specific first:
/// `https://host:8080/a/b` yields `//host:8080/a/b/`, `//host:8080/a/`, `//host:8080/`.
pub fn registry_key_prefixes(registry_url: &str) -> Vec<String> {
    let without_scheme = registry_url
        .split_once("://")
        .map(|(_, rest)| rest)
        .unwrap_or(registry_url);
    let without_query = without_scheme
        .split(['?', '#'])
        .next()
        .unwrap_or(without_scheme);

    let (host, path) = match without_query.split_once('/') {
        Some((host, path)) => (host, path),
        None => (without_query, ""),
    };
    if host.is_empty() {
        return Vec::new();
    }

    let segments = path
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    (0..=segments.len())
        .rev()
        .map(|count| {
            let mut prefix = format!("//{host}/");
            for segment in &segments[..count] {
                prefix.push_str(segment);
                prefix.push('/');
            }
            prefix
        })
        .collect()
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}
