mod client;
mod config;
mod local;
mod packument;
mod publish;

pub use client::{HttpRegistry, RegistryPublisher, RegistrySource};
pub use config::{registry_key_prefixes, UserConfig, DEFAULT_REGISTRY};
pub use local::LocalRegistry;
pub use packument::{Dist, Packument, PackumentVersion, VersionSelector};
pub use publish::{build_publish_document, tarball_url, PublishRequest};

use std::path::PathBuf;

use anyhow::Result;

/// Registry selected from a configured location: `file:` URLs and bare paths
/// open a directory registry, anything else is spoken to over HTTP.
pub enum RegistryBackend {
    Http(HttpRegistry),
    Local(LocalRegistry),
}

impl RegistryBackend {
    pub fn open(location: &str, config: &UserConfig) -> Result<Self> {
        if let Some(path) = local_registry_path(location) {
            return Ok(Self::Local(LocalRegistry::open(path)));
        }
        let token = config.auth_token_for(location).map(ToOwned::to_owned);
        Ok(Self::Http(HttpRegistry::new(location, token)?))
    }

    pub fn location(&self) -> String {
        match self {
            Self::Http(registry) => registry.base_url().to_string(),
            Self::Local(registry) => registry.root().display().to_string(),
        }
    }

    pub fn source(&self) -> &dyn RegistrySource {
        match self {
            Self::Http(registry) => registry,
            Self::Local(registry) => registry,
        }
    }

    pub fn publisher(&self) -> &dyn RegistryPublisher {
        match self {
            Self::Http(registry) => registry,
            Self::Local(registry) => registry,
        }
    }
}

fn local_registry_path(location: &str) -> Option<PathBuf> {
    if let Some(path) = location.strip_prefix("file://") {
        return Some(PathBuf::from(path));
    }
    if location.starts_with("http://") || location.starts_with("https://") {
        return None;
    }
    Some(PathBuf::from(location))
}
