use std::path::PathBuf;

use anyhow::Result;
use hoist_installer::{default_user_prefix, GlobalNamespace, TarballCache};
use hoist_registry::{RegistryBackend, UserConfig, DEFAULT_REGISTRY};
use tracing::debug;

use crate::GlobalArgs;

/// Settings after applying flag > environment > user config > default.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub prefix: PathBuf,
    pub registry: String,
    pub cache_dir: PathBuf,
    pub user_config: UserConfig,
}

impl ResolvedConfig {
    pub fn resolve(args: &GlobalArgs) -> Result<Self> {
        Self::resolve_with(args, |key| std::env::var(key).ok())
    }

    pub fn resolve_with(args: &GlobalArgs, env: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let non_empty = |key: &str| env(key).filter(|value| !value.trim().is_empty());

        let userconfig_path = args
            .userconfig
            .clone()
            .or_else(|| non_empty("HOIST_USERCONFIG").map(PathBuf::from))
            .or_else(|| home_dir(&non_empty).map(|home| home.join(".hoistrc")));
        let user_config = match &userconfig_path {
            Some(path) => UserConfig::load(path)?,
            None => UserConfig::default(),
        };

        let prefix = match args
            .prefix
            .clone()
            .or_else(|| non_empty("HOIST_PREFIX").map(PathBuf::from))
            .or_else(|| user_config.prefix())
        {
            Some(prefix) => prefix,
            None => default_user_prefix()?,
        };
        let registry = args
            .registry
            .clone()
            .or_else(|| non_empty("HOIST_REGISTRY"))
            .or_else(|| user_config.registry().map(str::to_string))
            .unwrap_or_else(|| DEFAULT_REGISTRY.to_string());
        let cache_dir = args
            .cache
            .clone()
            .or_else(|| non_empty("HOIST_CACHE").map(PathBuf::from))
            .or_else(|| user_config.cache())
            .unwrap_or_else(|| prefix.join("cache"));

        debug!(
            prefix = %prefix.display(),
            %registry,
            cache = %cache_dir.display(),
            "resolved configuration"
        );
        Ok(Self {
            prefix,
            registry,
            cache_dir,
            user_config,
        })
    }

    pub fn namespace(&self) -> GlobalNamespace {
        GlobalNamespace::for_prefix(&self.prefix)
    }

    pub fn tarball_cache(&self) -> TarballCache {
        TarballCache::new(&self.cache_dir)
    }

    pub fn registry_backend(&self) -> Result<RegistryBackend> {
        RegistryBackend::open(&self.registry, &self.user_config)
    }
}

fn home_dir(env: &impl Fn(&str) -> Option<String>) -> Option<PathBuf> {
    let key = if cfg!(windows) { "USERPROFILE" } else { "HOME" };
    env(key).map(PathBuf::from)
}
