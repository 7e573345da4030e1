use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::{Client, RequestBuilder};
use reqwest::header::{ACCEPT, CONTENT_TYPE};
use tracing::debug;

use crate::packument::{Dist, Packument};
use crate::publish::{build_publish_document, PublishRequest};

const USER_AGENT: &str = concat!("hoist/", env!("CARGO_PKG_VERSION"));

/// The two read operations the install engine needs from a registry.
pub trait RegistrySource {
    fn fetch_packument(&self, name: &str) -> Result<Packument>;
    fn fetch_tarball(&self, dist: &Dist) -> Result<Vec<u8>>;
}

pub trait RegistryPublisher {
    fn publish(&self, request: &PublishRequest) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct HttpRegistry {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl HttpRegistry {
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(120))
            .build()
            .context("failed to build registry HTTP client")?;
        Ok(Self {
            base_url: format!("{}/", base_url.trim_end_matches('/')),
            token,
            client,
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn packument_url(&self, name: &str) -> String {
        format!("{}{}", self.base_url, escape_package_name(name))
    }

    fn authorized(&self, request: RequestBuilder, url: &str) -> RequestBuilder {
        // Tokens are only sent back to the registry that issued them.
        match &self.token {
            Some(token) if url.starts_with(&self.base_url) => request.bearer_auth(token),
            _ => request,
        }
    }
}

impl RegistrySource for HttpRegistry {
    fn fetch_packument(&self, name: &str) -> Result<Packument> {
        let url = self.packument_url(name);
        debug!(%url, "fetching packument");
        let request = self.client.get(&url).header(ACCEPT, "application/json");
        let response = self
            .authorized(request, &url)
            .send()
            .with_context(|| format!("failed to request packument: {url}"))?;
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!("package '{name}' was not found in registry {}", self.base_url));
        }
        if !status.is_success() {
            return Err(anyhow!("registry returned {status} for {url}"));
        }

        let body = response
            .text()
            .with_context(|| format!("failed to read packument body: {url}"))?;
        Packument::from_json_str(&body).with_context(|| format!("invalid packument from {url}"))
    }

    fn fetch_tarball(&self, dist: &Dist) -> Result<Vec<u8>> {
        let url = dist.tarball.as_str();
        debug!(%url, "fetching tarball");
        let response = self
            .authorized(self.client.get(url), url)
            .send()
            .with_context(|| format!("failed to request tarball: {url}"))?;
        let status = response.status();
        if !status.is_success() {
            return Err(anyhow!("registry returned {status} for {url}"));
        }

        let bytes = response
            .bytes()
            .with_context(|| format!("failed to read tarball body: {url}"))?;
        Ok(bytes.to_vec())
    }
}

impl RegistryPublisher for HttpRegistry {
    fn publish(&self, request: &PublishRequest) -> Result<()> {
        if self.token.is_none() {
            return Err(anyhow!(
                "publish requires an auth token for {}; add '{}:_authToken = <token>' to your user config",
                self.base_url,
                crate::registry_key_prefixes(&self.base_url)
                    .last()
                    .cloned()
                    .unwrap_or_default()
            ));
        }

        let url = self.packument_url(&request.manifest.name);
        let document = build_publish_document(&self.base_url, request)?;
        let body = serde_json::to_string(&document).context("failed to encode publish body")?;
        debug!(%url, bytes = body.len(), "publishing package");

        let response = self
            .authorized(self.client.put(&url), &url)
            .header(CONTENT_TYPE, "application/json")
            .body(body)
            .send()
            .with_context(|| format!("failed to send publish request: {url}"))?;
        let status = response.status();
        if !status.is_success() {
            let detail = response.text().unwrap_or_default();
            return Err(anyhow!(
                "registry rejected publish of {}@{} ({status}): {}",
                request.manifest.name,
                request.manifest.version,
                detail.trim()
            ));
        }
        Ok(())
    }
}

/// Scoped names keep their `@` but escape the separator, as registries expect.
pub(crate) fn escape_package_name(name: &str) -> String {
    name.replace('/', "%2f")
}
