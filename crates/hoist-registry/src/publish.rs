use anyhow::Result;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use hoist_core::PackageManifest;
use hoist_security::integrity_sha512;
use serde_json::{json, Value};

/// A packed package ready to be handed to a registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishRequest {
    pub manifest: PackageManifest,
    pub tarball: Vec<u8>,
    pub tag: String,
}

impl PublishRequest {
    pub fn file_name(&self) -> String {
        format!(
            "{}-{}.tgz",
            self.manifest.unscoped_name(),
            self.manifest.version
        )
    }
}

/// Where a registry serves the tarball of `name@version`.
pub fn tarball_url(registry_base: &str, manifest: &PackageManifest) -> String {
    format!(
        "{}/{}/-/{}-{}.tgz",
        registry_base.trim_end_matches('/'),
        manifest.name,
        manifest.unscoped_name(),
        manifest.version
    )
}

/// Builds the document a registry expects on `PUT /<name>`: a single-version
/// packument plus the tarball as a base64 attachment.
pub fn build_publish_document(registry_base: &str, request: &PublishRequest) -> Result<Value> {
    let manifest = &request.manifest;
    let version = manifest.version.to_string();
    let file_name = request.file_name();

    let mut version_doc = manifest.to_json_value()?;
    if let Value::Object(fields) = &mut version_doc {
        fields.insert(
            "_id".to_string(),
            Value::String(format!("{}@{}", manifest.name, version)),
        );
        fields.insert(
            "dist".to_string(),
            json!({
                "integrity": integrity_sha512(&request.tarball),
                "tarball": tarball_url(registry_base, manifest),
            }),
        );
    }

    Ok(json!({
        "_id": manifest.name,
        "name": manifest.name,
        "dist-tags": { request.tag.clone(): version },
        "versions": { version.clone(): version_doc },
        "_attachments": {
            file_name: {
                "content_type": "application/octet-stream",
                "data": STANDARD.encode(&request.tarball),
                "length": request.tarball.len(),
            }
        }
    }))
}
