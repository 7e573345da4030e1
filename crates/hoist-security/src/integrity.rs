use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sha2::{Digest, Sha256, Sha512};

/// Subresource-integrity string in the form registries publish in `dist.integrity`.
pub fn integrity_sha512(payload: &[u8]) -> String {
    format!("sha512-{}", STANDARD.encode(Sha512::digest(payload)))
}

/// Checks `payload` against an SRI string. Several space-separated hashes may be
/// present; the strongest supported algorithm decides.
pub fn verify_integrity(payload: &[u8], integrity: &str) -> Result<()> {
    let mut candidates = integrity
        .split_whitespace()
        .filter_map(|entry| entry.split_once('-'))
        .filter(|(algorithm, _)| matches!(*algorithm, "sha512" | "sha256"))
        .collect::<Vec<_>>();
    candidates.sort_by_key(|(algorithm, _)| if *algorithm == "sha512" { 0 } else { 1 });

    let Some((algorithm, encoded)) = candidates.first() else {
        return Err(anyhow!("no supported hash algorithm in integrity '{integrity}'"));
    };

    // Options after '?' are allowed by the SRI grammar and ignored here.
    let encoded = encoded.split('?').next().unwrap_or(encoded);
    let expected = STANDARD
        .decode(encoded)
        .with_context(|| format!("failed to decode {algorithm} integrity digest"))?;
    let actual = match *algorithm {
        "sha512" => Sha512::digest(payload).to_vec(),
        _ => Sha256::digest(payload).to_vec(),
    };

    if actual != expected {
        return Err(anyhow!(
            "integrity mismatch: expected {algorithm}-{encoded}, got {algorithm}-{}",
            STANDARD.encode(&actual)
        ));
    }
    Ok(())
}
