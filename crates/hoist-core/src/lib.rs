mod archive;
mod manifest;

pub use archive::{pack_directory, pack_to_bytes, unpack_tarball, PackSummary};
pub use manifest::{BinField, PackageManifest, MANIFEST_FILE, MODULES_DIR};

#[cfg(test)]
mod tests;
