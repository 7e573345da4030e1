mod integrity;

pub use integrity::{integrity_sha512, verify_integrity};
