//! Content addressing for normalized frames.
//!
//! The digest is advisory: it goes into file names and audit columns but is
//! never part of a record's key.

use sha2::{Digest, Sha256};

/// SHA-256 of the given bytes as lowercase hex.
pub fn sha256_hex(data: &[u8]) -> String {
    let hash = Sha256::digest(data);
    format!("{hash:x}")
}

/// First 8 hex characters, used to disambiguate file names.
pub fn short_digest(digest: &str) -> &str {
    digest.get(..8).unwrap_or(digest)
}
