//! Utility functions for cryptographic operations.

use rand::RngCore;
use sha2::{Digest, Sha256};

/// Size of a per-publish commit salt in bytes.
pub const COMMIT_SALT_SIZE: usize = 8;

/// Number of hex characters kept from a path digest (128 bits).
const PATH_ID_HEX_LEN: usize = 32;

/// Generate cryptographically secure random bytes.
pub fn generate_random_bytes(len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rand::rngs::OsRng.fill_bytes(&mut buf);
    buf
}

/// Generate a fresh hex-encoded commit salt for one publish.
pub fn generate_commit_salt() -> String {
    hex::encode(generate_random_bytes(COMMIT_SALT_SIZE))
}

/// SHA-256 of `data`, hex-encoded. Used as the chunk content checksum.
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Keyed, fixed-length identifier for a path as it appears in message tags.
///
/// The server only ever sees this id, never the path itself. Fixed length
/// matters: IMAP header search is substring based, and equal-length ids can
/// only match each other exactly.
pub fn path_id(path_key: &[u8; 32], path: &str) -> String {
    let digest = Sha256::new()
        .chain_update(b"mailfs-path-v1")
        .chain_update(path_key)
        .chain_update(path.as_bytes())
        .finalize();
    let mut id = hex::encode(digest);
    id.truncate(PATH_ID_HEX_LEN);
    id
}
