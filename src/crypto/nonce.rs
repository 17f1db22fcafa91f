//! Deterministic nonce derivation.
//!
//! Nonces are never stored. Every encrypted body carries enough tags (path
//! id, generation, commit salt, chunk index) to recompute its nonce:
//!
//!   nonce = SHA-256("mailfs-nonce-v1" || path_id || generation || salt || slot)[..12]

use sha2::{Digest, Sha256};

use super::aes::AES_NONCE_SIZE;

const NONCE_DOMAIN: &[u8] = b"mailfs-nonce-v1";

/// Which body of a commit a nonce belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceSlot {
    Manifest,
    Chunk(u32),
}

/// The tags a nonce is derived from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonceContext<'a> {
    pub path_id: &'a str,
    pub generation: u64,
    pub salt: &'a str,
    pub slot: NonceSlot,
}

impl<'a> NonceContext<'a> {
    pub fn manifest(path_id: &'a str, generation: u64, salt: &'a str) -> Self {
        Self {
            path_id,
            generation,
            salt,
            slot: NonceSlot::Manifest,
        }
    }

    pub fn chunk(path_id: &'a str, generation: u64, salt: &'a str, index: u32) -> Self {
        Self {
            path_id,
            generation,
            salt,
            slot: NonceSlot::Chunk(index),
        }
    }
}

/// Derive the 96-bit AES-GCM nonce for a context.
///
/// Each field is length-prefixed so no two distinct contexts can hash the
/// same byte string.
pub fn derive_nonce(ctx: &NonceContext<'_>) -> [u8; AES_NONCE_SIZE] {
    let mut hasher = Sha256::new();
    hasher.update(NONCE_DOMAIN);
    hasher.update((ctx.path_id.len() as u32).to_be_bytes());
    hasher.update(ctx.path_id.as_bytes());
    hasher.update(ctx.generation.to_be_bytes());
    hasher.update((ctx.salt.len() as u32).to_be_bytes());
    hasher.update(ctx.salt.as_bytes());
    match ctx.slot {
        NonceSlot::Manifest => hasher.update([0u8]),
        NonceSlot::Chunk(index) => {
            hasher.update([1u8]);
            hasher.update(index.to_be_bytes());
        }
    }
    let digest = hasher.finalize();

    let mut nonce = [0u8; AES_NONCE_SIZE];
    nonce.copy_from_slice(&digest[..AES_NONCE_SIZE]);
    nonce
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nonce_is_deterministic() {
        let ctx = NonceContext::chunk("ab", 3, "00ff", 7);
        assert_eq!(derive_nonce(&ctx), derive_nonce(&ctx.clone()));
    }

    #[test]
    fn test_nonce_varies_with_every_field() {
        let base = derive_nonce(&NonceContext::chunk("ab", 3, "00ff", 7));
        assert_ne!(base, derive_nonce(&NonceContext::chunk("ac", 3, "00ff", 7)));
        assert_ne!(base, derive_nonce(&NonceContext::chunk("ab", 4, "00ff", 7)));
        assert_ne!(base, derive_nonce(&NonceContext::chunk("ab", 3, "00fe", 7)));
        assert_ne!(base, derive_nonce(&NonceContext::chunk("ab", 3, "00ff", 8)));
        assert_ne!(base, derive_nonce(&NonceContext::manifest("ab", 3, "00ff")));
    }
}
