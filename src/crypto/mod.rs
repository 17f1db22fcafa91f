//! mailfs crypto module
//!
//! Key derivation, deterministic nonces, and the chunk codec that turns
//! plaintext into 7-bit clean message bodies and back.

pub mod aes;
pub mod codec;
pub mod hkdf;
pub mod nonce;
pub mod utils;

// Re-export primary functions for convenience
pub use aes::{decrypt_aes_gcm, encrypt_aes_gcm};
pub use codec::{ChunkCodec, CodecError, EncodedChunk};
pub use hkdf::{derive_mount_keys, MountKeys};
pub use nonce::{derive_nonce, NonceContext, NonceSlot};
pub use utils::{generate_commit_salt, path_id, sha256_hex};
