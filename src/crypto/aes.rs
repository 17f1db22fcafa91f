//! AES-256-GCM encryption/decryption.
//!
//! Ciphertext format: Ciphertext || Auth Tag (16 bytes). The nonce is never
//! stored next to the ciphertext; callers re-derive it from the message tags
//! (see `nonce::derive_nonce`).

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use thiserror::Error;

/// AES-256-GCM key size in bytes (256 bits).
pub const AES_KEY_SIZE: usize = 32;

/// AES-GCM nonce size in bytes (96 bits).
pub const AES_NONCE_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes (128 bits).
pub const AES_TAG_SIZE: usize = 16;

#[derive(Debug, Error)]
pub enum AesError {
    #[error("Encryption failed")]
    EncryptionFailed,
    /// Raised on authentication tag mismatch as well as on truncated input.
    #[error("Decryption failed")]
    DecryptionFailed,
}

/// Encrypt data using AES-256-GCM.
///
/// Returns ciphertext with the 16-byte auth tag appended.
pub fn encrypt_aes_gcm(
    plaintext: &[u8],
    key: &[u8; AES_KEY_SIZE],
    nonce: &[u8; AES_NONCE_SIZE],
) -> Result<Vec<u8>, AesError> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AesError::EncryptionFailed)?;
    let nonce = Nonce::from_slice(nonce);

    cipher
        .encrypt(nonce, plaintext)
        .map_err(|_| AesError::EncryptionFailed)
}

/// Decrypt data using AES-256-GCM.
///
/// Expects ciphertext with the 16-byte auth tag appended.
pub fn decrypt_aes_gcm(
    ciphertext: &[u8],
    key: &[u8; AES_KEY_SIZE],
    nonce: &[u8; AES_NONCE_SIZE],
) -> Result<Vec<u8>, AesError> {
    if ciphertext.len() < AES_TAG_SIZE {
        return Err(AesError::DecryptionFailed);
    }

    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| AesError::DecryptionFailed)?;
    let nonce = Nonce::from_slice(nonce);

    cipher
        .decrypt(nonce, ciphertext)
        .map_err(|_| AesError::DecryptionFailed)
}
