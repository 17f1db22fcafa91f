//! Derivation of the per-mount key material.
//!
//! Derivation path:
//!   passphrase
//!     -> PBKDF2-HMAC-SHA256(salt="mailfs-v1:<mailbox>", rounds)
//!     -> HKDF-SHA256(salt="mailfs-v1", info=<domain>:<mailbox>)
//!     -> 32-byte content key (AES-256-GCM for chunk and manifest bodies)
//!     -> 32-byte path key (keyed hashing of paths into header tags)
//!
//! Both keys are re-derived on every mount; nothing derived here is persisted.
//! The round count is part of the key: a mailbox written with one count is
//! unreadable with another.

use hkdf::Hkdf;
use pbkdf2::pbkdf2_hmac;
use sha2::Sha256;
use thiserror::Error;
use zeroize::Zeroizing;

use super::aes::AES_KEY_SIZE;

/// Common HKDF salt for all mailfs derivations.
const HKDF_SALT: &[u8] = b"mailfs-v1";

/// HKDF info prefix for the content encryption key.
const CONTENT_KEY_INFO_PREFIX: &str = "mailfs-content-key-v1:";

/// HKDF info prefix for the path hashing key.
const PATH_KEY_INFO_PREFIX: &str = "mailfs-path-key-v1:";

/// PBKDF2 salt prefix; the mailbox name follows.
const STRETCH_SALT_PREFIX: &str = "mailfs-v1:";

/// Default PBKDF2 round count.
pub const DEFAULT_KDF_ROUNDS: u32 = 100_000;

#[derive(Debug, Error)]
pub enum HkdfError {
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,
    #[error("PBKDF2 round count must be at least 1")]
    ZeroRounds,
    #[error("HKDF derivation failed")]
    DerivationFailed,
}

/// Key material for one mount. Zeroized on drop.
pub struct MountKeys {
    pub content_key: Zeroizing<[u8; AES_KEY_SIZE]>,
    pub path_key: Zeroizing<[u8; AES_KEY_SIZE]>,
}

fn expand(hk: &Hkdf<Sha256>, prefix: &str, mailbox: &str) -> Result<Zeroizing<[u8; 32]>, HkdfError> {
    let info = format!("{}{}", prefix, mailbox);
    let mut okm = Zeroizing::new([0u8; AES_KEY_SIZE]);
    hk.expand(info.as_bytes(), &mut okm[..])
        .map_err(|_| HkdfError::DerivationFailed)?;
    Ok(okm)
}

/// Derive the content and path keys for `mailbox` from a passphrase,
/// stretched with `rounds` of PBKDF2-HMAC-SHA256.
///
/// The mailbox name is folded into both the PBKDF2 salt and the HKDF info so
/// the same passphrase used for two mailboxes yields unrelated keys.
pub fn derive_mount_keys(
    passphrase: &[u8],
    mailbox: &str,
    rounds: u32,
) -> Result<MountKeys, HkdfError> {
    if passphrase.is_empty() {
        return Err(HkdfError::EmptyPassphrase);
    }
    if rounds == 0 {
        return Err(HkdfError::ZeroRounds);
    }

    let salt = format!("{}{}", STRETCH_SALT_PREFIX, mailbox);
    let mut stretched = Zeroizing::new([0u8; AES_KEY_SIZE]);
    pbkdf2_hmac::<Sha256>(passphrase, salt.as_bytes(), rounds, &mut stretched[..]);

    let hk = Hkdf::<Sha256>::new(Some(HKDF_SALT), &stretched[..]);
    Ok(MountKeys {
        content_key: expand(&hk, CONTENT_KEY_INFO_PREFIX, mailbox)?,
        path_key: expand(&hk, PATH_KEY_INFO_PREFIX, mailbox)?,
    })
}
