//! Mount configuration.
//!
//! Plain data populated by `main` from CLI flags and environment variables.
//! The passphrase is held in memory only and zeroized on drop.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::codec::{encoded_len_for, HEADER_RESERVE};
use crate::crypto::hkdf::DEFAULT_KDF_ROUNDS;
use crate::mapping::chunking::DEFAULT_CHUNK_SIZE;
use crate::store::memory::DEFAULT_MAX_MESSAGE_SIZE;
use crate::store::retry::RetryPolicy;

/// Default staleness bound for entries learned from remote search.
pub const DEFAULT_STALENESS: Duration = Duration::from_secs(30);

/// Default memory budget for decrypted chunks (256 MiB).
pub const DEFAULT_CONTENT_CACHE_BYTES: usize = 256 * 1024 * 1024;

/// Default background daemon tick.
pub const DEFAULT_DAEMON_TICK: Duration = Duration::from_secs(30);

/// Default orphan sweep interval.
pub const DEFAULT_SWEEP_INTERVAL: Duration = Duration::from_secs(15 * 60);

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Passphrase must not be empty")]
    EmptyPassphrase,
    #[error("Mailbox name must not be empty")]
    EmptyMailbox,
    #[error("Chunk size must be greater than zero")]
    ZeroChunkSize,
    #[error(
        "Chunk size {chunk_size} encodes to {encoded} bytes, over the {limit} byte message limit"
    )]
    ChunkTooLarge {
        chunk_size: u32,
        encoded: usize,
        limit: usize,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("Home directory not found; pass a mount point explicitly")]
    NoHomeDir,
}

#[derive(Clone)]
pub struct MountConfig {
    /// Derives every key for the mount.
    pub passphrase: Zeroizing<String>,
    /// Mailbox (IMAP folder) holding the file tree.
    pub mailbox: String,
    /// PBKDF2 rounds applied to the passphrase. Every mount of a mailbox
    /// must use the same count.
    pub kdf_rounds: u32,
    /// Chunk size for newly written files.
    pub chunk_size: u32,
    /// How long an entry learned from remote search is trusted.
    pub staleness: Duration,
    /// Remote per-message size limit.
    pub max_message_size: usize,
    pub retry_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    /// Deadline for a single remote call.
    pub op_timeout: Duration,
    /// Parallel chunk uploads within one publish.
    pub upload_concurrency: usize,
    /// Memory budget for decrypted chunk plaintext.
    pub content_cache_bytes: usize,
    pub sweep_on_mount: bool,
    pub sweep_interval: Duration,
    pub daemon_tick: Duration,
    pub mount_point: Option<PathBuf>,
}

impl Default for MountConfig {
    fn default() -> Self {
        let retry = RetryPolicy::default();
        Self {
            passphrase: Zeroizing::new(String::new()),
            mailbox: "INBOX".to_string(),
            kdf_rounds: DEFAULT_KDF_ROUNDS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            staleness: DEFAULT_STALENESS,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            retry_attempts: retry.max_attempts,
            retry_base_delay: retry.base_delay,
            retry_max_delay: retry.max_delay,
            op_timeout: retry.op_timeout,
            upload_concurrency: 4,
            content_cache_bytes: DEFAULT_CONTENT_CACHE_BYTES,
            sweep_on_mount: true,
            sweep_interval: DEFAULT_SWEEP_INTERVAL,
            daemon_tick: DEFAULT_DAEMON_TICK,
            mount_point: None,
        }
    }
}

impl fmt::Debug for MountConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MountConfig")
            .field("passphrase", &"<redacted>")
            .field("mailbox", &self.mailbox)
            .field("kdf_rounds", &self.kdf_rounds)
            .field("chunk_size", &self.chunk_size)
            .field("staleness", &self.staleness)
            .field("max_message_size", &self.max_message_size)
            .field("upload_concurrency", &self.upload_concurrency)
            .field("sweep_on_mount", &self.sweep_on_mount)
            .field("mount_point", &self.mount_point)
            .finish_non_exhaustive()
    }
}

impl MountConfig {
    /// Reject settings the engine cannot honor. A full chunk must fit in one
    /// message, so this is where oversized chunk sizes are caught.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.passphrase.is_empty() {
            return Err(ConfigError::EmptyPassphrase);
        }
        if self.mailbox.trim().is_empty() {
            return Err(ConfigError::EmptyMailbox);
        }
        if self.chunk_size == 0 {
            return Err(ConfigError::ZeroChunkSize);
        }
        if self.kdf_rounds == 0 {
            return Err(ConfigError::Zero("KDF rounds"));
        }
        if self.upload_concurrency == 0 {
            return Err(ConfigError::Zero("upload concurrency"));
        }
        if self.retry_attempts == 0 {
            return Err(ConfigError::Zero("retry attempts"));
        }
        if self.daemon_tick.is_zero() {
            return Err(ConfigError::Zero("daemon tick"));
        }

        let encoded = encoded_len_for(self.chunk_size as usize);
        if encoded + HEADER_RESERVE > self.max_message_size {
            return Err(ConfigError::ChunkTooLarge {
                chunk_size: self.chunk_size,
                encoded,
                limit: self.max_message_size,
            });
        }
        Ok(())
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.retry_attempts,
            base_delay: self.retry_base_delay,
            max_delay: self.retry_max_delay,
            op_timeout: self.op_timeout,
        }
    }

    /// Mount point, defaulting to ~/MailFs.
    pub fn mount_point(&self) -> Result<PathBuf, ConfigError> {
        match &self.mount_point {
            Some(path) => Ok(path.clone()),
            None => dirs::home_dir()
                .map(|home| home.join("MailFs"))
                .ok_or(ConfigError::NoHomeDir),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> MountConfig {
        MountConfig {
            passphrase: Zeroizing::new("hunter2".to_string()),
            ..MountConfig::default()
        }
    }

    #[test]
    fn test_default_with_passphrase_is_valid() {
        assert_eq!(config().validate(), Ok(()));
        assert_eq!(config().chunk_size, 256 * 1024);
    }

    #[test]
    fn test_empty_passphrase_rejected() {
        assert_eq!(
            MountConfig::default().validate(),
            Err(ConfigError::EmptyPassphrase)
        );
    }

    #[test]
    fn test_chunk_size_must_fit_message_limit() {
        let mut c = config();
        c.max_message_size = 64 * 1024;
        c.chunk_size = 64 * 1024;
        assert!(matches!(
            c.validate(),
            Err(ConfigError::ChunkTooLarge { .. })
        ));

        c.chunk_size = 32 * 1024;
        assert_eq!(c.validate(), Ok(()));
    }

    #[test]
    fn test_zero_kdf_rounds_rejected() {
        let mut c = config();
        assert_eq!(c.kdf_rounds, 100_000);
        c.kdf_rounds = 0;
        assert_eq!(c.validate(), Err(ConfigError::Zero("KDF rounds")));
    }

    #[test]
    fn test_debug_redacts_passphrase() {
        let rendered = format!("{:?}", config());
        assert!(!rendered.contains("hunter2"));
    }

    #[test]
    fn test_explicit_mount_point() {
        let mut c = config();
        c.mount_point = Some(PathBuf::from("/mnt/mail"));
        assert_eq!(c.mount_point().unwrap(), PathBuf::from("/mnt/mail"));
    }
}
