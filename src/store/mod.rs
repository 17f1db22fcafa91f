//! Store engine and the remote-store seam it talks through.

pub mod coordinator;
pub mod engine;
pub mod memory;
pub mod retry;
pub mod transport;

pub use coordinator::PublishCoordinator;
pub use engine::{ChunkUpload, PublishRequest, PublishedManifest, StoreEngine, SweepReport};
pub use memory::MemoryMailbox;
pub use retry::RetryPolicy;
pub use transport::{FetchParts, FetchedMessage, MailStore, MessageId, SearchCriteria, TransportError};

use thiserror::Error;

use crate::mapping::ManifestError;

/// Errors surfaced by the store engine.
///
/// Only `TransientStore` is retried internally; every other kind reaches the
/// filesystem surface as-is.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Transient store failure during {op}: {source}")]
    TransientStore {
        op: &'static str,
        #[source]
        source: TransportError,
    },
    #[error("Authentication failed: {0}")]
    Auth(String),
    #[error("Not found: {0}")]
    NotFound(String),
    #[error("Corrupt data for {path}: {reason}")]
    Corruption { path: String, reason: String },
    #[error("Generation conflict on {path}: based on {expected:?}, found {found:?}")]
    GenerationConflict {
        path: String,
        expected: Option<u64>,
        found: Option<u64>,
    },
    #[error("Payload of {size} bytes exceeds limit of {limit} bytes")]
    Capacity { size: usize, limit: usize },
    #[error("Protocol error: {0}")]
    Protocol(String),
}

impl StoreError {
    pub fn from_transport(op: &'static str, err: TransportError) -> Self {
        match err {
            TransportError::Timeout | TransportError::Connection(_) => {
                StoreError::TransientStore { op, source: err }
            }
            TransportError::Auth(msg) => StoreError::Auth(msg),
            TransportError::TooLarge { size, limit } => StoreError::Capacity { size, limit },
            TransportError::Protocol(msg) => StoreError::Protocol(msg),
            TransportError::NoSuchMessage(id) => StoreError::NotFound(format!("message {}", id)),
        }
    }

    pub fn corruption(path: &str, reason: impl ToString) -> Self {
        StoreError::Corruption {
            path: path.to_string(),
            reason: reason.to_string(),
        }
    }

    pub fn from_manifest(path: &str, err: ManifestError) -> Self {
        match err {
            ManifestError::Codec(crate::crypto::CodecError::TooLarge { size, limit }) => {
                StoreError::Capacity { size, limit }
            }
            other => StoreError::corruption(path, other),
        }
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::TransientStore { .. })
    }
}
