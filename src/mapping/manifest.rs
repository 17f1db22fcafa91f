//! Manifest types and encryption.
//!
//! Uses Serde `rename_all = "camelCase"` for the JSON body, which is then
//! sealed by the chunk codec exactly like a content chunk.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use zeroize::Zeroize;

use super::chunking::{chunk_count, chunk_len};
use crate::crypto::codec::{ChunkCodec, CodecError, EncodedChunk};
use crate::crypto::nonce::NonceContext;
use crate::store::transport::MessageId;

/// Current manifest schema version.
pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum ManifestError {
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("Serialization failed")]
    SerializationFailed,
    #[error("Deserialization failed")]
    DeserializationFailed,
    #[error("Invalid manifest: {0}")]
    Invalid(String),
}

/// What a path is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum NodeKind {
    File,
    Directory,
    Symlink { target: String },
}

/// The commit a chunk message was written by. Its nonce is derived from
/// these values, so they travel with every reference to the chunk, including
/// references from manifests at other paths after a rename.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkOrigin {
    pub path_id: String,
    pub generation: u64,
    pub salt: String,
}

/// Reference from a manifest to one stored chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRef {
    pub index: u32,
    pub plain_len: u64,
    pub encoded_len: u64,
    /// SHA-256 hex of the plaintext.
    pub checksum: String,
    pub message_id: MessageId,
    pub origin: ChunkOrigin,
}

/// Decrypted manifest body: everything known about one path at one generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Manifest {
    pub version: u32,
    pub path: String,
    pub generation: u64,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    /// Chunk size this file was laid out with.
    pub chunk_size: u32,
    pub chunks: Vec<ChunkRef>,
}

impl Manifest {
    /// Structural checks. A manifest that fails these is corrupt.
    pub fn validate(&self) -> Result<(), ManifestError> {
        let invalid = |msg: String| Err(ManifestError::Invalid(msg));

        if self.version != MANIFEST_VERSION {
            return invalid(format!("unsupported version {}", self.version));
        }
        if !self.path.starts_with('/') {
            return invalid(format!("relative path {:?}", self.path));
        }
        if self.chunk_size == 0 {
            return invalid("zero chunk size".to_string());
        }
        for (expected, chunk) in self.chunks.iter().enumerate() {
            if chunk.index as usize != expected {
                return invalid(format!(
                    "chunk index {} at position {}",
                    chunk.index, expected
                ));
            }
        }

        match &self.kind {
            NodeKind::File => {
                let Some(count) = chunk_count(self.size, self.chunk_size) else {
                    return invalid(format!(
                        "size {} exceeds the chunk index space",
                        self.size
                    ));
                };
                if self.chunks.len() != count as usize {
                    return invalid(format!(
                        "{} chunks for size {} (expected {})",
                        self.chunks.len(),
                        self.size,
                        count
                    ));
                }
                for chunk in &self.chunks {
                    let len = chunk_len(chunk.index, self.size, self.chunk_size);
                    if chunk.plain_len != len {
                        return invalid(format!(
                            "chunk {} has length {} (expected {})",
                            chunk.index, chunk.plain_len, len
                        ));
                    }
                }
            }
            NodeKind::Directory | NodeKind::Symlink { .. } => {
                if !self.chunks.is_empty() {
                    return invalid("non-file manifest references chunks".to_string());
                }
            }
        }
        Ok(())
    }

    /// Serialize and seal the manifest body.
    pub fn encrypt(
        &self,
        codec: &ChunkCodec,
        ctx: &NonceContext<'_>,
    ) -> Result<EncodedChunk, ManifestError> {
        let mut json = serde_json::to_vec(self).map_err(|_| ManifestError::SerializationFailed)?;
        let result = codec.encode(&json, ctx).map_err(ManifestError::from);
        json.zeroize();
        result
    }

    /// Open and parse a manifest body, then validate it.
    pub fn decrypt(
        payload: &[u8],
        codec: &ChunkCodec,
        ctx: &NonceContext<'_>,
    ) -> Result<Self, ManifestError> {
        let json = codec.decode(payload, ctx, None)?;
        let manifest: Manifest = serde_json::from_slice(&json).map_err(|e| {
            log::error!("Manifest parse failed: {}", e);
            ManifestError::DeserializationFailed
        })?;
        manifest.validate()?;
        Ok(manifest)
    }
}

#[cfg(test)]
impl Manifest {
    /// Generation-0 directory manifest.
    pub(crate) fn placeholder(path: &str, mode: u32, now_ms: u64, chunk_size: u32) -> Self {
        Self {
            version: MANIFEST_VERSION,
            path: path.to_string(),
            generation: 0,
            kind: NodeKind::Directory,
            size: 0,
            mode,
            mtime_ms: now_ms,
            ctime_ms: now_ms,
            chunk_size,
            chunks: Vec::new(),
        }
    }
}
