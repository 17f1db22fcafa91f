//! Message mapping: how a file tree is laid out as messages in one mailbox.
//!
//! A path's current state is one manifest message (metadata plus the ordered
//! chunk list). Content lives in chunk messages, one per fixed-size slice of
//! the file. Both are immutable; every change appends a new generation.

pub mod chunking;
pub mod headers;
pub mod manifest;
pub mod path;

pub use chunking::{chunk_count, chunk_len, chunk_offset, chunk_span, max_file_size};
pub use headers::{MessageKind, MessageTags, TagError};
pub use manifest::{ChunkOrigin, ChunkRef, Manifest, ManifestError, NodeKind};
