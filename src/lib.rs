//! mailfs: an encrypted, chunked file tree stored as messages in a single
//! IMAP mailbox.
//!
//! Layers, bottom up: `crypto` (keys and the payload codec), `mapping`
//! (paths, headers, manifests, chunking), `store` (the `MailStore` seam and
//! the publish/read engine), `fuse` (the POSIX-like surface) and `sync`
//! (background retries and the orphan sweep).

pub mod config;
pub mod crypto;
pub mod fuse;
pub mod mapping;
pub mod store;
pub mod sync;
