//! Store engine: sequences search/fetch/append/delete against one mailbox.
//!
//! Commit protocol for a path (append-then-retire):
//!
//! 1. take the path lock and a commit guard (keeps the sweep out)
//! 2. check the base generation against the manifest current right now
//! 3. reserve a fresh generation and commit salt
//! 4. size every new chunk and the manifest; refuse oversized bodies
//!    before anything is sent
//! 5. encode and append chunk messages, at most `upload_concurrency` at once
//! 6. append the manifest: this is the commit point
//! 7. mark the superseded manifest and its unreused chunks deleted
//!
//! A crash before 6 leaves the old generation current and some unreferenced
//! chunk messages, which `sweep_orphans` later removes. A failure in 7 is
//! queued and retried; the new generation is already current either way.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex as AsyncMutex, Semaphore};
use tokio::task::JoinSet;
use zeroize::Zeroizing;

use super::coordinator::{CommitRecord, PublishCoordinator};
use super::retry::RetryPolicy;
use super::transport::{FetchParts, FetchedMessage, MailStore, MessageId, SearchCriteria};
use super::StoreError;
use crate::config::MountConfig;
use crate::crypto::codec::{encoded_len_for, ChunkCodec, CodecError};
use crate::crypto::hkdf::MountKeys;
use crate::crypto::nonce::NonceContext;
use crate::crypto::utils::{generate_commit_salt, path_id, sha256_hex};
use crate::mapping::headers::{self, MessageKind, MessageTags};
use crate::mapping::manifest::{ChunkOrigin, ChunkRef, Manifest, NodeKind, MANIFEST_VERSION};
use crate::mapping::path;
use crate::sync::queue::{RetryError, RetryHandler, RetryQueue};

/// Message id used while sizing a draft manifest. As wide as any real id.
const DRAFT_MESSAGE_ID: MessageId = MessageId::MAX;

/// A manifest together with the message that stores it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedManifest {
    pub manifest: Manifest,
    pub message_id: MessageId,
}

impl PublishedManifest {
    pub fn generation(&self) -> u64 {
        self.manifest.generation
    }
}

/// Content of one chunk slot in a publish.
pub enum ChunkUpload {
    /// Keep an existing chunk message.
    Reuse(ChunkRef),
    /// Encode and append this plaintext.
    Upload(Zeroizing<Vec<u8>>),
    /// Encode and append this many zero bytes. The zeros are only
    /// materialized while the chunk is being encoded.
    Zeros(usize),
}

/// Everything needed to commit the next generation of a path.
pub struct PublishRequest {
    pub path: String,
    /// The record the change diverged from; `None` for a path that must not
    /// exist yet.
    pub base: Option<PublishedManifest>,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub chunk_size: u32,
    /// One entry per chunk index, in order.
    pub chunks: Vec<ChunkUpload>,
}

/// Superseded messages whose deletion has not happened yet.
#[derive(Debug, Clone)]
pub struct Retirement {
    pub path: String,
    pub ids: Vec<MessageId>,
}

impl fmt::Display for Retirement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "retire {} message(s) of {}", self.ids.len(), self.path)
    }
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub manifests_deleted: usize,
    pub chunks_deleted: usize,
    /// Chunk deletion is skipped when a live manifest could not be read.
    pub chunks_skipped: bool,
}

/// Header-level view of one stored message.
struct TaggedMessage {
    id: MessageId,
    tags: MessageTags,
}

/// Plaintext of a chunk waiting for its upload slot.
enum PendingChunk {
    Data(Zeroizing<Vec<u8>>),
    Zeros(usize),
}

/// What the manifest needs to know about an appended chunk.
struct UploadedChunk {
    index: u32,
    message_id: MessageId,
    checksum: String,
    encoded_len: u64,
}

pub struct StoreEngine<S: MailStore> {
    store: Arc<S>,
    mailbox: String,
    codec: Arc<ChunkCodec>,
    path_key: Zeroizing<[u8; 32]>,
    retry: RetryPolicy,
    upload_concurrency: usize,
    coordinator: PublishCoordinator,
    retire_queue: AsyncMutex<RetryQueue<Retirement>>,
}

impl<S: MailStore> StoreEngine<S> {
    pub fn new(store: Arc<S>, keys: MountKeys, config: &MountConfig) -> Self {
        let MountKeys {
            content_key,
            path_key,
        } = keys;
        Self {
            store,
            mailbox: config.mailbox.clone(),
            codec: Arc::new(ChunkCodec::new(content_key, config.max_message_size)),
            path_key,
            retry: config.retry_policy(),
            upload_concurrency: config.upload_concurrency.max(1),
            coordinator: PublishCoordinator::new(),
            retire_queue: AsyncMutex::new(RetryQueue::new(config.retry_attempts)),
        }
    }

    pub fn mailbox(&self) -> &str {
        &self.mailbox
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn codec(&self) -> &ChunkCodec {
        &self.codec
    }

    /// Opaque id of a path as it appears in message tags.
    pub fn path_id(&self, path: &str) -> String {
        path_id(&self.path_key, path)
    }

    fn ancestor_ids(&self, path: &str) -> Vec<String> {
        path::ancestors(path)
            .into_iter()
            .map(|dir| self.path_id(dir))
            .collect()
    }

    // ── remote helpers ──────────────────────────────────────────────────

    async fn search(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<MessageId>, StoreError> {
        self.retry
            .run("search", || self.store.search(&self.mailbox, criteria))
            .await
    }

    async fn fetch(&self, id: MessageId, parts: FetchParts) -> Result<FetchedMessage, StoreError> {
        self.retry
            .run("fetch", || self.store.fetch(&self.mailbox, id, parts))
            .await
    }

    /// Search, then fetch headers of every hit. Messages that vanished in
    /// between or carry unparseable tags are skipped.
    async fn search_tagged(
        &self,
        criteria: &SearchCriteria,
    ) -> Result<Vec<TaggedMessage>, StoreError> {
        let ids = self.search(criteria).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let message = match self.fetch(id, FetchParts::Headers).await {
                Ok(message) => message,
                Err(StoreError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            match MessageTags::from_message(&message) {
                Ok(tags) => out.push(TaggedMessage { id, tags }),
                Err(e) => log::debug!("Skipping message {} with bad tags: {}", id, e),
            }
        }
        Ok(out)
    }

    /// Manifest messages for exactly this path id.
    async fn manifests_for(&self, path_id: &str) -> Result<Vec<TaggedMessage>, StoreError> {
        Ok(self
            .search_tagged(&headers::manifests_for(path_id))
            .await?
            .into_iter()
            .filter(|m| m.tags.kind == MessageKind::Manifest && m.tags.path_id == path_id)
            .collect())
    }

    async fn fetch_manifest(
        &self,
        path: &str,
        message: &TaggedMessage,
    ) -> Result<PublishedManifest, StoreError> {
        let fetched = self.fetch(message.id, FetchParts::Full).await?;
        let body = fetched
            .body
            .ok_or_else(|| StoreError::Protocol(format!("message {} has no body", message.id)))?;
        let ctx = NonceContext::manifest(
            &message.tags.path_id,
            message.tags.generation,
            &message.tags.salt,
        );
        let manifest = Manifest::decrypt(&body, &self.codec, &ctx)
            .map_err(|e| StoreError::from_manifest(path, e))?;
        if manifest.generation != message.tags.generation {
            return Err(StoreError::corruption(
                path,
                format!(
                    "manifest body says generation {}, tags say {}",
                    manifest.generation, message.tags.generation
                ),
            ));
        }
        Ok(PublishedManifest {
            manifest,
            message_id: message.id,
        })
    }

    async fn append(
        &self,
        op: &'static str,
        tags: &MessageTags,
        body: &str,
    ) -> Result<MessageId, StoreError> {
        let headers = tags.to_headers();
        self.retry
            .run(op, || {
                self.store
                    .append(&self.mailbox, &headers, body.as_bytes())
            })
            .await
    }

    /// Flag messages deleted and expunge. Already-gone messages count as
    /// deleted. Returns the ids that could not be flagged.
    async fn delete_messages(&self, ids: &[MessageId]) -> Result<(), (Vec<MessageId>, StoreError)> {
        let mut failed = Vec::new();
        let mut last_error = None;
        for &id in ids {
            match self
                .retry
                .run("mark deleted", || self.store.mark_deleted(&self.mailbox, id))
                .await
            {
                Ok(()) | Err(StoreError::NotFound(_)) => {}
                Err(e) => {
                    failed.push(id);
                    last_error = Some(e);
                }
            }
        }
        if let Err(e) = self
            .retry
            .run("expunge", || self.store.expunge(&self.mailbox))
            .await
        {
            // Flags are set; the next successful expunge removes them.
            log::warn!("Expunge failed: {}", e);
        }
        match last_error {
            Some(e) => Err((failed, e)),
            None => Ok(()),
        }
    }

    /// Delete superseded messages, queueing whatever fails.
    async fn retire(&self, path: &str, ids: Vec<MessageId>) {
        if ids.is_empty() {
            return;
        }
        log::debug!("Retiring {} message(s) of {}", ids.len(), path);
        if let Err((failed, e)) = self.delete_messages(&ids).await {
            log::warn!(
                "Retiring {} message(s) of {} failed, queued: {}",
                failed.len(),
                path,
                e
            );
            self.retire_queue.lock().await.enqueue(Retirement {
                path: path.to_string(),
                ids: failed,
            });
        }
    }

    // ── operations ──────────────────────────────────────────────────────

    /// Current manifest of a path according to the remote store.
    ///
    /// Search lag means a manifest appended moments ago may not be found;
    /// callers consult the local snapshot first.
    pub async fn read(&self, path: &str) -> Result<Option<PublishedManifest>, StoreError> {
        let path_id = self.path_id(path);
        let candidates = self.manifests_for(&path_id).await?;
        let Some(current) = candidates.iter().max_by_key(|m| m.tags.generation) else {
            return Ok(None);
        };
        self.coordinator
            .observe(&path_id, current.tags.generation);

        let record = self.fetch_manifest(path, current).await?;
        if record.manifest.path != path {
            return Err(StoreError::corruption(
                path,
                format!("manifest names {:?}", record.manifest.path),
            ));
        }
        Ok(Some(record))
    }

    /// Plaintext of one chunk of `path`.
    ///
    /// Falls back to a tag search when the recorded message id no longer
    /// resolves. Corruption is reported for this chunk only.
    pub async fn read_chunk(
        &self,
        path: &str,
        chunk: &ChunkRef,
    ) -> Result<Zeroizing<Vec<u8>>, StoreError> {
        let fetched = match self.fetch(chunk.message_id, FetchParts::Full).await {
            Ok(message) => message,
            Err(StoreError::NotFound(_)) => self.locate_chunk(path, chunk).await?,
            Err(e) => return Err(e),
        };
        let body = fetched.body.ok_or_else(|| {
            StoreError::Protocol(format!("message {} has no body", fetched.id))
        })?;

        let ctx = NonceContext::chunk(
            &chunk.origin.path_id,
            chunk.origin.generation,
            &chunk.origin.salt,
            chunk.index,
        );
        let plaintext = self
            .codec
            .decode(&body, &ctx, Some(&chunk.checksum))
            .map_err(|e| StoreError::corruption(path, format!("chunk {}: {}", chunk.index, e)))?;
        if plaintext.len() as u64 != chunk.plain_len {
            return Err(StoreError::corruption(
                path,
                format!(
                    "chunk {} is {} bytes, expected {}",
                    chunk.index,
                    plaintext.len(),
                    chunk.plain_len
                ),
            ));
        }
        Ok(plaintext)
    }

    async fn locate_chunk(&self, path: &str, chunk: &ChunkRef) -> Result<FetchedMessage, StoreError> {
        log::debug!(
            "Chunk {} of {} not at message {}, searching",
            chunk.index,
            path,
            chunk.message_id
        );
        let criteria = headers::chunk_at(
            &chunk.origin.path_id,
            chunk.origin.generation,
            &chunk.origin.salt,
            chunk.index,
        );
        let found = self.search_tagged(&criteria).await?.into_iter().find(|m| {
            m.tags.kind == MessageKind::Chunk
                && m.tags.path_id == chunk.origin.path_id
                && m.tags.generation == chunk.origin.generation
                && m.tags.salt == chunk.origin.salt
                && m.tags.chunk_index == Some(chunk.index)
        });
        match found {
            Some(message) => self.fetch(message.id, FetchParts::Full).await,
            None => Err(StoreError::NotFound(format!(
                "chunk {} of {}",
                chunk.index, path
            ))),
        }
    }

    /// Current manifests of every path below `dir`, one per path.
    pub async fn scan(&self, dir: &str) -> Result<Vec<PublishedManifest>, StoreError> {
        let dir_id = self.path_id(dir);
        let mut newest: HashMap<String, TaggedMessage> = HashMap::new();
        for message in self.search_tagged(&headers::manifests_under(&dir_id)).await? {
            if message.tags.kind != MessageKind::Manifest
                || !message.tags.ancestors.iter().any(|a| *a == dir_id)
            {
                continue;
            }
            let replace = newest
                .get(&message.tags.path_id)
                .map_or(true, |m| message.tags.generation > m.tags.generation);
            if replace {
                newest.insert(message.tags.path_id.clone(), message);
            }
        }

        let mut out = Vec::with_capacity(newest.len());
        for (path_id, message) in newest {
            self.coordinator.observe(&path_id, message.tags.generation);
            match self.fetch_manifest(dir, &message).await {
                Ok(record) if path::is_descendant(&record.manifest.path, dir) => out.push(record),
                Ok(record) => log::warn!(
                    "Manifest {} for {:?} filed under {}",
                    message.id,
                    record.manifest.path,
                    dir
                ),
                Err(e @ StoreError::Corruption { .. }) => {
                    log::error!("Unreadable manifest {} under {}: {}", message.id, dir, e)
                }
                Err(e) => return Err(e),
            }
        }
        Ok(out)
    }

    /// Names of the immediate children of `dir`, implicit directories
    /// included.
    pub async fn list(&self, dir: &str) -> Result<Vec<String>, StoreError> {
        let mut names = BTreeSet::new();
        for record in self.scan(dir).await? {
            if let Some(name) = path::child_name(dir, &record.manifest.path) {
                names.insert(name.to_string());
            }
        }
        Ok(names.into_iter().collect())
    }

    /// Commit the next generation of a path.
    pub async fn publish(&self, request: PublishRequest) -> Result<PublishedManifest, StoreError> {
        let path = request.path.clone();
        let path_id = self.path_id(&path);
        let _path_guard = self.coordinator.lock_path(&path_id).await;
        let _commit_guard = self.coordinator.commit_guard().await;

        let remote = self.manifests_for(&path_id).await?;
        let base_generation = request.base.as_ref().map(PublishedManifest::generation);
        self.check_base(&path, &path_id, base_generation, &remote)?;

        let seen = self.highest_generation(&path_id, &remote).await?;
        let generation = self.coordinator.reserve(&path_id, seen.max(base_generation));
        let salt = generate_commit_salt();

        let committed = self
            .commit(&path, &path_id, generation, &salt, request)
            .await?;

        let mut superseded: BTreeSet<MessageId> = remote
            .iter()
            .map(|m| m.id)
            .filter(|id| *id != committed.record.message_id)
            .collect();
        if let Some(base) = &committed.base {
            superseded.insert(base.message_id);
            let kept: HashSet<MessageId> = committed
                .record
                .manifest
                .chunks
                .iter()
                .map(|c| c.message_id)
                .collect();
            superseded.extend(
                base.manifest
                    .chunks
                    .iter()
                    .map(|c| c.message_id)
                    .filter(|id| !kept.contains(id)),
            );
        }
        self.retire(&path, superseded.into_iter().collect()).await;

        Ok(committed.record)
    }

    fn check_base(
        &self,
        path: &str,
        path_id: &str,
        base: Option<u64>,
        remote: &[TaggedMessage],
    ) -> Result<(), StoreError> {
        let remote_current = remote.iter().map(|m| m.tags.generation).max();
        let observed = match self.coordinator.committed(path_id) {
            Some(local) => local.max(remote_current),
            None => remote_current,
        };
        if observed != base {
            log::warn!(
                "Generation conflict on {}: based on {:?}, current is {:?}",
                path,
                base,
                observed
            );
            return Err(StoreError::GenerationConflict {
                path: path.to_string(),
                expected: base,
                found: observed,
            });
        }
        Ok(())
    }

    /// Highest generation ever used for the path, orphans included.
    ///
    /// The first time a mount publishes a path it scans every message tagged
    /// with the path; afterwards the coordinator's cache is authoritative.
    async fn highest_generation(
        &self,
        path_id: &str,
        remote: &[TaggedMessage],
    ) -> Result<Option<u64>, StoreError> {
        let mut seen = remote.iter().map(|m| m.tags.generation).max();
        if self.coordinator.known_generation(path_id).is_none() {
            let all = self.search_tagged(&headers::all_for(path_id)).await?;
            seen = seen.max(
                all.iter()
                    .filter(|m| m.tags.path_id == path_id)
                    .map(|m| m.tags.generation)
                    .max(),
            );
        }
        Ok(seen)
    }

    async fn commit(
        &self,
        path: &str,
        path_id: &str,
        generation: u64,
        salt: &str,
        request: PublishRequest,
    ) -> Result<Committed, StoreError> {
        let PublishRequest {
            base,
            kind,
            size,
            mode,
            mtime_ms,
            ctime_ms,
            chunk_size,
            chunks,
            ..
        } = request;
        let chunk_count = u32::try_from(chunks.len())
            .map_err(|_| StoreError::Protocol(format!("too many chunks for {}", path)))?;

        // Size everything first so capacity problems surface before any
        // message is appended. Encoding happens per upload slot.
        let draft_checksum = sha256_hex(&[]);
        let mut refs = Vec::with_capacity(chunks.len());
        let mut uploads = Vec::new();
        for (index, chunk) in (0..chunk_count).zip(chunks) {
            let pending = match chunk {
                ChunkUpload::Reuse(existing) => {
                    refs.push(ChunkRef { index, ..existing });
                    continue;
                }
                ChunkUpload::Upload(plaintext) => PendingChunk::Data(plaintext),
                ChunkUpload::Zeros(len) => PendingChunk::Zeros(len),
            };
            let plain_len = match &pending {
                PendingChunk::Data(plaintext) => plaintext.len(),
                PendingChunk::Zeros(len) => *len,
            };
            let encoded_len = encoded_len_for(plain_len);
            if encoded_len > self.codec.max_body_size() {
                return Err(StoreError::Capacity {
                    size: encoded_len,
                    limit: self.codec.max_body_size(),
                });
            }
            refs.push(ChunkRef {
                index,
                plain_len: plain_len as u64,
                encoded_len: encoded_len as u64,
                checksum: draft_checksum.clone(),
                message_id: DRAFT_MESSAGE_ID,
                origin: ChunkOrigin {
                    path_id: path_id.to_string(),
                    generation,
                    salt: salt.to_string(),
                },
            });
            uploads.push((index, pending));
        }

        let mut manifest = Manifest {
            version: MANIFEST_VERSION,
            path: path.to_string(),
            generation,
            kind,
            size,
            mode,
            mtime_ms,
            ctime_ms,
            chunk_size,
            chunks: refs,
        };
        manifest
            .validate()
            .map_err(|e| StoreError::Protocol(format!("refusing to publish {}: {}", path, e)))?;
        let manifest_ctx = NonceContext::manifest(path_id, generation, salt);
        manifest
            .encrypt(&self.codec, &manifest_ctx)
            .map_err(|e| StoreError::from_manifest(path, e))?;

        let ancestors = self.ancestor_ids(path);
        let uploaded = self
            .upload_chunks(path, path_id, &ancestors, generation, salt, chunk_count, uploads)
            .await?;
        for done in uploaded {
            let chunk = &mut manifest.chunks[done.index as usize];
            chunk.message_id = done.message_id;
            chunk.checksum = done.checksum;
            chunk.encoded_len = done.encoded_len;
        }

        let sealed = manifest
            .encrypt(&self.codec, &manifest_ctx)
            .map_err(|e| StoreError::from_manifest(path, e))?;
        let tags = MessageTags {
            kind: MessageKind::Manifest,
            path_id: path_id.to_string(),
            ancestors,
            generation,
            chunk_index: None,
            chunk_count,
            salt: salt.to_string(),
        };
        let message_id = match self.append("append manifest", &tags, &sealed.payload).await {
            Ok(id) => id,
            Err(e) => {
                log::warn!(
                    "Manifest append for {} generation {} failed; previous generation stays current: {}",
                    path,
                    generation,
                    e
                );
                return Err(e);
            }
        };

        self.coordinator.record_commit(
            path_id,
            Some(CommitRecord {
                generation,
                manifest_id: message_id,
                chunk_ids: manifest.chunks.iter().map(|c| c.message_id).collect(),
            }),
        );
        log::info!(
            "Committed {} generation {} ({} chunk(s))",
            path,
            generation,
            chunk_count
        );

        Ok(Committed {
            base,
            record: PublishedManifest {
                manifest,
                message_id,
            },
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn upload_chunks(
        &self,
        path: &str,
        path_id: &str,
        ancestors: &[String],
        generation: u64,
        salt: &str,
        chunk_count: u32,
        uploads: Vec<(u32, PendingChunk)>,
    ) -> Result<Vec<UploadedChunk>, StoreError> {
        if uploads.is_empty() {
            return Ok(Vec::new());
        }

        let permits = Arc::new(Semaphore::new(self.upload_concurrency));
        let mut tasks = JoinSet::new();
        for (index, pending) in uploads {
            let headers = MessageTags {
                kind: MessageKind::Chunk,
                path_id: path_id.to_string(),
                ancestors: ancestors.to_vec(),
                generation,
                chunk_index: Some(index),
                chunk_count,
                salt: salt.to_string(),
            }
            .to_headers();
            let store = Arc::clone(&self.store);
            let codec = Arc::clone(&self.codec);
            let mailbox = self.mailbox.clone();
            let retry = self.retry.clone();
            let permits = Arc::clone(&permits);
            let (path, path_id, salt) = (path.to_string(), path_id.to_string(), salt.to_string());

            tasks.spawn(async move {
                let _permit = permits
                    .acquire_owned()
                    .await
                    .map_err(|_| StoreError::Protocol("upload semaphore closed".to_string()))?;
                let plaintext = match pending {
                    PendingChunk::Data(plaintext) => plaintext,
                    PendingChunk::Zeros(len) => Zeroizing::new(vec![0u8; len]),
                };
                let ctx = NonceContext::chunk(&path_id, generation, &salt, index);
                let encoded = codec
                    .encode(&plaintext, &ctx)
                    .map_err(|e| codec_error(&path, e))?;
                drop(plaintext);

                let message_id = retry
                    .run("append chunk", || {
                        store.append(&mailbox, &headers, encoded.payload.as_bytes())
                    })
                    .await?;
                Ok::<_, StoreError>(UploadedChunk {
                    index,
                    message_id,
                    checksum: encoded.checksum,
                    encoded_len: encoded.encoded_len,
                })
            });
        }

        let mut uploaded = Vec::new();
        let mut first_error = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(done)) => uploaded.push(done),
                Ok(Err(e)) => {
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    first_error.get_or_insert(StoreError::Protocol(format!(
                        "chunk upload task failed: {}",
                        e
                    )));
                }
            }
        }

        match first_error {
            Some(e) => {
                log::warn!(
                    "Chunk upload for {} generation {} failed after {} chunk(s); \
                     fragments left for the orphan sweep: {}",
                    path,
                    generation,
                    uploaded.len(),
                    e
                );
                Err(e)
            }
            None => Ok(uploaded),
        }
    }

    /// Remove a path: its manifest(s) first, then its chunks.
    ///
    /// `known` is the caller's view of the current record, which remote
    /// search may not show yet.
    pub async fn remove(
        &self,
        path: &str,
        known: Option<&PublishedManifest>,
    ) -> Result<(), StoreError> {
        let path_id = self.path_id(path);
        let _path_guard = self.coordinator.lock_path(&path_id).await;
        let _commit_guard = self.coordinator.commit_guard().await;

        let remote = self.manifests_for(&path_id).await?;
        let mut manifests: BTreeSet<MessageId> = remote.iter().map(|m| m.id).collect();
        if let Some(record) = known {
            manifests.insert(record.message_id);
        }
        if manifests.is_empty() {
            return Err(StoreError::NotFound(path.to_string()));
        }

        let manifest_ids: Vec<MessageId> = manifests.into_iter().collect();
        if let Err((_, e)) = self.delete_messages(&manifest_ids).await {
            return Err(e);
        }
        self.coordinator.record_commit(&path_id, None);
        log::info!("Removed {}", path);

        if let Some(record) = known {
            let chunks: Vec<MessageId> = record
                .manifest
                .chunks
                .iter()
                .map(|c| c.message_id)
                .collect();
            self.retire(path, chunks).await;
        }
        Ok(())
    }

    /// Move a record to `new_path` without touching its chunk messages.
    ///
    /// One manifest append at the new path, then the old manifest is
    /// deleted. `replaced` is the destination's current record, if any; it
    /// is retired like any superseded generation.
    pub async fn rename(
        &self,
        record: &PublishedManifest,
        new_path: &str,
        replaced: Option<PublishedManifest>,
        ctime_ms: u64,
    ) -> Result<PublishedManifest, StoreError> {
        let old = &record.manifest;
        let request = PublishRequest {
            path: new_path.to_string(),
            base: replaced,
            kind: old.kind.clone(),
            size: old.size,
            mode: old.mode,
            mtime_ms: old.mtime_ms,
            ctime_ms,
            chunk_size: old.chunk_size,
            chunks: old.chunks.iter().cloned().map(ChunkUpload::Reuse).collect(),
        };
        let moved = self.publish(request).await?;

        let old_id = self.path_id(&old.path);
        {
            let _path_guard = self.coordinator.lock_path(&old_id).await;
            let _commit_guard = self.coordinator.commit_guard().await;
            let mut stale: BTreeSet<MessageId> = self
                .manifests_for(&old_id)
                .await?
                .into_iter()
                .map(|m| m.id)
                .collect();
            stale.insert(record.message_id);
            self.coordinator.record_commit(&old_id, None);
            self.retire(&old.path, stale.into_iter().collect()).await;
        }
        log::info!("Renamed {} -> {}", old.path, new_path);
        Ok(moved)
    }

    /// Verify the mount key against the root placeholder, creating it on a
    /// fresh mailbox.
    ///
    /// Path ids are keyed, so under a different passphrase the root is simply
    /// not found. Any other manifest in the mailbox then means the mailbox
    /// belongs to another passphrase; a root that does not decrypt means the
    /// same.
    pub async fn verify_root(
        &self,
        now_ms: u64,
        chunk_size: u32,
    ) -> Result<PublishedManifest, StoreError> {
        match self.read(path::ROOT).await {
            Ok(Some(root)) => Ok(root),
            Ok(None) => {
                let foreign = self
                    .search(&headers::all_of_kind(MessageKind::Manifest))
                    .await?;
                if !foreign.is_empty() {
                    return Err(StoreError::Auth(format!(
                        "{} holds {} record(s) written with a different passphrase",
                        self.mailbox,
                        foreign.len()
                    )));
                }
                log::info!("No root manifest in {}, creating one", self.mailbox);
                self.publish(PublishRequest {
                    path: path::ROOT.to_string(),
                    base: None,
                    kind: NodeKind::Directory,
                    size: 0,
                    mode: 0o755,
                    mtime_ms: now_ms,
                    ctime_ms: now_ms,
                    chunk_size,
                    chunks: Vec::new(),
                })
                .await
            }
            Err(StoreError::Corruption { reason, .. }) => Err(StoreError::Auth(format!(
                "root manifest does not decrypt (wrong passphrase?): {}",
                reason
            ))),
            Err(e) => Err(e),
        }
    }

    /// Delete superseded manifests and chunk messages no live manifest
    /// references.
    ///
    /// A chunk whose generation is above everything visible for its path
    /// may belong to another mount's commit that search does not show yet;
    /// it is left for a later sweep.
    pub async fn sweep_orphans(&self) -> Result<SweepReport, StoreError> {
        let _sweep_guard = self.coordinator.sweep_guard().await;
        let mut report = SweepReport::default();

        // Local commits may not be searchable yet; they are live regardless.
        let local: HashMap<String, CommitRecord> =
            self.coordinator.live_commits().into_iter().collect();

        let mut by_path: HashMap<String, Vec<TaggedMessage>> = HashMap::new();
        for message in self
            .search_tagged(&headers::all_of_kind(MessageKind::Manifest))
            .await?
        {
            if message.tags.kind == MessageKind::Manifest {
                by_path
                    .entry(message.tags.path_id.clone())
                    .or_default()
                    .push(message);
            }
        }

        let mut newest: HashMap<String, u64> = local
            .iter()
            .map(|(path_id, record)| (path_id.clone(), record.generation))
            .collect();
        let mut superseded = Vec::new();
        let mut live = Vec::new();
        for (path_id, messages) in by_path {
            let local_generation = local.get(&path_id).map(|r| r.generation);
            let winner = messages
                .iter()
                .map(|m| m.tags.generation)
                .max()
                .max(local_generation)
                .unwrap_or(0);
            newest.insert(path_id, winner);
            for message in messages {
                if message.tags.generation < winner {
                    superseded.push(message.id);
                } else if local_generation != Some(winner) {
                    live.push(message);
                }
            }
        }

        let mut referenced: HashSet<MessageId> = HashSet::new();
        for record in local.values() {
            referenced.extend(record.chunk_ids.iter().copied());
        }
        for message in &live {
            match self.fetch_manifest("(sweep)", message).await {
                Ok(record) => {
                    referenced.extend(record.manifest.chunks.iter().map(|c| c.message_id));
                }
                Err(e) => {
                    log::warn!(
                        "Sweep cannot read live manifest {}, keeping all chunks: {}",
                        message.id,
                        e
                    );
                    report.chunks_skipped = true;
                }
            }
        }

        let mut orphans = Vec::new();
        if !report.chunks_skipped {
            for message in self
                .search_tagged(&headers::all_of_kind(MessageKind::Chunk))
                .await?
            {
                if message.tags.kind != MessageKind::Chunk || referenced.contains(&message.id) {
                    continue;
                }
                let path_id = &message.tags.path_id;
                let settled = newest
                    .get(path_id)
                    .copied()
                    .max(self.coordinator.known_generation(path_id));
                if Some(message.tags.generation) > settled {
                    log::debug!(
                        "Keeping chunk {} of an unseen generation {}",
                        message.id,
                        message.tags.generation
                    );
                    continue;
                }
                orphans.push(message.id);
            }
        }

        report.manifests_deleted = superseded.len();
        report.chunks_deleted = orphans.len();
        let mut doomed = superseded;
        doomed.extend(orphans);
        if !doomed.is_empty() {
            if let Err((failed, e)) = self.delete_messages(&doomed).await {
                log::warn!("Sweep left {} message(s) undeleted: {}", failed.len(), e);
            }
        }
        log::info!(
            "Orphan sweep: {} superseded manifest(s), {} orphan chunk(s)",
            report.manifests_deleted,
            report.chunks_deleted
        );
        Ok(report)
    }

    /// Retry queued retirements once. Returns how many completed.
    pub async fn process_retirements(&self) -> usize {
        let mut queue = self.retire_queue.lock().await;
        queue.process(&RetireHandler { engine: self }).await
    }

    pub async fn pending_retirements(&self) -> usize {
        self.retire_queue.lock().await.len()
    }

    /// End the session.
    pub async fn logout(&self) -> Result<(), StoreError> {
        self.store
            .logout()
            .await
            .map_err(|e| StoreError::from_transport("logout", e))
    }
}

struct Committed {
    base: Option<PublishedManifest>,
    record: PublishedManifest,
}

struct RetireHandler<'a, S: MailStore> {
    engine: &'a StoreEngine<S>,
}

impl<S: MailStore> RetryHandler<Retirement> for RetireHandler<'_, S> {
    async fn attempt(&self, item: &Retirement) -> Result<(), RetryError> {
        match self.engine.delete_messages(&item.ids).await {
            Ok(()) => Ok(()),
            Err((_, e)) if e.is_transient() => Err(RetryError::Transient(e.to_string())),
            Err((_, e)) => Err(RetryError::Permanent(e.to_string())),
        }
    }
}

fn codec_error(path: &str, err: CodecError) -> StoreError {
    match err {
        CodecError::TooLarge { size, limit } => StoreError::Capacity { size, limit },
        other => StoreError::corruption(path, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::hkdf::derive_mount_keys;
    use crate::mapping::headers::{HEADER_GENERATION, HEADER_KIND, HEADER_PATH};
    use crate::store::memory::{MemoryMailbox, Operation};
    use crate::store::transport::TransportError;
    use std::time::Duration;

    const C: u32 = 16;

    fn config() -> MountConfig {
        MountConfig {
            passphrase: Zeroizing::new("pw".to_string()),
            mailbox: "INBOX".to_string(),
            chunk_size: C,
            retry_attempts: 2,
            retry_base_delay: Duration::from_millis(1),
            retry_max_delay: Duration::from_millis(2),
            op_timeout: Duration::from_secs(5),
            ..MountConfig::default()
        }
    }

    fn engine_on(store: Arc<MemoryMailbox>, passphrase: &str) -> StoreEngine<MemoryMailbox> {
        let keys = derive_mount_keys(passphrase.as_bytes(), "INBOX", 1_000).unwrap();
        StoreEngine::new(store, keys, &config())
    }

    fn engine() -> (Arc<MemoryMailbox>, StoreEngine<MemoryMailbox>) {
        let store = Arc::new(MemoryMailbox::new());
        let engine = engine_on(Arc::clone(&store), "pw");
        (store, engine)
    }

    fn file_request(path: &str, base: Option<PublishedManifest>, data: &[u8]) -> PublishRequest {
        PublishRequest {
            path: path.to_string(),
            base,
            kind: NodeKind::File,
            size: data.len() as u64,
            mode: 0o644,
            mtime_ms: 1,
            ctime_ms: 1,
            chunk_size: C,
            chunks: data
                .chunks(C as usize)
                .map(|c| ChunkUpload::Upload(Zeroizing::new(c.to_vec())))
                .collect(),
        }
    }

    async fn read_all(engine: &StoreEngine<MemoryMailbox>, record: &PublishedManifest) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in &record.manifest.chunks {
            out.extend_from_slice(&engine.read_chunk(&record.manifest.path, chunk).await.unwrap());
        }
        out
    }

    #[tokio::test]
    async fn test_publish_then_read() {
        let (_, engine) = engine();
        let data = b"hello chunked mailbox world, spanning three chunks";
        let record = engine.publish(file_request("/a.txt", None, data)).await.unwrap();
        assert_eq!(record.generation(), 0);
        assert_eq!(record.manifest.chunks.len(), 4);

        let read = engine.read("/a.txt").await.unwrap().unwrap();
        assert_eq!(read, record);
        assert_eq!(read_all(&engine, &read).await, data);
    }

    #[tokio::test]
    async fn test_new_generation_retires_old_after_commit() {
        let (store, engine) = engine();
        let g0 = engine
            .publish(file_request("/f", None, &[1u8; 48]))
            .await
            .unwrap();
        let old_ids: Vec<MessageId> = g0.manifest.chunks.iter().map(|c| c.message_id).collect();

        // Rewrite only chunk 1.
        let mut chunks: Vec<ChunkUpload> =
            g0.manifest.chunks.iter().cloned().map(ChunkUpload::Reuse).collect();
        chunks[1] = ChunkUpload::Upload(Zeroizing::new(vec![2u8; 16]));
        let before = store.append_count();
        let g1 = engine
            .publish(PublishRequest {
                chunks,
                ..file_request("/f", Some(g0.clone()), &[1u8; 48])
            })
            .await
            .unwrap();

        assert_eq!(g1.generation(), 1);
        // One chunk plus one manifest.
        assert_eq!(store.append_count() - before, 2);
        assert!(!store.contains(g0.message_id));
        assert!(!store.contains(old_ids[1]));
        assert!(store.contains(old_ids[0]));
        assert!(store.contains(old_ids[2]));

        let read = engine.read("/f").await.unwrap().unwrap();
        assert_eq!(read.generation(), 1);
        let mut expected = vec![1u8; 48];
        expected[16..32].fill(2);
        assert_eq!(read_all(&engine, &read).await, expected);
    }

    #[tokio::test]
    async fn test_crash_before_manifest_keeps_old_generation() {
        let (store, engine) = engine();
        let g0 = engine
            .publish(file_request("/f", None, b"original content!"))
            .await
            .unwrap();

        store.fail_appends_with(HEADER_KIND, "manifest", TransportError::Auth("crash".into()));
        let err = engine
            .publish(file_request("/f", Some(g0.clone()), b"replacement content"))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Auth(_)));
        store.clear_faults();

        let read = engine.read("/f").await.unwrap().unwrap();
        assert_eq!(read, g0);
        assert_eq!(read_all(&engine, &read).await, b"original content!");

        // The orphaned chunks of the failed commit are swept; g0 survives.
        let report = engine.sweep_orphans().await.unwrap();
        assert_eq!(report.chunks_deleted, 2);
        assert_eq!(read_all(&engine, &read).await, b"original content!");

        // A retry after the crash picks a fresh generation.
        let g = engine
            .publish(file_request("/f", Some(g0), b"second try"))
            .await
            .unwrap();
        assert_eq!(g.generation(), 2);
    }

    #[tokio::test]
    async fn test_conflict_when_base_is_stale() {
        let store = Arc::new(MemoryMailbox::new());
        let ours = engine_on(Arc::clone(&store), "pw");
        let g0 = ours.publish(file_request("/f", None, b"v0")).await.unwrap();

        // A second mount commits on top of g0.
        let theirs = engine_on(Arc::clone(&store), "pw");
        let remote = theirs.read("/f").await.unwrap().unwrap();
        theirs
            .publish(file_request("/f", Some(remote), b"v1 from elsewhere"))
            .await
            .unwrap();

        let err = ours
            .publish(file_request("/f", Some(g0), b"v1 from here"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            StoreError::GenerationConflict {
                expected: Some(0),
                found: Some(1),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_create_conflicts_with_existing_path() {
        let (_, engine) = engine();
        engine.publish(file_request("/f", None, b"x")).await.unwrap();
        assert!(matches!(
            engine.publish(file_request("/f", None, b"y")).await,
            Err(StoreError::GenerationConflict { expected: None, .. })
        ));
    }

    #[tokio::test]
    async fn test_own_commits_visible_despite_search_lag() {
        let store = Arc::new(MemoryMailbox::new().with_search_lag(Duration::from_secs(3600)));
        let engine = engine_on(Arc::clone(&store), "pw");
        let g0 = engine.publish(file_request("/f", None, b"a")).await.unwrap();
        // Search cannot see g0, but the base check uses the local commit.
        let g1 = engine
            .publish(file_request("/f", Some(g0.clone()), b"b"))
            .await
            .unwrap();
        assert_eq!(g1.generation(), 1);
        assert!(!store.contains(g0.message_id));
        assert!(matches!(
            engine.publish(file_request("/f", Some(g0), b"c")).await,
            Err(StoreError::GenerationConflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_rename_uploads_no_chunks() {
        let (store, engine) = engine();
        let record = engine
            .publish(file_request("/src", None, &[9u8; 80]))
            .await
            .unwrap();
        assert_eq!(record.manifest.chunks.len(), 5);

        let chunk_appends = store.appends_with(HEADER_KIND, "chunk");
        let manifest_appends = store.appends_with(HEADER_KIND, "manifest");
        let moved = engine.rename(&record, "/dst", None, 2).await.unwrap();

        assert_eq!(store.appends_with(HEADER_KIND, "chunk"), chunk_appends);
        assert_eq!(store.appends_with(HEADER_KIND, "manifest"), manifest_appends + 1);
        assert!(engine.read("/src").await.unwrap().is_none());
        assert_eq!(read_all(&engine, &moved).await, vec![9u8; 80]);
        for chunk in &record.manifest.chunks {
            assert!(store.contains(chunk.message_id));
        }
    }

    #[tokio::test]
    async fn test_rename_over_existing_retires_destination() {
        let (store, engine) = engine();
        let src = engine.publish(file_request("/a", None, b"aaaa")).await.unwrap();
        let dst = engine.publish(file_request("/b", None, b"bbbb")).await.unwrap();

        let moved = engine.rename(&src, "/b", Some(dst.clone()), 3).await.unwrap();
        assert_eq!(moved.generation(), 1);
        assert!(!store.contains(dst.message_id));
        assert!(!store.contains(dst.manifest.chunks[0].message_id));
        assert_eq!(read_all(&engine, &moved).await, b"aaaa");
    }

    #[tokio::test]
    async fn test_truncate_deletes_dropped_chunks_after_commit() {
        let (store, engine) = engine();
        let g0 = engine
            .publish(file_request("/f", None, &[5u8; 48]))
            .await
            .unwrap();
        let dropped: Vec<MessageId> =
            g0.manifest.chunks[1..].iter().map(|c| c.message_id).collect();

        // The manifest append fails: nothing may be deleted yet.
        store.fail_next(Operation::Append, TransportError::Auth("down".into()));
        let truncated = || PublishRequest {
            size: 16,
            chunks: vec![ChunkUpload::Reuse(g0.manifest.chunks[0].clone())],
            ..file_request("/f", Some(g0.clone()), &[])
        };
        assert!(engine.publish(truncated()).await.is_err());
        for id in &dropped {
            assert!(store.contains(*id));
        }

        let g1 = engine.publish(truncated()).await.unwrap();
        assert_eq!(g1.manifest.chunks.len(), 1);
        for id in &dropped {
            assert!(!store.contains(*id));
        }
        assert!(store.contains(g0.manifest.chunks[0].message_id));
    }

    #[tokio::test]
    async fn test_tampered_chunk_is_isolated() {
        let (store, engine) = engine();
        let record = engine
            .publish(file_request("/f", None, &[7u8; 48]))
            .await
            .unwrap();
        let victim = record.manifest.chunks[1].message_id;
        store.tamper_body(victim, |body| {
            body[10] = if body[10] == b'A' { b'B' } else { b'A' };
        });

        assert!(matches!(
            engine.read_chunk("/f", &record.manifest.chunks[1]).await,
            Err(StoreError::Corruption { .. })
        ));
        for i in [0, 2] {
            let plain = engine.read_chunk("/f", &record.manifest.chunks[i]).await.unwrap();
            assert_eq!(&plain[..], &[7u8; 16]);
        }
    }

    #[tokio::test]
    async fn test_capacity_checked_before_upload() {
        let store = Arc::new(MemoryMailbox::new());
        let mut cfg = config();
        cfg.max_message_size = 2048 + 200;
        let engine = StoreEngine::new(
            Arc::clone(&store),
            derive_mount_keys(b"pw", "INBOX", 1_000).unwrap(),
            &cfg,
        );
        let mut request = file_request("/big", None, &[0u8; 16]);
        request.chunks.push(ChunkUpload::Upload(Zeroizing::new(vec![0u8; 500])));
        request.size = 16 + 500;
        request.chunk_size = 500;
        let err = engine.publish(request).await.unwrap_err();
        assert!(matches!(err, StoreError::Capacity { .. }));
        assert_eq!(store.append_count(), 0);
    }

    #[tokio::test]
    async fn test_zero_chunks_are_encoded_at_upload() {
        let (store, engine) = engine();
        let mut request = file_request("/sparse", None, &[0u8; 0]);
        request.chunks = vec![
            ChunkUpload::Zeros(C as usize),
            ChunkUpload::Upload(Zeroizing::new(vec![9u8; 16])),
            ChunkUpload::Zeros(5),
        ];
        request.size = 2 * C as u64 + 5;
        let record = engine.publish(request).await.unwrap();
        assert_eq!(store.appends_with(HEADER_KIND, "chunk"), 3);

        let chunks = &record.manifest.chunks;
        assert_eq!(chunks[0].checksum, sha256_hex(&[0u8; 16]));
        assert_eq!(chunks[2].plain_len, 5);
        assert_eq!(chunks[2].encoded_len, encoded_len_for(5) as u64);

        let mut expected = vec![0u8; 16];
        expected.extend_from_slice(&[9u8; 16]);
        expected.extend_from_slice(&[0u8; 5]);
        assert_eq!(read_all(&engine, &record).await, expected);
        assert_eq!(engine.read("/sparse").await.unwrap().unwrap(), record);
    }

    #[tokio::test]
    async fn test_oversized_zero_chunk_refused_before_upload() {
        let store = Arc::new(MemoryMailbox::new());
        let mut cfg = config();
        cfg.max_message_size = 2048 + 200;
        let engine = StoreEngine::new(
            Arc::clone(&store),
            derive_mount_keys(b"pw", "INBOX", 1_000).unwrap(),
            &cfg,
        );
        let mut request = file_request("/gap", None, &[1u8; 16]);
        request.chunks.insert(0, ChunkUpload::Zeros(500));
        request.size = 516;
        request.chunk_size = 500;
        let err = engine.publish(request).await.unwrap_err();
        assert!(matches!(err, StoreError::Capacity { .. }));
        assert_eq!(store.append_count(), 0);
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let (store, engine) = engine();
        store.fail_next(Operation::Append, TransportError::Timeout);
        store.fail_next(Operation::Search, TransportError::Connection("reset".into()));
        let record = engine.publish(file_request("/f", None, b"retry me")).await.unwrap();
        assert_eq!(read_all(&engine, &record).await, b"retry me");
    }

    #[tokio::test]
    async fn test_list_and_scan() {
        let (_, engine) = engine();
        for p in ["/a", "/d/x", "/d/y", "/d/e/z"] {
            engine.publish(file_request(p, None, b"1")).await.unwrap();
        }
        assert_eq!(engine.list("/").await.unwrap(), vec!["a", "d"]);
        assert_eq!(engine.list("/d").await.unwrap(), vec!["e", "x", "y"]);
        assert_eq!(engine.scan("/d").await.unwrap().len(), 3);
        assert!(engine.list("/nope").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remove_deletes_manifest_then_chunks() {
        let (store, engine) = engine();
        let record = engine.publish(file_request("/f", None, &[1u8; 20])).await.unwrap();
        engine.remove("/f", Some(&record)).await.unwrap();
        assert!(engine.read("/f").await.unwrap().is_none());
        assert_eq!(store.live_count(), 0);
        assert!(matches!(
            engine.remove("/f", None).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_failed_retirement_is_queued() {
        let (store, engine) = engine();
        let g0 = engine.publish(file_request("/f", None, b"a")).await.unwrap();
        for _ in 0..2 {
            store.fail_next(Operation::MarkDeleted, TransportError::Timeout);
        }
        let g1 = engine
            .publish(file_request("/f", Some(g0.clone()), b"b"))
            .await
            .unwrap();
        assert_eq!(g1.generation(), 1);
        assert_eq!(engine.pending_retirements().await, 1);

        assert_eq!(engine.process_retirements().await, 1);
        assert_eq!(engine.pending_retirements().await, 0);
        assert!(!store.contains(g0.message_id));
    }

    #[tokio::test]
    async fn test_chunk_lookup_falls_back_to_search() {
        let (_, engine) = engine();
        let record = engine.publish(file_request("/f", None, b"lost id")).await.unwrap();
        let mut chunk = record.manifest.chunks[0].clone();
        chunk.message_id = 9_999;
        assert_eq!(&engine.read_chunk("/f", &chunk).await.unwrap()[..], b"lost id");
    }

    #[tokio::test]
    async fn test_verify_root_creates_root_and_detects_wrong_passphrase() {
        let store = Arc::new(MemoryMailbox::new());
        let engine = engine_on(Arc::clone(&store), "right");
        let root = engine.verify_root(0, C).await.unwrap();
        assert_eq!(root.manifest.kind, NodeKind::Directory);
        assert_eq!(engine.verify_root(0, C).await.unwrap(), root);

        // Path ids are keyed: the other passphrase cannot find the root, but
        // it does see manifests it cannot account for.
        let wrong = engine_on(Arc::clone(&store), "wrong");
        assert_eq!(store.live_with(HEADER_PATH, &engine.path_id("/")).len(), 1);
        assert!(wrong.read("/").await.unwrap().is_none());
        assert!(matches!(wrong.verify_root(0, C).await, Err(StoreError::Auth(_))));
        assert_eq!(store.appends_with(HEADER_KIND, "manifest"), 1);
    }

    #[tokio::test]
    async fn test_verify_root_reports_undecryptable_root() {
        let store = Arc::new(MemoryMailbox::new());
        let engine = engine_on(Arc::clone(&store), "pw");
        let root = engine.verify_root(0, C).await.unwrap();
        store.tamper_body(root.message_id, |body| body.truncate(body.len() / 2));

        let fresh = engine_on(Arc::clone(&store), "pw");
        assert!(matches!(fresh.verify_root(0, C).await, Err(StoreError::Auth(_))));
    }

    #[tokio::test]
    async fn test_sweep_removes_superseded_manifests() {
        let (store, engine) = engine();
        let g0 = engine.publish(file_request("/f", None, b"a")).await.unwrap();
        // Leave g0's manifest behind as if retirement never ran.
        for _ in 0..4 {
            store.fail_next(Operation::MarkDeleted, TransportError::Timeout);
        }
        let g1 = engine
            .publish(file_request("/f", Some(g0.clone()), b"b"))
            .await
            .unwrap();
        assert!(store.contains(g0.message_id));

        let fresh = engine_on(Arc::clone(&store), "pw");
        let report = fresh.sweep_orphans().await.unwrap();
        assert_eq!(report.manifests_deleted, 1);
        assert!(!store.contains(g0.message_id));
        assert!(store.contains(g1.message_id));
        assert_eq!(
            store.live_with(HEADER_GENERATION, "1").len(),
            2,
            "g1 manifest and its chunk survive"
        );
    }
}
