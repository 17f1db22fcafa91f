//! Filesystem surface for mailfs.
//!
//! `MailFs` implements one method per filesystem call on top of the store
//! engine. Calls are synchronous: each one blocks on the tokio runtime with a
//! deadline, the way FUSE callbacks must. The path/inode index and the
//! snapshot sit behind one `RwLock` that is never held across a remote call;
//! each open handle owns its write buffer behind its own async mutex.
//!
//! The cache, inode and file_handle modules do not depend on libfuse. The
//! kernel adapter and `mount_filesystem` require the `fuse` feature.

pub mod cache;
pub mod file_handle;
pub mod inode;
#[cfg(feature = "fuse")]
pub mod operations;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use thiserror::Error;
use tokio::runtime::Handle;
use tokio::sync::Mutex as AsyncMutex;
use zeroize::Zeroizing;

use crate::config::MountConfig;
use crate::mapping::manifest::{ChunkRef, NodeKind};
use crate::mapping::path::{self, PathError};
use crate::store::{MailStore, PublishRequest, PublishedManifest, StoreEngine, StoreError};
use crate::sync::queue::{RetryError, RetryHandler, RetryQueue};

use cache::{ChildEntry, ContentCache, EntryState, IndexSnapshot};
use file_handle::{BufferError, ChunkSource, DirtyBuffer, OpenFileHandle};
use inode::{now_ms, FileNode, InodeTable, NodeAttr, NodeType, BLOCK_SIZE, ROOT_INO};

/// A filesystem call may run several remote operations, each with its own
/// retries; its deadline is this many single-operation budgets.
const CALL_TIMEOUT_FACTOR: u32 = 4;

/// Capacity reported by statfs. The mailbox has no quota we can query.
const REPORTED_CAPACITY: u64 = 1 << 40;

#[derive(Debug, Error)]
pub enum FsError {
    #[error("No such file or directory: {0}")]
    NotFound(String),
    #[error("Already exists: {0}")]
    Exists(String),
    #[error("Not a directory: {0}")]
    NotDirectory(String),
    #[error("Is a directory: {0}")]
    IsDirectory(String),
    #[error("Directory not empty: {0}")]
    NotEmpty(String),
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Bad file handle {0}")]
    BadHandle(u64),
    #[error("Operation timed out")]
    TimedOut,
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Buffer(#[from] BufferError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl FsError {
    /// Conventional errno for the kernel reply.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound(_) => libc::ENOENT,
            FsError::Exists(_) => libc::EEXIST,
            FsError::NotDirectory(_) => libc::ENOTDIR,
            FsError::IsDirectory(_) => libc::EISDIR,
            FsError::NotEmpty(_) => libc::ENOTEMPTY,
            FsError::InvalidArgument(_) | FsError::Path(_) => libc::EINVAL,
            FsError::BadHandle(_) => libc::EBADF,
            FsError::TimedOut => libc::EIO,
            FsError::Buffer(BufferError::TooLarge(_)) => libc::EFBIG,
            FsError::Buffer(BufferError::NotLoaded(_)) => libc::EIO,
            FsError::Store(e) => match e {
                StoreError::NotFound(_) => libc::ENOENT,
                StoreError::GenerationConflict { .. } => libc::ESTALE,
                StoreError::Capacity { .. } => libc::ENOSPC,
                StoreError::Auth(_) => libc::EACCES,
                StoreError::TransientStore { .. }
                | StoreError::Corruption { .. }
                | StoreError::Protocol(_) => libc::EIO,
            },
        }
    }

    /// Worth another attempt later.
    pub fn is_transient(&self) -> bool {
        match self {
            FsError::TimedOut => true,
            FsError::Store(e) => e.is_transient(),
            _ => false,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub ino: u64,
    pub kind: NodeType,
    pub name: String,
}

/// Attribute changes requested by setattr. `None` leaves a field alone.
#[derive(Debug, Default, Clone, Copy)]
pub struct SetAttr {
    pub mode: Option<u32>,
    pub size: Option<u64>,
    pub mtime_ms: Option<u64>,
}

impl SetAttr {
    fn is_empty(&self) -> bool {
        self.mode.is_none() && self.size.is_none() && self.mtime_ms.is_none()
    }
}

/// What rename does when the destination already exists.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum RenameMode {
    /// Replace it, subject to the usual type checks.
    #[default]
    Replace,
    /// Fail with `Exists`.
    NoReplace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FsStats {
    pub blocks: u64,
    pub blocks_free: u64,
    pub files: u64,
    pub block_size: u32,
    pub name_max: u32,
}

/// A released buffer whose flush failed transiently.
#[derive(Clone)]
pub struct PendingFlush {
    pub path: String,
    pub buffer: DirtyBuffer,
}

impl fmt::Display for PendingFlush {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "flush of {} ({} dirty chunk(s))",
            self.path,
            self.buffer.dirty_chunks().count()
        )
    }
}

struct Namespace {
    inodes: InodeTable,
    snapshot: IndexSnapshot,
}

type SharedHandle = Arc<AsyncMutex<OpenFileHandle>>;

pub struct MailFs<S: MailStore> {
    engine: Arc<StoreEngine<S>>,
    rt: Handle,
    namespace: RwLock<Namespace>,
    content: Mutex<ContentCache>,
    handles: Mutex<HashMap<u64, SharedHandle>>,
    next_fh: AtomicU64,
    chunk_size: u32,
    call_timeout: Duration,
    flush_queue: AsyncMutex<RetryQueue<PendingFlush>>,
}

impl<S: MailStore> MailFs<S> {
    pub fn new(engine: Arc<StoreEngine<S>>, config: &MountConfig, rt: Handle) -> Self {
        let call_timeout = config
            .op_timeout
            .saturating_mul(config.retry_attempts.max(1))
            .saturating_mul(CALL_TIMEOUT_FACTOR);
        Self {
            engine,
            rt,
            namespace: RwLock::new(Namespace {
                inodes: InodeTable::new(),
                snapshot: IndexSnapshot::new(config.staleness),
            }),
            content: Mutex::new(ContentCache::new(config.content_cache_bytes)),
            handles: Mutex::new(HashMap::new()),
            next_fh: AtomicU64::new(1),
            chunk_size: config.chunk_size,
            call_timeout,
            flush_queue: AsyncMutex::new(RetryQueue::unbounded()),
        }
    }

    /// Verify the passphrase against the mailbox and make the root known.
    /// Runs the orphan sweep when configured; a failed sweep only warns.
    pub fn mount(
        engine: Arc<StoreEngine<S>>,
        config: &MountConfig,
        rt: Handle,
    ) -> Result<Self, FsError> {
        let fs = Self::new(engine, config, rt);
        let root = fs.block(async { Ok(fs.engine.verify_root(now_ms(), fs.chunk_size).await?) })?;
        log::info!(
            "Mounted mailbox {} (root generation {})",
            fs.engine.mailbox(),
            root.generation()
        );
        fs.ns_mut().snapshot.record_local(path::ROOT, root);

        if config.sweep_on_mount {
            match fs.block(async { Ok(fs.engine.sweep_orphans().await?) }) {
                Ok(report) => log::debug!("Mount sweep: {:?}", report),
                Err(e) => log::warn!("Orphan sweep on mount failed: {}", e),
            }
        }
        Ok(fs)
    }

    pub fn engine(&self) -> &Arc<StoreEngine<S>> {
        &self.engine
    }

    // ── plumbing ────────────────────────────────────────────────────────

    /// Run a future on the runtime with the per-call deadline.
    fn block<T>(&self, fut: impl Future<Output = Result<T, FsError>>) -> Result<T, FsError> {
        self.rt.block_on(async {
            tokio::time::timeout(self.call_timeout, fut)
                .await
                .unwrap_or(Err(FsError::TimedOut))
        })
    }

    fn ns(&self) -> RwLockReadGuard<'_, Namespace> {
        self.namespace.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn ns_mut(&self) -> RwLockWriteGuard<'_, Namespace> {
        self.namespace.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn content_cache(&self) -> MutexGuard<'_, ContentCache> {
        self.content.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn open_handles(&self) -> MutexGuard<'_, HashMap<u64, SharedHandle>> {
        self.handles.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn handle(&self, fh: u64) -> Result<SharedHandle, FsError> {
        self.open_handles()
            .get(&fh)
            .cloned()
            .ok_or(FsError::BadHandle(fh))
    }

    fn all_handles(&self) -> Vec<(u64, SharedHandle)> {
        self.open_handles()
            .iter()
            .map(|(fh, h)| (*fh, Arc::clone(h)))
            .collect()
    }

    fn path_of(&self, ino: u64) -> Result<String, FsError> {
        self.ns()
            .inodes
            .path_of(ino)
            .map(str::to_string)
            .ok_or_else(|| FsError::NotFound(format!("inode {}", ino)))
    }

    fn child_path(&self, parent: u64, name: &str) -> Result<(String, String), FsError> {
        let dir = self.path_of(parent)?;
        let name = path::normalize_name(name)?;
        let child = path::join(&dir, &name);
        Ok((dir, child))
    }

    fn attr_for(&self, path: &str, node: &FileNode) -> NodeAttr {
        let ino = self.ns_mut().inodes.ino_for(path);
        let mut attr = node.attr(ino);
        self.overlay_open_state(path, &mut attr);
        attr
    }

    /// Show unflushed size and metadata of a parked flush or an open dirty
    /// handle. Open handles win over parked buffers.
    fn overlay_open_state(&self, path: &str, attr: &mut NodeAttr) {
        if let Ok(queue) = self.flush_queue.try_lock() {
            for parked in queue.iter().filter(|q| q.item.path == path) {
                overlay_buffer(attr, &parked.item.buffer);
            }
        }
        for (_, handle) in self.all_handles() {
            let Ok(h) = handle.try_lock() else {
                continue;
            };
            if h.ino == attr.ino && h.buffer.is_dirty() {
                overlay_buffer(attr, &h.buffer);
            }
        }
    }

    // ── resolution ──────────────────────────────────────────────────────

    /// Snapshot answer for `path` if it can be trusted without the store.
    fn cached(&self, path: &str) -> Option<Option<FileNode>> {
        let ns = self.ns();
        let entry = ns.snapshot.fresh(path)?;
        Some(match &entry.state {
            EntryState::Present(record) => Some(FileNode::from_record(record)),
            EntryState::Implicit => Some(FileNode::implicit_dir(path)),
            EntryState::Removed { .. } if ns.snapshot.has_descendants(path) => {
                Some(FileNode::implicit_dir(path))
            }
            EntryState::Removed { .. } => None,
        })
    }

    /// Current node at `path`, consulting the store when the snapshot has
    /// no fresh answer.
    async fn resolve(&self, path: &str) -> Result<Option<FileNode>, FsError> {
        if let Some(found) = self.cached(path) {
            return Ok(found);
        }

        let remote = self.engine.read(path).await?;
        self.ns_mut().snapshot.apply_remote(path, remote);
        let known = self.ns().snapshot.get(path).and_then(|e| e.record().cloned());
        if let Some(record) = known {
            return Ok(Some(FileNode::from_record(&record)));
        }

        // No manifest of its own: a directory iff something lives below it.
        let below = self.engine.scan(path).await?;
        let mut ns = self.ns_mut();
        ns.snapshot.apply_listing(path, below);
        if ns.snapshot.has_descendants(path) {
            ns.snapshot.mark_implicit(path);
            return Ok(Some(FileNode::implicit_dir(path)));
        }
        Ok(None)
    }

    async fn require(&self, path: &str) -> Result<FileNode, FsError> {
        self.resolve(path)
            .await?
            .ok_or_else(|| FsError::NotFound(path.to_string()))
    }

    async fn require_dir(&self, path: &str) -> Result<FileNode, FsError> {
        let node = self.require(path).await?;
        if !node.is_dir() {
            return Err(FsError::NotDirectory(path.to_string()));
        }
        Ok(node)
    }

    async fn require_absent(&self, path: &str) -> Result<(), FsError> {
        match self.resolve(path).await? {
            Some(_) => Err(FsError::Exists(path.to_string())),
            None => Ok(()),
        }
    }

    /// Children of `dir`, refreshing the listing when it is stale.
    async fn list_children(&self, dir: &str) -> Result<Vec<(String, ChildEntry)>, FsError> {
        if !self.ns().snapshot.listing_fresh(dir) {
            let records = self.engine.scan(dir).await?;
            self.ns_mut().snapshot.apply_listing(dir, records);
        }
        Ok(self.ns().snapshot.children(dir).into_iter().collect())
    }

    // ── content ─────────────────────────────────────────────────────────

    async fn load_chunk(&self, path: &str, chunk: &ChunkRef) -> Result<Zeroizing<Vec<u8>>, FsError> {
        let cached = self
            .content_cache()
            .get(chunk.message_id)
            .map(|data| Zeroizing::new(data.to_vec()));
        if let Some(data) = cached {
            return Ok(data);
        }
        let data = self.engine.read_chunk(path, chunk).await?;
        self.content_cache().set(chunk.message_id, data.clone());
        Ok(data)
    }

    async fn install_all(
        &self,
        path: &str,
        buffer: &mut DirtyBuffer,
        chunks: Vec<ChunkRef>,
    ) -> Result<(), FsError> {
        for chunk in chunks {
            let plaintext = self.load_chunk(path, &chunk).await?;
            buffer.install(chunk.index, plaintext);
        }
        Ok(())
    }

    /// Commit a buffer if it holds changes. Returns the new record.
    async fn flush_buffer(
        &self,
        path: &str,
        buffer: &mut DirtyBuffer,
    ) -> Result<Option<PublishedManifest>, FsError> {
        if !buffer.is_dirty() {
            return Ok(None);
        }
        let loads = buffer.loads_for_flush();
        self.install_all(path, buffer, loads).await?;
        let request = buffer.publish_request(path, now_ms())?;
        let dirty = buffer.dirty_chunks().count();
        let record = self.engine.publish(request).await?;
        log::debug!(
            "Flushed {} -> generation {} ({} dirty chunk(s))",
            path,
            record.generation(),
            dirty
        );
        self.commit_local(path, &record);
        buffer.committed(record.clone());
        Ok(Some(record))
    }

    /// Make a commit visible to the snapshot and to idle handles of the path.
    fn commit_local(&self, path: &str, record: &PublishedManifest) {
        self.ns_mut().snapshot.record_local(path, record.clone());
        for (_, handle) in self.all_handles() {
            let Ok(mut h) = handle.try_lock() else {
                continue;
            };
            if h.path == path
                && !h.buffer.is_dirty()
                && h.buffer.base().generation() < record.generation()
            {
                h.buffer.committed(record.clone());
            }
        }
    }

    async fn publish_new(&self, request: PublishRequest) -> Result<(NodeAttr, FileNode), FsError> {
        let path = request.path.clone();
        let record = self.engine.publish(request).await?;
        self.commit_local(&path, &record);
        let node = FileNode::from_record(&record);
        Ok((self.attr_for(&path, &node), node))
    }

    fn new_node_request(&self, path: &str, kind: NodeKind, size: u64, mode: u32) -> PublishRequest {
        let now = now_ms();
        PublishRequest {
            path: path.to_string(),
            base: None,
            kind,
            size,
            mode: mode & 0o7777,
            mtime_ms: now,
            ctime_ms: now,
            chunk_size: self.chunk_size,
            chunks: Vec::new(),
        }
    }

    /// Publish a placeholder for `dir` when it exists only through
    /// descendants and just lost the last of them.
    async fn keep_parent(&self, dir: &str) -> Result<(), FsError> {
        if dir == path::ROOT {
            return Ok(());
        }
        let node = match self.resolve(dir).await? {
            Some(node) if node.record.is_none() => node,
            _ => return Ok(()),
        };
        if !self.list_children(dir).await?.is_empty() {
            return Ok(());
        }
        log::debug!("Keeping emptied directory {} with a placeholder", dir);
        let request = self.new_node_request(dir, NodeKind::Directory, 0, node.mode);
        self.publish_new(request).await?;
        Ok(())
    }

    fn forget_removed(&self, path: &str, record: Option<&PublishedManifest>) {
        let mut ns = self.ns_mut();
        ns.snapshot.remove_local(path, record.map(PublishedManifest::generation));
        ns.inodes.forget(path);
        drop(ns);
        if let Some(record) = record {
            let mut content = self.content_cache();
            for chunk in &record.manifest.chunks {
                content.invalidate(chunk.message_id);
            }
        }
    }

    /// Flush parked buffers at `root` or below before the paths move on.
    async fn flush_parked(&self, root: &str) -> Result<(), FsError> {
        let parked = self
            .flush_queue
            .lock()
            .await
            .take_where(|p| p.path == root || path::is_descendant(&p.path, root));
        let mut parked = parked.into_iter();
        while let Some(mut pending) = parked.next() {
            if let Err(e) = self.flush_buffer(&pending.path, &mut pending.buffer).await {
                let mut queue = self.flush_queue.lock().await;
                queue.enqueue(pending);
                parked.for_each(|rest| queue.enqueue(rest));
                return Err(e);
            }
        }
        Ok(())
    }

    /// Flush every open handle at `root` or below.
    async fn flush_open_under(&self, root: &str) -> Result<(), FsError> {
        for (_, handle) in self.all_handles() {
            let mut h = handle.lock().await;
            if h.path == root || path::is_descendant(&h.path, root) {
                let path = h.path.clone();
                self.flush_buffer(&path, &mut h.buffer).await?;
            }
        }
        Ok(())
    }

    // ── filesystem calls ────────────────────────────────────────────────

    pub fn lookup(&self, parent: u64, name: &str) -> Result<NodeAttr, FsError> {
        let (_, child) = self.child_path(parent, name)?;
        let node = self.block(self.require(&child))?;
        Ok(self.attr_for(&child, &node))
    }

    /// Inode of the directory holding `ino`. The root is its own parent.
    pub fn parent_ino(&self, ino: u64) -> u64 {
        let ns = self.ns();
        ns.inodes
            .path_of(ino)
            .and_then(path::parent)
            .and_then(|dir| ns.inodes.find(dir))
            .unwrap_or(ROOT_INO)
    }

    pub fn getattr(&self, ino: u64) -> Result<NodeAttr, FsError> {
        let path = self.path_of(ino)?;
        let node = self.block(self.require(&path))?;
        Ok(self.attr_for(&path, &node))
    }

    /// Entries of a directory, without "." and "..".
    pub fn readdir(&self, ino: u64) -> Result<Vec<DirEntry>, FsError> {
        let dir = self.path_of(ino)?;
        let children = self.block(async {
            self.require_dir(&dir).await?;
            self.list_children(&dir).await
        })?;

        let mut ns = self.ns_mut();
        Ok(children
            .into_iter()
            .map(|(name, child)| {
                let kind = match &child {
                    ChildEntry::Record(record) => FileNode::from_record(record).node_type(),
                    ChildEntry::Implicit => NodeType::Directory,
                };
                DirEntry {
                    ino: ns.inodes.ino_for(&path::join(&dir, &name)),
                    kind,
                    name,
                }
            })
            .collect())
    }

    pub fn open(&self, ino: u64, flags: i32) -> Result<u64, FsError> {
        let path = self.path_of(ino)?;
        let record = self.block(async {
            self.flush_parked(&path).await?;
            let node = self.require(&path).await?;
            match node.node_type() {
                NodeType::Directory => Err(FsError::IsDirectory(path.clone())),
                NodeType::Symlink => Err(FsError::InvalidArgument(format!(
                    "{} is a symbolic link",
                    path
                ))),
                NodeType::File => node
                    .record
                    .ok_or_else(|| FsError::NotFound(path.clone())),
            }
        })?;

        let mut handle = OpenFileHandle::new(ino, flags, &path, record);
        if handle.writable() && flags & libc::O_TRUNC != 0 {
            handle.buffer.truncate(0)?;
            handle.buffer.touch(now_ms());
        }
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.open_handles()
            .insert(fh, Arc::new(AsyncMutex::new(handle)));
        log::debug!("open {} flags={:#o} -> fh {}", path, flags, fh);
        Ok(fh)
    }

    pub fn read(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, FsError> {
        let handle = self.handle(fh)?;
        self.block(async {
            let h = handle.lock().await;
            let mut out = Vec::with_capacity(size as usize);
            for slice in h.buffer.read_slices(offset, size as u64) {
                let mut data = match h.buffer.source(slice.index) {
                    ChunkSource::Resident(bytes) => Zeroizing::new(bytes.to_vec()),
                    ChunkSource::Stored(chunk) => {
                        let chunk = chunk.clone();
                        self.load_chunk(&h.path, &chunk).await?
                    }
                    ChunkSource::Zeros => Zeroizing::new(Vec::new()),
                };
                data.resize(slice.chunk_len, 0);
                out.extend_from_slice(&data[slice.range]);
            }
            Ok(out)
        })
    }

    pub fn write(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, FsError> {
        let handle = self.handle(fh)?;
        self.block(async {
            let mut h = handle.lock().await;
            if !h.writable() {
                return Err(FsError::BadHandle(fh));
            }
            let offset = if h.appending() { h.buffer.size() } else { offset };
            let path = h.path.clone();
            let loads = h.buffer.loads_for_write(offset, data.len() as u64);
            self.install_all(&path, &mut h.buffer, loads).await?;
            let written = h.buffer.write(offset, data)?;
            h.buffer.touch(now_ms());
            Ok(written as u32)
        })
    }

    pub fn create(&self, parent: u64, name: &str, mode: u32, flags: i32) -> Result<(NodeAttr, u64), FsError> {
        let (dir, child) = self.child_path(parent, name)?;
        let (attr, node) = self.block(async {
            self.require_dir(&dir).await?;
            self.require_absent(&child).await?;
            self.publish_new(self.new_node_request(&child, NodeKind::File, 0, mode))
                .await
        })?;
        let record = node
            .record
            .ok_or_else(|| FsError::NotFound(child.clone()))?;

        let handle = OpenFileHandle::new(attr.ino, flags, &child, record);
        let fh = self.next_fh.fetch_add(1, Ordering::SeqCst);
        self.open_handles()
            .insert(fh, Arc::new(AsyncMutex::new(handle)));
        log::info!("Created {}", child);
        Ok((attr, fh))
    }

    pub fn mkdir(&self, parent: u64, name: &str, mode: u32) -> Result<NodeAttr, FsError> {
        let (dir, child) = self.child_path(parent, name)?;
        let (attr, _) = self.block(async {
            self.require_dir(&dir).await?;
            self.require_absent(&child).await?;
            self.publish_new(self.new_node_request(&child, NodeKind::Directory, 0, mode))
                .await
        })?;
        log::info!("Created directory {}", child);
        Ok(attr)
    }

    pub fn symlink(&self, parent: u64, name: &str, target: &str) -> Result<NodeAttr, FsError> {
        let (dir, child) = self.child_path(parent, name)?;
        if target.is_empty() {
            return Err(FsError::InvalidArgument("empty symlink target".to_string()));
        }
        let kind = NodeKind::Symlink {
            target: target.to_string(),
        };
        let (attr, _) = self.block(async {
            self.require_dir(&dir).await?;
            self.require_absent(&child).await?;
            self.publish_new(self.new_node_request(&child, kind, target.len() as u64, 0o777))
                .await
        })?;
        Ok(attr)
    }

    pub fn readlink(&self, ino: u64) -> Result<String, FsError> {
        let path = self.path_of(ino)?;
        let node = self.block(self.require(&path))?;
        match node.kind {
            NodeKind::Symlink { target } => Ok(target),
            _ => Err(FsError::InvalidArgument(format!("{} is not a symbolic link", path))),
        }
    }

    pub fn unlink(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let (dir, child) = self.child_path(parent, name)?;
        self.block(async {
            let node = self.require(&child).await?;
            if node.is_dir() {
                return Err(FsError::IsDirectory(child.clone()));
            }
            let discarded = self
                .flush_queue
                .lock()
                .await
                .take_where(|p| p.path == child);
            if !discarded.is_empty() {
                log::warn!("Discarding {} parked flush(es) of unlinked {}", discarded.len(), child);
            }
            self.engine.remove(&child, node.record.as_ref()).await?;
            self.forget_removed(&child, node.record.as_ref());
            self.keep_parent(&dir).await
        })?;
        log::info!("Unlinked {}", child);
        Ok(())
    }

    pub fn rmdir(&self, parent: u64, name: &str) -> Result<(), FsError> {
        let (dir, child) = self.child_path(parent, name)?;
        self.block(async {
            let node = self.require_dir(&child).await?;
            if !self.list_children(&child).await?.is_empty() {
                return Err(FsError::NotEmpty(child.clone()));
            }
            if let Some(record) = &node.record {
                self.engine.remove(&child, Some(record)).await?;
            }
            self.forget_removed(&child, node.record.as_ref());
            self.keep_parent(&dir).await
        })?;
        log::info!("Removed directory {}", child);
        Ok(())
    }

    /// Move `name` under `parent` to `newname` under `newparent`, replacing
    /// a compatible destination. Only manifests are rewritten.
    pub fn rename(
        &self,
        parent: u64,
        name: &str,
        newparent: u64,
        newname: &str,
        mode: RenameMode,
    ) -> Result<(), FsError> {
        let (old_dir, old) = self.child_path(parent, name)?;
        let (new_dir, new) = self.child_path(newparent, newname)?;
        if old == new {
            return match mode {
                RenameMode::Replace => Ok(()),
                RenameMode::NoReplace => {
                    self.block(self.require(&old))?;
                    Err(FsError::Exists(new))
                }
            };
        }
        if path::is_descendant(&new, &old) {
            return Err(FsError::InvalidArgument(format!(
                "cannot move {} into itself",
                old
            )));
        }

        let moved = self.block(async {
            self.flush_parked(&old).await?;
            self.flush_open_under(&old).await?;
            let src = self.require(&old).await?;
            self.require_dir(&new_dir).await?;

            let dst = self.resolve(&new).await?;
            if let Some(dst) = &dst {
                if mode == RenameMode::NoReplace {
                    return Err(FsError::Exists(new.clone()));
                }
                if src.is_dir() && !dst.is_dir() {
                    return Err(FsError::NotDirectory(new.clone()));
                }
                if !src.is_dir() && dst.is_dir() {
                    return Err(FsError::IsDirectory(new.clone()));
                }
                if dst.is_dir() && !self.list_children(&new).await?.is_empty() {
                    return Err(FsError::NotEmpty(new.clone()));
                }
            }
            let replaced = dst.and_then(|d| d.record);

            let mut moved: Vec<(String, PublishedManifest)> = Vec::new();
            if src.is_dir() {
                self.list_children(&old).await?;
                let below = self.ns().snapshot.subtree(&old);
                for record in below {
                    let from = record.manifest.path.clone();
                    let to = path::rebase(&from, &old, &new);
                    let next = self.engine.rename(&record, &to, None, now_ms()).await?;
                    self.forget_moved(&from, &to, &record, &next);
                    moved.push((from, next));
                }
            }
            match (&src.record, replaced) {
                (Some(record), replaced) => {
                    let next = self.engine.rename(record, &new, replaced, now_ms()).await?;
                    self.forget_moved(&old, &new, record, &next);
                    moved.push((old.clone(), next));
                }
                (None, Some(replaced)) => {
                    // Implicit directory over an empty placeholder.
                    self.engine.remove(&new, Some(&replaced)).await?;
                    self.ns_mut().snapshot.remove_local(&new, Some(replaced.generation()));
                }
                (None, None) => {}
            }
            if src.record.is_none() {
                self.ns_mut().snapshot.remove_local(&old, None);
            }
            if old_dir != new_dir {
                self.keep_parent(&old_dir).await?;
            }
            Ok(moved)
        })?;

        self.ns_mut().inodes.rename_subtree(&old, &new);
        let moved: HashMap<String, PublishedManifest> = moved.into_iter().collect();
        for (_, handle) in self.all_handles() {
            let Ok(mut h) = handle.try_lock() else {
                continue;
            };
            if h.path == old || path::is_descendant(&h.path, &old) {
                if let Some(record) = moved.get(&h.path) {
                    h.buffer.renamed(record.clone());
                }
                let to = path::rebase(&h.path, &old, &new);
                h.path = to;
            }
        }
        log::info!("Renamed {} -> {}", old, new);
        Ok(())
    }

    fn forget_moved(&self, from: &str, to: &str, old: &PublishedManifest, new: &PublishedManifest) {
        let mut ns = self.ns_mut();
        ns.snapshot.remove_local(from, Some(old.generation()));
        ns.snapshot.record_local(to, new.clone());
    }

    /// chmod / utime / truncate. Applied to an open writable handle of the
    /// file when one exists (and committed with it), otherwise committed
    /// right away.
    pub fn setattr(&self, ino: u64, changes: SetAttr, fh: Option<u64>) -> Result<NodeAttr, FsError> {
        let path = self.path_of(ino)?;
        if changes.is_empty() {
            return self.getattr(ino);
        }

        let target = self.writable_handle(ino, fh);
        self.block(async {
            let node = self.require(&path).await?;
            if changes.size.is_some() && node.node_type() != NodeType::File {
                return Err(if node.is_dir() {
                    FsError::IsDirectory(path.clone())
                } else {
                    FsError::InvalidArgument(format!("cannot truncate {}", path))
                });
            }

            if let Some(handle) = target {
                let mut h = handle.lock().await;
                self.apply_attr(&path, &mut h.buffer, changes).await?;
                return Ok(());
            }

            match node.record {
                Some(record) => {
                    let mut buffer = DirtyBuffer::new(record);
                    self.apply_attr(&path, &mut buffer, changes).await?;
                    self.flush_buffer(&path, &mut buffer).await?;
                }
                None => {
                    let mode = changes.mode.unwrap_or(node.mode);
                    let mut request = self.new_node_request(&path, NodeKind::Directory, 0, mode);
                    if let Some(mtime) = changes.mtime_ms {
                        request.mtime_ms = mtime;
                    }
                    self.publish_new(request).await?;
                }
            }
            Ok(())
        })?;
        self.getattr(ino)
    }

    pub fn truncate(&self, ino: u64, size: u64) -> Result<NodeAttr, FsError> {
        self.setattr(
            ino,
            SetAttr {
                size: Some(size),
                ..SetAttr::default()
            },
            None,
        )
    }

    fn writable_handle(&self, ino: u64, fh: Option<u64>) -> Option<SharedHandle> {
        let handles = self.all_handles();
        let pick = |(_, handle): &(u64, SharedHandle)| {
            handle
                .try_lock()
                .is_ok_and(|h| h.ino == ino && h.writable())
        };
        if let Some(fh) = fh {
            if let Some(found) = handles.iter().find(|e| e.0 == fh).filter(|e| pick(*e)) {
                return Some(Arc::clone(&found.1));
            }
        }
        handles.iter().find(|e| pick(*e)).map(|e| Arc::clone(&e.1))
    }

    async fn apply_attr(&self, path: &str, buffer: &mut DirtyBuffer, changes: SetAttr) -> Result<(), FsError> {
        if let Some(size) = changes.size {
            let load = buffer.load_for_truncate(size).into_iter().collect();
            self.install_all(path, buffer, load).await?;
            buffer.truncate(size)?;
            buffer.touch(now_ms());
        }
        if let Some(mode) = changes.mode {
            buffer.set_mode(mode & 0o7777);
        }
        if let Some(mtime) = changes.mtime_ms {
            buffer.set_mtime(mtime);
        }
        Ok(())
    }

    /// Commit the handle's pending changes. A no-op when nothing is dirty.
    pub fn flush(&self, fh: u64) -> Result<(), FsError> {
        let handle = self.handle(fh)?;
        self.block(async {
            let mut h = handle.lock().await;
            let path = h.path.clone();
            self.flush_buffer(&path, &mut h.buffer).await?;
            Ok(())
        })
    }

    /// Close a handle, committing anything unflushed. A transient failure
    /// parks the buffer for the background daemon instead of losing it.
    pub fn release(&self, fh: u64) -> Result<(), FsError> {
        let handle = self
            .open_handles()
            .remove(&fh)
            .ok_or(FsError::BadHandle(fh))?;
        self.block(async {
            let mut h = handle.lock().await;
            let path = h.path.clone();
            match self.flush_buffer(&path, &mut h.buffer).await {
                Ok(_) => Ok(()),
                Err(e) if e.is_transient() => {
                    log::warn!("Flush of {} on release failed, parking it: {}", path, e);
                    self.flush_queue.lock().await.enqueue(PendingFlush {
                        path,
                        buffer: h.buffer.clone(),
                    });
                    Ok(())
                }
                Err(e) => {
                    log::error!("Flush of {} on release failed: {}", path, e);
                    Err(e)
                }
            }
        })
    }

    pub fn statfs(&self) -> FsStats {
        let ns = self.ns();
        let used: u64 = ns
            .snapshot
            .subtree(path::ROOT)
            .iter()
            .map(|r| r.manifest.size)
            .sum();
        let block_size = BLOCK_SIZE as u64;
        let blocks = REPORTED_CAPACITY / block_size;
        FsStats {
            blocks,
            blocks_free: blocks.saturating_sub(used.div_ceil(block_size)),
            files: ns.inodes.len() as u64,
            block_size: BLOCK_SIZE,
            name_max: path::MAX_NAME_LEN as u32,
        }
    }

    // ── background work ─────────────────────────────────────────────────

    /// Retry parked flushes once. Returns how many committed.
    pub async fn drain_flush_queue(&self) -> usize {
        let mut queue = self.flush_queue.lock().await;
        queue.process(&FlushHandler { fs: self }).await
    }

    pub async fn pending_flushes(&self) -> usize {
        self.flush_queue.lock().await.len()
    }

    /// Drop tombstones and negative entries older than the staleness bound.
    pub fn prune_snapshot(&self) -> usize {
        self.ns_mut().snapshot.prune()
    }

    /// Flush everything still open or parked, then drop cached plaintext
    /// and end the store session.
    ///
    /// Caches are cleared even when the store fails; the first failure of
    /// the final drain or logout is returned.
    pub fn shutdown(&self) -> Result<(), FsError> {
        let handles: Vec<(u64, SharedHandle)> = self.open_handles().drain().collect();
        for (fh, handle) in handles {
            let result = self.block(async {
                let mut h = handle.lock().await;
                let path = h.path.clone();
                self.flush_buffer(&path, &mut h.buffer).await
            });
            if let Err(e) = result {
                log::error!("Unflushed changes lost on fh {}: {}", fh, e);
            }
        }

        let result = self.block(async {
            self.drain_flush_queue().await;
            let lost = self.pending_flushes().await;
            if lost > 0 {
                log::error!("{} parked flush(es) could not be committed", lost);
            }
            self.engine.process_retirements().await;
            self.engine.logout().await?;
            Ok(())
        });
        if let Err(e) = &result {
            log::warn!("Store session did not end cleanly: {}", e);
        }

        self.content_cache().clear();
        self.ns_mut().snapshot.clear();
        log::info!("mailfs shut down: caches cleared");
        result
    }
}

fn overlay_buffer(attr: &mut NodeAttr, buffer: &DirtyBuffer) {
    attr.size = buffer.size();
    attr.blocks = attr.size.div_ceil(512);
    attr.perm = (buffer.mode() & 0o7777) as u16;
    attr.mtime_ms = buffer.mtime_ms();
}

struct FlushHandler<'a, S: MailStore> {
    fs: &'a MailFs<S>,
}

impl<S: MailStore> RetryHandler<PendingFlush> for FlushHandler<'_, S> {
    async fn attempt(&self, item: &PendingFlush) -> Result<(), RetryError> {
        let mut buffer = item.buffer.clone();
        match self.fs.flush_buffer(&item.path, &mut buffer).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_transient() => Err(RetryError::Transient(e.to_string())),
            Err(e) => Err(RetryError::Permanent(e.to_string())),
        }
    }
}

/// Mount the filesystem at the configured mount point.
///
/// The FUSE event loop runs on a dedicated OS thread (fuser runs its own
/// loop). Waits briefly so an immediate mount failure is reported here.
#[cfg(feature = "fuse")]
pub fn mount_filesystem<S: MailStore>(
    fs: Arc<MailFs<S>>,
    mount_path: std::path::PathBuf,
) -> Result<std::thread::JoinHandle<()>, String> {
    use fuser::MountOption;

    if mount_path.is_symlink() {
        return Err("Mount point is a symlink, refusing to proceed".to_string());
    }
    if !mount_path.exists() {
        std::fs::create_dir_all(&mount_path)
            .map_err(|e| format!("Failed to create mount point: {}", e))?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let _ = std::fs::set_permissions(&mount_path, std::fs::Permissions::from_mode(0o700));
        }
    }

    let options = vec![
        MountOption::FSName("mailfs".to_string()),
        MountOption::Subtype("mailfs".to_string()),
        MountOption::DefaultPermissions,
        MountOption::NoAtime,
        MountOption::RW,
    ];

    let (tx, rx) = std::sync::mpsc::sync_channel::<Result<(), String>>(1);
    let adapter = operations::FuseAdapter::new(fs);
    let mount_path_clone = mount_path.clone();
    let handle = std::thread::Builder::new()
        .name("fuse-mount".to_string())
        .spawn(move || {
            log::info!("Mounting mailfs at {}", mount_path_clone.display());
            match fuser::mount2(adapter, &mount_path_clone, &options) {
                Ok(()) => {
                    log::info!("FUSE filesystem unmounted cleanly");
                    let _ = tx.send(Ok(()));
                }
                Err(e) => {
                    log::error!("FUSE mount error: {}", e);
                    let _ = tx.send(Err(format!("FUSE mount error: {}", e)));
                }
            }
        })
        .map_err(|e| format!("Failed to spawn FUSE thread: {}", e))?;

    // mount2 blocks while mounted, so silence means the mount is up.
    match rx.recv_timeout(Duration::from_secs(2)) {
        Ok(Ok(())) => Err("FUSE filesystem unmounted immediately after mounting".to_string()),
        Ok(Err(e)) => Err(e),
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
            log::info!("FUSE mount confirmed at {}", mount_path.display());
            Ok(handle)
        }
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
            Err("FUSE mount thread exited unexpectedly".to_string())
        }
    }
}
