//! Inode table mapping inode numbers to paths, and the node model served to
//! the filesystem-call boundary.
//!
//! Inode numbers are a purely local notion: they are allocated on first sight
//! of a path and kept stable across renames so open handles and kernel caches
//! keep working. Nothing here is persisted.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::mapping::manifest::{ChunkRef, NodeKind};
use crate::mapping::path;
use crate::store::PublishedManifest;

/// Root inode number (standard FUSE convention).
pub const ROOT_INO: u64 = 1;

/// Default block size for statfs reporting.
pub const BLOCK_SIZE: u32 = 4096;

/// Milliseconds since the Unix epoch.
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

pub fn ms_to_system_time(ms: u64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(ms)
}

// ── FileNode ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeType {
    File,
    Directory,
    Symlink,
}

/// Everything known about one path right now.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNode {
    pub path: String,
    pub kind: NodeKind,
    pub size: u64,
    pub mode: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
    pub chunk_size: u32,
    pub chunks: Vec<ChunkRef>,
    /// The stored record, `None` for an implicit directory.
    pub record: Option<PublishedManifest>,
}

impl FileNode {
    pub fn from_record(record: &PublishedManifest) -> Self {
        let m = &record.manifest;
        Self {
            path: m.path.clone(),
            kind: m.kind.clone(),
            size: m.size,
            mode: m.mode,
            mtime_ms: m.mtime_ms,
            ctime_ms: m.ctime_ms,
            chunk_size: m.chunk_size,
            chunks: m.chunks.clone(),
            record: Some(record.clone()),
        }
    }

    /// A directory that exists only because something below it does.
    pub fn implicit_dir(path: &str) -> Self {
        Self {
            path: path.to_string(),
            kind: NodeKind::Directory,
            size: 0,
            mode: 0o755,
            mtime_ms: 0,
            ctime_ms: 0,
            chunk_size: 0,
            chunks: Vec::new(),
            record: None,
        }
    }

    pub fn node_type(&self) -> NodeType {
        match self.kind {
            NodeKind::File => NodeType::File,
            NodeKind::Directory => NodeType::Directory,
            NodeKind::Symlink { .. } => NodeType::Symlink,
        }
    }

    pub fn is_dir(&self) -> bool {
        self.node_type() == NodeType::Directory
    }

    pub fn generation(&self) -> Option<u64> {
        self.record.as_ref().map(PublishedManifest::generation)
    }

    pub fn attr(&self, ino: u64) -> NodeAttr {
        let kind = self.node_type();
        NodeAttr {
            ino,
            kind,
            size: self.size,
            blocks: self.size.div_ceil(512),
            perm: (self.mode & 0o7777) as u16,
            nlink: if kind == NodeType::Directory { 2 } else { 1 },
            mtime_ms: self.mtime_ms,
            ctime_ms: self.ctime_ms,
        }
    }
}

/// Attributes reported for an inode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeAttr {
    pub ino: u64,
    pub kind: NodeType,
    pub size: u64,
    pub blocks: u64,
    pub perm: u16,
    pub nlink: u32,
    pub mtime_ms: u64,
    pub ctime_ms: u64,
}

// ── InodeTable ────────────────────────────────────────────────────────────────

/// Bidirectional inode <-> path map.
///
/// Inode numbers are allocated sequentially starting at 2 (1 is root).
pub struct InodeTable {
    paths: HashMap<u64, String>,
    inos: HashMap<String, u64>,
    next_ino: AtomicU64,
}

impl InodeTable {
    /// Create a table holding only the root.
    pub fn new() -> Self {
        let mut table = Self {
            paths: HashMap::new(),
            inos: HashMap::new(),
            next_ino: AtomicU64::new(ROOT_INO + 1),
        };
        table.paths.insert(ROOT_INO, path::ROOT.to_string());
        table.inos.insert(path::ROOT.to_string(), ROOT_INO);
        table
    }

    /// Allocate a new unique inode number.
    pub fn allocate_ino(&self) -> u64 {
        self.next_ino.fetch_add(1, Ordering::SeqCst)
    }

    /// Inode of `path`, allocating one on first sight.
    pub fn ino_for(&mut self, path: &str) -> u64 {
        if let Some(ino) = self.inos.get(path) {
            return *ino;
        }
        let ino = self.allocate_ino();
        self.paths.insert(ino, path.to_string());
        self.inos.insert(path.to_string(), ino);
        ino
    }

    pub fn find(&self, path: &str) -> Option<u64> {
        self.inos.get(path).copied()
    }

    pub fn path_of(&self, ino: u64) -> Option<&str> {
        self.paths.get(&ino).map(String::as_str)
    }

    /// Drop the mapping for one path. The root is never forgotten.
    pub fn forget(&mut self, path: &str) {
        if path == path::ROOT {
            return;
        }
        if let Some(ino) = self.inos.remove(path) {
            self.paths.remove(&ino);
        }
    }

    /// Move `old` and everything below it to `new`, keeping inode numbers.
    /// Whatever was mapped at the destination is forgotten first.
    pub fn rename_subtree(&mut self, old: &str, new: &str) {
        let doomed: Vec<String> = self
            .inos
            .keys()
            .filter(|p| p.as_str() == new || path::is_descendant(p, new))
            .cloned()
            .collect();
        for p in doomed {
            self.forget(&p);
        }

        let moved: Vec<(String, u64)> = self
            .inos
            .iter()
            .filter(|(p, _)| p.as_str() == old || path::is_descendant(p, old))
            .map(|(p, ino)| (p.clone(), *ino))
            .collect();
        for (from, ino) in moved {
            let to = path::rebase(&from, old, new);
            self.inos.remove(&from);
            self.inos.insert(to.clone(), ino);
            self.paths.insert(ino, to);
        }
    }

    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }
}

impl Default for InodeTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::manifest::Manifest;

    #[test]
    fn test_inode_table_new_has_root() {
        let table = InodeTable::new();
        assert_eq!(table.path_of(ROOT_INO), Some("/"));
        assert_eq!(table.find("/"), Some(ROOT_INO));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_allocate_ino_sequential() {
        let table = InodeTable::new();
        assert_eq!(table.allocate_ino(), 2);
        assert_eq!(table.allocate_ino(), 3);
        assert_eq!(table.allocate_ino(), 4);
    }

    #[test]
    fn test_ino_for_is_stable() {
        let mut table = InodeTable::new();
        let a = table.ino_for("/docs");
        assert_eq!(table.ino_for("/docs"), a);
        assert_ne!(table.ino_for("/other"), a);
        assert_eq!(table.path_of(a), Some("/docs"));
    }

    #[test]
    fn test_forget() {
        let mut table = InodeTable::new();
        let ino = table.ino_for("/test.txt");
        table.forget("/test.txt");
        assert!(table.path_of(ino).is_none());
        assert!(table.find("/test.txt").is_none());

        table.forget("/");
        assert_eq!(table.find("/"), Some(ROOT_INO));
    }

    #[test]
    fn test_rename_subtree_keeps_inodes() {
        let mut table = InodeTable::new();
        let dir = table.ino_for("/a");
        let file = table.ino_for("/a/f");
        let sibling = table.ino_for("/ab");
        let victim = table.ino_for("/b");

        table.rename_subtree("/a", "/b");
        assert_eq!(table.path_of(dir), Some("/b"));
        assert_eq!(table.path_of(file), Some("/b/f"));
        assert_eq!(table.path_of(sibling), Some("/ab"));
        assert!(table.path_of(victim).is_none());
        assert!(table.find("/a/f").is_none());
    }

    #[test]
    fn test_file_node_attr() {
        let mut manifest = Manifest::placeholder("/d", 0o750, 5, 16);
        manifest.generation = 3;
        let record = PublishedManifest {
            manifest,
            message_id: 9,
        };
        let node = FileNode::from_record(&record);
        assert!(node.is_dir());
        assert_eq!(node.generation(), Some(3));

        let attr = node.attr(7);
        assert_eq!(attr.ino, 7);
        assert_eq!(attr.kind, NodeType::Directory);
        assert_eq!(attr.perm, 0o750);
        assert_eq!(attr.nlink, 2);

        let implicit = FileNode::implicit_dir("/x");
        assert_eq!(implicit.generation(), None);
        assert!(implicit.is_dir());
    }
}
