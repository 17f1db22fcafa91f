//! Memory caches for path records and decrypted chunk content.
//!
//! - IndexSnapshot: path -> manifest record with freshness. Entries written by
//!   local commits are always fresh; entries learned from remote search age out
//!   after the staleness bound. Local removals leave a tombstone that stays
//!   fresh for one staleness window past the last lagging search that still
//!   showed the removed record.
//! - ContentCache: decrypted chunk plaintext keyed by message id, LRU within a
//!   byte budget. Chunk messages are immutable, so entries never go stale.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use zeroize::Zeroizing;

use crate::mapping::path;
use crate::store::{MessageId, PublishedManifest};

// ── Index Snapshot ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryOrigin {
    /// Produced by a commit or removal in this process.
    Local,
    /// Learned from remote search.
    Remote,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryState {
    Present(PublishedManifest),
    /// Directory with no manifest of its own.
    Implicit,
    /// Known absent. `generation` is the last generation removed, if any.
    Removed { generation: Option<u64> },
}

#[derive(Debug, Clone)]
pub struct SnapshotEntry {
    pub state: EntryState,
    pub origin: EntryOrigin,
    refreshed_at: Instant,
}

impl SnapshotEntry {
    fn new(state: EntryState, origin: EntryOrigin) -> Self {
        Self {
            state,
            origin,
            refreshed_at: Instant::now(),
        }
    }

    pub fn is_fresh(&self, staleness: Duration) -> bool {
        (self.origin == EntryOrigin::Local && !self.is_removed())
            || self.refreshed_at.elapsed() < staleness
    }

    fn is_removed(&self) -> bool {
        matches!(self.state, EntryState::Removed { .. })
    }

    pub fn record(&self) -> Option<&PublishedManifest> {
        match &self.state {
            EntryState::Present(record) => Some(record),
            _ => None,
        }
    }

    fn generation(&self) -> Option<u64> {
        match &self.state {
            EntryState::Present(record) => Some(record.generation()),
            EntryState::Removed { generation } => *generation,
            EntryState::Implicit => None,
        }
    }

    fn exists(&self) -> bool {
        !self.is_removed()
    }
}

/// A child of a listed directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChildEntry {
    Record(PublishedManifest),
    Implicit,
}

pub struct IndexSnapshot {
    entries: HashMap<String, SnapshotEntry>,
    /// Directories whose full listing was fetched, with the fetch time.
    listings: HashMap<String, Instant>,
    staleness: Duration,
}

impl IndexSnapshot {
    pub fn new(staleness: Duration) -> Self {
        Self {
            entries: HashMap::new(),
            listings: HashMap::new(),
            staleness,
        }
    }

    /// Entry for `path` regardless of age.
    pub fn get(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries.get(path)
    }

    /// Entry for `path` if it can be trusted without asking the store.
    pub fn fresh(&self, path: &str) -> Option<&SnapshotEntry> {
        self.entries
            .get(path)
            .filter(|entry| entry.is_fresh(self.staleness))
    }

    /// Record a local commit.
    pub fn record_local(&mut self, path: &str, record: PublishedManifest) {
        self.entries.insert(
            path.to_string(),
            SnapshotEntry::new(EntryState::Present(record), EntryOrigin::Local),
        );
        self.invalidate_listing_of(path);
    }

    /// Record a local removal as a tombstone.
    pub fn remove_local(&mut self, path: &str, generation: Option<u64>) {
        self.entries.insert(
            path.to_string(),
            SnapshotEntry::new(EntryState::Removed { generation }, EntryOrigin::Local),
        );
        self.invalidate_listing_of(path);
    }

    /// Fold in what remote search says about `path`. Returns whether the
    /// snapshot changed.
    ///
    /// A remote answer never regresses a known generation, and never
    /// overrides a local entry unless it carries a newer generation (another
    /// writer). A remote "absent" does not override a local commit, which
    /// search may simply not show yet, but it does retire a local tombstone.
    pub fn apply_remote(&mut self, path: &str, remote: Option<PublishedManifest>) -> bool {
        let incoming = match remote {
            Some(record) => EntryState::Present(record),
            None => EntryState::Removed { generation: None },
        };
        self.apply_remote_state(path, incoming)
    }

    /// Record that `path` exists only as an implicit directory.
    pub fn mark_implicit(&mut self, path: &str) -> bool {
        self.apply_remote_state(path, EntryState::Implicit)
    }

    fn apply_remote_state(&mut self, path: &str, incoming: EntryState) -> bool {
        let accept = match (self.entries.get(path), &incoming) {
            (None, _) => true,
            (Some(current), EntryState::Present(record)) => match current.generation() {
                Some(known) => {
                    record.generation() > known
                        || (current.origin == EntryOrigin::Remote
                            && record.generation() == known)
                }
                None => true,
            },
            (Some(current), EntryState::Removed { .. }) => {
                current.origin == EntryOrigin::Remote || current.is_removed()
            }
            (Some(current), _) => current.origin == EntryOrigin::Remote,
        };
        if accept {
            self.entries.insert(
                path.to_string(),
                SnapshotEntry::new(incoming, EntryOrigin::Remote),
            );
        } else if let Some(entry) = self.entries.get_mut(path) {
            // A tombstone is refreshed while search still shows what it hides.
            let lagging = entry.is_removed() && matches!(incoming, EntryState::Present(_));
            if entry.origin == EntryOrigin::Remote || lagging {
                entry.refreshed_at = Instant::now();
            }
        }
        accept
    }

    /// Replace the remote view of everything below `dir` with a fresh scan.
    pub fn apply_listing(&mut self, dir: &str, records: Vec<PublishedManifest>) {
        let listed: std::collections::HashSet<String> =
            records.iter().map(|r| r.manifest.path.clone()).collect();
        let staleness = self.staleness;
        self.entries.retain(|p, entry| {
            !path::is_descendant(p, dir)
                || listed.contains(p)
                || (entry.origin == EntryOrigin::Local
                    && (!entry.is_removed() || entry.is_fresh(staleness)))
        });
        for record in records {
            let p = record.manifest.path.clone();
            self.apply_remote(&p, Some(record));
        }
        self.listings.insert(dir.to_string(), Instant::now());
    }

    pub fn listing_fresh(&self, dir: &str) -> bool {
        self.listings
            .get(dir)
            .is_some_and(|at| at.elapsed() < self.staleness)
    }

    fn invalidate_listing_of(&mut self, path: &str) {
        self.listings.remove(path);
        if let Some(parent) = path::parent(path) {
            self.listings.remove(parent);
        }
    }

    /// Whether any existing entry lies below `dir`.
    pub fn has_descendants(&self, dir: &str) -> bool {
        self.entries
            .iter()
            .any(|(p, entry)| entry.exists() && path::is_descendant(p, dir))
    }

    /// Present entries below `dir`, deepest first.
    pub fn subtree(&self, dir: &str) -> Vec<PublishedManifest> {
        let mut out: Vec<PublishedManifest> = self
            .entries
            .iter()
            .filter(|(p, _)| path::is_descendant(p, dir))
            .filter_map(|(_, entry)| entry.record().cloned())
            .collect();
        out.sort_by(|a, b| {
            let depth = |r: &PublishedManifest| r.manifest.path.matches('/').count();
            depth(b).cmp(&depth(a)).then(a.manifest.path.cmp(&b.manifest.path))
        });
        out
    }

    /// Immediate children of `dir`, named, from everything the snapshot
    /// knows.
    pub fn children(&self, dir: &str) -> BTreeMap<String, ChildEntry> {
        let mut out = BTreeMap::new();
        for (p, entry) in &self.entries {
            if !entry.exists() {
                continue;
            }
            let Some(name) = path::child_name(dir, p) else {
                continue;
            };
            let direct = path::join(dir, name) == *p;
            match (&entry.state, direct) {
                (EntryState::Present(record), true) => {
                    out.insert(name.to_string(), ChildEntry::Record(record.clone()));
                }
                _ => {
                    out.entry(name.to_string()).or_insert(ChildEntry::Implicit);
                }
            }
        }
        out
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget expired absences and listing times. Returns how many entries
    /// went.
    pub fn prune(&mut self) -> usize {
        let staleness = self.staleness;
        let before = self.entries.len();
        self.entries
            .retain(|_, entry| !entry.is_removed() || entry.is_fresh(staleness));
        self.listings.retain(|_, at| at.elapsed() < staleness);
        before - self.entries.len()
    }

    /// Drop everything. Used at unmount.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.listings.clear();
    }
}

// ── Content Cache ─────────────────────────────────────────────────────────────

/// Cached decrypted chunk with LRU tracking. Zeroized on drop.
struct CachedContent {
    data: Zeroizing<Vec<u8>>,
    accessed_at: Instant,
}

/// In-memory LRU cache for decrypted chunk plaintext, keyed by message id.
///
/// Evicts least-recently-accessed entries when the total exceeds the budget.
/// Plaintext is never persisted to disk.
pub struct ContentCache {
    entries: HashMap<MessageId, CachedContent>,
    current_size: usize,
    max_size: usize,
}

impl ContentCache {
    pub fn new(max_size: usize) -> Self {
        Self {
            entries: HashMap::new(),
            current_size: 0,
            max_size,
        }
    }

    /// Get cached plaintext, updating the access time for LRU tracking.
    pub fn get(&mut self, id: MessageId) -> Option<&[u8]> {
        let entry = self.entries.get_mut(&id)?;
        entry.accessed_at = Instant::now();
        Some(entry.data.as_slice())
    }

    /// Store plaintext, evicting LRU entries if over budget.
    pub fn set(&mut self, id: MessageId, data: Zeroizing<Vec<u8>>) {
        let size = data.len();
        if size > self.max_size {
            return;
        }

        if let Some(old) = self.entries.remove(&id) {
            self.current_size = self.current_size.saturating_sub(old.data.len());
        }
        while self.current_size + size > self.max_size && !self.entries.is_empty() {
            self.evict_lru();
        }

        self.current_size += size;
        self.entries.insert(
            id,
            CachedContent {
                data,
                accessed_at: Instant::now(),
            },
        );
    }

    /// Drop an entry, e.g. after its message was deleted.
    pub fn invalidate(&mut self, id: MessageId) {
        if let Some(old) = self.entries.remove(&id) {
            self.current_size = self.current_size.saturating_sub(old.data.len());
        }
    }

    fn evict_lru(&mut self) {
        if let Some(oldest) = self
            .entries
            .iter()
            .min_by_key(|(_, v)| v.accessed_at)
            .map(|(k, _)| *k)
        {
            self.invalidate(oldest);
        }
    }

    pub fn current_size(&self) -> usize {
        self.current_size
    }

    /// Clear all cached content; each entry is zeroized as it drops.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.current_size = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::manifest::Manifest;

    fn record(path: &str, generation: u64) -> PublishedManifest {
        let mut manifest = Manifest::placeholder(path, 0o755, 0, 16);
        manifest.generation = generation;
        PublishedManifest {
            manifest,
            message_id: 100 + generation,
        }
    }

    // ── IndexSnapshot tests ───────────────────────────────────────────────

    #[test]
    fn test_local_entries_never_go_stale() {
        let mut snap = IndexSnapshot::new(Duration::ZERO);
        snap.record_local("/a", record("/a", 0));
        assert!(snap.fresh("/a").is_some());

        snap.apply_remote("/b", Some(record("/b", 0)));
        assert!(snap.fresh("/b").is_none());
        assert!(snap.get("/b").is_some());
    }

    #[test]
    fn test_remote_absence_does_not_hide_local_commit() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.record_local("/a", record("/a", 2));
        assert!(!snap.apply_remote("/a", None));
        assert_eq!(snap.fresh("/a").unwrap().record().unwrap().generation(), 2);
    }

    #[test]
    fn test_no_generation_regression() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        assert!(snap.apply_remote("/a", Some(record("/a", 3))));
        assert!(!snap.apply_remote("/a", Some(record("/a", 2))));
        assert!(snap.apply_remote("/a", Some(record("/a", 4))));

        snap.record_local("/b", record("/b", 5));
        assert!(!snap.apply_remote("/b", Some(record("/b", 5))));
        assert!(snap.apply_remote("/b", Some(record("/b", 6))));
        assert_eq!(snap.get("/b").unwrap().origin, EntryOrigin::Remote);
    }

    #[test]
    fn test_tombstone_blocks_lagging_resurrection() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.remove_local("/a", Some(1));
        assert!(!snap.apply_remote("/a", Some(record("/a", 1))));
        assert!(snap.fresh("/a").unwrap().record().is_none());
    }

    #[test]
    fn test_remote_absence_retires_tombstone() {
        let mut snap = IndexSnapshot::new(Duration::ZERO);
        snap.remove_local("/a", Some(1));
        assert!(snap.fresh("/a").is_none());

        assert!(snap.apply_remote("/a", None));
        assert_eq!(snap.get("/a").unwrap().origin, EntryOrigin::Remote);
        assert_eq!(snap.prune(), 1);
        assert!(snap.is_empty());
    }

    #[test]
    fn test_lagging_search_keeps_stale_tombstone() {
        let mut snap = IndexSnapshot::new(Duration::ZERO);
        snap.remove_local("/a", Some(1));
        assert!(!snap.apply_remote("/a", Some(record("/a", 1))));
        let entry = snap.get("/a").unwrap();
        assert_eq!(entry.origin, EntryOrigin::Local);
        assert!(entry.record().is_none());

        // A newer generation is another writer, not lag.
        assert!(snap.apply_remote("/a", Some(record("/a", 2))));
        assert_eq!(snap.get("/a").unwrap().record().unwrap().generation(), 2);
    }

    #[test]
    fn test_prune_drops_only_expired_absences() {
        let mut snap = IndexSnapshot::new(Duration::from_millis(20));
        snap.record_local("/kept", record("/kept", 0));
        snap.remove_local("/gone", Some(0));
        snap.apply_remote("/missing", None);
        assert_eq!(snap.prune(), 0);

        std::thread::sleep(Duration::from_millis(30));
        assert_eq!(snap.prune(), 2);
        assert_eq!(snap.len(), 1);
        assert!(snap.fresh("/kept").is_some());
    }

    #[test]
    fn test_listing_drops_expired_tombstones() {
        let mut snap = IndexSnapshot::new(Duration::ZERO);
        snap.remove_local("/d/x", Some(0));
        snap.remove_local("/d/y", Some(0));
        snap.apply_listing("/d", vec![record("/d/y", 0)]);
        assert!(snap.get("/d/x").is_none());
        assert!(snap.get("/d/y").unwrap().record().is_none());
    }

    #[test]
    fn test_listing_freshness_and_invalidation() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.apply_listing("/d", vec![record("/d/x", 0)]);
        assert!(snap.listing_fresh("/d"));

        snap.record_local("/d/y", record("/d/y", 0));
        assert!(!snap.listing_fresh("/d"));
    }

    #[test]
    fn test_listing_drops_vanished_remote_entries() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.apply_listing("/d", vec![record("/d/x", 0), record("/d/y", 0)]);
        snap.record_local("/d/z", record("/d/z", 0));

        snap.apply_listing("/d", vec![record("/d/x", 0)]);
        assert!(snap.get("/d/y").is_none());
        assert!(snap.get("/d/z").is_some());
    }

    #[test]
    fn test_children_include_implicit_dirs() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.record_local("/a", record("/a", 0));
        snap.record_local("/d/e/f", record("/d/e/f", 0));
        snap.remove_local("/gone", Some(0));

        let root = snap.children("/");
        assert_eq!(root.keys().collect::<Vec<_>>(), vec!["a", "d"]);
        assert!(matches!(root["d"], ChildEntry::Implicit));
        assert!(matches!(root["a"], ChildEntry::Record(_)));

        let d = snap.children("/d");
        assert_eq!(d.keys().collect::<Vec<_>>(), vec!["e"]);
        assert!(snap.has_descendants("/d"));
        assert!(!snap.has_descendants("/a"));
    }

    #[test]
    fn test_subtree_deepest_first() {
        let mut snap = IndexSnapshot::new(Duration::from_secs(60));
        snap.record_local("/d/a", record("/d/a", 0));
        snap.record_local("/d/e/f", record("/d/e/f", 0));
        snap.record_local("/x", record("/x", 0));
        let paths: Vec<String> = snap
            .subtree("/d")
            .into_iter()
            .map(|r| r.manifest.path)
            .collect();
        assert_eq!(paths, vec!["/d/e/f", "/d/a"]);
    }

    // ── ContentCache tests ────────────────────────────────────────────────

    fn bytes(fill: u8, len: usize) -> Zeroizing<Vec<u8>> {
        Zeroizing::new(vec![fill; len])
    }

    #[test]
    fn test_content_cache_set_and_get() {
        let mut cache = ContentCache::new(1024);
        cache.set(1, Zeroizing::new(vec![1, 2, 3, 4]));
        assert_eq!(cache.get(1), Some(&[1u8, 2, 3, 4][..]));
        assert!(cache.get(2).is_none());
    }

    #[test]
    fn test_content_cache_lru_eviction_order() {
        let mut cache = ContentCache::new(300);
        cache.set(1, bytes(0, 101));
        cache.set(2, bytes(1, 101));
        // Touch 1 so 2 becomes least recently used.
        std::thread::sleep(Duration::from_millis(2));
        let _ = cache.get(1);

        cache.set(3, bytes(2, 101));
        assert!(cache.get(1).is_some());
        assert!(cache.get(2).is_none());
        assert!(cache.get(3).is_some());
        assert_eq!(cache.current_size(), 202);
    }

    #[test]
    fn test_content_cache_update_existing() {
        let mut cache = ContentCache::new(1024);
        cache.set(1, bytes(1, 3));
        cache.set(1, bytes(1, 5));
        assert_eq!(cache.current_size(), 5);
        cache.invalidate(1);
        assert_eq!(cache.current_size(), 0);
    }

    #[test]
    fn test_content_cache_skips_oversized() {
        let mut cache = ContentCache::new(10);
        cache.set(1, bytes(0, 11));
        assert!(cache.get(1).is_none());
        assert_eq!(cache.current_size(), 0);
    }
}
