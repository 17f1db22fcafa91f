//! Coordinates manifest commits so generations never race or roll back.
//!
//! - one async lock per path serializes commits on that path
//! - a monotonic generation cache per path remembers the highest generation
//!   this mount has seen or reserved, including orphans
//! - a committed-generation cache records what this mount last made current
//! - a read/write gate lets many commits run at once but keeps the orphan
//!   sweep out while any is in flight

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};

use super::transport::MessageId;

/// A manifest this mount made current, with the messages it keeps alive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitRecord {
    pub generation: u64,
    pub manifest_id: MessageId,
    pub chunk_ids: Vec<MessageId>,
}

#[derive(Default)]
pub struct PublishCoordinator {
    /// Per-path highest generation seen or reserved (monotonically increasing).
    reserved: Mutex<HashMap<String, u64>>,
    /// Per-path manifest this mount made current. `None` records a local
    /// removal.
    committed: Mutex<HashMap<String, Option<CommitRecord>>>,
    /// Per-path publish locks.
    publish_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    sweep_gate: RwLock<()>,
}

impl PublishCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get or create the publish lock for a path id, then hold it.
    pub async fn lock_path(&self, path_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self
                .publish_locks
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            locks
                .entry(path_id.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Held by every commit for its whole duration.
    pub async fn commit_guard(&self) -> RwLockReadGuard<'_, ()> {
        self.sweep_gate.read().await
    }

    /// Held by the orphan sweep; waits for in-flight commits to finish.
    pub async fn sweep_guard(&self) -> RwLockWriteGuard<'_, ()> {
        self.sweep_gate.write().await
    }

    /// Highest generation known for the path, if this mount has looked.
    pub fn known_generation(&self, path_id: &str) -> Option<u64> {
        self.reserved
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path_id)
            .copied()
    }

    /// Fold an observed generation into the cache (never decreases it).
    pub fn observe(&self, path_id: &str, generation: u64) {
        let mut cache = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = cache.entry(path_id.to_string()).or_insert(generation);
        if generation > *entry {
            *entry = generation;
        }
    }

    /// Reserve the next generation for a path.
    ///
    /// `seen` is the highest generation the caller found remotely. The first
    /// generation of a path that has never existed is 0; otherwise the next
    /// one is one above everything observed so far.
    pub fn reserve(&self, path_id: &str, seen: Option<u64>) -> u64 {
        let mut cache = self.reserved.lock().unwrap_or_else(PoisonError::into_inner);
        let highest = cache.get(path_id).copied().max(seen);
        let next = highest.map_or(0, |g| g + 1);
        cache.insert(path_id.to_string(), next);
        next
    }

    /// Record what this mount made current for a path (`None`: removed).
    pub fn record_commit(&self, path_id: &str, record: Option<CommitRecord>) {
        if let Some(record) = &record {
            self.observe(path_id, record.generation);
        }
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(path_id.to_string(), record);
    }

    /// Generation this mount last committed for the path. Outer `None`:
    /// nothing recorded; inner `None`: removed locally.
    pub fn committed(&self, path_id: &str) -> Option<Option<u64>> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(path_id)
            .map(|record| record.as_ref().map(|r| r.generation))
    }

    /// Every path this mount currently holds a live commit for.
    pub fn live_commits(&self) -> Vec<(String, CommitRecord)> {
        self.committed
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter_map(|(path_id, record)| {
                record.as_ref().map(|r| (path_id.clone(), r.clone()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn record(generation: u64) -> CommitRecord {
        CommitRecord {
            generation,
            manifest_id: 100 + generation,
            chunk_ids: vec![1, 2],
        }
    }

    #[test]
    fn test_reserve_is_monotonic() {
        let c = PublishCoordinator::new();
        assert_eq!(c.reserve("p", None), 0);
        assert_eq!(c.reserve("p", None), 1);
        c.observe("p", 0);
        assert_eq!(c.reserve("p", None), 2);
        c.observe("p", 10);
        assert_eq!(c.reserve("p", Some(4)), 11);
        assert_eq!(c.reserve("q", Some(7)), 8);
    }

    #[test]
    fn test_commit_record() {
        let c = PublishCoordinator::new();
        assert_eq!(c.committed("p"), None);
        c.record_commit("p", Some(record(5)));
        assert_eq!(c.committed("p"), Some(Some(5)));
        assert_eq!(c.known_generation("p"), Some(5));
        assert_eq!(c.live_commits(), vec![("p".to_string(), record(5))]);

        c.record_commit("p", None);
        assert_eq!(c.committed("p"), Some(None));
        assert_eq!(c.known_generation("p"), Some(5));
        assert!(c.live_commits().is_empty());
    }

    #[tokio::test]
    async fn test_path_lock_serializes() {
        let c = Arc::new(PublishCoordinator::new());
        let guard = c.lock_path("p").await;

        let c2 = Arc::clone(&c);
        let waiter = tokio::spawn(async move {
            let _g = c2.lock_path("p").await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        // A different path is independent.
        let _other = c.lock_path("q").await;

        drop(guard);
        waiter.await.unwrap();
    }

    #[tokio::test]
    async fn test_sweep_waits_for_commits() {
        let c = Arc::new(PublishCoordinator::new());
        let commit = c.commit_guard().await;

        let c2 = Arc::clone(&c);
        let sweep = tokio::spawn(async move {
            let _g = c2.sweep_guard().await;
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!sweep.is_finished());
        drop(commit);
        sweep.await.unwrap();
    }
}
