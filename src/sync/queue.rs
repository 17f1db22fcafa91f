//! Retry queue for remote work that failed after its caller moved on.
//!
//! Two kinds of work end up here: dirty buffers whose flush on release hit a
//! transient store error, and retirements (deletes of superseded messages)
//! that failed after their commit already succeeded.
//!
//! Memory-only: queued items are lost when the process exits. A lost
//! retirement leaves garbage for the next orphan sweep. Parked flushes hold
//! writes `release` already acknowledged, so their queue has no retry limit.

use std::collections::VecDeque;
use std::fmt::Display;
use std::future::Future;
use std::time::Instant;

use thiserror::Error;

/// A single queued item with its retry bookkeeping.
#[derive(Debug, Clone)]
pub struct QueuedItem<T> {
    pub item: T,
    /// When this item was queued.
    pub created_at: Instant,
    /// Number of attempts that failed.
    pub retries: u32,
}

/// Why an attempt failed.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RetryError {
    /// Worth another attempt later.
    #[error("{0}")]
    Transient(String),
    /// Will never succeed; the item is dropped at once.
    #[error("{0}")]
    Permanent(String),
}

/// Trait abstracting the retried operation for testability.
pub trait RetryHandler<T> {
    fn attempt(&self, item: &T) -> impl Future<Output = Result<(), RetryError>> + Send;
}

/// FIFO queue of items awaiting another attempt.
///
/// Items are processed front-to-back. On a transient failure, the item is
/// moved to the back with `retries` incremented; items exceeding
/// `max_retries` (if set) are dropped. A permanent failure drops the item.
pub struct RetryQueue<T> {
    queue: VecDeque<QueuedItem<T>>,
    max_retries: Option<u32>,
}

impl<T: Display> RetryQueue<T> {
    pub fn new(max_retries: u32) -> Self {
        Self {
            queue: VecDeque::new(),
            max_retries: Some(max_retries),
        }
    }

    /// A queue that keeps retrying transient failures until they succeed.
    pub fn unbounded() -> Self {
        Self {
            queue: VecDeque::new(),
            max_retries: None,
        }
    }

    /// Add an item to the back of the queue.
    pub fn enqueue(&mut self, item: T) {
        self.queue.push_back(QueuedItem {
            item,
            created_at: Instant::now(),
            retries: 0,
        });
    }

    /// Attempt every queued item once.
    ///
    /// Returns the number of items that succeeded. Dropped items are
    /// logged at error level.
    pub async fn process<H: RetryHandler<T>>(&mut self, handler: &H) -> usize {
        if self.queue.is_empty() {
            return 0;
        }

        let mut processed = 0;
        let mut remaining = VecDeque::new();

        // Process each item exactly once per call
        while let Some(mut queued) = self.queue.pop_front() {
            match handler.attempt(&queued.item).await {
                Ok(()) => {
                    log::info!(
                        "Queued item processed after {:?}: {}",
                        queued.created_at.elapsed(),
                        queued.item
                    );
                    processed += 1;
                }
                Err(RetryError::Permanent(e)) => {
                    log::error!(
                        "Queued item dropped after a permanent failure: {} - {}",
                        queued.item,
                        e
                    );
                }
                Err(RetryError::Transient(e)) => {
                    queued.retries += 1;
                    match self.max_retries {
                        Some(max) if queued.retries > max => {
                            log::error!(
                                "Queued item dropped after {} retries: {} - {}",
                                max,
                                queued.item,
                                e
                            );
                        }
                        _ => {
                            log::warn!(
                                "Queued item retry {}: {} - {}",
                                queued.retries,
                                queued.item,
                                e
                            );
                            remaining.push_back(queued);
                        }
                    }
                }
            }
        }

        self.queue = remaining;
        processed
    }

    /// Remove and return every queued item matching `pred`.
    pub fn take_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.queue.len());
        for queued in self.queue.drain(..) {
            if pred(&queued.item) {
                taken.push(queued.item);
            } else {
                kept.push_back(queued);
            }
        }
        self.queue = kept;
        taken
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueuedItem<T>> {
        self.queue.iter()
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}

impl<T: Display> Default for RetryQueue<T> {
    fn default() -> Self {
        Self::new(5)
    }
}
