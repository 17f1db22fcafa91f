//! Background daemon for a mounted mailfs.
//!
//! On every tick it retries flushes parked by `release` and deletions of
//! superseded messages that failed after their commit, and prunes expired
//! tombstones from the index snapshot. Every
//! `sweep_interval` it also runs the orphan sweep, which removes chunks and
//! manifests no live manifest references (crash leftovers, lost retirements).
//!
//! Nothing here affects correctness of reads: the daemon only finishes work
//! that foreground calls already handed off.

pub mod queue;

pub use queue::{QueuedItem, RetryError, RetryHandler, RetryQueue};

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::MountConfig;
use crate::fuse::MailFs;
use crate::store::{MailStore, SweepReport};

/// What one daemon cycle accomplished.
#[derive(Debug, Default)]
pub struct CycleReport {
    pub flushed: usize,
    pub retired: usize,
    /// Expired snapshot entries dropped.
    pub pruned: usize,
    /// Present when this cycle ran a sweep that completed.
    pub sweep: Option<SweepReport>,
}

pub struct SyncDaemon<S: MailStore> {
    fs: Arc<MailFs<S>>,
    tick: Duration,
    sweep_interval: Duration,
    last_sweep: Instant,
    /// Whether the last sweep failed on a transient store error.
    was_offline: bool,
}

impl<S: MailStore> SyncDaemon<S> {
    /// The first sweep happens one `sweep_interval` after creation; the
    /// mount itself may already have swept.
    pub fn new(fs: Arc<MailFs<S>>, config: &MountConfig) -> Self {
        Self {
            fs,
            tick: config.daemon_tick,
            sweep_interval: config.sweep_interval,
            last_sweep: Instant::now(),
            was_offline: false,
        }
    }

    /// Run on `rt` until the returned handle is stopped.
    pub fn spawn(self, rt: &Handle) -> DaemonHandle {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let task = rt.spawn(self.run(shutdown_rx));
        DaemonHandle { shutdown_tx, task }
    }

    /// Main loop. Returns once `shutdown` flips to true or its sender is
    /// dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.tick);
        // The first tick fires immediately; skip it to let the mount settle.
        ticker.tick().await;

        log::info!(
            "Sync daemon started (tick: {}s, sweep every {}s)",
            self.tick.as_secs(),
            self.sweep_interval.as_secs()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.cycle().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        log::info!("Sync daemon stopped");
    }

    /// One pass over all deferred work.
    pub async fn cycle(&mut self) -> CycleReport {
        let mut report = CycleReport {
            flushed: self.fs.drain_flush_queue().await,
            retired: self.fs.engine().process_retirements().await,
            pruned: self.fs.prune_snapshot(),
            sweep: None,
        };
        if report.flushed > 0 || report.retired > 0 {
            log::info!(
                "Sync cycle: {} parked flush(es) committed, {} retirement(s) done",
                report.flushed,
                report.retired
            );
        }
        if report.pruned > 0 {
            log::debug!("Sync cycle: {} expired snapshot entries pruned", report.pruned);
        }

        if self.last_sweep.elapsed() >= self.sweep_interval {
            self.last_sweep = Instant::now();
            match self.fs.engine().sweep_orphans().await {
                Ok(sweep) => {
                    if self.was_offline {
                        log::info!("Store reachable again");
                        self.was_offline = false;
                    }
                    report.sweep = Some(sweep);
                }
                Err(e) if e.is_transient() => {
                    if !self.was_offline {
                        log::warn!("Store unreachable, sweep postponed: {}", e);
                        self.was_offline = true;
                    }
                }
                Err(e) => log::warn!("Orphan sweep failed: {}", e),
            }
        }
        report
    }
}

/// Handle to a spawned daemon.
pub struct DaemonHandle {
    shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DaemonHandle {
    /// Signal the loop and wait for it to exit. A cycle in progress is
    /// allowed to finish.
    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        if let Err(e) = self.task.await {
            log::warn!("Sync daemon task ended abnormally: {}", e);
        }
    }
}
