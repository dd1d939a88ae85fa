//! The import queue
//!
//! A FIFO of fetched identity files awaiting import, with deduplication:
//! when a newer edition for an identity arrives while an older one is
//! still queued, the older one is dropped. The registered handler (the
//! importer's delayed job) is triggered on every add, so bursts coalesce
//! into one drain after the import delay.

use crate::jobs::DelayedJob;
use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use tracing::debug;
use vouch_model::{Clock, RequestUri};
use std::sync::Arc;

/// One fetched identity file: the URI it was retrieved under (carrying the
/// actual edition the fetcher found) and the raw payload.
#[derive(Clone, Debug)]
pub struct QueuedFile {
    pub uri: RequestUri,
    pub payload: Vec<u8>,
}

/// Counters of the import pipeline.
#[derive(Clone, Debug, Default)]
pub struct QueueStats {
    /// Files ever enqueued, including ones later deduplicated.
    pub queued: u64,
    /// Files dropped because another edition of the same identity
    /// superseded them.
    pub deduplicated: u64,
    /// Files whose import failed (unparseable or rejected).
    pub failed: u64,
    /// Files imported successfully (including no-op re-imports).
    pub finished: u64,
    /// Total import processing time, for the average.
    pub processing_ms_total: u64,
    /// When the queue was created, for the per-hour average.
    pub started_ms: u64,
}

impl QueueStats {
    /// Average imports finished per hour since the queue was created.
    pub fn average_finished_per_hour(&self, now_ms: u64) -> f64 {
        let elapsed_ms = now_ms.saturating_sub(self.started_ms).max(1);
        self.finished as f64 * 3_600_000.0 / elapsed_ms as f64
    }

    /// Average processing time of a finished import in milliseconds.
    pub fn average_processing_ms(&self) -> f64 {
        if self.finished == 0 {
            0.0
        } else {
            self.processing_ms_total as f64 / self.finished as f64
        }
    }
}

struct QueueInner {
    files: VecDeque<QueuedFile>,
    stats: QueueStats,
}

pub struct ImportQueue {
    inner: Mutex<QueueInner>,
    handler: Mutex<Option<Weak<dyn DelayedJob>>>,
    clock: Arc<dyn Clock>,
}

impl ImportQueue {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let started_ms = clock.now_ms();
        Self {
            inner: Mutex::new(QueueInner {
                files: VecDeque::new(),
                stats: QueueStats {
                    started_ms,
                    ..QueueStats::default()
                },
            }),
            handler: Mutex::new(None),
            clock,
        }
    }

    /// Registers the job to trigger whenever a file is enqueued. Held
    /// weakly so the queue does not keep the job graph alive.
    pub fn register_handler(&self, handler: &Arc<dyn DelayedJob>) {
        *self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(Arc::downgrade(handler));
    }

    /// Enqueues a fetched file, deduplicating against a queued file of the
    /// same identity: the higher edition wins regardless of arrival order.
    pub fn add(&self, file: QueuedFile) {
        {
            let mut inner = self
                .inner
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            inner.stats.queued += 1;
            let existing = inner
                .files
                .iter()
                .position(|f| f.uri.id() == file.uri.id());
            match existing {
                Some(pos) if inner.files[pos].uri.edition() >= file.uri.edition() => {
                    debug!(
                        identity = %file.uri.id(),
                        edition = file.uri.edition(),
                        queued_edition = inner.files[pos].uri.edition(),
                        "dropping superseded identity file"
                    );
                    inner.stats.deduplicated += 1;
                    return;
                }
                Some(pos) => {
                    inner.files.remove(pos);
                    inner.stats.deduplicated += 1;
                    inner.files.push_back(file);
                }
                None => inner.files.push_back(file),
            }
        }
        let handler = self
            .handler
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        if let Some(job) = handler.and_then(|weak| weak.upgrade()) {
            job.trigger();
        }
    }

    /// Removes and returns the head of the queue.
    pub fn poll(&self) -> Option<QueuedFile> {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .files
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .files
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn mark_finished(&self, processing_ms: u64) {
        let mut inner = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        inner.stats.finished += 1;
        inner.stats.processing_ms_total += processing_ms;
    }

    pub fn mark_failed(&self) {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stats
            .failed += 1;
    }

    pub fn stats(&self) -> QueueStats {
        self.inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .stats
            .clone()
    }

    pub fn average_finished_per_hour(&self) -> f64 {
        self.stats().average_finished_per_hour(self.clock.now_ms())
    }
}
