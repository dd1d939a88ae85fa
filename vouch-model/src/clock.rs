//! Time source for entity timestamps
//!
//! Identities, trusts and scores stamp creation, last-changed and
//! last-fetched times in milliseconds since the Unix epoch, with 0
//! meaning "never". The source of those stamps is a trait so tests can
//! pin and advance time instead of sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// Source of entity timestamps.
pub trait Clock: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn now_ms(&self) -> u64;
}

/// Wall-clock time. A clock sitting before the Unix epoch reports 0
/// rather than panicking; entities stamped that way read as "never",
/// which is the least damaging interpretation of a broken clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Mock clock for testing - settable and advanceable
#[derive(Debug, Clone, Default)]
pub struct MockClock {
    time_ms: Arc<AtomicU64>,
}

impl MockClock {
    pub fn new(time_ms: u64) -> Self {
        Self {
            time_ms: Arc::new(AtomicU64::new(time_ms)),
        }
    }

    pub fn set(&self, time_ms: u64) {
        self.time_ms.store(time_ms, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_ms: u64) {
        self.time_ms.fetch_add(delta_ms, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn now_ms(&self) -> u64 {
        self.time_ms.load(Ordering::SeqCst)
    }
}
