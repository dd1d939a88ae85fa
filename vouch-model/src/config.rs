//! Kernel configuration

use crate::score::DEFAULT_CAPACITY_TABLE;
use std::time::Duration;

/// Tunables of the kernel. Defaults match production behavior; tests
/// shorten the delays.
#[derive(Clone, Debug)]
pub struct Config {
    /// Coalescing delay before the importer drains the import queue,
    /// giving the queue time to deduplicate bursts of editions.
    pub import_delay: Duration,
    /// Coalescing delay before queued notifications are deployed to
    /// clients. Also the retry delay after a failed deployment.
    pub subscription_delay: Duration,
    /// Number of explicit client failures after which a client is
    /// disconnected and forgotten.
    pub client_failure_limit: u8,
    /// Capacity by rank; ranks beyond the table have capacity 0. Entries
    /// must be drawn from the standard capacity set.
    pub capacity_table: [u8; 6],
}

impl Default for Config {
    fn default() -> Self {
        Self {
            import_delay: Duration::from_secs(60),
            subscription_delay: Duration::from_secs(60),
            client_failure_limit: 5,
            capacity_table: DEFAULT_CAPACITY_TABLE,
        }
    }
}
