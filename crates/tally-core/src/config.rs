//! Runtime knobs for the vote engine, the stores and the reconciliation worker.

use std::time::Duration;

/// Tuning for a [`crate::core::TallyServices`] instance.
///
/// Defaults suit a single API process talking to a local Redis and SQLite.
#[derive(Debug, Clone)]
pub struct TallyConfig {
    /// Connect/read/write timeout for counter store calls.
    pub counter_timeout: Duration,
    /// How long SQLite waits on a locked database before giving up.
    pub busy_timeout: Duration,
    /// Extra attempts after a uniqueness conflict on a vote insert.
    pub max_conflict_retries: u32,
    /// Entities popped from the pending-sync set per drain.
    pub dirty_batch_size: usize,
    /// Entities fetched per page during a full sweep.
    pub sweep_page_size: usize,
    /// Pause between pending-sync drains in the background worker.
    pub drain_interval: Duration,
    /// Pause between full sweeps in the background worker.
    pub sweep_interval: Duration,
    /// Run a full sweep as soon as the worker starts.
    pub sweep_on_start: bool,
}

impl Default for TallyConfig {
    fn default() -> Self {
        Self {
            counter_timeout: Duration::from_millis(50),
            busy_timeout: Duration::from_secs(5),
            max_conflict_retries: 3,
            dirty_batch_size: 256,
            sweep_page_size: 500,
            drain_interval: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(15 * 60),
            sweep_on_start: true,
        }
    }
}
