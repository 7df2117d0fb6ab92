//! Engine configuration.

use std::time::Duration;

/// Configuration for sync behavior.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Maximum rows per table in one page or one send round.
    pub batch_limit: usize,
    /// Timeout applied to every network request.
    pub request_timeout: Duration,
    /// Period of the background scheduler.
    pub tick_interval: Duration,
    /// Whether to run the view refresher at the end of a cycle.
    pub refresh_views: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_limit: 500,
            request_timeout: Duration::from_secs(30),
            tick_interval: Duration::from_secs(60),
            refresh_views: false,
        }
    }
}

impl SyncConfig {
    /// The batch limit, never below one.
    pub fn effective_batch_limit(&self) -> usize {
        self.batch_limit.max(1)
    }
}
