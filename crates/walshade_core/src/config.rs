//! Engine configuration.

use std::time::Duration;

/// Configuration for a managed database.
#[derive(Debug, Clone)]
pub struct DbConfig {
    /// Minimum WAL size, in pages, before a passive checkpoint is attempted.
    /// A passive checkpoint never waits for readers and may be partial.
    pub min_checkpoint_pages: u32,

    /// Maximum WAL size, in pages, before a restart checkpoint is forced.
    /// A restart checkpoint waits for writers to finish and resets the WAL.
    ///
    /// If zero, checkpoints are never forced; the WAL can grow unbounded
    /// while read transactions are always active.
    pub max_checkpoint_pages: u32,

    /// Time since the last database modification after which a passive
    /// checkpoint is issued even below the page thresholds, provided the WAL
    /// holds at least one frame. Zero disables time-based checkpoints.
    pub checkpoint_interval: Duration,

    /// Interval between capture ticks. Zero disables the background monitor;
    /// sync must then be driven manually.
    pub monitor_interval: Duration,

    /// SQLite busy timeout for both engine connections.
    pub busy_timeout: Duration,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            min_checkpoint_pages: 1000,
            max_checkpoint_pages: 10_000,
            checkpoint_interval: Duration::from_secs(60),
            monitor_interval: Duration::from_secs(1),
            busy_timeout: Duration::from_secs(1),
        }
    }
}

impl DbConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the passive checkpoint threshold, in pages.
    #[must_use]
    pub const fn min_checkpoint_pages(mut self, pages: u32) -> Self {
        self.min_checkpoint_pages = pages;
        self
    }

    /// Sets the forced checkpoint threshold, in pages.
    #[must_use]
    pub const fn max_checkpoint_pages(mut self, pages: u32) -> Self {
        self.max_checkpoint_pages = pages;
        self
    }

    /// Sets the time-based checkpoint interval.
    #[must_use]
    pub const fn checkpoint_interval(mut self, interval: Duration) -> Self {
        self.checkpoint_interval = interval;
        self
    }

    /// Sets the capture tick interval.
    #[must_use]
    pub const fn monitor_interval(mut self, interval: Duration) -> Self {
        self.monitor_interval = interval;
        self
    }
}
