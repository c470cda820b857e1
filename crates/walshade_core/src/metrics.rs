//! Per-database replication metrics.
//!
//! Counters and gauges are advisory: they never influence engine behavior.
//! Each [`crate::Db`] owns its own instance, so tests can open many
//! databases without any process-global registry collisions.

use crate::sqlite::CheckpointMode;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Metrics for one managed database.
///
/// All fields are atomics readable while a sync is in progress.
#[derive(Debug, Default)]
pub struct DbMetrics {
    /// Current size of the live database file, in bytes.
    db_size: AtomicU64,
    /// Current size of the live WAL file, in bytes.
    wal_size: AtomicU64,
    /// Cumulative bytes copied into shadow WAL segments.
    total_wal_bytes: AtomicU64,
    /// Current shadow WAL index.
    shadow_wal_index: AtomicU64,
    /// Total bytes across the current generation's shadow segments.
    shadow_wal_size: AtomicU64,
    /// Number of sync ticks performed.
    sync_count: AtomicU64,
    /// Number of sync ticks that returned an error.
    sync_error_count: AtomicU64,
    /// Total time spent in sync ticks, in microseconds.
    sync_micros: AtomicU64,
    /// Per-mode checkpoint counters, indexed by [`CheckpointMode`].
    checkpoints: [CheckpointMetrics; 3],
}

/// Checkpoint counters for a single mode.
#[derive(Debug, Default)]
struct CheckpointMetrics {
    count: AtomicU64,
    error_count: AtomicU64,
    micros: AtomicU64,
}

impl DbMetrics {
    /// Creates a zeroed metrics instance.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn set_db_size(&self, bytes: u64) {
        self.db_size.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_wal_size(&self, bytes: u64) {
        self.wal_size.store(bytes, Ordering::Relaxed);
    }

    pub(crate) fn add_shadow_bytes(&self, bytes: u64) {
        self.total_wal_bytes.fetch_add(bytes, Ordering::Relaxed);
    }

    pub(crate) fn set_shadow_position(&self, index: u32, total_size: u64) {
        self.shadow_wal_index.store(u64::from(index), Ordering::Relaxed);
        self.shadow_wal_size.store(total_size, Ordering::Relaxed);
    }

    pub(crate) fn record_sync(&self, elapsed: Duration, failed: bool) {
        self.sync_count.fetch_add(1, Ordering::Relaxed);
        if failed {
            self.sync_error_count.fetch_add(1, Ordering::Relaxed);
        }
        self.sync_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_checkpoint(&self, mode: CheckpointMode, elapsed: Duration, failed: bool) {
        let m = &self.checkpoints[mode as usize];
        m.count.fetch_add(1, Ordering::Relaxed);
        if failed {
            m.error_count.fetch_add(1, Ordering::Relaxed);
        }
        m.micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
    }

    /// Returns a point-in-time copy of all counters.
    #[must_use]
    pub fn snapshot(&self) -> MetricsSnapshot {
        let checkpoint = |mode: CheckpointMode| {
            let m = &self.checkpoints[mode as usize];
            CheckpointSnapshot {
                count: m.count.load(Ordering::Relaxed),
                error_count: m.error_count.load(Ordering::Relaxed),
                duration: Duration::from_micros(m.micros.load(Ordering::Relaxed)),
            }
        };

        MetricsSnapshot {
            db_size: self.db_size.load(Ordering::Relaxed),
            wal_size: self.wal_size.load(Ordering::Relaxed),
            total_wal_bytes: self.total_wal_bytes.load(Ordering::Relaxed),
            shadow_wal_index: self.shadow_wal_index.load(Ordering::Relaxed) as u32,
            shadow_wal_size: self.shadow_wal_size.load(Ordering::Relaxed),
            sync_count: self.sync_count.load(Ordering::Relaxed),
            sync_error_count: self.sync_error_count.load(Ordering::Relaxed),
            sync_duration: Duration::from_micros(self.sync_micros.load(Ordering::Relaxed)),
            passive_checkpoints: checkpoint(CheckpointMode::Passive),
            restart_checkpoints: checkpoint(CheckpointMode::Restart),
            truncate_checkpoints: checkpoint(CheckpointMode::Truncate),
        }
    }
}

/// A point-in-time view of [`DbMetrics`].
#[derive(Debug, Clone, Default)]
pub struct MetricsSnapshot {
    /// Current size of the live database file, in bytes.
    pub db_size: u64,
    /// Current size of the live WAL file, in bytes.
    pub wal_size: u64,
    /// Cumulative bytes copied into shadow WAL segments.
    pub total_wal_bytes: u64,
    /// Current shadow WAL index.
    pub shadow_wal_index: u32,
    /// Total bytes across the current generation's shadow segments.
    pub shadow_wal_size: u64,
    /// Number of sync ticks performed.
    pub sync_count: u64,
    /// Number of sync ticks that returned an error.
    pub sync_error_count: u64,
    /// Total time spent in sync ticks.
    pub sync_duration: Duration,
    /// Passive checkpoint counters.
    pub passive_checkpoints: CheckpointSnapshot,
    /// Restart checkpoint counters.
    pub restart_checkpoints: CheckpointSnapshot,
    /// Truncate checkpoint counters.
    pub truncate_checkpoints: CheckpointSnapshot,
}

/// Point-in-time checkpoint counters for one mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct CheckpointSnapshot {
    /// Checkpoints performed.
    pub count: u64,
    /// Checkpoints that returned an error.
    pub error_count: u64,
    /// Total time spent checkpointing.
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_counters_accumulate() {
        let metrics = DbMetrics::new();
        metrics.record_sync(Duration::from_millis(5), false);
        metrics.record_sync(Duration::from_millis(7), true);

        let snap = metrics.snapshot();
        assert_eq!(snap.sync_count, 2);
        assert_eq!(snap.sync_error_count, 1);
        assert_eq!(snap.sync_duration, Duration::from_millis(12));
    }

    #[test]
    fn checkpoint_counters_partition_by_mode() {
        let metrics = DbMetrics::new();
        metrics.record_checkpoint(CheckpointMode::Passive, Duration::from_millis(1), false);
        metrics.record_checkpoint(CheckpointMode::Passive, Duration::from_millis(1), false);
        metrics.record_checkpoint(CheckpointMode::Restart, Duration::from_millis(2), true);

        let snap = metrics.snapshot();
        assert_eq!(snap.passive_checkpoints.count, 2);
        assert_eq!(snap.passive_checkpoints.error_count, 0);
        assert_eq!(snap.restart_checkpoints.count, 1);
        assert_eq!(snap.restart_checkpoints.error_count, 1);
        assert_eq!(snap.truncate_checkpoints.count, 0);
    }

    #[test]
    fn gauges_overwrite() {
        let metrics = DbMetrics::new();
        metrics.set_wal_size(100);
        metrics.set_wal_size(50);
        metrics.set_shadow_position(3, 9000);

        let snap = metrics.snapshot();
        assert_eq!(snap.wal_size, 50);
        assert_eq!(snap.shadow_wal_index, 3);
        assert_eq!(snap.shadow_wal_size, 9000);
    }

    #[test]
    fn shadow_bytes_accumulate() {
        let metrics = DbMetrics::new();
        metrics.add_shadow_bytes(4120);
        metrics.add_shadow_bytes(4120);
        assert_eq!(metrics.snapshot().total_wal_bytes, 8240);
    }
}
