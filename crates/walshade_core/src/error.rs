//! Error types for the walshade core.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type for core operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors that can occur in walshade core operations.
///
/// No error here is fatal to the engine: a failed sync tick is logged by the
/// monitor and retried on the next tick. Verification failures that force a
/// new generation are not errors at all; they travel as reasons inside the
/// per-tick sync info.
#[derive(Debug, Error)]
pub enum CoreError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// SQLite driver error.
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// WAL codec error.
    #[error("wal codec error: {0}")]
    Wal(#[from] walshade_wal::WalError),

    /// Another engine instance holds the meta directory lock.
    #[error("meta directory locked: another instance is replicating this database")]
    MetaDirLocked,

    /// WAL journal mode could not be enabled on the database.
    #[error("cannot enable wal journal mode, database reports {mode:?}")]
    WalModeUnavailable {
        /// Journal mode the database reported instead.
        mode: String,
    },

    /// The database reported a nonsensical page size.
    #[error("invalid database page size: {page_size}")]
    InvalidPageSize {
        /// The reported page size.
        page_size: u32,
    },

    /// Two replicas were registered under the same name.
    #[error("duplicate replica name: {name:?}")]
    DuplicateReplicaName {
        /// The conflicting replica name.
        name: String,
    },

    /// No replica with the requested name is registered.
    #[error("unknown replica: {name:?}")]
    UnknownReplica {
        /// The requested replica name.
        name: String,
    },

    /// No current generation exists yet.
    #[error("no current generation")]
    NoGeneration,

    /// A shadow WAL reader was opened past the end of its segment.
    #[error("wal reader offset too high: {offset} > {size}")]
    OffsetBeyondEof {
        /// Requested byte offset.
        offset: u64,
        /// Frame-aligned size of the segment.
        size: u64,
    },

    /// The requested shadow WAL segment does not exist yet; the stream ends
    /// here for now.
    #[error("no more shadow wal available after {generation}/{index:08x}")]
    EndOfAvailableWal {
        /// Generation being read.
        generation: String,
        /// Last index that was available.
        index: u32,
    },

    /// A truncating checkpoint reported busy frames during restore.
    #[error("truncation checkpoint failed during restore ({busy},{log},{checkpointed})")]
    TruncateCheckpointFailed {
        /// Number of busy frames reported by SQLite.
        busy: i64,
        /// Total frames in the WAL.
        log: i64,
        /// Frames checkpointed.
        checkpointed: i64,
    },

    /// The restore output path already exists.
    #[error("cannot restore, output path already exists: {path}")]
    RestoreTargetExists {
        /// The conflicting output path.
        path: PathBuf,
    },

    /// Restore options are missing a required value or combine exclusive
    /// ones.
    #[error("invalid restore options: {message}")]
    InvalidRestoreOptions {
        /// Description of the option conflict.
        message: String,
    },

    /// No generation matching the restore filters could be found on any
    /// replica.
    #[error("no matching backup generation found")]
    NoRestoreTarget,

    /// No usable snapshot exists for the generation being restored.
    #[error("no snapshot available for generation {generation}")]
    SnapshotNotFound {
        /// Generation searched.
        generation: String,
    },
}

impl CoreError {
    /// Creates a duplicate replica name error.
    pub fn duplicate_replica_name(name: impl Into<String>) -> Self {
        Self::DuplicateReplicaName { name: name.into() }
    }

    /// Creates an unknown replica error.
    pub fn unknown_replica(name: impl Into<String>) -> Self {
        Self::UnknownReplica { name: name.into() }
    }

    /// Creates an invalid restore options error.
    pub fn invalid_restore_options(message: impl Into<String>) -> Self {
        Self::InvalidRestoreOptions {
            message: message.into(),
        }
    }

    /// Returns true if the underlying cause is a missing file.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Io(err) if err.kind() == io::ErrorKind::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_detection() {
        let err = CoreError::Io(io::Error::new(io::ErrorKind::NotFound, "gone"));
        assert!(err.is_not_found());

        let err = CoreError::NoGeneration;
        assert!(!err.is_not_found());
    }

    #[test]
    fn error_display() {
        let err = CoreError::OffsetBeyondEof {
            offset: 5000,
            size: 4152,
        };
        assert_eq!(err.to_string(), "wal reader offset too high: 5000 > 4152");

        let err = CoreError::duplicate_replica_name("s3");
        assert!(err.to_string().contains("s3"));
    }
}
