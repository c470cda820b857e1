//! # walshade core
//!
//! Continuous replication for live SQLite databases. The capture engine
//! observes a database's write-ahead log, validates it against a locally
//! persisted mirror (the shadow WAL), appends newly committed frames,
//! rotates segments across WAL resets, and coordinates checkpoints so the
//! database never checkpoints behind the capture's back. Replicas consume
//! the shadow WAL through a monotonic `(generation, index, offset)`
//! position and a change feed; the restore driver rebuilds a database from
//! a snapshot plus contiguous shadow segments.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use walshade_core::{Db, MemoryReplica};
//!
//! let db = Db::new("app.db");
//! db.add_replica(Arc::new(MemoryReplica::new("mem")));
//! db.open()?;
//!
//! // The background monitor now captures WAL changes once per second.
//! let changes = db.notify();
//! while let Ok(pos) = changes.recv() {
//!     println!("shadow wal advanced to {pos}");
//! }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod db;
mod error;
mod feed;
mod meta;
mod metrics;
mod pos;
mod reader;
mod replica;
mod restore;
mod sqlite;

pub use config::DbConfig;
pub use db::Db;
pub use error::{CoreError, CoreResult};
pub use feed::ChangeFeed;
pub use meta::{
    format_segment_name, meta_path_for, parse_segment_name, remove_tmp_files, FilePerms,
    ShadowStore, META_DIR_SUFFIX, WAL_SEGMENT_EXT,
};
pub use metrics::{CheckpointSnapshot, DbMetrics, MetricsSnapshot};
pub use pos::{Pos, GENERATION_NAME_LEN, MAX_WAL_INDEX};
pub use reader::ShadowWalReader;
pub use replica::{GenerationStats, MemoryReplica, Replica, SnapshotInfo, WalInfo};
pub use restore::{
    calc_replica_restore_target, calc_restore_target, restore_replica, RestoreOptions,
};
pub use sqlite::CheckpointMode;
