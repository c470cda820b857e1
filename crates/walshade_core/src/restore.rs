//! Restore driver: snapshot plus contiguous shadow WAL replay.
//!
//! A restore streams the newest usable snapshot into `<output>.tmp`,
//! applies replicated WAL segments one at a time (each followed by a
//! truncating checkpoint that must run clean), and atomically renames the
//! temp file into place. A failed restore leaves no partial output.

use crate::db::Db;
use crate::error::{CoreError, CoreResult};
use crate::meta::FilePerms;
use crate::replica::{GenerationStats, Replica};
use crate::sqlite::CheckpointMode;
use rusqlite::Connection;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;
use tracing::{debug, info};

/// Options for restoring a database from a replica.
#[derive(Debug, Clone)]
pub struct RestoreOptions {
    /// Path the restored database is written to. Must not already exist.
    pub output_path: PathBuf,
    /// Restrict restore to the replica with this name. All replicas are
    /// considered when unset.
    pub replica_name: Option<String>,
    /// Restrict restore to this generation. Required when `index` is set;
    /// otherwise the generation with the newest data is chosen.
    pub generation: Option<String>,
    /// Restore up to this shadow WAL index. Mutually exclusive with
    /// `timestamp`.
    pub index: Option<u32>,
    /// Restore to the latest state at or before this point in time.
    pub timestamp: Option<SystemTime>,
    /// Plan and log the restore without writing anything.
    pub dry_run: bool,
    /// Log every applied WAL segment.
    pub verbose: bool,
}

impl RestoreOptions {
    /// Creates options targeting `output_path`, restoring the most recent
    /// state available.
    #[must_use]
    pub fn new(output_path: impl Into<PathBuf>) -> Self {
        Self {
            output_path: output_path.into(),
            replica_name: None,
            generation: None,
            index: None,
            timestamp: None,
            dry_run: false,
            verbose: false,
        }
    }

    /// Restricts the restore to one replica.
    #[must_use]
    pub fn replica_name(mut self, name: impl Into<String>) -> Self {
        self.replica_name = Some(name.into());
        self
    }

    /// Restricts the restore to one generation.
    #[must_use]
    pub fn generation(mut self, generation: impl Into<String>) -> Self {
        self.generation = Some(generation.into());
        self
    }

    /// Restores up to a specific shadow WAL index.
    #[must_use]
    pub const fn index(mut self, index: u32) -> Self {
        self.index = Some(index);
        self
    }

    /// Restores to a point in time.
    #[must_use]
    pub const fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// Enables dry-run mode.
    #[must_use]
    pub const fn dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Validates option combinations.
    ///
    /// # Errors
    ///
    /// An index requires a generation, and an index excludes a timestamp.
    pub fn validate(&self) -> CoreResult<()> {
        if self.index.is_some() && self.generation.is_none() {
            return Err(CoreError::invalid_restore_options(
                "must specify generation when restoring to an index",
            ));
        }
        if self.index.is_some() && self.timestamp.is_some() {
            return Err(CoreError::invalid_restore_options(
                "cannot specify index and timestamp together",
            ));
        }
        Ok(())
    }
}

/// Picks the replica and generation to restore from, preferring whichever
/// candidate was updated most recently.
pub fn calc_restore_target(
    db: &Db,
    opt: &RestoreOptions,
) -> CoreResult<(Arc<dyn Replica>, String)> {
    let mut target: Option<(Arc<dyn Replica>, String, GenerationStats)> = None;
    let mut name_matched = false;

    for replica in db.replicas() {
        if let Some(name) = &opt.replica_name {
            if replica.name() != name {
                continue;
            }
        }
        name_matched = true;

        let Some((generation, stats)) = calc_replica_restore_target(replica.as_ref(), opt)? else {
            continue;
        };

        let newer = target
            .as_ref()
            .map_or(true, |(_, _, best)| stats.updated_at > best.updated_at);
        if newer {
            target = Some((replica, generation, stats));
        }
    }

    if !name_matched {
        if let Some(name) = &opt.replica_name {
            return Err(CoreError::unknown_replica(name));
        }
    }

    target
        .map(|(replica, generation, _)| (replica, generation))
        .ok_or(CoreError::NoRestoreTarget)
}

/// Picks the generation to restore from one replica, or `None` when no
/// generation matches the filters.
pub fn calc_replica_restore_target(
    replica: &dyn Replica,
    opt: &RestoreOptions,
) -> CoreResult<Option<(String, GenerationStats)>> {
    let mut target: Option<(String, GenerationStats)> = None;

    for generation in replica.generations()? {
        if let Some(filter) = &opt.generation {
            if &generation != filter {
                continue;
            }
        }

        let stats = replica.generation_stats(&generation)?;

        if let Some(timestamp) = opt.timestamp {
            if timestamp < stats.created_at || timestamp > stats.updated_at {
                continue;
            }
        }

        let newer = target
            .as_ref()
            .map_or(true, |(_, best)| stats.updated_at > best.updated_at);
        if newer {
            target = Some((generation, stats));
        }
    }

    Ok(target)
}

/// Restores a database from one replica according to `opt`.
///
/// # Errors
///
/// Fails on invalid options, an already existing output path, a missing
/// snapshot, or a truncating checkpoint that reports busy frames. All work
/// happens in `<output>.tmp`; the output path appears only on success.
pub fn restore_replica(replica: &dyn Replica, opt: &RestoreOptions) -> CoreResult<()> {
    opt.validate()?;

    let generation = match &opt.generation {
        Some(generation) => generation.clone(),
        None => {
            calc_replica_restore_target(replica, opt)?
                .ok_or(CoreError::NoRestoreTarget)?
                .0
        }
    };

    if !opt.dry_run {
        match fs::metadata(&opt.output_path) {
            Ok(_) => {
                return Err(CoreError::RestoreTargetExists {
                    path: opt.output_path.clone(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
    }

    let min_index = snapshot_index_at(replica, &generation, opt.timestamp)?;
    let max_index = wal_index_at(replica, &generation, opt.index, opt.timestamp, min_index)?;
    info!(
        replica = replica.name(),
        generation = %generation,
        min = format_args!("{min_index:08x}"),
        max = format_args!("{max_index:08x}"),
        "starting restore"
    );

    let tmp_path = tmp_output_path(&opt.output_path);
    let perms = replica.source_perms();

    info!(
        replica = replica.name(),
        generation = %generation,
        index = format_args!("{min_index:08x}"),
        path = %tmp_path.display(),
        "restoring snapshot"
    );
    if !opt.dry_run {
        restore_snapshot(replica, &generation, min_index, &tmp_path, perms)?;
    }

    for index in min_index..=max_index {
        if !opt.dry_run {
            match apply_wal(replica, &generation, index, &tmp_path, perms) {
                Err(err)
                    if err.is_not_found() && index == min_index && index == max_index =>
                {
                    info!(replica = replica.name(), "no wal available, snapshot only");
                    break;
                }
                other => other?,
            }
        }
        if opt.verbose {
            info!(
                replica = replica.name(),
                generation = %generation,
                index = format_args!("{index:08x}"),
                "restored wal"
            );
        }
    }

    info!(replica = replica.name(), path = %opt.output_path.display(), "renaming database from temporary location");
    if !opt.dry_run {
        fs::rename(&tmp_path, &opt.output_path)?;
    }

    Ok(())
}

/// Returns the snapshot index the restore starts from: the newest snapshot
/// at or before `timestamp`, or the newest overall.
fn snapshot_index_at(
    replica: &dyn Replica,
    generation: &str,
    timestamp: Option<SystemTime>,
) -> CoreResult<u32> {
    let mut best: Option<(u32, SystemTime)> = None;

    for snapshot in replica.snapshots()? {
        if snapshot.generation != generation {
            continue;
        }
        if let Some(timestamp) = timestamp {
            if snapshot.created_at > timestamp {
                continue;
            }
        }
        let better = best.map_or(true, |(index, _)| snapshot.index > index);
        if better {
            best = Some((snapshot.index, snapshot.created_at));
        }
    }

    best.map(|(index, _)| index)
        .ok_or_else(|| CoreError::SnapshotNotFound {
            generation: generation.to_string(),
        })
}

/// Returns the highest WAL index the restore replays through: an explicit
/// index, the newest segment at or before `timestamp`, or the newest
/// overall. Falls back to `min_index` when the replica holds no WAL for
/// the generation (snapshot-only restore).
fn wal_index_at(
    replica: &dyn Replica,
    generation: &str,
    index: Option<u32>,
    timestamp: Option<SystemTime>,
    min_index: u32,
) -> CoreResult<u32> {
    if let Some(index) = index {
        return Ok(index);
    }

    let mut best: Option<u32> = None;
    for wal in replica.wals()? {
        if wal.generation != generation {
            continue;
        }
        if let Some(timestamp) = timestamp {
            if wal.created_at > timestamp {
                continue;
            }
        }
        best = Some(best.map_or(wal.index, |b| b.max(wal.index)));
    }

    Ok(best.unwrap_or(min_index))
}

fn tmp_output_path(output_path: &Path) -> PathBuf {
    let mut path = output_path.to_path_buf().into_os_string();
    path.push(".tmp");
    PathBuf::from(path)
}

/// Streams a snapshot from the replica into `path`, creating parent
/// directories and applying the source database's permissions.
fn restore_snapshot(
    replica: &dyn Replica,
    generation: &str,
    index: u32,
    path: &Path,
    perms: Option<FilePerms>,
) -> CoreResult<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent)?;
        }
    }

    let mut reader = replica.snapshot_reader(generation, index)?;
    let mut file = File::create(path)?;
    io::copy(&mut reader, &mut file)?;
    file.sync_all()?;
    drop(file);

    if let Some(perms) = perms {
        perms.apply(path);
    }
    Ok(())
}

/// Copies one replicated WAL segment beside the restore target and folds it
/// into the database with a truncating checkpoint.
///
/// A checkpoint that reports busy frames would leave WAL state unapplied,
/// which is a hard restore failure.
fn apply_wal(
    replica: &dyn Replica,
    generation: &str,
    index: u32,
    db_path: &Path,
    perms: Option<FilePerms>,
) -> CoreResult<()> {
    let mut reader = replica.wal_reader(generation, index)?;

    let mut wal_path = db_path.to_path_buf().into_os_string();
    wal_path.push("-wal");
    let wal_path = PathBuf::from(wal_path);

    let mut file = File::create(&wal_path)?;
    io::copy(&mut reader, &mut file)?;
    file.sync_all()?;
    drop(file);
    if let Some(perms) = perms {
        perms.apply(&wal_path);
    }

    let conn = Connection::open(db_path)?;
    let sql = format!("PRAGMA wal_checkpoint({})", CheckpointMode::Truncate.as_sql());
    let (busy, log, checkpointed): (i64, i64, i64) =
        conn.query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?;
    if busy != 0 {
        return Err(CoreError::TruncateCheckpointFailed {
            busy,
            log,
            checkpointed,
        });
    }
    debug!(generation, index = format_args!("{index:08x}"), "applied wal segment");
    Ok(())
}
