//! The replica capability consumed by the capture engine.
//!
//! Replica back-ends (object stores, file systems, SFTP, ...) live outside
//! this crate. The core only needs lifecycle control, the replica's last
//! durably replicated position (for pruning), and enumeration plus byte
//! streams for restore planning.

use crate::error::{CoreError, CoreResult};
use crate::meta::FilePerms;
use crate::pos::Pos;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::{self, Read};
use std::time::SystemTime;

/// Metadata for one snapshot stored on a replica.
#[derive(Debug, Clone)]
pub struct SnapshotInfo {
    /// Name of the replica holding the snapshot.
    pub replica: String,
    /// Generation the snapshot belongs to.
    pub generation: String,
    /// Shadow WAL index the snapshot was taken at.
    pub index: u32,
    /// Snapshot size in bytes.
    pub size: u64,
    /// Creation time.
    pub created_at: SystemTime,
}

/// Metadata for one replicated shadow WAL segment.
#[derive(Debug, Clone)]
pub struct WalInfo {
    /// Name of the replica holding the segment.
    pub replica: String,
    /// Generation the segment belongs to.
    pub generation: String,
    /// Segment index.
    pub index: u32,
    /// Segment size in bytes.
    pub size: u64,
    /// Creation time.
    pub created_at: SystemTime,
}

/// Aggregate statistics for one generation on a replica.
#[derive(Debug, Clone)]
pub struct GenerationStats {
    /// Generation name.
    pub generation: String,
    /// Number of snapshots present.
    pub snapshot_count: usize,
    /// Number of shadow WAL segments present.
    pub wal_count: usize,
    /// Time of the oldest artifact.
    pub created_at: SystemTime,
    /// Time of the newest artifact.
    pub updated_at: SystemTime,
}

/// A replication target.
///
/// The original design hands each replica a back-pointer to its database so
/// restored files can inherit the database's permissions; the pointer is
/// used for nothing else. [`Replica::source_perms`] carries exactly that
/// capability without tying replica lifetime to engine lifetime.
pub trait Replica: Send + Sync {
    /// Unique name of this replica.
    fn name(&self) -> &str;

    /// Permissions of the source database file, when known, for restored
    /// files to inherit.
    fn source_perms(&self) -> Option<FilePerms> {
        None
    }

    /// Starts background replication.
    fn start(&self);

    /// Stops background replication.
    fn stop(&self);

    /// Returns the last position durably replicated by this replica. Used
    /// only for pruning shadow segments.
    fn last_pos(&self) -> Pos;

    /// Lists snapshots held by this replica.
    fn snapshots(&self) -> CoreResult<Vec<SnapshotInfo>>;

    /// Lists shadow WAL segments held by this replica.
    fn wals(&self) -> CoreResult<Vec<WalInfo>>;

    /// Lists generations known to this replica.
    fn generations(&self) -> CoreResult<Vec<String>>;

    /// Returns aggregate statistics for one generation.
    fn generation_stats(&self, generation: &str) -> CoreResult<GenerationStats>;

    /// Opens a byte stream over a snapshot.
    ///
    /// # Errors
    ///
    /// A missing snapshot surfaces as an I/O `NotFound` error.
    fn snapshot_reader(&self, generation: &str, index: u32) -> CoreResult<Box<dyn Read + Send>>;

    /// Opens a byte stream over a replicated shadow WAL segment.
    ///
    /// # Errors
    ///
    /// A missing segment surfaces as an I/O `NotFound` error.
    fn wal_reader(&self, generation: &str, index: u32) -> CoreResult<Box<dyn Read + Send>>;
}

fn not_found(what: &str, generation: &str, index: u32) -> CoreError {
    CoreError::Io(io::Error::new(
        io::ErrorKind::NotFound,
        format!("{what} {generation}/{index:08x} not found"),
    ))
}

/// An in-memory replica for tests and restore planning exercises.
///
/// Stores snapshots and WAL segments as byte vectors keyed by
/// `(generation, index)` and lets tests pin the reported last position.
#[derive(Debug, Default)]
pub struct MemoryReplica {
    name: String,
    perms: Option<FilePerms>,
    state: RwLock<MemoryReplicaState>,
}

#[derive(Debug, Default)]
struct MemoryReplicaState {
    snapshots: BTreeMap<(String, u32), (Vec<u8>, SystemTime)>,
    wals: BTreeMap<(String, u32), (Vec<u8>, SystemTime)>,
    last_pos: Pos,
    started: bool,
}

impl MemoryReplica {
    /// Creates a new empty in-memory replica.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            perms: None,
            state: RwLock::default(),
        }
    }

    /// Sets the permissions reported by [`Replica::source_perms`].
    #[must_use]
    pub fn with_source_perms(mut self, perms: FilePerms) -> Self {
        self.perms = Some(perms);
        self
    }

    /// Stores a snapshot.
    pub fn put_snapshot(&self, generation: &str, index: u32, data: Vec<u8>) {
        self.put_snapshot_at(generation, index, data, SystemTime::now());
    }

    /// Stores a snapshot with an explicit creation time.
    pub fn put_snapshot_at(&self, generation: &str, index: u32, data: Vec<u8>, at: SystemTime) {
        self.state
            .write()
            .snapshots
            .insert((generation.to_string(), index), (data, at));
    }

    /// Stores a WAL segment.
    pub fn put_wal(&self, generation: &str, index: u32, data: Vec<u8>) {
        self.put_wal_at(generation, index, data, SystemTime::now());
    }

    /// Stores a WAL segment with an explicit creation time.
    pub fn put_wal_at(&self, generation: &str, index: u32, data: Vec<u8>, at: SystemTime) {
        self.state
            .write()
            .wals
            .insert((generation.to_string(), index), (data, at));
    }

    /// Pins the position reported by [`Replica::last_pos`].
    pub fn set_last_pos(&self, pos: Pos) {
        self.state.write().last_pos = pos;
    }

    /// Returns true after [`Replica::start`] and before [`Replica::stop`].
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.state.read().started
    }
}

impl Replica for MemoryReplica {
    fn name(&self) -> &str {
        &self.name
    }

    fn source_perms(&self) -> Option<FilePerms> {
        self.perms
    }

    fn start(&self) {
        self.state.write().started = true;
    }

    fn stop(&self) {
        self.state.write().started = false;
    }

    fn last_pos(&self) -> Pos {
        self.state.read().last_pos.clone()
    }

    fn snapshots(&self) -> CoreResult<Vec<SnapshotInfo>> {
        let state = self.state.read();
        Ok(state
            .snapshots
            .iter()
            .map(|((generation, index), (data, at))| SnapshotInfo {
                replica: self.name.clone(),
                generation: generation.clone(),
                index: *index,
                size: data.len() as u64,
                created_at: *at,
            })
            .collect())
    }

    fn wals(&self) -> CoreResult<Vec<WalInfo>> {
        let state = self.state.read();
        Ok(state
            .wals
            .iter()
            .map(|((generation, index), (data, at))| WalInfo {
                replica: self.name.clone(),
                generation: generation.clone(),
                index: *index,
                size: data.len() as u64,
                created_at: *at,
            })
            .collect())
    }

    fn generations(&self) -> CoreResult<Vec<String>> {
        let state = self.state.read();
        let mut generations: Vec<String> = state
            .snapshots
            .keys()
            .chain(state.wals.keys())
            .map(|(generation, _)| generation.clone())
            .collect();
        generations.sort();
        generations.dedup();
        Ok(generations)
    }

    fn generation_stats(&self, generation: &str) -> CoreResult<GenerationStats> {
        let state = self.state.read();
        let times: Vec<SystemTime> = state
            .snapshots
            .iter()
            .filter(|((g, _), _)| g == generation)
            .map(|(_, (_, at))| *at)
            .chain(
                state
                    .wals
                    .iter()
                    .filter(|((g, _), _)| g == generation)
                    .map(|(_, (_, at))| *at),
            )
            .collect();

        let created_at = times.iter().min().copied().unwrap_or(SystemTime::UNIX_EPOCH);
        let updated_at = times.iter().max().copied().unwrap_or(SystemTime::UNIX_EPOCH);

        Ok(GenerationStats {
            generation: generation.to_string(),
            snapshot_count: state
                .snapshots
                .keys()
                .filter(|(g, _)| g == generation)
                .count(),
            wal_count: state.wals.keys().filter(|(g, _)| g == generation).count(),
            created_at,
            updated_at,
        })
    }

    fn snapshot_reader(&self, generation: &str, index: u32) -> CoreResult<Box<dyn Read + Send>> {
        let state = self.state.read();
        let (data, _) = state
            .snapshots
            .get(&(generation.to_string(), index))
            .ok_or_else(|| not_found("snapshot", generation, index))?;
        Ok(Box::new(io::Cursor::new(data.clone())))
    }

    fn wal_reader(&self, generation: &str, index: u32) -> CoreResult<Box<dyn Read + Send>> {
        let state = self.state.read();
        let (data, _) = state
            .wals
            .get(&(generation.to_string(), index))
            .ok_or_else(|| not_found("wal segment", generation, index))?;
        Ok(Box::new(io::Cursor::new(data.clone())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifecycle_flag() {
        let replica = MemoryReplica::new("mem");
        assert!(!replica.is_started());
        replica.start();
        assert!(replica.is_started());
        replica.stop();
        assert!(!replica.is_started());
    }

    #[test]
    fn snapshot_listing_and_reading() {
        let replica = MemoryReplica::new("mem");
        replica.put_snapshot("0123456789abcdef", 0, vec![1, 2, 3]);

        let snapshots = replica.snapshots().unwrap();
        assert_eq!(snapshots.len(), 1);
        assert_eq!(snapshots[0].replica, "mem");
        assert_eq!(snapshots[0].size, 3);

        let mut reader = replica.snapshot_reader("0123456789abcdef", 0).unwrap();
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf, vec![1, 2, 3]);
    }

    #[test]
    fn missing_artifacts_are_not_found() {
        let replica = MemoryReplica::new("mem");
        let err = replica.wal_reader("0123456789abcdef", 7).unwrap_err();
        assert!(err.is_not_found());
        let err = replica.snapshot_reader("0123456789abcdef", 7).unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn generations_deduplicated_across_kinds() {
        let replica = MemoryReplica::new("mem");
        replica.put_snapshot("0123456789abcdef", 0, vec![]);
        replica.put_wal("0123456789abcdef", 0, vec![]);
        replica.put_wal("fedcba9876543210", 0, vec![]);

        let generations = replica.generations().unwrap();
        assert_eq!(
            generations,
            vec!["0123456789abcdef".to_string(), "fedcba9876543210".to_string()]
        );
    }

    #[test]
    fn generation_stats_span_artifacts() {
        let replica = MemoryReplica::new("mem");
        let early = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(100);
        let late = SystemTime::UNIX_EPOCH + std::time::Duration::from_secs(200);
        replica.put_snapshot_at("0123456789abcdef", 0, vec![], early);
        replica.put_wal_at("0123456789abcdef", 0, vec![], late);

        let stats = replica.generation_stats("0123456789abcdef").unwrap();
        assert_eq!(stats.snapshot_count, 1);
        assert_eq!(stats.wal_count, 1);
        assert_eq!(stats.created_at, early);
        assert_eq!(stats.updated_at, late);
    }

    #[test]
    fn last_pos_round_trip() {
        let replica = MemoryReplica::new("mem");
        assert!(replica.last_pos().is_empty());

        let pos = Pos::new("0123456789abcdef", 2, 4152);
        replica.set_last_pos(pos.clone());
        assert_eq!(replica.last_pos(), pos);
    }
}
