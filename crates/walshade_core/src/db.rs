//! The managed database: capture engine, background monitor and facade.
//!
//! A [`Db`] owns one live SQLite database and mirrors its WAL into the
//! shadow store, one generation at a time. Each tick of the capture engine:
//!
//! 1. lazily initializes the adapter and shadow store (no-op until the
//!    database file exists),
//! 2. makes sure the live WAL holds at least a header,
//! 3. promotes to a writer so nothing can append behind its back,
//! 4. verifies the shadow state against the live WAL,
//! 5. starts a new generation when verification says it cannot continue,
//! 6. copies newly committed frames (rotating on WAL restart),
//! 7. releases the write intent, checkpoints when thresholds say so,
//! 8. prunes replicated segments and old generations,
//! 9. notifies subscribers when anything changed.
//!
//! The engine-wide state lock is held in write mode for the whole of
//! [`Db::sync`], [`Db::checkpoint`] and [`Db::crc64`]; accessors take it in
//! read mode. Each tick is independent: a failed tick is logged by the
//! monitor and retried on the next interval.

use crate::config::DbConfig;
use crate::error::{CoreError, CoreResult};
use crate::feed::ChangeFeed;
use crate::meta::{self, FilePerms, ShadowStore};
use crate::metrics::DbMetrics;
use crate::pos::{Pos, MAX_WAL_INDEX};
use crate::reader::ShadowWalReader;
use crate::replica::{Replica, SnapshotInfo, WalInfo};
use crate::sqlite::{CheckpointMode, CheckpointResult, SqliteAdapter};
use crc::{Crc, CRC_64_GO_ISO};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::mpsc::Receiver;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, info, warn};
use walshade_wal::{
    frame_align, frame_size, header_salts, verify_frame, ByteOrder, Checksum, FrameOutcome,
    WalHeader, WAL_FRAME_CHECKSUM_OFFSET, WAL_HEADER_CHECKSUM_OFFSET, WAL_HEADER_SIZE,
};

const CRC64: Crc<u64> = Crc::<u64>::new(&CRC_64_GO_ISO);

/// Returns the byte size of a WAL holding `pages` frames.
const fn calc_wal_size(page_size: u32, pages: u32) -> u64 {
    WAL_HEADER_SIZE as u64 + frame_size(page_size) * pages as u64
}

/// A managed SQLite database whose WAL is continuously captured into the
/// shadow store and exposed to replicas.
///
/// Replicas are registered with [`Db::add_replica`] before [`Db::open`];
/// the background monitor then drives one capture tick per configured
/// interval. Dropping the handle performs a soft close, which deliberately
/// leaves the SQLite connections open (see [`Db::soft_close`]).
pub struct Db {
    shared: Arc<DbShared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

struct DbShared {
    path: PathBuf,
    config: DbConfig,
    state: RwLock<DbState>,
    replicas: RwLock<Vec<Arc<dyn Replica>>>,
    feed: ChangeFeed,
    metrics: DbMetrics,
    shutdown: Shutdown,
}

#[derive(Default)]
struct DbState {
    adapter: Option<SqliteAdapter>,
    store: Option<ShadowStore>,
}

#[derive(Default)]
struct Shutdown {
    stopped: Mutex<bool>,
    cond: Condvar,
}

/// Per-tick verification outcome: where the shadow stands relative to the
/// live WAL and whether the engine can continue the current generation.
#[derive(Debug, Default)]
struct SyncInfo {
    /// Current generation name.
    generation: String,
    /// Index of the newest shadow segment.
    index: u32,
    /// Path of the newest shadow segment.
    shadow_path: PathBuf,
    /// Last modification time of the live database file.
    db_mod_time: Option<SystemTime>,
    /// Raw size of the live WAL file.
    wal_size: u64,
    /// Frame-aligned size of the newest shadow segment.
    shadow_wal_size: u64,
    /// True when the live WAL header differs from the shadow header.
    restart: bool,
    /// Non-empty when the engine must start a new generation.
    reason: Option<&'static str>,
}

impl Db {
    /// Creates an unopened handle for the database at `path` with default
    /// configuration.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self::with_config(path, DbConfig::default())
    }

    /// Creates an unopened handle with explicit configuration.
    #[must_use]
    pub fn with_config(path: impl Into<PathBuf>, config: DbConfig) -> Self {
        Self {
            shared: Arc::new(DbShared {
                path: path.into(),
                config,
                state: RwLock::new(DbState::default()),
                replicas: RwLock::new(Vec::new()),
                feed: ChangeFeed::new(),
                metrics: DbMetrics::new(),
                shutdown: Shutdown::default(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Registers a replica. Must happen before [`Db::open`].
    pub fn add_replica(&self, replica: Arc<dyn Replica>) {
        self.shared.replicas.write().push(replica);
    }

    /// Starts the background monitor.
    ///
    /// Validates replica names and clears crash-leftover temp files from
    /// the meta directory first. With a zero monitor interval no thread is
    /// started and [`Db::sync`] must be driven manually.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::DuplicateReplicaName`] when two replicas share
    /// a name.
    pub fn open(&self) -> CoreResult<()> {
        {
            let replicas = self.shared.replicas.read();
            let mut seen = HashSet::new();
            for replica in replicas.iter() {
                if !seen.insert(replica.name().to_string()) {
                    return Err(CoreError::duplicate_replica_name(replica.name()));
                }
            }
        }

        meta::remove_tmp_files(&meta::meta_path_for(&self.shared.path))?;

        if self.shared.config.monitor_interval > Duration::ZERO {
            let shared = Arc::clone(&self.shared);
            let handle = std::thread::Builder::new()
                .name("walshade-monitor".to_string())
                .spawn(move || monitor_loop(&shared))?;
            *self.monitor.lock() = Some(handle);
        }

        Ok(())
    }

    /// Returns the database file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.shared.path
    }

    /// Returns the live WAL file path (`<db>-wal`).
    #[must_use]
    pub fn wal_path(&self) -> PathBuf {
        self.shared.wal_path()
    }

    /// Returns the meta directory path.
    #[must_use]
    pub fn meta_path(&self) -> PathBuf {
        meta::meta_path_for(&self.shared.path)
    }

    /// Returns the configuration.
    #[must_use]
    pub fn config(&self) -> &DbConfig {
        &self.shared.config
    }

    /// Returns the per-database metrics.
    #[must_use]
    pub fn metrics(&self) -> &DbMetrics {
        &self.shared.metrics
    }

    /// Returns the registered replicas.
    #[must_use]
    pub fn replicas(&self) -> Vec<Arc<dyn Replica>> {
        self.shared.replicas.read().clone()
    }

    /// Returns a replica by name.
    #[must_use]
    pub fn replica(&self, name: &str) -> Option<Arc<dyn Replica>> {
        self.shared
            .replicas
            .read()
            .iter()
            .find(|r| r.name() == name)
            .cloned()
    }

    /// Returns the database page size, once the adapter has initialized.
    #[must_use]
    pub fn page_size(&self) -> Option<u32> {
        self.shared
            .state
            .read()
            .adapter
            .as_ref()
            .map(SqliteAdapter::page_size)
    }

    /// Returns the current replication position, derived from disk.
    ///
    /// Empty until a generation exists.
    pub fn pos(&self) -> CoreResult<Pos> {
        let state = self.shared.state.read();
        let (Some(adapter), Some(store)) = (&state.adapter, &state.store) else {
            return Ok(Pos::default());
        };
        self.shared.pos_on_disk(store, adapter.page_size())
    }

    /// Subscribes to shadow WAL change notifications.
    pub fn notify(&self) -> Receiver<Pos> {
        self.shared.feed.subscribe()
    }

    /// Runs one capture tick.
    pub fn sync(&self) -> CoreResult<()> {
        let mut state = self.shared.state.write();
        self.shared.sync_locked(&mut state)
    }

    /// Runs a checkpoint in the given mode. No-op until the adapter has
    /// initialized.
    pub fn checkpoint(&self, mode: CheckpointMode) -> CoreResult<()> {
        let mut state = self.shared.state.write();
        let Some(adapter) = state.adapter.as_mut() else {
            return Ok(());
        };
        self.shared.do_checkpoint(adapter, mode)?;
        Ok(())
    }

    /// Computes a CRC-64/GO-ISO checksum of the database file together with
    /// the position it corresponds to.
    ///
    /// Forces a restart checkpoint first so the WAL is folded into the
    /// database file; the returned position has a zero offset since the
    /// checksum covers the database only. When `dst` is given the database
    /// file is copied there first and the copy is checksummed.
    pub fn crc64(&self, dst: Option<&Path>) -> CoreResult<(u64, Pos)> {
        let mut state = self.shared.state.write();
        self.shared.init_locked(&mut state)?;

        let DbState { adapter, store } = &mut *state;
        let (Some(adapter), Some(store)) = (adapter.as_mut(), store.as_ref()) else {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::NotFound,
                "no database file",
            )));
        };

        let generation = store
            .current_generation()?
            .ok_or(CoreError::NoGeneration)?;
        let page_size = adapter.page_size();
        self.shared
            .checkpoint_and_init(adapter, store, &generation, CheckpointMode::Restart, page_size)?;

        let mut pos = self.shared.pos_on_disk(store, page_size)?;
        pos.offset = 0;

        let checksum_path = match dst {
            Some(dst) => {
                copy_file(dst, &self.shared.path)?;
                dst
            }
            None => self.shared.path.as_path(),
        };
        Ok((crc64_file(checksum_path)?, pos))
    }

    /// Opens a reader over the shadow WAL at `pos`.
    ///
    /// When the segment at `pos` is exhausted the next segment is tried at
    /// offset zero; [`CoreError::EndOfAvailableWal`] means the stream has no
    /// more data for now.
    pub fn shadow_wal_reader(&self, pos: Pos) -> CoreResult<ShadowWalReader> {
        let state = self.shared.state.read();
        let (Some(adapter), Some(store)) = (&state.adapter, &state.store) else {
            return Err(CoreError::NoGeneration);
        };
        let page_size = adapter.page_size();

        let path = store.segment_path(&pos.generation, pos.index);
        let reader = ShadowWalReader::open(&path, pos.clone(), page_size)?;
        if reader.remaining() > 0 {
            return Ok(reader);
        }

        let next = pos.next_index();
        let path = store.segment_path(&next.generation, next.index);
        match ShadowWalReader::open(&path, next, page_size) {
            Ok(reader) => Ok(reader),
            Err(err) if err.is_not_found() => Err(CoreError::EndOfAvailableWal {
                generation: pos.generation,
                index: pos.index,
            }),
            Err(err) => Err(err),
        }
    }

    /// Returns the last modification time of the database or its WAL,
    /// whichever is later.
    pub fn updated_at(&self) -> CoreResult<SystemTime> {
        let mut updated = fs::metadata(&self.shared.path)?.modified()?;
        match fs::metadata(self.shared.wal_path()) {
            Ok(metadata) => {
                let modified = metadata.modified()?;
                if modified > updated {
                    updated = modified;
                }
            }
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        Ok(updated)
    }

    /// Lists snapshots across all replicas, ordered by creation time.
    pub fn snapshots(&self) -> CoreResult<Vec<SnapshotInfo>> {
        let mut infos = Vec::new();
        for replica in self.replicas() {
            infos.extend(replica.snapshots()?);
        }
        infos.sort_by_key(|info| info.created_at);
        Ok(infos)
    }

    /// Lists shadow WAL segments across all replicas, ordered by creation
    /// time.
    pub fn wals(&self) -> CoreResult<Vec<WalInfo>> {
        let mut infos = Vec::new();
        for replica in self.replicas() {
            infos.extend(replica.wals()?);
        }
        infos.sort_by_key(|info| info.created_at);
        Ok(infos)
    }

    /// Stops the monitor and replicas and releases the read lock, leaving
    /// the SQLite connections open.
    ///
    /// Closing the last connection to a WAL database checkpoints it, which
    /// would fold the unreplicated WAL tail into the database file. The
    /// soft close therefore leaks the connections; the process exit cleans
    /// them up.
    pub fn soft_close(&self) -> CoreResult<()> {
        self.shutdown_impl(false)
    }

    /// Stops everything and closes the SQLite connections.
    ///
    /// The implicit checkpoint on close settles the database file, so this
    /// path is meant for tests that want to reopen or inspect it.
    pub fn close(&self) -> CoreResult<()> {
        self.shutdown_impl(true)
    }

    fn shutdown_impl(&self, hard: bool) -> CoreResult<()> {
        {
            let mut stopped = self.shared.shutdown.stopped.lock();
            *stopped = true;
        }
        self.shared.shutdown.cond.notify_all();
        if let Some(handle) = self.monitor.lock().take() {
            let _ = handle.join();
        }

        for replica in self.shared.replicas.read().iter() {
            replica.stop();
        }

        let (adapter, store) = {
            let mut state = self.shared.state.write();
            let adapter = state.adapter.take();
            let store = if hard { state.store.take() } else { None };
            (adapter, store)
        };
        drop(store);
        if let Some(adapter) = adapter {
            if hard {
                adapter.close()?;
            } else {
                adapter.soft_close()?;
            }
        }
        Ok(())
    }
}

impl Drop for Db {
    fn drop(&mut self) {
        let _ = self.soft_close();
    }
}

impl std::fmt::Debug for Db {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Db")
            .field("path", &self.shared.path)
            .finish_non_exhaustive()
    }
}

fn monitor_loop(shared: &Arc<DbShared>) {
    loop {
        {
            let mut stopped = shared.shutdown.stopped.lock();
            if *stopped {
                return;
            }
            let _ = shared
                .shutdown
                .cond
                .wait_for(&mut stopped, shared.config.monitor_interval);
            if *stopped {
                return;
            }
        }

        let result = {
            let mut state = shared.state.write();
            shared.sync_locked(&mut state)
        };
        if let Err(err) = result {
            warn!(db = %shared.path.display(), error = %err, "sync error");
        }
    }
}

impl DbShared {
    fn wal_path(&self) -> PathBuf {
        let mut path = self.path.clone().into_os_string();
        path.push("-wal");
        PathBuf::from(path)
    }

    /// Initializes the adapter and shadow store once the database file
    /// exists. Idempotent; a missing database leaves the engine idle.
    fn init_locked(&self, state: &mut DbState) -> CoreResult<()> {
        if state.adapter.is_some() {
            return Ok(());
        }

        match fs::metadata(&self.path) {
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        }

        let file_perms = FilePerms::capture(&self.path)?;
        let parent = self
            .path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let dir_perms = FilePerms::capture(parent)?;

        let adapter = SqliteAdapter::open(&self.path, self.config.busy_timeout)?;
        let store = ShadowStore::open(&self.path, file_perms, dir_perms)?;

        // If the last shadow position cannot be determined from the current
        // headers, drop the generation pointer so the next tick starts
        // fresh instead of appending to an unknown base.
        if !self.headers_match(&store)? {
            info!(db = %self.path.display(), "init: wal and shadow headers diverged, clearing generation");
            match fs::remove_file(store.generation_file_path()) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
        }

        self.clean(&store)?;

        for replica in self.replicas.read().iter() {
            replica.start();
        }

        state.adapter = Some(adapter);
        state.store = Some(store);
        Ok(())
    }

    /// Returns true when the live WAL header equals the newest shadow
    /// segment's header, or when there is nothing to compare yet. Any
    /// unreadable header counts as a mismatch.
    fn headers_match(&self, store: &ShadowStore) -> CoreResult<bool> {
        let Some(generation) = store.current_generation()? else {
            return Ok(true);
        };
        let Ok((index, _)) = store.current_index(&generation) else {
            return Ok(false);
        };

        let live = read_wal_header(&self.wal_path());
        let shadow = read_wal_header(&store.segment_path(&generation, index));
        match (live, shadow) {
            (Ok(live), Ok(shadow)) => Ok(live == shadow),
            _ => Ok(false),
        }
    }

    fn sync_locked(&self, state: &mut DbState) -> CoreResult<()> {
        self.init_locked(state)?;

        let DbState { adapter, store } = &mut *state;
        let (Some(adapter), Some(store)) = (adapter.as_mut(), store.as_ref()) else {
            debug!(db = %self.path.display(), "sync: no database found");
            return Ok(());
        };

        let started = Instant::now();
        let result = self.sync_inner(adapter, store);
        self.metrics.record_sync(started.elapsed(), result.is_err());
        result
    }

    fn sync_inner(&self, adapter: &mut SqliteAdapter, store: &ShadowStore) -> CoreResult<()> {
        let page_size = adapter.page_size();

        adapter.ensure_wal_exists(&self.wal_path())?;

        // Promote to a writer. Until the rollback below, no other
        // connection can append WAL frames, so what verify observes is what
        // copy will see.
        let write_lock = adapter.acquire_write_lock()?;

        let mut info = self.verify(store, page_size)?;
        debug!(db = %self.path.display(), ?info, "sync: verified");

        let mut changed =
            info.wal_size != info.shadow_wal_size || info.restart || info.reason.is_some();

        if let Some(reason) = info.reason {
            info.generation = self.create_generation(store, page_size)?;
            info!(db = %self.path.display(), generation = %info.generation, reason, "sync: new generation");

            info.index = 0;
            info.shadow_path = store.segment_path(&info.generation, 0);
            info.shadow_wal_size = WAL_HEADER_SIZE as u64;
            info.restart = false;
            info.reason = None;
        }

        let new_wal_size = self.sync_wal(store, &info, page_size)?;

        let mut checkpoint = false;
        let mut mode = CheckpointMode::Passive;
        if self.config.max_checkpoint_pages > 0
            && new_wal_size >= calc_wal_size(page_size, self.config.max_checkpoint_pages)
        {
            checkpoint = true;
            mode = CheckpointMode::Restart;
        } else if new_wal_size >= calc_wal_size(page_size, self.config.min_checkpoint_pages) {
            checkpoint = true;
        } else if self.config.checkpoint_interval > Duration::ZERO
            && new_wal_size >= calc_wal_size(page_size, 1)
        {
            if let Some(mod_time) = info.db_mod_time {
                let since = SystemTime::now()
                    .duration_since(mod_time)
                    .unwrap_or_default();
                if since > self.config.checkpoint_interval {
                    checkpoint = true;
                }
            }
        }

        // Release the write intent before checkpointing; the transaction
        // never commits, so the lock table stays empty on disk.
        write_lock.release()?;

        if checkpoint {
            changed = true;
            self.checkpoint_and_init(adapter, store, &info.generation, mode, page_size)?;
        }

        self.clean(store)?;

        // Shadow index and total size are tracked for observability only;
        // failures here must not fail the tick.
        if let Ok((index, size)) = store.current_index(&info.generation) {
            self.metrics.set_shadow_position(index, size);
        }

        if changed {
            let pos = self.pos_on_disk(store, page_size).unwrap_or_default();
            self.feed.emit(pos);
        }

        Ok(())
    }

    /// Checks that the shadow state matches where capture left off on the
    /// live WAL. A populated `reason` means a new generation must start;
    /// `restart` means the live WAL was reset and the segment must rotate.
    fn verify(&self, store: &ShadowStore, page_size: u32) -> CoreResult<SyncInfo> {
        let mut info = SyncInfo::default();

        let Some(generation) = store.current_generation()? else {
            info.reason = Some("no generation exists");
            return Ok(info);
        };
        info.generation = generation;

        let metadata = fs::metadata(&self.path)?;
        info.db_mod_time = metadata.modified().ok();
        self.metrics.set_db_size(metadata.len());

        let metadata = fs::metadata(self.wal_path())?;
        info.wal_size = metadata.len();
        self.metrics.set_wal_size(metadata.len());

        let (index, _) = store.current_index(&info.generation)?;
        if index >= MAX_WAL_INDEX {
            info.reason = Some("max index exceeded");
            return Ok(info);
        }
        info.index = index;
        info.shadow_path = store.segment_path(&info.generation, index);

        let metadata = match fs::metadata(&info.shadow_path) {
            Ok(metadata) => metadata,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info.reason = Some("no shadow wal");
                return Ok(info);
            }
            Err(err) => return Err(err.into()),
        };
        info.shadow_wal_size = frame_align(metadata.len(), page_size);

        if info.shadow_wal_size < WAL_HEADER_SIZE as u64 {
            info.reason = Some("short shadow wal");
            return Ok(info);
        }

        // A live WAL smaller than the shadow means someone truncated it;
        // the shadow's base no longer exists.
        if info.shadow_wal_size > info.wal_size {
            info.reason = Some("wal truncated by another process");
            return Ok(info);
        }

        let live_hdr = read_wal_header(&self.wal_path())?;
        let shadow_hdr = read_wal_header(&info.shadow_path)?;
        if live_hdr != shadow_hdr {
            info.restart = true;
        }

        if info.shadow_wal_size == WAL_HEADER_SIZE as u64 && info.restart {
            info.reason = Some("wal header only, mismatched");
            return Ok(info);
        }

        // Re-read the last synced frame from both files. A byte difference
        // at the same offset means the live WAL was overwritten in place.
        if info.shadow_wal_size > WAL_HEADER_SIZE as u64 {
            let offset = info.shadow_wal_size - frame_size(page_size);
            let live = read_file_at(&self.wal_path(), offset, frame_size(page_size))?;
            let shadow = read_file_at(&info.shadow_path, offset, frame_size(page_size))?;
            if live != shadow {
                info.reason = Some("wal overwritten by another process");
                return Ok(info);
            }
        }

        Ok(info)
    }

    /// Starts a new generation: fresh random name, segment zero seeded from
    /// the current live header, pointer flip, prune.
    fn create_generation(&self, store: &ShadowStore, page_size: u32) -> CoreResult<String> {
        let generation = store.generate_generation_name();
        store.create_generation_dir(&generation)?;
        self.init_shadow_wal_file(store, &generation, 0, page_size)?;
        store.set_current_generation(&generation)?;
        self.clean(store)?;
        Ok(generation)
    }

    /// Creates a shadow segment seeded with the current live WAL header and
    /// copies whatever committed frames are already available.
    fn init_shadow_wal_file(
        &self,
        store: &ShadowStore,
        generation: &str,
        index: u32,
        page_size: u32,
    ) -> CoreResult<u64> {
        let hdr = read_wal_header(&self.wal_path())?;
        WalHeader::parse(&hdr)?;

        let path = store.create_segment(generation, index, &hdr)?;
        self.copy_to_shadow_wal(&path, page_size)
    }

    /// Copies newly committed frames into the current segment; on restart
    /// additionally rotates to `index + 1` seeded from the new live header.
    ///
    /// The tail of the old WAL is copied into the current segment *before*
    /// the rotation so no frames are dropped across the boundary.
    fn sync_wal(&self, store: &ShadowStore, info: &SyncInfo, page_size: u32) -> CoreResult<u64> {
        let new_size = self.copy_to_shadow_wal(&info.shadow_path, page_size)?;
        if !info.restart {
            return Ok(new_size);
        }
        self.init_shadow_wal_file(store, &info.generation, info.index + 1, page_size)
    }

    /// Appends newly committed live WAL frames to a shadow segment.
    ///
    /// Streams the live WAL from the segment's frame-aligned end, chaining
    /// the running checksum from the segment's last frame (or its header).
    /// Stops cleanly at a salt mismatch (end of the logical WAL), stops
    /// with a warning at a checksum mismatch, and persists exactly up to
    /// the last commit frame, fsyncing before returning the new size.
    fn copy_to_shadow_wal(&self, shadow_path: &Path, page_size: u32) -> CoreResult<u64> {
        let mut wal = File::open(self.wal_path())?;
        let mut shadow = OpenOptions::new().read(true).write(true).open(shadow_path)?;

        let orig_size = frame_align(shadow.metadata()?.len(), page_size);

        let mut hdr = [0u8; WAL_HEADER_SIZE];
        shadow.read_exact(&mut hdr)?;
        let salts = header_salts(&hdr)?;
        let order = ByteOrder::from_magic(u32::from_be_bytes([hdr[0], hdr[1], hdr[2], hdr[3]]))?;

        let mut sum = read_last_checksum(&mut shadow, orig_size, page_size)?;

        wal.seek(SeekFrom::Start(orig_size))?;

        let fsz = frame_size(page_size);
        let mut buf = vec![0u8; fsz as usize];
        let mut tmp_size = orig_size;
        let mut last_commit_size = orig_size;
        loop {
            if !read_full(&mut wal, &mut buf)? {
                break; // end of file or partial frame
            }

            match verify_frame(order, salts, sum, &buf)? {
                FrameOutcome::SaltMismatch => {
                    debug!(offset = tmp_size, "copy shadow: salt mismatch, end of logical wal");
                    break;
                }
                FrameOutcome::ChecksumMismatch { stored, computed } => {
                    warn!(
                        offset = tmp_size,
                        stored = ?stored,
                        computed = ?computed,
                        "copy shadow: frame checksum mismatch, truncating copy"
                    );
                    break;
                }
                FrameOutcome::Valid { checksum, db_size } => {
                    sum = checksum;
                    tmp_size += fsz;
                    if db_size != 0 {
                        last_commit_size = tmp_size;
                    }
                }
            }
        }

        // Copy the commit-bounded range and make it durable. Frames past
        // the last commit are left for the next tick.
        wal.seek(SeekFrom::Start(orig_size))?;
        shadow.seek(SeekFrom::Start(orig_size))?;

        let n = last_commit_size - orig_size;
        let copied = io::copy(&mut (&mut wal).take(n), &mut shadow)?;
        if copied != n {
            return Err(CoreError::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short wal copy: {copied} of {n} bytes"),
            )));
        }
        shadow.sync_all()?;

        self.metrics.add_shadow_bytes(n);
        Ok(last_commit_size)
    }

    /// Runs a checkpoint, forces a fresh WAL write, and rotates the shadow
    /// segment when the live WAL header changed (it does whenever the
    /// checkpoint reached the end of the WAL and the write wrapped around).
    fn checkpoint_and_init(
        &self,
        adapter: &mut SqliteAdapter,
        store: &ShadowStore,
        generation: &str,
        mode: CheckpointMode,
        page_size: u32,
    ) -> CoreResult<()> {
        let (index, _) = store.current_index(generation)?;
        let shadow_path = store.segment_path(generation, index);

        let hdr_before = read_wal_header(&self.wal_path())?;

        self.do_checkpoint(adapter, mode)?;
        adapter.bump_seq()?;

        let hdr_after = read_wal_header(&self.wal_path())?;
        if hdr_before == hdr_after {
            return Ok(());
        }

        // The WAL restarted. Finish the old segment from the old header's
        // frames, then seed the next segment from the new header.
        self.copy_to_shadow_wal(&shadow_path, page_size)?;
        self.init_shadow_wal_file(store, generation, index + 1, page_size)?;
        Ok(())
    }

    fn do_checkpoint(
        &self,
        adapter: &mut SqliteAdapter,
        mode: CheckpointMode,
    ) -> CoreResult<CheckpointResult> {
        let started = Instant::now();
        let result = adapter.checkpoint(mode);
        self.metrics
            .record_checkpoint(mode, started.elapsed(), result.is_err());
        result
    }

    /// Removes old generations and replicated shadow segments.
    fn clean(&self, store: &ShadowStore) -> CoreResult<()> {
        let generation = store.current_generation()?;
        store.clean_generations(generation.as_deref())?;
        if let Some(generation) = generation {
            self.clean_wal(store, &generation)?;
        }
        Ok(())
    }

    /// Deletes segments below the minimum index every replica has durably
    /// replicated in the current generation, keeping one extra segment.
    /// Positions from other generations count as zero; nothing is deleted
    /// until every replica has advanced past segment zero.
    fn clean_wal(&self, store: &ShadowStore, generation: &str) -> CoreResult<()> {
        let replicas = self.replicas.read();
        if replicas.is_empty() {
            return Ok(());
        }

        let mut min: Option<u32> = None;
        for replica in replicas.iter() {
            let pos = replica.last_pos();
            let index = if pos.generation == generation {
                pos.index
            } else {
                0
            };
            min = Some(min.map_or(index, |m| m.min(index)));
        }

        let Some(min) = min else { return Ok(()) };
        if min == 0 {
            return Ok(());
        }
        store.clean_wal(generation, min - 1)
    }

    /// Derives the current position from disk: current generation, highest
    /// segment index, frame-aligned segment size.
    fn pos_on_disk(&self, store: &ShadowStore, page_size: u32) -> CoreResult<Pos> {
        let Some(generation) = store.current_generation()? else {
            return Ok(Pos::default());
        };
        let (index, _) = store.current_index(&generation)?;

        match fs::metadata(store.segment_path(&generation, index)) {
            Ok(metadata) => Ok(Pos::new(
                generation,
                index,
                frame_align(metadata.len(), page_size),
            )),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                Ok(Pos::new(generation, index, 0))
            }
            Err(err) => Err(err.into()),
        }
    }
}

/// Reads the raw 32-byte WAL header.
fn read_wal_header(path: &Path) -> CoreResult<[u8; WAL_HEADER_SIZE]> {
    let mut file = File::open(path)?;
    let mut hdr = [0u8; WAL_HEADER_SIZE];
    file.read_exact(&mut hdr)?;
    Ok(hdr)
}

/// Reads `len` bytes at `offset`.
fn read_file_at(path: &Path, offset: u64, len: u64) -> CoreResult<Vec<u8>> {
    let mut file = File::open(path)?;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; len as usize];
    file.read_exact(&mut buf)?;
    Ok(buf)
}

/// Reads the checksum that seeds the next frame: the last full frame's
/// stored checksum, or the header checksum for a header-only segment.
fn read_last_checksum(file: &mut File, aligned_size: u64, page_size: u32) -> CoreResult<Checksum> {
    let offset = if aligned_size > WAL_HEADER_SIZE as u64 {
        aligned_size - frame_size(page_size) + WAL_FRAME_CHECKSUM_OFFSET
    } else {
        WAL_HEADER_CHECKSUM_OFFSET
    };

    file.seek(SeekFrom::Start(offset))?;
    let mut buf = [0u8; 8];
    file.read_exact(&mut buf)?;
    Ok(Checksum {
        s1: u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]),
        s2: u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]),
    })
}

/// Fills `buf` completely, or returns false on end of file (including a
/// trailing partial frame).
fn read_full(file: &mut File, buf: &mut [u8]) -> io::Result<bool> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Ok(false);
        }
        filled += n;
    }
    Ok(true)
}

fn crc64_file(path: &Path) -> CoreResult<u64> {
    let mut file = File::open(path)?;
    let mut digest = CRC64.digest();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        digest.update(&buf[..n]);
    }
    Ok(digest.finalize())
}

fn copy_file(dst: &Path, src: &Path) -> CoreResult<()> {
    let mut reader = File::open(src)?;
    let mut writer = File::create(dst)?;
    io::copy(&mut reader, &mut writer)?;
    writer.sync_all()?;
    Ok(())
}
