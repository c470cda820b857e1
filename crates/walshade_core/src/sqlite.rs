//! Database adapter: the only module that speaks SQLite's dialect.
//!
//! The adapter owns two connections to the live database:
//!
//! - the **main connection** issues the sequence-table upserts that force
//!   WAL writes, the write-intent transactions, and checkpoints;
//! - the **read connection** holds the long-lived read transaction that
//!   pins a read mark so no other connection can checkpoint past it.
//!
//! The read mark must survive while the main connection writes, so the two
//! roles cannot share one connection. The read transaction is not a data
//! transaction; it is exposed as an opaque read lock with acquire/release.

use crate::error::{CoreError, CoreResult};
use rusqlite::Connection;
use std::fmt;
use std::fs;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

use walshade_wal::WAL_HEADER_SIZE;

/// Upsert that bumps the sequence row, forcing at least one WAL frame.
/// There is only ever one row, with `id = 1`.
const SEQ_UPSERT: &str =
    "INSERT INTO _walshade_seq (id, seq) VALUES (1, 1) ON CONFLICT (id) DO UPDATE SET seq = seq + 1";

/// Checkpoint mode passed to `PRAGMA wal_checkpoint`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckpointMode {
    /// Checkpoint without waiting for readers or blocking writers; may be
    /// partial.
    Passive = 0,
    /// Wait for writers, checkpoint everything and force the next writer to
    /// restart the WAL from its beginning.
    Restart = 1,
    /// Like restart, but also truncate the WAL file to zero bytes. Used
    /// only at restore time.
    Truncate = 2,
}

impl CheckpointMode {
    /// Returns the SQL keyword for this mode.
    #[must_use]
    pub const fn as_sql(self) -> &'static str {
        match self {
            Self::Passive => "PASSIVE",
            Self::Restart => "RESTART",
            Self::Truncate => "TRUNCATE",
        }
    }
}

impl fmt::Display for CheckpointMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_sql())
    }
}

/// Result row of `PRAGMA wal_checkpoint`: `(busy, log frames, checkpointed
/// frames)`.
pub type CheckpointResult = (i64, i64, i64);

/// A write-intent transaction on the main connection.
///
/// Inserting into the lock table promotes the transaction to a writer, which
/// prevents any other connection from appending WAL frames until release.
/// The transaction is always rolled back (on [`WriteLock::release`] or on
/// drop), so the lock table is empty on disk at all times.
pub struct WriteLock<'conn> {
    tx: rusqlite::Transaction<'conn>,
}

impl WriteLock<'_> {
    /// Rolls the write-intent transaction back, releasing the write lock.
    pub fn release(self) -> CoreResult<()> {
        self.tx.rollback()?;
        Ok(())
    }
}

/// Connection manager for the live database.
pub struct SqliteAdapter {
    conn: Connection,
    read_conn: Connection,
    read_locked: bool,
    page_size: u32,
}

impl SqliteAdapter {
    /// Opens both connections, enables WAL journaling, disables the
    /// engine-side autocheckpoint, creates the private tables and acquires
    /// the long-lived read lock.
    ///
    /// # Errors
    ///
    /// Fails when the database cannot be opened, WAL mode cannot be
    /// enabled, or the reported page size is invalid.
    pub fn open(path: &Path, busy_timeout: Duration) -> CoreResult<Self> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;

        let mode: String = conn.query_row("PRAGMA journal_mode = wal", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            return Err(CoreError::WalModeUnavailable { mode });
        }

        // The engine owns all checkpointing; SQLite must never checkpoint
        // behind the capture's back.
        let _: i64 = conn.query_row("PRAGMA wal_autocheckpoint = 0", [], |row| row.get(0))?;

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS _walshade_seq (id INTEGER PRIMARY KEY, seq INTEGER);
             CREATE TABLE IF NOT EXISTS _walshade_lock (id INTEGER);",
        )?;

        let page_size: u32 = conn.query_row("PRAGMA page_size", [], |row| row.get(0))?;
        if page_size == 0 {
            return Err(CoreError::InvalidPageSize { page_size });
        }

        let read_conn = Connection::open(path)?;
        read_conn.busy_timeout(busy_timeout)?;

        let mut adapter = Self {
            conn,
            read_conn,
            read_locked: false,
            page_size,
        };
        adapter.acquire_read_lock()?;
        Ok(adapter)
    }

    /// Returns the database page size in bytes.
    #[must_use]
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Returns true while the long-lived read lock is held.
    #[must_use]
    pub fn is_read_locked(&self) -> bool {
        self.read_locked
    }

    /// Acquires the long-lived read lock: a transaction on the read
    /// connection pinned by an arbitrary read. No-op when already held.
    pub fn acquire_read_lock(&mut self) -> CoreResult<()> {
        if self.read_locked {
            return Ok(());
        }

        self.read_conn.execute_batch("BEGIN")?;
        let pinned: CoreResult<i64> = self
            .read_conn
            .query_row("SELECT COUNT(1) FROM _walshade_seq", [], |row| row.get(0))
            .map_err(Into::into);
        if let Err(err) = pinned {
            let _ = self.read_conn.execute_batch("ROLLBACK");
            return Err(err);
        }

        self.read_locked = true;
        Ok(())
    }

    /// Rolls back the long-lived read transaction. No-op when not held.
    pub fn release_read_lock(&mut self) -> CoreResult<()> {
        if !self.read_locked {
            return Ok(());
        }
        self.read_locked = false;
        self.read_conn.execute_batch("ROLLBACK")?;
        Ok(())
    }

    /// Ensures the live WAL file exists and holds at least a header by
    /// bumping the sequence row when it does not.
    pub fn ensure_wal_exists(&self, wal_path: &Path) -> CoreResult<()> {
        if let Ok(metadata) = fs::metadata(wal_path) {
            if metadata.len() >= WAL_HEADER_SIZE as u64 {
                return Ok(());
            }
        }
        self.bump_seq()
    }

    /// Bumps the sequence row, forcing SQLite to write at least one new WAL
    /// frame.
    pub fn bump_seq(&self) -> CoreResult<()> {
        self.conn.execute(SEQ_UPSERT, [])?;
        Ok(())
    }

    /// Promotes the current position to a writer by inserting into the lock
    /// table inside a fresh transaction. While the returned lock lives, no
    /// other connection can append WAL frames.
    pub fn acquire_write_lock(&mut self) -> CoreResult<WriteLock<'_>> {
        let tx = self.conn.transaction()?;
        tx.execute("INSERT INTO _walshade_lock (id) VALUES (1)", [])?;
        Ok(WriteLock { tx })
    }

    /// Runs a checkpoint in the given mode.
    ///
    /// The read lock is released first (a pinned read mark would make every
    /// checkpoint a no-op) and reacquired immediately after, even when the
    /// checkpoint itself fails.
    pub fn checkpoint(&mut self, mode: CheckpointMode) -> CoreResult<CheckpointResult> {
        self.release_read_lock()?;

        let sql = format!("PRAGMA wal_checkpoint({})", mode.as_sql());
        let result = self
            .conn
            .query_row(&sql, [], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)));

        let reacquire = self.acquire_read_lock();
        let row: CheckpointResult = result?;
        reacquire?;

        debug!(mode = %mode, busy = row.0, log = row.1, checkpointed = row.2, "checkpoint");
        Ok(row)
    }

    /// Releases the read lock and leaks both connections.
    ///
    /// Dropping the last connection to a WAL database makes SQLite fold the
    /// WAL back into the main file; that would destroy the tail of the WAL
    /// before a replica could stream it, so on shutdown the connections are
    /// deliberately kept open until the process exits.
    pub fn soft_close(mut self) -> CoreResult<()> {
        let result = self.release_read_lock();
        std::mem::forget(self);
        result
    }

    /// Releases the read lock and drops both connections.
    ///
    /// Closing triggers SQLite's implicit checkpoint; only tests that want
    /// a fully settled database file should call this.
    pub fn close(mut self) -> CoreResult<()> {
        self.release_read_lock()
    }
}

impl fmt::Debug for SqliteAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqliteAdapter")
            .field("page_size", &self.page_size)
            .field("read_locked", &self.read_locked)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn create_db(path: &Path) {
        let conn = Connection::open(path).unwrap();
        conn.execute_batch("CREATE TABLE t (id INTEGER PRIMARY KEY, body TEXT)")
            .unwrap();
    }

    #[test]
    fn open_enables_wal_and_reads_page_size() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        assert!(adapter.page_size() >= 512);
        assert!(adapter.is_read_locked());
        adapter.close().unwrap();
    }

    #[test]
    fn ensure_wal_exists_creates_wal_file() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        let wal_path = temp.path().join("app.db-wal");
        adapter.ensure_wal_exists(&wal_path).unwrap();

        let len = fs::metadata(&wal_path).unwrap().len();
        assert!(len >= WAL_HEADER_SIZE as u64);
        adapter.close().unwrap();
    }

    #[test]
    fn read_lock_acquire_release_idempotent() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let mut adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        adapter.acquire_read_lock().unwrap();
        adapter.acquire_read_lock().unwrap();
        assert!(adapter.is_read_locked());

        adapter.release_read_lock().unwrap();
        adapter.release_read_lock().unwrap();
        assert!(!adapter.is_read_locked());
        adapter.close().unwrap();
    }

    #[test]
    fn write_lock_blocks_other_writers() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let mut adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        let lock = adapter.acquire_write_lock().unwrap();

        let other = Connection::open(&db_path).unwrap();
        other.busy_timeout(Duration::ZERO).unwrap();
        let blocked = other.execute("INSERT INTO t (body) VALUES ('x')", []);
        assert!(blocked.is_err());

        lock.release().unwrap();
        other.busy_timeout(Duration::from_secs(1)).unwrap();
        other.execute("INSERT INTO t (body) VALUES ('x')", []).unwrap();
        adapter.close().unwrap();
    }

    #[test]
    fn lock_table_empty_after_release() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let mut adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        let lock = adapter.acquire_write_lock().unwrap();
        lock.release().unwrap();

        let count: i64 = adapter
            .conn
            .query_row("SELECT COUNT(*) FROM _walshade_lock", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 0);
        adapter.close().unwrap();
    }

    #[test]
    fn checkpoint_reacquires_read_lock() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        create_db(&db_path);

        let mut adapter = SqliteAdapter::open(&db_path, Duration::from_secs(1)).unwrap();
        adapter.bump_seq().unwrap();

        let (busy, _, _) = adapter.checkpoint(CheckpointMode::Passive).unwrap();
        assert_eq!(busy, 0);
        assert!(adapter.is_read_locked());
        adapter.close().unwrap();
    }
}
