//! Shadow store: the on-disk meta directory beside the database file.
//!
//! Layout for a database at `<dir>/<name>`:
//!
//! ```text
//! <dir>/.<name>-walshade/
//! ├─ LOCK                              # advisory lock, one engine per DB
//! ├─ generation                        # current generation id, newline-terminated
//! └─ generations/
//!    └─ <16-hex-generation>/
//!       └─ wal/
//!          ├─ 00000000.wal             # shadow WAL segments
//!          └─ 00000001.wal
//! ```
//!
//! The store is pure filesystem state with no in-memory index. The
//! generation pointer is flipped with write-to-temp + atomic rename so a
//! reader never observes a torn value. Files created here inherit the
//! database file's mode and owner; directories inherit the database parent
//! directory's.

use crate::error::{CoreError, CoreResult};
use crate::pos::GENERATION_NAME_LEN;
use fs2::FileExt;
use rand::RngCore;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Suffix appended to the hidden meta directory name.
pub const META_DIR_SUFFIX: &str = "-walshade";

/// File extension of shadow WAL segments.
pub const WAL_SEGMENT_EXT: &str = ".wal";

const GENERATION_FILE: &str = "generation";
const GENERATIONS_DIR: &str = "generations";
const WAL_DIR: &str = "wal";
const LOCK_FILE: &str = "LOCK";
const TMP_EXT: &str = "tmp";

/// Returns the meta directory path for a database path.
///
/// `/data/app.db` maps to `/data/.app.db-walshade`.
#[must_use]
pub fn meta_path_for(db_path: &Path) -> PathBuf {
    let dir = db_path.parent().unwrap_or_else(|| Path::new(""));
    let name = db_path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    dir.join(format!(".{name}{META_DIR_SUFFIX}"))
}

/// Removes `*.tmp` files under `meta_path`, recursively.
///
/// Crash leftovers from interrupted pointer flips or restores are cleared
/// at open time before any of them could be mistaken for live state.
pub fn remove_tmp_files(meta_path: &Path) -> CoreResult<()> {
    if !meta_path.exists() {
        return Ok(());
    }
    remove_tmp_files_in(meta_path)
}

fn remove_tmp_files_in(dir: &Path) -> CoreResult<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let path = entry.path();
        if entry.file_type()?.is_dir() {
            remove_tmp_files_in(&path)?;
        } else if path.extension().is_some_and(|ext| ext == TMP_EXT) {
            debug!(path = %path.display(), "removing stale temp file");
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

/// File mode and ownership captured from an existing file, applied
/// best-effort to files the store creates.
///
/// Ownership is only available on Unix; elsewhere the struct is inert.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilePerms {
    mode: Option<u32>,
    owner: Option<(u32, u32)>,
}

impl FilePerms {
    /// Captures mode and ownership from an existing path.
    pub fn capture(path: &Path) -> io::Result<Self> {
        let metadata = fs::metadata(path)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            Ok(Self {
                mode: Some(metadata.mode() & 0o7777),
                owner: Some((metadata.uid(), metadata.gid())),
            })
        }
        #[cfg(not(unix))]
        {
            let _ = metadata;
            Ok(Self::default())
        }
    }

    /// Applies the captured mode and ownership to `path`, best-effort.
    ///
    /// Ownership changes typically require privileges; failures are ignored
    /// the same way the permission bits of a foreign platform are.
    pub fn apply(&self, path: &Path) {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            if let Some(mode) = self.mode {
                let _ = fs::set_permissions(path, fs::Permissions::from_mode(mode));
            }
            if let Some((uid, gid)) = self.owner {
                let _ = std::os::unix::fs::chown(path, Some(uid), Some(gid));
            }
        }
        #[cfg(not(unix))]
        {
            let _ = path;
        }
    }
}

/// Formats a shadow WAL segment file name for an index.
#[must_use]
pub fn format_segment_name(index: u32) -> String {
    format!("{index:08x}{WAL_SEGMENT_EXT}")
}

/// Parses a shadow WAL segment file name back to its index.
#[must_use]
pub fn parse_segment_name(name: &str) -> Option<u32> {
    let stem = name.strip_suffix(WAL_SEGMENT_EXT)?;
    if stem.len() != 8 {
        return None;
    }
    u32::from_str_radix(stem, 16).ok()
}

/// Manages the meta directory for one database.
///
/// Holds an exclusive advisory lock for its lifetime; a second engine
/// instance on the same database path fails to open the store.
#[derive(Debug)]
pub struct ShadowStore {
    meta_path: PathBuf,
    file_perms: FilePerms,
    dir_perms: FilePerms,
    /// Lock file handle, held for exclusive access to the meta directory.
    _lock_file: File,
}

impl ShadowStore {
    /// Opens the shadow store for a database, creating the meta directory.
    ///
    /// `file_perms` and `dir_perms` are the database file's and its parent
    /// directory's captured permissions; everything the store creates
    /// inherits them.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::MetaDirLocked`] when another engine instance
    /// holds the meta directory lock.
    pub fn open(db_path: &Path, file_perms: FilePerms, dir_perms: FilePerms) -> CoreResult<Self> {
        let meta_path = meta_path_for(db_path);
        if !meta_path.exists() {
            fs::create_dir_all(&meta_path)?;
            dir_perms.apply(&meta_path);
        }

        let lock_path = meta_path.join(LOCK_FILE);
        let lock_file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;
        if lock_file.try_lock_exclusive().is_err() {
            return Err(CoreError::MetaDirLocked);
        }

        Ok(Self {
            meta_path,
            file_perms,
            dir_perms,
            _lock_file: lock_file,
        })
    }

    /// Returns the meta directory path.
    #[must_use]
    pub fn meta_path(&self) -> &Path {
        &self.meta_path
    }

    /// Returns the captured database file permissions.
    #[must_use]
    pub fn file_perms(&self) -> FilePerms {
        self.file_perms
    }

    /// Returns the captured database parent directory permissions.
    #[must_use]
    pub fn dir_perms(&self) -> FilePerms {
        self.dir_perms
    }

    /// Returns the path of the current-generation pointer file.
    #[must_use]
    pub fn generation_file_path(&self) -> PathBuf {
        self.meta_path.join(GENERATION_FILE)
    }

    /// Returns the path of the generations directory.
    #[must_use]
    pub fn generations_path(&self) -> PathBuf {
        self.meta_path.join(GENERATIONS_DIR)
    }

    /// Returns the path of a single generation directory.
    #[must_use]
    pub fn generation_path(&self, generation: &str) -> PathBuf {
        self.generations_path().join(generation)
    }

    /// Returns the shadow WAL directory of a generation.
    #[must_use]
    pub fn wal_dir(&self, generation: &str) -> PathBuf {
        self.generation_path(generation).join(WAL_DIR)
    }

    /// Returns the path of one shadow WAL segment.
    #[must_use]
    pub fn segment_path(&self, generation: &str, index: u32) -> PathBuf {
        self.wal_dir(generation).join(format_segment_name(index))
    }

    /// Reads the current generation id from the pointer file.
    ///
    /// Returns `None` when the pointer file is absent, truncated or the
    /// wrong length. A pointer referencing a generation directory that no
    /// longer exists is unlinked and reported as `None`, so the next tick
    /// starts a fresh generation instead of chasing a dangling name.
    pub fn current_generation(&self) -> CoreResult<Option<String>> {
        let path = self.generation_file_path();
        let buf = match fs::read_to_string(&path) {
            Ok(buf) => buf,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };

        let generation = buf.trim();
        if generation.len() != GENERATION_NAME_LEN {
            return Ok(None);
        }

        if !self.generation_path(generation).is_dir() {
            warn!(generation, "generation pointer references missing directory, unlinking");
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(err) => return Err(err.into()),
            }
            return Ok(None);
        }

        Ok(Some(generation.to_string()))
    }

    /// Atomically flips the current-generation pointer.
    ///
    /// Writes to `generation.tmp`, fsyncs, applies the database file's
    /// permissions, renames over the pointer and fsyncs the meta directory.
    pub fn set_current_generation(&self, generation: &str) -> CoreResult<()> {
        let path = self.generation_file_path();
        let tmp_path = path.with_extension(TMP_EXT);

        let mut file = File::create(&tmp_path)?;
        file.write_all(generation.as_bytes())?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        drop(file);
        self.file_perms.apply(&tmp_path);

        fs::rename(&tmp_path, &path)?;
        sync_dir(&self.meta_path)?;
        Ok(())
    }

    /// Generates a fresh random generation name (8 bytes, hex-encoded).
    #[must_use]
    pub fn generate_generation_name(&self) -> String {
        let mut buf = [0u8; GENERATION_NAME_LEN / 2];
        rand::thread_rng().fill_bytes(&mut buf);
        buf.iter().map(|b| format!("{b:02x}")).collect()
    }

    /// Creates the directory tree for a new generation.
    pub fn create_generation_dir(&self, generation: &str) -> CoreResult<()> {
        let generations = self.generations_path();
        if !generations.exists() {
            fs::create_dir_all(&generations)?;
            self.dir_perms.apply(&generations);
        }
        let wal_dir = self.wal_dir(generation);
        fs::create_dir_all(&wal_dir)?;
        self.dir_perms.apply(&self.generation_path(generation));
        self.dir_perms.apply(&wal_dir);
        Ok(())
    }

    /// Creates a shadow WAL segment initialized with `header`, applying the
    /// database file's permissions. Returns the segment path.
    pub fn create_segment(
        &self,
        generation: &str,
        index: u32,
        header: &[u8],
    ) -> CoreResult<PathBuf> {
        let path = self.segment_path(generation, index);
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                self.create_generation_dir(generation)?;
            }
        }
        fs::write(&path, header)?;
        self.file_perms.apply(&path);
        Ok(path)
    }

    /// Returns the highest segment index in a generation together with the
    /// total byte size of its segments. `(0, 0)` when the generation has no
    /// WAL directory yet.
    pub fn current_index(&self, generation: &str) -> CoreResult<(u32, u64)> {
        let dir = self.wal_dir(generation);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok((0, 0)),
            Err(err) => return Err(err.into()),
        };

        let mut index = 0u32;
        let mut size = 0u64;
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(idx) = parse_segment_name(&name.to_string_lossy()) else {
                continue;
            };
            index = index.max(idx);
            size += entry.metadata()?.len();
        }
        Ok((index, size))
    }

    /// Lists the generation ids present on disk.
    pub fn generations(&self) -> CoreResult<Vec<String>> {
        let entries = match fs::read_dir(self.generations_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(err.into()),
        };

        let mut generations = Vec::new();
        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.len() == GENERATION_NAME_LEN && entry.file_type()?.is_dir() {
                generations.push(name);
            }
        }
        generations.sort();
        Ok(generations)
    }

    /// Deletes every generation directory other than `current`.
    pub fn clean_generations(&self, current: Option<&str>) -> CoreResult<()> {
        let entries = match fs::read_dir(self.generations_path()) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if Some(name.as_str()) == current {
                continue;
            }
            debug!(generation = %name, "removing old generation");
            if entry.file_type()?.is_dir() {
                fs::remove_dir_all(entry.path())?;
            } else {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }

    /// Deletes shadow WAL segments of `generation` with `index < min_index`.
    pub fn clean_wal(&self, generation: &str, min_index: u32) -> CoreResult<()> {
        let dir = self.wal_dir(generation);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(err.into()),
        };

        for entry in entries {
            let entry = entry?;
            let name = entry.file_name();
            let Some(idx) = parse_segment_name(&name.to_string_lossy()) else {
                continue;
            };
            if idx < min_index {
                fs::remove_file(entry.path())?;
            }
        }
        Ok(())
    }
}

/// Fsyncs a directory so entry creations, renames and deletions are durable.
#[cfg(unix)]
fn sync_dir(path: &Path) -> CoreResult<()> {
    let dir = File::open(path)?;
    dir.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_dir(_path: &Path) -> CoreResult<()> {
    // NTFS journaling covers metadata durability; directory handles cannot
    // be fsynced on Windows.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn open_store(dir: &Path) -> (PathBuf, ShadowStore) {
        let db_path = dir.join("app.db");
        fs::write(&db_path, b"not a real database").unwrap();
        let file_perms = FilePerms::capture(&db_path).unwrap();
        let dir_perms = FilePerms::capture(dir).unwrap();
        let store = ShadowStore::open(&db_path, file_perms, dir_perms).unwrap();
        (db_path, store)
    }

    #[test]
    fn meta_path_beside_database() {
        let path = meta_path_for(Path::new("/data/app.db"));
        assert_eq!(path, Path::new("/data/.app.db-walshade"));
    }

    #[test]
    fn segment_name_round_trip() {
        assert_eq!(format_segment_name(0), "00000000.wal");
        assert_eq!(format_segment_name(0xab), "000000ab.wal");
        assert_eq!(parse_segment_name("000000ab.wal"), Some(0xab));
        assert_eq!(parse_segment_name("00000000.wal"), Some(0));
        assert_eq!(parse_segment_name("00000000.tmp"), None);
        assert_eq!(parse_segment_name("0.wal"), None);
        assert_eq!(parse_segment_name("nonsense"), None);
    }

    #[test]
    fn no_generation_initially() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());
        assert_eq!(store.current_generation().unwrap(), None);
    }

    #[test]
    fn generation_pointer_round_trip() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        let generation = store.generate_generation_name();
        assert_eq!(generation.len(), GENERATION_NAME_LEN);
        assert!(generation.chars().all(|c| c.is_ascii_hexdigit()));

        store.create_generation_dir(&generation).unwrap();
        store.set_current_generation(&generation).unwrap();
        assert_eq!(store.current_generation().unwrap(), Some(generation.clone()));

        // The pointer file is newline-terminated.
        let raw = fs::read_to_string(store.generation_file_path()).unwrap();
        assert_eq!(raw, format!("{generation}\n"));
    }

    #[test]
    fn wrong_length_pointer_treated_as_none() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        fs::write(store.generation_file_path(), "short\n").unwrap();
        assert_eq!(store.current_generation().unwrap(), None);
    }

    #[test]
    fn dangling_pointer_unlinked() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        // Pointer names a generation whose directory never existed.
        fs::write(store.generation_file_path(), "0123456789abcdef\n").unwrap();
        assert_eq!(store.current_generation().unwrap(), None);
        assert!(!store.generation_file_path().exists());
    }

    #[test]
    fn generation_names_are_distinct() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());
        let a = store.generate_generation_name();
        let b = store.generate_generation_name();
        assert_ne!(a, b);
    }

    #[test]
    fn current_index_of_missing_generation() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());
        assert_eq!(store.current_index("0123456789abcdef").unwrap(), (0, 0));
    }

    #[test]
    fn current_index_finds_highest_segment() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        let generation = "0123456789abcdef";
        store.create_segment(generation, 0, &[0u8; 32]).unwrap();
        store.create_segment(generation, 1, &[0u8; 32]).unwrap();
        store.create_segment(generation, 5, &[0u8; 48]).unwrap();
        // Non-segment files are ignored.
        fs::write(store.wal_dir(generation).join("notes.txt"), b"x").unwrap();

        let (index, size) = store.current_index(generation).unwrap();
        assert_eq!(index, 5);
        assert_eq!(size, 32 + 32 + 48);
    }

    #[test]
    fn clean_generations_keeps_current() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        store.create_generation_dir("0123456789abcdef").unwrap();
        store.create_generation_dir("fedcba9876543210").unwrap();

        store
            .clean_generations(Some("0123456789abcdef"))
            .unwrap();

        assert!(store.generation_path("0123456789abcdef").exists());
        assert!(!store.generation_path("fedcba9876543210").exists());
    }

    #[test]
    fn clean_wal_removes_below_min_index() {
        let temp = tempdir().unwrap();
        let (_, store) = open_store(temp.path());

        let generation = "0123456789abcdef";
        for index in 0..4 {
            store.create_segment(generation, index, &[0u8; 32]).unwrap();
        }

        store.clean_wal(generation, 2).unwrap();

        assert!(!store.segment_path(generation, 0).exists());
        assert!(!store.segment_path(generation, 1).exists());
        assert!(store.segment_path(generation, 2).exists());
        assert!(store.segment_path(generation, 3).exists());
    }

    #[test]
    fn tmp_files_removed_recursively() {
        let temp = tempdir().unwrap();
        let (db_path, store) = open_store(temp.path());

        let generation = "0123456789abcdef";
        store.create_generation_dir(generation).unwrap();
        let nested_tmp = store.wal_dir(generation).join("00000000.tmp");
        fs::write(&nested_tmp, b"partial").unwrap();
        let top_tmp = store.meta_path().join("generation.tmp");
        fs::write(&top_tmp, b"partial").unwrap();
        let keep = store.segment_path(generation, 0);
        fs::write(&keep, b"keep").unwrap();

        remove_tmp_files(&meta_path_for(&db_path)).unwrap();

        assert!(!nested_tmp.exists());
        assert!(!top_tmp.exists());
        assert!(keep.exists());
    }

    #[test]
    fn lock_prevents_second_store() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        fs::write(&db_path, b"db").unwrap();
        let file_perms = FilePerms::capture(&db_path).unwrap();
        let dir_perms = FilePerms::capture(temp.path()).unwrap();

        let _store = ShadowStore::open(&db_path, file_perms, dir_perms).unwrap();
        let second = ShadowStore::open(&db_path, file_perms, dir_perms);
        assert!(matches!(second, Err(CoreError::MetaDirLocked)));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempdir().unwrap();
        let db_path = temp.path().join("app.db");
        fs::write(&db_path, b"db").unwrap();
        let file_perms = FilePerms::capture(&db_path).unwrap();
        let dir_perms = FilePerms::capture(temp.path()).unwrap();

        {
            let _store = ShadowStore::open(&db_path, file_perms, dir_perms).unwrap();
        }
        let _store = ShadowStore::open(&db_path, file_perms, dir_perms).unwrap();
    }
}
