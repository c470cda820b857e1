//! Positioned reader over shadow WAL segments.

use crate::error::{CoreError, CoreResult};
use crate::pos::Pos;
use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::Path;
use walshade_wal::frame_align;

/// A reader over one shadow WAL segment that tracks its replication
/// position and the bytes remaining up to the frame-aligned end of file.
///
/// Bytes past the last full frame are never served; a torn trailing write
/// is invisible to consumers. When a reader is exhausted, callers re-open at
/// `(generation, index + 1, 0)` via [`crate::Db::shadow_wal_reader`].
#[derive(Debug)]
pub struct ShadowWalReader {
    file: File,
    remaining: u64,
    pos: Pos,
}

impl ShadowWalReader {
    /// Opens the segment at `path`, seeking to `pos.offset`.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::OffsetBeyondEof`] when the requested offset is
    /// past the frame-aligned size of the segment, or an I/O error (with
    /// `NotFound` kind when the segment does not exist).
    pub(crate) fn open(path: &Path, pos: Pos, page_size: u32) -> CoreResult<Self> {
        let mut file = File::open(path)?;
        let size = frame_align(file.metadata()?.len(), page_size);
        if pos.offset > size {
            return Err(CoreError::OffsetBeyondEof {
                offset: pos.offset,
                size,
            });
        }

        file.seek(SeekFrom::Start(pos.offset))?;
        Ok(Self {
            file,
            remaining: size - pos.offset,
            pos,
        })
    }

    /// Returns the current replication position of the reader.
    #[must_use]
    pub fn pos(&self) -> &Pos {
        &self.pos
    }

    /// Returns the number of frame-aligned bytes left to read.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.remaining
    }
}

impl Read for ShadowWalReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.remaining == 0 {
            return Ok(0);
        }

        let limit = usize::try_from(self.remaining.min(buf.len() as u64)).unwrap_or(usize::MAX);
        let n = self.file.read(&mut buf[..limit])?;
        self.remaining -= n as u64;
        self.pos.offset += n as u64;
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    const PAGE_SIZE: u32 = 512;
    const FRAME_SIZE: usize = 24 + 512;

    fn write_segment(path: &Path, frames: usize, extra: usize) {
        let mut data = vec![0u8; 32 + frames * FRAME_SIZE + extra];
        for (i, byte) in data.iter_mut().enumerate() {
            *byte = (i % 251) as u8;
        }
        fs::write(path, &data).unwrap();
    }

    #[test]
    fn reads_from_offset_to_aligned_end() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("00000000.wal");
        write_segment(&path, 2, 0);

        let pos = Pos::new("0123456789abcdef", 0, 32);
        let mut reader = ShadowWalReader::open(&path, pos, PAGE_SIZE).unwrap();
        assert_eq!(reader.remaining(), 2 * FRAME_SIZE as u64);

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 2 * FRAME_SIZE);
        assert_eq!(reader.remaining(), 0);
        assert_eq!(reader.pos().offset, 32 + 2 * FRAME_SIZE as u64);
    }

    #[test]
    fn torn_tail_is_not_served() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("00000000.wal");
        // One full frame plus a torn partial frame.
        write_segment(&path, 1, 100);

        let pos = Pos::new("0123456789abcdef", 0, 0);
        let mut reader = ShadowWalReader::open(&path, pos, PAGE_SIZE).unwrap();

        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        assert_eq!(buf.len(), 32 + FRAME_SIZE);
    }

    #[test]
    fn offset_beyond_eof_rejected() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("00000000.wal");
        write_segment(&path, 1, 0);

        let pos = Pos::new("0123456789abcdef", 0, 32 + 2 * FRAME_SIZE as u64);
        let result = ShadowWalReader::open(&path, pos, PAGE_SIZE);
        assert!(matches!(result, Err(CoreError::OffsetBeyondEof { .. })));
    }

    #[test]
    fn offset_at_exact_end_yields_empty_reader() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("00000000.wal");
        write_segment(&path, 1, 0);

        let pos = Pos::new("0123456789abcdef", 0, 32 + FRAME_SIZE as u64);
        let mut reader = ShadowWalReader::open(&path, pos, PAGE_SIZE).unwrap();
        assert_eq!(reader.remaining(), 0);

        let mut buf = [0u8; 16];
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn missing_segment_is_not_found() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("00000001.wal");
        let result = ShadowWalReader::open(&path, Pos::default(), PAGE_SIZE);
        assert!(result.err().map(|e| e.is_not_found()).unwrap_or(false));
    }
}
