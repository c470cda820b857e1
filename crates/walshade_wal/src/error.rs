//! Error types for the WAL codec.

use thiserror::Error;

/// Result type for WAL codec operations.
pub type WalResult<T> = Result<T, WalError>;

/// Errors that can occur while parsing WAL bytes.
///
/// Salt and running-checksum mismatches on individual frames are *not*
/// errors; they mark the end of the logically valid WAL and are reported
/// through [`crate::FrameOutcome`] instead.
#[derive(Debug, Error)]
pub enum WalError {
    /// The WAL header magic is not one of the two known values.
    #[error("invalid wal header magic: {magic:#010x}")]
    BadMagic {
        /// The magic value that was read (big-endian).
        magic: u32,
    },

    /// The 64-bit checksum stored in the WAL header does not match the
    /// checksum computed over its first 24 bytes.
    #[error("invalid wal header checksum: stored ({stored_s1:#x},{stored_s2:#x}) != computed ({computed_s1:#x},{computed_s2:#x})")]
    BadHeaderChecksum {
        /// First stored checksum word.
        stored_s1: u32,
        /// Second stored checksum word.
        stored_s2: u32,
        /// First computed checksum word.
        computed_s1: u32,
        /// Second computed checksum word.
        computed_s2: u32,
    },

    /// The input buffer is too short for the structure being parsed.
    #[error("short wal input: need {need} bytes, have {have}")]
    ShortInput {
        /// Number of bytes required.
        need: usize,
        /// Number of bytes available.
        have: usize,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = WalError::BadMagic { magic: 0xdead_beef };
        assert_eq!(err.to_string(), "invalid wal header magic: 0xdeadbeef");

        let err = WalError::ShortInput { need: 32, have: 7 };
        assert!(err.to_string().contains("32"));
        assert!(err.to_string().contains("7"));
    }
}
