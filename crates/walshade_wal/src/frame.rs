//! WAL frame parsing, validation and encoding.

use crate::error::{WalError, WalResult};
use crate::header::be_u32;
use crate::{checksum, ByteOrder, Checksum, Salts, WAL_FRAME_HEADER_SIZE};

/// The 24-byte header preceding each page in the WAL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalFrameHeader {
    /// Database page number written by this frame.
    pub page_number: u32,
    /// Size of the database in pages after this commit, or zero if this
    /// frame does not end a transaction.
    pub db_size: u32,
    /// Copy of the WAL header salts; a mismatch marks the end of the
    /// logically valid WAL.
    pub salts: Salts,
    /// Cumulative checksum through this frame's header and page data.
    pub checksum: Checksum,
}

impl WalFrameHeader {
    /// Parses a frame header from the first 24 bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::ShortInput`] if fewer than 24 bytes are given.
    pub fn parse(buf: &[u8]) -> WalResult<Self> {
        if buf.len() < WAL_FRAME_HEADER_SIZE {
            return Err(WalError::ShortInput {
                need: WAL_FRAME_HEADER_SIZE,
                have: buf.len(),
            });
        }
        Ok(Self {
            page_number: be_u32(buf, 0),
            db_size: be_u32(buf, 4),
            salts: Salts {
                salt1: be_u32(buf, 8),
                salt2: be_u32(buf, 12),
            },
            checksum: Checksum {
                s1: be_u32(buf, 16),
                s2: be_u32(buf, 20),
            },
        })
    }

    /// Returns true if this frame ends a transaction.
    #[must_use]
    pub const fn is_commit(&self) -> bool {
        self.db_size != 0
    }
}

/// The result of validating one frame against the WAL header state.
///
/// Salt and checksum mismatches are terminal conditions of the frame
/// sequence, not errors: they mark where the logically valid WAL ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame verifies; `checksum` seeds the next frame.
    Valid {
        /// Running checksum through this frame.
        checksum: Checksum,
        /// Post-commit database page count (zero for non-commit frames).
        db_size: u32,
    },
    /// Frame salts do not match the header salts.
    SaltMismatch,
    /// The recomputed running checksum disagrees with the stored one.
    ChecksumMismatch {
        /// Checksum stored in the frame header.
        stored: Checksum,
        /// Checksum recomputed from the byte stream.
        computed: Checksum,
    },
}

/// Validates a full frame (`24 + page_size` bytes) against the header salts
/// and the running checksum of the preceding frame (or the header checksum
/// for the first frame).
///
/// # Errors
///
/// Returns [`WalError::ShortInput`] when `frame` is shorter than one frame
/// header plus one byte of page data.
pub fn verify_frame(
    order: ByteOrder,
    salts: Salts,
    prev: Checksum,
    frame: &[u8],
) -> WalResult<FrameOutcome> {
    let hdr = WalFrameHeader::parse(frame)?;
    if frame.len() <= WAL_FRAME_HEADER_SIZE {
        return Err(WalError::ShortInput {
            need: WAL_FRAME_HEADER_SIZE + 1,
            have: frame.len(),
        });
    }

    if hdr.salts != salts {
        return Ok(FrameOutcome::SaltMismatch);
    }

    let sum = checksum(order, prev, &frame[..8]);
    let sum = checksum(order, sum, &frame[WAL_FRAME_HEADER_SIZE..]);
    if sum != hdr.checksum {
        return Ok(FrameOutcome::ChecksumMismatch {
            stored: hdr.checksum,
            computed: sum,
        });
    }

    Ok(FrameOutcome::Valid {
        checksum: sum,
        db_size: hdr.db_size,
    })
}

/// Encodes one frame with a correct running checksum.
///
/// Returns the `24 + page.len()` frame bytes together with the checksum that
/// seeds the next frame. Used to synthesize bit-faithful WALs in tests and
/// fixtures; the capture path itself only ever copies frames verbatim.
#[must_use]
pub fn encode_frame(
    order: ByteOrder,
    salts: Salts,
    prev: Checksum,
    page_number: u32,
    db_size: u32,
    page: &[u8],
) -> (Vec<u8>, Checksum) {
    let mut buf = Vec::with_capacity(WAL_FRAME_HEADER_SIZE + page.len());
    buf.extend_from_slice(&page_number.to_be_bytes());
    buf.extend_from_slice(&db_size.to_be_bytes());
    buf.extend_from_slice(&salts.salt1.to_be_bytes());
    buf.extend_from_slice(&salts.salt2.to_be_bytes());

    let sum = checksum(order, prev, &buf[..8]);
    let sum = checksum(order, sum, page);
    buf.extend_from_slice(&sum.s1.to_be_bytes());
    buf.extend_from_slice(&sum.s2.to_be_bytes());
    buf.extend_from_slice(page);

    (buf, sum)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SALTS: Salts = Salts {
        salt1: 0xaaaa_bbbb,
        salt2: 0xcccc_dddd,
    };

    #[test]
    fn encode_then_verify() {
        let page = vec![0x42u8; 4096];
        let (frame, sum) = encode_frame(ByteOrder::Little, SALTS, Checksum::ZERO, 1, 1, &page);
        assert_eq!(frame.len(), WAL_FRAME_HEADER_SIZE + 4096);

        let outcome = verify_frame(ByteOrder::Little, SALTS, Checksum::ZERO, &frame).unwrap();
        assert_eq!(
            outcome,
            FrameOutcome::Valid {
                checksum: sum,
                db_size: 1
            }
        );
    }

    #[test]
    fn chained_frames_verify_in_sequence() {
        let page = vec![7u8; 512];
        let (f1, sum1) = encode_frame(ByteOrder::Big, SALTS, Checksum::ZERO, 1, 0, &page);
        let (f2, sum2) = encode_frame(ByteOrder::Big, SALTS, sum1, 2, 2, &page);

        let o1 = verify_frame(ByteOrder::Big, SALTS, Checksum::ZERO, &f1).unwrap();
        assert!(matches!(o1, FrameOutcome::Valid { checksum, .. } if checksum == sum1));

        let o2 = verify_frame(ByteOrder::Big, SALTS, sum1, &f2).unwrap();
        assert_eq!(
            o2,
            FrameOutcome::Valid {
                checksum: sum2,
                db_size: 2
            }
        );
    }

    #[test]
    fn salt_mismatch_is_terminal_not_error() {
        let page = vec![0u8; 256];
        let other = Salts {
            salt1: 1,
            salt2: 2,
        };
        let (frame, _) = encode_frame(ByteOrder::Little, other, Checksum::ZERO, 1, 1, &page);
        let outcome = verify_frame(ByteOrder::Little, SALTS, Checksum::ZERO, &frame).unwrap();
        assert_eq!(outcome, FrameOutcome::SaltMismatch);
    }

    #[test]
    fn corrupt_page_reports_checksum_mismatch() {
        let page = vec![9u8; 256];
        let (mut frame, _) = encode_frame(ByteOrder::Little, SALTS, Checksum::ZERO, 3, 0, &page);
        frame[WAL_FRAME_HEADER_SIZE + 10] ^= 0x01;
        let outcome = verify_frame(ByteOrder::Little, SALTS, Checksum::ZERO, &frame).unwrap();
        assert!(matches!(outcome, FrameOutcome::ChecksumMismatch { .. }));
    }

    #[test]
    fn wrong_seed_reports_checksum_mismatch() {
        let page = vec![9u8; 256];
        let (frame, _) = encode_frame(ByteOrder::Little, SALTS, Checksum::ZERO, 3, 0, &page);
        let seed = Checksum { s1: 1, s2: 1 };
        let outcome = verify_frame(ByteOrder::Little, SALTS, seed, &frame).unwrap();
        assert!(matches!(outcome, FrameOutcome::ChecksumMismatch { .. }));
    }

    #[test]
    fn commit_flag_from_db_size() {
        let hdr = WalFrameHeader {
            page_number: 1,
            db_size: 0,
            salts: SALTS,
            checksum: Checksum::ZERO,
        };
        assert!(!hdr.is_commit());

        let hdr = WalFrameHeader { db_size: 12, ..hdr };
        assert!(hdr.is_commit());
    }
}
