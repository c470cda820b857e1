//! WAL header parsing and encoding.

use crate::error::{WalError, WalResult};
use crate::{checksum, ByteOrder, Checksum, Salts, WAL_HEADER_SIZE};

/// Magic value (read big-endian) selecting little-endian checksum arithmetic.
pub const WAL_MAGIC_LITTLE_ENDIAN: u32 = 0x377f_0682;
/// Magic value (read big-endian) selecting big-endian checksum arithmetic.
pub const WAL_MAGIC_BIG_ENDIAN: u32 = 0x377f_0683;

/// The 32-byte header at the start of every WAL file.
///
/// All fields are stored big-endian on disk. The magic determines the byte
/// order used for *checksum arithmetic* only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WalHeader {
    /// Magic number (`0x377f0682` or `0x377f0683`).
    pub magic: u32,
    /// WAL format version (3007000 for current SQLite).
    pub format_version: u32,
    /// Database page size in bytes.
    pub page_size: u32,
    /// Checkpoint sequence number.
    pub checkpoint_seq: u32,
    /// Salts regenerated on each WAL reset; copied into every frame.
    pub salts: Salts,
    /// Cumulative checksum over the first 24 header bytes, seeded `(0,0)`.
    pub checksum: Checksum,
}

impl WalHeader {
    /// Parses and validates a WAL header from the first 32 bytes of `buf`.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::ShortInput`] if fewer than 32 bytes are given,
    /// [`WalError::BadMagic`] for an unknown magic, and
    /// [`WalError::BadHeaderChecksum`] when the stored header checksum does
    /// not verify.
    pub fn parse(buf: &[u8]) -> WalResult<Self> {
        if buf.len() < WAL_HEADER_SIZE {
            return Err(WalError::ShortInput {
                need: WAL_HEADER_SIZE,
                have: buf.len(),
            });
        }

        let magic = be_u32(buf, 0);
        let order = ByteOrder::from_magic(magic)?;

        let stored = Checksum {
            s1: be_u32(buf, 24),
            s2: be_u32(buf, 28),
        };
        let computed = checksum(order, Checksum::ZERO, &buf[..24]);
        if stored != computed {
            return Err(WalError::BadHeaderChecksum {
                stored_s1: stored.s1,
                stored_s2: stored.s2,
                computed_s1: computed.s1,
                computed_s2: computed.s2,
            });
        }

        Ok(Self {
            magic,
            format_version: be_u32(buf, 4),
            page_size: be_u32(buf, 8),
            checkpoint_seq: be_u32(buf, 12),
            salts: Salts {
                salt1: be_u32(buf, 16),
                salt2: be_u32(buf, 20),
            },
            checksum: stored,
        })
    }

    /// Returns the checksum byte order selected by the header magic.
    #[must_use]
    pub fn byte_order(&self) -> ByteOrder {
        if self.magic == WAL_MAGIC_BIG_ENDIAN {
            ByteOrder::Big
        } else {
            ByteOrder::Little
        }
    }

    /// Encodes the header back to its exact 32-byte on-disk form.
    ///
    /// The stored checksum field is ignored; the checksum is recomputed from
    /// the first 24 encoded bytes so the output always self-validates.
    #[must_use]
    pub fn encode(&self) -> [u8; WAL_HEADER_SIZE] {
        let mut buf = [0u8; WAL_HEADER_SIZE];
        buf[0..4].copy_from_slice(&self.magic.to_be_bytes());
        buf[4..8].copy_from_slice(&self.format_version.to_be_bytes());
        buf[8..12].copy_from_slice(&self.page_size.to_be_bytes());
        buf[12..16].copy_from_slice(&self.checkpoint_seq.to_be_bytes());
        buf[16..20].copy_from_slice(&self.salts.salt1.to_be_bytes());
        buf[20..24].copy_from_slice(&self.salts.salt2.to_be_bytes());

        let sum = checksum(self.byte_order(), Checksum::ZERO, &buf[..24]);
        buf[24..28].copy_from_slice(&sum.s1.to_be_bytes());
        buf[28..32].copy_from_slice(&sum.s2.to_be_bytes());
        buf
    }
}

/// Reads the two salts from raw header bytes without full validation.
///
/// # Errors
///
/// Returns [`WalError::ShortInput`] if fewer than 24 bytes are given.
pub fn header_salts(buf: &[u8]) -> WalResult<Salts> {
    if buf.len() < 24 {
        return Err(WalError::ShortInput {
            need: 24,
            have: buf.len(),
        });
    }
    Ok(Salts {
        salt1: be_u32(buf, 16),
        salt2: be_u32(buf, 20),
    })
}

pub(crate) fn be_u32(buf: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]])
}
