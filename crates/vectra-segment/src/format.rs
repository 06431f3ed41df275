//! Segment file format constants and layout.
//!
//! File layout:
//! ```text
//! [Header] [Records] [ID Roster] [Footer]
//! ```
//!
//! Header (16 bytes):
//! - magic: u32 (0x56534547 "VSEG")
//! - version: u32
//! - dim: u32 (vector dimension; every record carries exactly dim floats)
//! - reserved: u32
//!
//! Footer (last 64 bytes):
//! - roster_offset: u64
//! - roster_size: u64
//! - record_count: u64
//! - tombstone_count: u64
//! - reserved: 20 bytes
//! - magic: u64 (0x4745535341525456 "VTRASSEG")
//! - crc32c: u32 (over the first 60 bytes)
//!
//! The roster is a fixed-width table of one entry per record, enough to
//! rebuild the latest-by-id directory and to seek straight to any record.

use crate::error::{Result, SegmentError};
use bytes::{Buf, BufMut, BytesMut};

/// Header magic "VSEG".
pub const SEGMENT_MAGIC: u32 = 0x5653_4547;

/// Footer magic.
pub const FOOTER_MAGIC: u64 = 0x4745_5353_4152_5456;

pub const SEGMENT_VERSION: u32 = 1;

pub const HEADER_SIZE: usize = 16;

pub const FOOTER_SIZE: usize = 64;

/// Writer flushes accumulated bytes once a chunk reaches this size.
pub const WRITE_CHUNK_SIZE: usize = 1024 * 1024;

/// Bytes per roster entry: id_hash + epoch + offset + local_id + tombstone.
pub const ROSTER_ENTRY_SIZE: usize = 8 + 8 + 8 + 4 + 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub version: u32,
    pub dim: u32,
}

impl Header {
    pub fn new(dim: u32) -> Self {
        Self {
            version: SEGMENT_VERSION,
            dim,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(SEGMENT_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u32_le(self.dim);
        buf.put_u32_le(0);
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < HEADER_SIZE {
            return Err(SegmentError::InvalidFormat("file shorter than header".into()));
        }
        let mut cursor = data;
        let magic = cursor.get_u32_le();
        if magic != SEGMENT_MAGIC {
            return Err(SegmentError::InvalidFormat(format!(
                "invalid header magic: {:#x}",
                magic
            )));
        }
        let version = cursor.get_u32_le();
        let dim = cursor.get_u32_le();
        Ok(Self { version, dim })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footer {
    pub roster_offset: u64,
    pub roster_size: u64,
    pub record_count: u64,
    pub tombstone_count: u64,
}

impl Footer {
    pub fn encode(&self) -> [u8; FOOTER_SIZE] {
        let mut buf = [0u8; FOOTER_SIZE];
        buf[0..8].copy_from_slice(&self.roster_offset.to_le_bytes());
        buf[8..16].copy_from_slice(&self.roster_size.to_le_bytes());
        buf[16..24].copy_from_slice(&self.record_count.to_le_bytes());
        buf[24..32].copy_from_slice(&self.tombstone_count.to_le_bytes());
        // 32..52: reserved
        buf[52..60].copy_from_slice(&FOOTER_MAGIC.to_le_bytes());
        let crc = crc32c::crc32c(&buf[0..60]);
        buf[60..64].copy_from_slice(&crc.to_le_bytes());
        buf
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() != FOOTER_SIZE {
            return Err(SegmentError::InvalidFormat("footer must be 64 bytes".into()));
        }

        let expected = u32::from_le_bytes([buf[60], buf[61], buf[62], buf[63]]);
        let actual = crc32c::crc32c(&buf[0..60]);
        if expected != actual {
            return Err(SegmentError::CrcMismatch { expected, actual });
        }

        let magic = u64::from_le_bytes(buf[52..60].try_into().unwrap());
        if magic != FOOTER_MAGIC {
            return Err(SegmentError::InvalidFormat(format!(
                "invalid footer magic: {:#x}",
                magic
            )));
        }

        Ok(Self {
            roster_offset: u64::from_le_bytes(buf[0..8].try_into().unwrap()),
            roster_size: u64::from_le_bytes(buf[8..16].try_into().unwrap()),
            record_count: u64::from_le_bytes(buf[16..24].try_into().unwrap()),
            tombstone_count: u64::from_le_bytes(buf[24..32].try_into().unwrap()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = Header::new(768);
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), HEADER_SIZE);
        assert_eq!(Header::decode(&buf).unwrap(), header);
    }

    #[test]
    fn test_footer_roundtrip() {
        let footer = Footer {
            roster_offset: 4096,
            roster_size: 290,
            record_count: 10,
            tombstone_count: 2,
        };
        let encoded = footer.encode();
        assert_eq!(Footer::decode(&encoded).unwrap(), footer);
    }

    #[test]
    fn test_footer_crc_detects_corruption() {
        let footer = Footer {
            roster_offset: 128,
            roster_size: 29,
            record_count: 1,
            tombstone_count: 0,
        };
        let mut encoded = footer.encode();
        encoded[3] ^= 0xFF;
        assert!(matches!(
            Footer::decode(&encoded),
            Err(SegmentError::CrcMismatch { .. })
        ));
    }
}
