//! WAL file naming and header layout.
//!
//! Each WAL file starts with a 16-byte header:
//! - magic: u32 (0x57415631)
//! - version: u32
//! - starting_epoch: u64 (first epoch that may appear in this file)
//!
//! Files are named `wal-<seq:010>.log` and appended in sequence order.

use bytes::{Buf, BufMut, BytesMut};
use std::path::{Path, PathBuf};

pub const WAL_MAGIC: u32 = 0x5741_5631;
pub const WAL_VERSION: u32 = 1;
pub const FILE_HEADER_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    pub version: u32,
    pub starting_epoch: u64,
}

impl FileHeader {
    pub fn new(starting_epoch: u64) -> Self {
        Self {
            version: WAL_VERSION,
            starting_epoch,
        }
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u32_le(WAL_MAGIC);
        buf.put_u32_le(self.version);
        buf.put_u64_le(self.starting_epoch);
    }

    /// Parses a header from the front of `data`, or `None` if the bytes do
    /// not form a valid header.
    pub fn decode(data: &[u8]) -> Option<Self> {
        if data.len() < FILE_HEADER_SIZE {
            return None;
        }
        let mut cursor = data;
        if cursor.get_u32_le() != WAL_MAGIC {
            return None;
        }
        let version = cursor.get_u32_le();
        let starting_epoch = cursor.get_u64_le();
        Some(Self {
            version,
            starting_epoch,
        })
    }
}

/// Path of the WAL file with the given sequence number.
pub fn wal_file_path(dir: &Path, seq: u64) -> PathBuf {
    dir.join(format!("wal-{:010}.log", seq))
}

/// Extracts the sequence number from a WAL file name, if it is one.
pub fn parse_wal_seq(name: &str) -> Option<u64> {
    name.strip_prefix("wal-")?
        .strip_suffix(".log")?
        .parse::<u64>()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_roundtrip() {
        let header = FileHeader::new(1234);
        let mut buf = BytesMut::new();
        header.encode_into(&mut buf);
        assert_eq!(buf.len(), FILE_HEADER_SIZE);
        assert_eq!(FileHeader::decode(&buf), Some(header));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = BytesMut::new();
        FileHeader::new(1).encode_into(&mut buf);
        buf[0] ^= 0xFF;
        assert_eq!(FileHeader::decode(&buf), None);
    }

    #[test]
    fn test_file_name_roundtrip() {
        let path = wal_file_path(Path::new("/tmp/wal"), 42);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert_eq!(name, "wal-0000000042.log");
        assert_eq!(parse_wal_seq(name), Some(42));
        assert_eq!(parse_wal_seq("wal-abc.log"), None);
        assert_eq!(parse_wal_seq("segment-0000000001.log"), None);
    }
}
