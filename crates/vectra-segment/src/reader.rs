//! Segment reader: footer verification, roster access, record iteration.
//!
//! Delta segments are bounded by the flush batch size, so the reader loads
//! the file into memory on open and serves roster lookups and record reads
//! from the resident bytes.

use crate::error::{Result, SegmentError};
use crate::format::{Footer, Header, FOOTER_SIZE, HEADER_SIZE, ROSTER_ENTRY_SIZE};
use crate::record::{RosterEntry, SegmentRecord};
use bytes::Bytes;
use std::path::Path;

pub struct SegmentReader {
    data: Bytes,
    header: Header,
    footer: Footer,
}

impl SegmentReader {
    /// Opens a segment file, verifying header magic and footer checksum.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let data = Bytes::from(tokio::fs::read(path.as_ref()).await?);
        Self::from_bytes(data)
    }

    pub fn from_bytes(data: Bytes) -> Result<Self> {
        if data.len() < HEADER_SIZE + FOOTER_SIZE {
            return Err(SegmentError::InvalidFormat(
                "file shorter than header and footer".into(),
            ));
        }
        let header = Header::decode(&data)?;
        let footer = Footer::decode(&data[data.len() - FOOTER_SIZE..])?;

        let roster_end = footer.roster_offset + footer.roster_size;
        if roster_end > (data.len() - FOOTER_SIZE) as u64
            || footer.roster_size != footer.record_count * ROSTER_ENTRY_SIZE as u64
        {
            return Err(SegmentError::InvalidFormat(
                "roster extent disagrees with footer".into(),
            ));
        }

        Ok(Self {
            data,
            header,
            footer,
        })
    }

    /// Verifies a segment file without retaining it. Used by manifest
    /// recovery to quarantine unreadable segments.
    pub async fn verify(path: impl AsRef<Path>) -> Result<()> {
        SegmentReader::open(path).await.map(|_| ())
    }

    pub fn dim(&self) -> u32 {
        self.header.dim
    }

    pub fn record_count(&self) -> u64 {
        self.footer.record_count
    }

    pub fn tombstone_count(&self) -> u64 {
        self.footer.tombstone_count
    }

    /// Reads the full ID roster.
    pub fn read_roster(&self) -> Result<Vec<RosterEntry>> {
        let start = self.footer.roster_offset as usize;
        let mut roster = Vec::with_capacity(self.footer.record_count as usize);
        for i in 0..self.footer.record_count as usize {
            let offset = start + i * ROSTER_ENTRY_SIZE;
            roster.push(RosterEntry::decode(&self.data[offset..])?);
        }
        Ok(roster)
    }

    /// Reads one record by its local id.
    pub fn read_record(&self, local_id: u32) -> Result<SegmentRecord> {
        if local_id as u64 >= self.footer.record_count {
            return Err(SegmentError::LocalIdOutOfRange(local_id));
        }
        let roster_offset =
            self.footer.roster_offset as usize + local_id as usize * ROSTER_ENTRY_SIZE;
        let entry = RosterEntry::decode(&self.data[roster_offset..])?;
        let (record, _) = SegmentRecord::decode(&self.data[entry.offset as usize..])?;
        Ok(record)
    }

    /// Iterates all records in file order.
    pub fn iter(&self) -> SegmentIter<'_> {
        SegmentIter {
            data: &self.data,
            offset: HEADER_SIZE,
            end: self.footer.roster_offset as usize,
        }
    }
}

pub struct SegmentIter<'a> {
    data: &'a [u8],
    offset: usize,
    end: usize,
}

impl<'a> Iterator for SegmentIter<'a> {
    type Item = Result<SegmentRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.end {
            return None;
        }
        match SegmentRecord::decode(&self.data[self.offset..self.end]) {
            Ok((record, consumed)) => {
                self.offset += consumed;
                Some(Ok(record))
            }
            Err(e) => {
                self.offset = self.end;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::builder::SegmentBuilder;
    use tempfile::TempDir;

    fn record(i: u64, tombstone: bool) -> SegmentRecord {
        SegmentRecord {
            id: format!("v{:04}", i),
            id_hash: i * 31 + 7,
            tenant: "acme".to_string(),
            tenant_hash: 1,
            namespace: "default".to_string(),
            namespace_hash: 2,
            tags: vec![i as u32 % 4],
            created_at: 1000 + i as i64,
            updated_at: 2000 + i as i64,
            epoch: i + 1,
            centroid_id: (i % 16) as u16,
            tombstone,
            vector: if tombstone {
                Vec::new()
            } else {
                vec![i as f32, 0.5, -0.5, 1.0]
            },
        }
    }

    async fn build_segment(dir: &TempDir, n: u64) -> std::path::PathBuf {
        let path = dir.path().join("seg-0001.vseg");
        let mut builder = SegmentBuilder::create(path.clone(), 4).await.unwrap();
        for i in 0..n {
            builder.add(&record(i, i % 5 == 4)).await.unwrap();
        }
        builder.finish().await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_build_and_read_back() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(&dir, 50).await;

        let reader = SegmentReader::open(&path).await.unwrap();
        assert_eq!(reader.dim(), 4);
        assert_eq!(reader.record_count(), 50);
        assert_eq!(reader.tombstone_count(), 10);

        let records: Vec<_> = reader.iter().map(|r| r.unwrap()).collect();
        assert_eq!(records.len(), 50);
        for (i, rec) in records.iter().enumerate() {
            assert_eq!(*rec, record(i as u64, i % 5 == 4));
        }
    }

    #[tokio::test]
    async fn test_roster_matches_records() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(&dir, 20).await;

        let reader = SegmentReader::open(&path).await.unwrap();
        let roster = reader.read_roster().unwrap();
        assert_eq!(roster.len(), 20);

        for entry in &roster {
            let rec = reader.read_record(entry.local_id).unwrap();
            assert_eq!(rec.id_hash, entry.id_hash);
            assert_eq!(rec.epoch, entry.epoch);
            assert_eq!(rec.tombstone, entry.tombstone);
        }
    }

    #[tokio::test]
    async fn test_local_id_out_of_range() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(&dir, 3).await;

        let reader = SegmentReader::open(&path).await.unwrap();
        assert!(matches!(
            reader.read_record(3),
            Err(SegmentError::LocalIdOutOfRange(3))
        ));
    }

    #[tokio::test]
    async fn test_corrupt_footer_rejected() {
        let dir = TempDir::new().unwrap();
        let path = build_segment(&dir, 5).await;

        let mut data = tokio::fs::read(&path).await.unwrap();
        let n = data.len();
        data[n - 10] ^= 0xFF;
        tokio::fs::write(&path, &data).await.unwrap();

        assert!(SegmentReader::verify(&path).await.is_err());
    }

    #[tokio::test]
    async fn test_dimension_mismatch_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-bad.vseg");
        let mut builder = SegmentBuilder::create(path, 8).await.unwrap();

        let mut rec = record(1, false);
        rec.vector = vec![1.0; 4];
        assert!(matches!(
            builder.add(&rec).await,
            Err(SegmentError::DimensionMismatch {
                expected: 8,
                actual: 4
            })
        ));
    }

    #[tokio::test]
    async fn test_empty_segment_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-empty.vseg");
        let builder = SegmentBuilder::create(path, 4).await.unwrap();
        assert!(matches!(builder.finish().await, Err(SegmentError::Empty)));
    }

    #[tokio::test]
    async fn test_chunked_write_large_segment() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("seg-large.vseg");
        let dim = 256;
        let mut builder = SegmentBuilder::create(path.clone(), dim).await.unwrap();

        // Enough vector data to cross several 1 MiB chunk boundaries.
        for i in 0..4000u64 {
            let mut rec = record(i, false);
            rec.vector = vec![i as f32; dim as usize];
            builder.add(&rec).await.unwrap();
        }
        let meta = builder.finish().await.unwrap();
        assert_eq!(meta.record_count, 4000);
        assert!(meta.file_size > 4 * 1024 * 1024);

        let reader = SegmentReader::open(&path).await.unwrap();
        let rec = reader.read_record(3999).unwrap();
        assert_eq!(rec.vector[0], 3999.0);
    }
}
