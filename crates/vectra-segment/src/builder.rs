//! Segment builder: streams records into an immutable segment file.
//!
//! Records are buffered and written in 1 MiB chunks. `finish()` writes the
//! roster and footer, fsyncs, and returns the segment metadata. A segment is
//! never visible to readers until the caller has committed its descriptor to
//! the manifest, so a torn build only leaves an orphan file behind.

use crate::error::{Result, SegmentError};
use crate::format::{Footer, Header, WRITE_CHUNK_SIZE};
use crate::record::{RosterEntry, SegmentRecord};
use bytes::BytesMut;
use std::path::PathBuf;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

/// Metadata describing a finished segment file.
#[derive(Debug, Clone)]
pub struct SegmentMeta {
    pub file_size: u64,
    pub record_count: u64,
    pub tombstone_count: u64,
    pub min_id_hash: u64,
    pub max_id_hash: u64,
    pub min_epoch: u64,
    pub max_epoch: u64,
}

impl SegmentMeta {
    pub fn tombstone_ratio(&self) -> f32 {
        if self.record_count == 0 {
            0.0
        } else {
            self.tombstone_count as f32 / self.record_count as f32
        }
    }
}

pub struct SegmentBuilder {
    file: File,
    path: PathBuf,
    dim: u32,
    buf: BytesMut,
    bytes_written: u64,
    roster: Vec<RosterEntry>,
    tombstone_count: u64,
    min_id_hash: u64,
    max_id_hash: u64,
    min_epoch: u64,
    max_epoch: u64,
}

impl SegmentBuilder {
    /// Creates the segment file and writes its header.
    pub async fn create(path: PathBuf, dim: u32) -> Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;

        let mut buf = BytesMut::new();
        Header::new(dim).encode_into(&mut buf);

        Ok(Self {
            file,
            path,
            dim,
            buf,
            // Header bytes sit in `buf` until the first chunk flush.
            bytes_written: 0,
            roster: Vec::new(),
            tombstone_count: 0,
            min_id_hash: u64::MAX,
            max_id_hash: 0,
            min_epoch: u64::MAX,
            max_epoch: 0,
        })
    }

    /// Appends one record. Live records must match the segment dimension;
    /// tombstones carry no vector.
    pub async fn add(&mut self, record: &SegmentRecord) -> Result<()> {
        if !record.tombstone && record.vector.len() as u32 != self.dim {
            return Err(SegmentError::DimensionMismatch {
                expected: self.dim,
                actual: record.vector.len() as u32,
            });
        }

        let local_id = self.roster.len() as u32;
        let record_offset = self.current_offset();
        record.encode_into(&mut self.buf);

        self.roster.push(RosterEntry {
            id_hash: record.id_hash,
            epoch: record.epoch,
            offset: record_offset,
            local_id,
            tombstone: record.tombstone,
        });

        if record.tombstone {
            self.tombstone_count += 1;
        }
        self.min_id_hash = self.min_id_hash.min(record.id_hash);
        self.max_id_hash = self.max_id_hash.max(record.id_hash);
        self.min_epoch = self.min_epoch.min(record.epoch);
        self.max_epoch = self.max_epoch.max(record.epoch);

        if self.buf.len() >= WRITE_CHUNK_SIZE {
            self.flush_chunk().await?;
        }
        Ok(())
    }

    fn current_offset(&self) -> u64 {
        self.bytes_written + self.buf.len() as u64
    }

    async fn flush_chunk(&mut self) -> Result<()> {
        if self.buf.is_empty() {
            return Ok(());
        }
        let chunk = self.buf.split().freeze();
        self.file.write_all(&chunk).await?;
        self.bytes_written += chunk.len() as u64;
        Ok(())
    }

    /// Writes the roster and footer, fsyncs, and returns the metadata.
    pub async fn finish(mut self) -> Result<SegmentMeta> {
        if self.roster.is_empty() {
            return Err(SegmentError::Empty);
        }
        self.flush_chunk().await?;

        let roster_offset = self.bytes_written;
        let mut roster_buf = BytesMut::new();
        for entry in &self.roster {
            entry.encode_into(&mut roster_buf);
        }
        let roster_size = roster_buf.len() as u64;
        self.file.write_all(&roster_buf).await?;
        self.bytes_written += roster_size;

        let footer = Footer {
            roster_offset,
            roster_size,
            record_count: self.roster.len() as u64,
            tombstone_count: self.tombstone_count,
        };
        self.file.write_all(&footer.encode()).await?;
        self.bytes_written += crate::format::FOOTER_SIZE as u64;

        self.file.sync_all().await?;

        tracing::debug!(
            path = %self.path.display(),
            records = self.roster.len(),
            bytes = self.bytes_written,
            "segment finished"
        );

        Ok(SegmentMeta {
            file_size: self.bytes_written,
            record_count: self.roster.len() as u64,
            tombstone_count: self.tombstone_count,
            min_id_hash: self.min_id_hash,
            max_id_hash: self.max_id_hash,
            min_epoch: self.min_epoch,
            max_epoch: self.max_epoch,
        })
    }

    /// Number of records added so far.
    pub fn len(&self) -> usize {
        self.roster.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roster.is_empty()
    }
}
