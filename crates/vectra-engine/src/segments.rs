//! Capability interfaces around segment materialization, plus the default
//! filesystem-backed implementations.
//!
//! The flush engine does not know how segment files or ANN structures are
//! laid out; it talks to a `SegmentWriter` that persists a batch and an
//! `IndexBuilder` that trains per-segment index structures. Both are
//! injected at engine construction.

use crate::error::{EngineError, Result};
use crate::types::{Clock, Message, Operation, SegmentDescriptor, SegmentId};
use async_trait::async_trait;
use std::path::PathBuf;
use std::sync::Arc;
use vectra_segment::{SegmentBuilder, SegmentReader, SegmentRecord};

/// A batch headed into one segment file.
pub struct SegmentWriteRequest {
    pub segment_id: SegmentId,
    pub path: PathBuf,
    pub dim: u32,
    /// Deduplicated records: at most one per id hash, greatest epoch.
    pub records: Vec<SegmentRecord>,
}

/// Outcome of a segment write: the descriptor plus the roster order used to
/// retarget the latest-by-id directory.
pub struct SegmentWriteResult {
    pub descriptor: SegmentDescriptor,
    /// `(id_hash, local_id)` pairs in roster order.
    pub roster: Vec<(u64, u32)>,
}

/// Persists immutable segment files.
#[async_trait]
pub trait SegmentWriter: Send + Sync {
    async fn write(&self, request: SegmentWriteRequest) -> Result<SegmentWriteResult>;
}

/// Trains per-segment ANN structures after a segment commits.
///
/// Failures are surfaced but non-fatal: a delta segment without its index is
/// still scannable.
#[async_trait]
pub trait IndexBuilder: Send + Sync {
    async fn build_delta(&self, descriptor: &SegmentDescriptor) -> Result<()>;
}

/// Default index builder: records the request and does nothing. Index
/// training is a separate subsystem.
pub struct NoopIndexBuilder;

#[async_trait]
impl IndexBuilder for NoopIndexBuilder {
    async fn build_delta(&self, descriptor: &SegmentDescriptor) -> Result<()> {
        tracing::trace!(segment = %descriptor.segment_id, "index build skipped (noop builder)");
        Ok(())
    }
}

/// Filesystem segment writer using the vectra-segment format.
pub struct FsSegmentWriter {
    clock: Arc<dyn Clock>,
}

impl FsSegmentWriter {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

#[async_trait]
impl SegmentWriter for FsSegmentWriter {
    async fn write(&self, request: SegmentWriteRequest) -> Result<SegmentWriteResult> {
        if request.records.is_empty() {
            return Err(EngineError::Validation(
                "segment write with no records".to_string(),
            ));
        }

        let mut builder = SegmentBuilder::create(request.path.clone(), request.dim).await?;
        let mut roster = Vec::with_capacity(request.records.len());
        for (local_id, record) in request.records.iter().enumerate() {
            builder.add(record).await?;
            roster.push((record.id_hash, local_id as u32));
        }
        let meta = builder.finish().await?;

        let descriptor = SegmentDescriptor {
            segment_id: request.segment_id,
            file_path: request.path,
            num_vectors: meta.record_count,
            min_id_hash: meta.min_id_hash,
            max_id_hash: meta.max_id_hash,
            min_epoch: meta.min_epoch,
            max_epoch: meta.max_epoch,
            tombstone_ratio: meta.tombstone_ratio(),
            created_at: self.clock.now_micros(),
            is_stable: false,
        };

        Ok(SegmentWriteResult { descriptor, roster })
    }
}

/// Converts a buffered message into its on-disk record form.
pub fn message_to_record(msg: &Message) -> SegmentRecord {
    let entry = &msg.entry;
    let tombstone = msg.op == Operation::Delete || entry.deleted;
    SegmentRecord {
        id: entry.id.clone(),
        id_hash: entry.id_hash,
        tenant: entry.tenant.clone(),
        tenant_hash: entry.tenant_hash,
        namespace: entry.namespace_id.clone(),
        namespace_hash: entry.namespace_hash,
        tags: entry.tags.clone(),
        created_at: entry.created_at,
        updated_at: entry.updated_at,
        epoch: msg.epoch,
        centroid_id: entry.centroid_id,
        tombstone,
        vector: if tombstone {
            Vec::new()
        } else {
            entry.vector.clone()
        },
    }
}

/// Verifies a committed segment file is readable (footer magic + CRC).
pub async fn verify_segment(descriptor: &SegmentDescriptor) -> Result<()> {
    SegmentReader::verify(&descriptor.file_path)
        .await
        .map_err(EngineError::from)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SystemClock, VectorEntry};
    use tempfile::TempDir;

    fn request(dir: &TempDir, n: u64) -> SegmentWriteRequest {
        let records = (0..n)
            .map(|i| {
                let mut entry = VectorEntry::new(format!("v{}", i), vec![i as f32; 4], "t", "n");
                entry.updated_at = i as i64;
                message_to_record(&Message {
                    op: Operation::Upsert,
                    entry,
                    epoch: i + 1,
                    timestamp: i as i64,
                })
            })
            .collect();
        SegmentWriteRequest {
            segment_id: "seg-test".to_string(),
            path: dir.path().join("seg-test.vseg"),
            dim: 4,
            records,
        }
    }

    #[tokio::test]
    async fn test_fs_writer_produces_descriptor() {
        let dir = TempDir::new().unwrap();
        let writer = FsSegmentWriter::new(Arc::new(SystemClock::new()));
        let result = writer.write(request(&dir, 10)).await.unwrap();

        assert_eq!(result.descriptor.num_vectors, 10);
        assert_eq!(result.descriptor.min_epoch, 1);
        assert_eq!(result.descriptor.max_epoch, 10);
        assert!(!result.descriptor.is_stable);
        assert_eq!(result.roster.len(), 10);
        assert_eq!(result.roster[3].1, 3);

        verify_segment(&result.descriptor).await.unwrap();
    }

    #[tokio::test]
    async fn test_fs_writer_rejects_empty_batch() {
        let dir = TempDir::new().unwrap();
        let writer = FsSegmentWriter::new(Arc::new(SystemClock::new()));
        let mut req = request(&dir, 1);
        req.records.clear();
        assert!(writer.write(req).await.is_err());
    }

    #[tokio::test]
    async fn test_message_to_record_tombstone() {
        let entry = VectorEntry::tombstone("gone", 5);
        let record = message_to_record(&Message {
            op: Operation::Delete,
            entry,
            epoch: 9,
            timestamp: 5,
        });
        assert!(record.tombstone);
        assert!(record.vector.is_empty());
        assert_eq!(record.epoch, 9);
    }
}
