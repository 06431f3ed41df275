//! Startup recovery: manifest reconciliation, directory rebuild, WAL replay.
//!
//! Order matters: the manifest names the committed segment set, the
//! directory is rebuilt from those segments, and only WAL records beyond the
//! manifest's high-water epoch are replayed into the buffer. Records at or
//! below the high water already live in a committed segment; replaying them
//! would be a no-op in the directory anyway because upserts are epoch-gated.

use crate::buffer::MessageBuffer;
use crate::betree::FlushEngine;
use crate::config::EngineConfig;
use crate::error::{EngineError, Result};
use crate::latest::LatestById;
use crate::manifest::ManifestLog;
use crate::types::{Message, Operation, VectorLocation};
use std::time::Duration;
use vectra_segment::SegmentReader;
use vectra_wal::Wal;

/// How long a replayed record may wait on backpressure before recovery
/// fails. Nothing flushes during replay, so this should only trip when the
/// WAL tail is larger than the configured buffer.
const REPLAY_APPEND_DEADLINE: Duration = Duration::from_secs(60);

/// Summary of a completed recovery.
#[derive(Debug, Clone, Default)]
pub struct RecoveryReport {
    /// Segments live in the manifest after reconciliation.
    pub manifest_segments: usize,
    /// Segments dropped because their files were missing or unreadable.
    pub quarantined_segments: usize,
    /// Manifest high-water epoch at startup.
    pub high_water_epoch: u64,
    /// WAL records re-admitted into the buffer.
    pub wal_records_replayed: u64,
    /// WAL-level recovery details (corruption, truncated bytes).
    pub wal: vectra_wal::RecoveryInfo,
}

/// Verifies manifest segments, rebuilds the directory, and replays the WAL
/// tail into the buffer.
pub(crate) async fn run(
    config: &EngineConfig,
    manifest: &ManifestLog,
    latest: &LatestById,
    buffer: &MessageBuffer,
    flush_engine: &FlushEngine,
    wal: &Wal,
    wal_info: vectra_wal::RecoveryInfo,
) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        wal: wal_info,
        ..Default::default()
    };

    // 1. Reconcile the manifest against the segment files on disk.
    let snapshot = manifest.current();
    let mut quarantined = Vec::new();
    let mut live = Vec::new();
    for descriptor in &snapshot.segments {
        match SegmentReader::verify(&descriptor.file_path).await {
            Ok(()) => live.push(descriptor.clone()),
            Err(e) => {
                tracing::warn!(
                    segment = %descriptor.segment_id,
                    path = %descriptor.file_path.display(),
                    error = %e,
                    "quarantining unreadable segment"
                );
                quarantined.push(descriptor.segment_id.clone());
            }
        }
    }
    if !quarantined.is_empty() {
        report.quarantined_segments = quarantined.len();
        manifest
            .commit(Vec::new(), quarantined)
            .map_err(|e| EngineError::Manifest(format!("quarantine commit failed: {}", e)))?;
    }
    report.manifest_segments = live.len();
    report.high_water_epoch = manifest.high_water();

    // 2. Rebuild the directory from each live segment's records. Epoch-gated
    // upserts keep the greatest epoch when an id spans segments.
    let mut directory_entries = Vec::new();
    for descriptor in &live {
        let reader = SegmentReader::open(&descriptor.file_path).await?;
        for (local_id, record) in reader.iter().enumerate() {
            let record = record?;
            let location = VectorLocation {
                kind: if record.tombstone {
                    crate::types::LocationKind::Deleted
                } else {
                    crate::types::LocationKind::Segment
                },
                segment_id: (!record.tombstone).then(|| descriptor.segment_id.clone()),
                local_id: local_id as u32,
                timestamp: record.updated_at,
                epoch: record.epoch,
                tombstone: record.tombstone,
            };
            directory_entries.push((record.id, record.id_hash, location));
        }
    }
    latest.rebuild(directory_entries);

    // 3. Replay WAL records beyond the manifest high water as fresh appends,
    // re-running dedup, backpressure, and directory updates.
    let records = wal.replay_from(report.high_water_epoch).await?;
    for record in records {
        let op = Operation::from_wire(record.op).ok_or_else(|| {
            EngineError::Corruption(format!(
                "WAL record {} carries unknown op {}",
                record.epoch, record.op
            ))
        })?;
        let entry: crate::types::VectorEntry =
            bincode::deserialize(&record.payload).map_err(|e| {
                EngineError::Corruption(format!(
                    "WAL record {} payload undecodable: {}",
                    record.epoch, e
                ))
            })?;

        let timestamp = entry.updated_at;
        let msg = Message {
            op,
            entry,
            epoch: record.epoch,
            timestamp,
        };
        let id = msg.entry.id.clone();
        let id_hash = msg.entry.id_hash;

        let buffered = buffer.append(msg, REPLAY_APPEND_DEADLINE).await?;
        if op.is_delete() {
            latest.mark_deleted(&id, id_hash, timestamp, record.epoch);
        } else {
            latest.upsert(
                &id,
                id_hash,
                VectorLocation::buffer(record.epoch, timestamp, false),
            );
        }
        // Keep leaf accounting truthful; triggers fire on later ticks.
        let _ = flush_engine.note_append(id_hash, buffered.size);
        report.wal_records_replayed += 1;
    }

    tracing::info!(
        segments = report.manifest_segments,
        quarantined = report.quarantined_segments,
        high_water = report.high_water_epoch,
        replayed = report.wal_records_replayed,
        lost_tail = report.wal.corruption_detected,
        dir = %config.data_dir.display(),
        "recovery complete"
    );

    Ok(report)
}
