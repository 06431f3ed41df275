//! vectra-engine: the vector write path and near-real-time read surface.
//!
//! Implements the storage engine behind a high-throughput vector store:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Write-Ahead Log (vectra-wal)                               │
//! │  - Serial epoch assignment, group commit, rotation          │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ durable
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Message Buffer (16 shards)                                 │
//! │  - FIFO + dedup per shard, byte-capped with backpressure    │
//! │  - Read-your-writes query scans                             │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ B-epsilon flush (per-leaf batches)
//!                ↓
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Delta Segments + MANIFEST                                  │
//! │  - Immutable files, atomic manifest commit                  │
//! │  - Latest-by-id directory retargeted after commit           │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Epochs assigned at WAL append time form the single total order; every
//! downstream structure (buffer dedup, directory, segments) resolves
//! conflicts by epoch, which is what makes crash replay idempotent.
//!
//! # Example
//!
//! ```no_run
//! use vectra_engine::{EngineConfig, VectraEngine, VectorEntry};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = EngineConfig::default();
//!     config.collection.dim = 4;
//!     let (engine, report) = VectraEngine::open(config).await?;
//!     println!("recovered to epoch {}", report.high_water_epoch);
//!
//!     let entry = VectorEntry::new("v1", vec![0.1, 0.2, 0.3, 0.4], "acme", "default");
//!     let epoch = engine.upsert(entry).await?;
//!     println!("durable at epoch {}", epoch);
//!
//!     engine.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod betree;
pub mod buffer;
pub mod config;
pub mod error;
pub mod latest;
pub mod manifest;
pub mod recovery;
pub mod segments;
pub mod types;

pub use buffer::{BufferStats, MessageBuffer};
pub use betree::{FlushEngine, FlushStats};
pub use config::{BtreeConfig, BufferConfig, CollectionConfig, EngineConfig, SegmentConfig};
pub use error::{EngineError, Result};
pub use latest::{LatestById, LatestStats};
pub use manifest::{ManifestLog, ManifestSnapshot};
pub use recovery::RecoveryReport;
pub use segments::{
    FsSegmentWriter, IndexBuilder, NoopIndexBuilder, SegmentWriteRequest, SegmentWriteResult,
    SegmentWriter,
};
pub use types::{
    hash_id, Clock, Epoch, LocationKind, Message, Operation, SegmentDescriptor, SystemClock,
    VectorEntry, VectorLocation,
};

use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use vectra_vector::{CentroidAssigner, UniformCentroidAssigner};
use vectra_wal::{Wal, WalConfig};

/// Injected capability interfaces. `default()` wires the filesystem segment
/// writer, a no-op index builder, uniform centroid spreading, and the
/// system clock.
pub struct EngineCollaborators {
    pub segment_writer: Arc<dyn SegmentWriter>,
    pub index_builder: Arc<dyn IndexBuilder>,
    pub centroid_assigner: Arc<dyn CentroidAssigner>,
    pub clock: Arc<dyn Clock>,
}

impl Default for EngineCollaborators {
    fn default() -> Self {
        let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
        Self {
            segment_writer: Arc::new(FsSegmentWriter::new(clock.clone())),
            index_builder: Arc::new(NoopIndexBuilder),
            centroid_assigner: Arc::new(UniformCentroidAssigner::new(1024)),
            clock,
        }
    }
}

/// Engine-wide statistics snapshot.
#[derive(Debug, Clone)]
pub struct EngineStats {
    pub buffer: BufferStats,
    pub latest: LatestStats,
    pub flush: FlushStats,
    pub live_segments: usize,
    pub high_water_epoch: Epoch,
    pub durable_epoch: Epoch,
    pub read_only: bool,
}

/// The storage engine: one instance per collection directory.
///
/// All operations take `&self`; internal structures carry their own locks.
/// A durability failure latches the engine read-only until it is reopened.
pub struct VectraEngine {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    wal: Arc<Wal>,
    buffer: Arc<MessageBuffer>,
    latest: Arc<LatestById>,
    manifest: Arc<ManifestLog>,
    flush_engine: Arc<FlushEngine>,
    read_only: AtomicBool,
    shutdown: Arc<Notify>,
    flush_task: std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl VectraEngine {
    /// Opens the engine with default collaborators, running full recovery.
    pub async fn open(config: EngineConfig) -> Result<(Self, RecoveryReport)> {
        Self::open_with(config, EngineCollaborators::default()).await
    }

    /// Opens the engine with injected collaborators.
    pub async fn open_with(
        config: EngineConfig,
        collaborators: EngineCollaborators,
    ) -> Result<(Self, RecoveryReport)> {
        config.validate()?;
        tokio::fs::create_dir_all(config.segment_dir()).await?;

        let manifest = Arc::new(ManifestLog::open(config.manifest_dir())?);
        let latest = Arc::new(LatestById::new());
        let buffer = Arc::new(MessageBuffer::new(config.buffer.clone()));

        let wal_config = WalConfig {
            dir: config.wal_dir(),
            group_commit_ms: config.wal.group_commit_ms,
            fsync_every_fences: config.wal.fsync_every_fences,
            rotate_bytes: config.wal.rotate_bytes,
            max_files: config.wal.max_files,
        };
        let (wal, wal_info) = Wal::open(wal_config).await?;
        let wal = Arc::new(wal);

        let flush_engine = Arc::new(FlushEngine::new(
            config.btree.clone(),
            &config.segment,
            config.buffer.flush_threshold_bytes,
            config.collection.dim,
            config.segment_dir(),
            buffer.clone(),
            latest.clone(),
            manifest.clone(),
            collaborators.segment_writer,
            collaborators.index_builder,
            collaborators.centroid_assigner,
        ));

        let report = recovery::run(
            &config,
            &manifest,
            &latest,
            &buffer,
            &flush_engine,
            &wal,
            wal_info,
        )
        .await?;

        let shutdown = Arc::new(Notify::new());
        let flush_task = tokio::spawn(flush_loop(
            flush_engine.clone(),
            shutdown.clone(),
            config.btree.flush_interval_ms,
        ));

        Ok((
            Self {
                config,
                clock: collaborators.clock,
                wal,
                buffer,
                latest,
                manifest,
                flush_engine,
                read_only: AtomicBool::new(false),
                shutdown,
                flush_task: std::sync::Mutex::new(Some(flush_task)),
            },
            report,
        ))
    }

    /// Inserts a new vector. Returns the assigned epoch once durable.
    pub async fn insert(&self, entry: VectorEntry) -> Result<Epoch> {
        self.write(Operation::Insert, entry).await
    }

    /// Inserts or replaces a vector. Returns the assigned epoch once durable.
    pub async fn upsert(&self, entry: VectorEntry) -> Result<Epoch> {
        self.write(Operation::Upsert, entry).await
    }

    /// Deletes a vector by id (writes a tombstone).
    pub async fn delete(&self, id: &str) -> Result<Epoch> {
        if id.is_empty() {
            return Err(EngineError::Validation("id must not be empty".to_string()));
        }
        let entry = VectorEntry::tombstone(id, self.clock.now_micros());
        self.write(Operation::Delete, entry).await
    }

    async fn write(&self, op: Operation, mut entry: VectorEntry) -> Result<Epoch> {
        if self.read_only.load(Ordering::Acquire) {
            return Err(EngineError::ReadOnly);
        }
        self.validate(op, &entry)?;

        let now = self.clock.now_micros();
        if !op.is_delete() {
            if entry.created_at == 0 {
                entry.created_at = now;
            }
            entry.updated_at = now;
        }

        // Durability first: nothing mutates until the WAL accepts the record.
        let payload = bincode::serialize(&entry)
            .map_err(|e| EngineError::Validation(format!("entry not serializable: {}", e)))?;
        let epoch = match self.wal.append(op.wire_code(), Bytes::from(payload)).await {
            Ok(epoch) => epoch,
            Err(e) => {
                tracing::error!(error = %e, "WAL append failed; latching engine read-only");
                self.read_only.store(true, Ordering::Release);
                return Err(e.into());
            }
        };

        let id = entry.id.clone();
        let id_hash = entry.id_hash;
        let msg = Message {
            op,
            entry,
            epoch,
            timestamp: now,
        };

        let deadline = Duration::from_millis(
            self.config.buffer.wait_cycle_ms * self.config.buffer.max_wait_cycles as u64,
        );
        // On BufferFull the record stays durable in the WAL and will be
        // re-admitted by recovery; the caller may simply retry.
        let buffered = self.buffer.append(msg, deadline).await?;

        if op.is_delete() {
            self.latest.mark_deleted(&id, id_hash, now, epoch);
        } else {
            self.latest
                .upsert(&id, id_hash, VectorLocation::buffer(epoch, now, false));
        }

        if let Some(leaf) = self.flush_engine.note_append(id_hash, buffered.size) {
            let flush_engine = self.flush_engine.clone();
            tokio::spawn(async move {
                if let Err(e) = flush_engine.flush_leaf(leaf, false).await {
                    tracing::warn!(leaf, error = %e, "triggered flush failed");
                }
            });
        }
        Ok(epoch)
    }

    fn validate(&self, op: Operation, entry: &VectorEntry) -> Result<()> {
        if entry.id.is_empty() {
            return Err(EngineError::Validation("id must not be empty".to_string()));
        }
        if entry.tags.len() > self.config.collection.max_tags_per_vector {
            return Err(EngineError::Validation(format!(
                "too many tags: {} (max {})",
                entry.tags.len(),
                self.config.collection.max_tags_per_vector
            )));
        }
        if !op.is_delete() {
            let dim = self.config.collection.dim as usize;
            if entry.vector.len() != dim {
                return Err(EngineError::Validation(format!(
                    "dimension mismatch: expected {}, got {}",
                    dim,
                    entry.vector.len()
                )));
            }
            if entry.vector.iter().any(|v| !v.is_finite()) {
                return Err(EngineError::Validation(
                    "vector contains non-finite values".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Read-your-writes candidates from the buffer, filtered by tenant,
    /// namespace, and tag-ANY. Scoring is the query executor's concern.
    pub fn query_buffer(
        &self,
        query: &[f32],
        tenant: &str,
        namespace: &str,
        tags: &[u32],
        max: usize,
    ) -> Result<Vec<VectorEntry>> {
        let dim = self.config.collection.dim as usize;
        if query.len() != dim {
            return Err(EngineError::Validation(format!(
                "dimension mismatch: expected {}, got {}",
                dim,
                query.len()
            )));
        }
        Ok(self.buffer.scan_for_query(tenant, namespace, tags, max))
    }

    /// Latest location for an id, across buffer and segments.
    pub fn lookup(&self, id: &str) -> Option<VectorLocation> {
        self.latest.get_latest(id)
    }

    /// True iff the id is present and not tombstoned.
    pub fn exists(&self, id: &str) -> bool {
        self.latest.exists(id)
    }

    /// Flushes buffered messages into segments. With `force` every leaf is
    /// drained; otherwise the normal trigger rules run once.
    pub async fn flush(&self, force: bool) -> Result<()> {
        if force {
            self.flush_engine.flush_all(true).await
        } else {
            self.flush_engine.tick().await
        }
    }

    /// Force-flushes, snapshots the manifest, and lets the WAL reclaim
    /// files wholly at or below the new high water. Returns the manifest
    /// version.
    pub async fn checkpoint(&self) -> Result<u64> {
        self.flush_engine.flush_all(true).await?;
        let version = self
            .manifest
            .checkpoint()
            .map_err(|e| EngineError::Manifest(format!("checkpoint failed: {}", e)))?;
        self.wal.truncate_below(self.manifest.high_water()).await?;
        Ok(version)
    }

    pub fn stats(&self) -> EngineStats {
        let snapshot = self.manifest.current();
        EngineStats {
            buffer: self.buffer.stats(),
            latest: self.latest.stats(),
            flush: self.flush_engine.stats(),
            live_segments: snapshot.segments.len(),
            high_water_epoch: snapshot.high_water_epoch,
            durable_epoch: self.wal.durable_epoch(),
            read_only: self.read_only.load(Ordering::Acquire),
        }
    }

    /// Current manifest snapshot (live segment set).
    pub fn manifest_snapshot(&self) -> Arc<ManifestSnapshot> {
        self.manifest.current()
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Stops background flushing and closes the WAL cleanly.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.notify_waiters();
        let task = self.flush_task.lock().unwrap().take();
        if let Some(task) = task {
            task.abort();
            let _ = task.await;
        }
        self.wal.close().await?;
        Ok(())
    }
}

impl Drop for VectraEngine {
    fn drop(&mut self) {
        if let Some(task) = self.flush_task.lock().unwrap().take() {
            task.abort();
        }
    }
}

async fn flush_loop(flush_engine: Arc<FlushEngine>, shutdown: Arc<Notify>, interval_ms: u64) {
    let mut interval = tokio::time::interval(Duration::from_millis(interval_ms.max(1)));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = shutdown.notified() => return,
        }
        if let Err(e) = flush_engine.tick().await {
            tracing::warn!(error = %e, "background flush tick failed");
        }
    }
}
