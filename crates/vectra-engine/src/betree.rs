//! B-epsilon flush engine: decides when and how buffered messages become
//! immutable delta segments.
//!
//! The tree is keyed by `id_hash`. Leaves partition the full 64-bit hash
//! space into `fanout` contiguous ranges and are the flush targets; per the
//! epsilon parameter each subtree devotes a slice of its capacity to message
//! buffering and moves messages toward leaves in large batches. Per-leaf
//! flush mutexes allow distinct leaves to flush concurrently while a leaf
//! never flushes against itself.
//!
//! A flush only becomes observable at manifest commit: slice → dedup →
//! centroid assignment → segment write → manifest commit → directory
//! retarget → buffer eviction. Failure anywhere before the commit leaves
//! the batch in the buffer for the next trigger.

use crate::buffer::{BufferedMessage, MessageBuffer};
use crate::config::{BtreeConfig, SegmentConfig};
use crate::error::Result;
use crate::latest::LatestById;
use crate::manifest::ManifestLog;
use crate::segments::{message_to_record, IndexBuilder, SegmentWriteRequest, SegmentWriter};
use crate::types::{SegmentDescriptor, VectorIdHash};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use vectra_vector::CentroidAssigner;

/// Transient segment-writer failures are retried this many times with
/// exponential backoff before the flush gives up until the next trigger.
const FLUSH_RETRY_BUDGET: u32 = 3;
const FLUSH_RETRY_BASE: Duration = Duration::from_millis(10);

/// Local epsilon never grows past this, keeping some pivot capacity.
const EPSILON_MAX: f32 = 0.9;

/// Flush-share statistics are meaningless until this many flushes happened.
const ADAPT_MIN_FLUSHES: u64 = 10;

/// Inclusive hash range owned by one leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LeafRange {
    pub start: VectorIdHash,
    pub end: VectorIdHash,
}

impl LeafRange {
    pub fn contains(&self, hash: VectorIdHash) -> bool {
        hash >= self.start && hash <= self.end
    }
}

/// Leaf index for a hash under `fanout` equal partitions.
pub fn leaf_for_hash(hash: VectorIdHash, fanout: usize) -> usize {
    ((hash as u128 * fanout as u128) >> 64) as usize
}

/// Inclusive range of the given leaf, consistent with `leaf_for_hash`.
pub fn leaf_range(leaf: usize, fanout: usize) -> LeafRange {
    let span = 1u128 << 64;
    let start_of = |i: usize| -> u128 { (i as u128 * span).div_ceil(fanout as u128) };
    let start = start_of(leaf) as u64;
    let end = if leaf + 1 == fanout {
        u64::MAX
    } else {
        (start_of(leaf + 1) - 1) as u64
    };
    LeafRange { start, end }
}

struct Leaf {
    range: LeafRange,
    pending_bytes: AtomicUsize,
    flush_lock: Mutex<()>,
    flushes: AtomicU64,
    /// Local epsilon as f32 bits; adaptive tuning raises it on hot leaves.
    epsilon_bits: AtomicU32,
    direct_flush: AtomicBool,
}

impl Leaf {
    fn new(range: LeafRange, epsilon: f32) -> Self {
        Self {
            range,
            pending_bytes: AtomicUsize::new(0),
            flush_lock: Mutex::new(()),
            flushes: AtomicU64::new(0),
            epsilon_bits: AtomicU32::new(epsilon.to_bits()),
            direct_flush: AtomicBool::new(false),
        }
    }

    fn epsilon(&self) -> f32 {
        f32::from_bits(self.epsilon_bits.load(Ordering::Relaxed))
    }
}

/// Flush engine statistics.
#[derive(Debug, Clone, Default)]
pub struct FlushStats {
    pub flush_count: u64,
    pub segments_created: u64,
    pub messages_flushed: u64,
    /// Leaves currently running with a raised epsilon.
    pub hot_leaves: Vec<usize>,
    /// Leaves switched to direct flush.
    pub direct_flush_leaves: Vec<usize>,
}

pub struct FlushEngine {
    config: BtreeConfig,
    flush_threshold_bytes: usize,
    batch_cap: usize,
    dim: u32,
    segment_dir: PathBuf,

    leaves: Vec<Leaf>,
    total_flushes: AtomicU64,
    segments_created: AtomicU64,
    messages_flushed: AtomicU64,
    segment_seq: AtomicU64,

    buffer: Arc<MessageBuffer>,
    latest: Arc<LatestById>,
    manifest: Arc<ManifestLog>,
    segment_writer: Arc<dyn SegmentWriter>,
    index_builder: Arc<dyn IndexBuilder>,
    assigner: Arc<dyn CentroidAssigner>,
}

impl FlushEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: BtreeConfig,
        segment_config: &SegmentConfig,
        flush_threshold_bytes: usize,
        dim: u32,
        segment_dir: PathBuf,
        buffer: Arc<MessageBuffer>,
        latest: Arc<LatestById>,
        manifest: Arc<ManifestLog>,
        segment_writer: Arc<dyn SegmentWriter>,
        index_builder: Arc<dyn IndexBuilder>,
        assigner: Arc<dyn CentroidAssigner>,
    ) -> Self {
        let leaves = (0..config.fanout)
            .map(|i| Leaf::new(leaf_range(i, config.fanout), config.epsilon))
            .collect();
        Self {
            batch_cap: segment_config.target_size_vectors as usize,
            flush_threshold_bytes,
            dim,
            segment_dir,
            leaves,
            total_flushes: AtomicU64::new(0),
            segments_created: AtomicU64::new(0),
            messages_flushed: AtomicU64::new(0),
            segment_seq: AtomicU64::new(0),
            buffer,
            latest,
            manifest,
            segment_writer,
            index_builder,
            assigner,
            config,
        }
    }

    /// Accounts an admitted append against its leaf. Returns the leaf index
    /// when the leaf has crossed the flush threshold.
    pub fn note_append(&self, id_hash: VectorIdHash, size: usize) -> Option<usize> {
        let leaf_idx = leaf_for_hash(id_hash, self.config.fanout);
        let leaf = &self.leaves[leaf_idx];
        let pending = leaf.pending_bytes.fetch_add(size, Ordering::Relaxed) + size;
        let direct = leaf.direct_flush.load(Ordering::Relaxed);
        // Direct-flush leaves skip pivot batching: any pending data flushes.
        if pending > self.flush_threshold_bytes || (direct && pending > 0) {
            Some(leaf_idx)
        } else {
            None
        }
    }

    /// One scheduler pass over the flush triggers, in priority order.
    pub async fn tick(&self) -> Result<()> {
        // (a) Leaves over the hard threshold.
        let mut flushed_any = false;
        for i in 0..self.leaves.len() {
            if self.leaves[i].pending_bytes.load(Ordering::Relaxed) > self.flush_threshold_bytes {
                self.flush_leaf(i, false).await?;
                flushed_any = true;
            }
        }

        // (b) Total buffer pressure: drain the hottest leaf.
        let high_water =
            (self.buffer.max_bytes() as f64 * self.config.high_water_fraction as f64) as usize;
        if self.buffer.bytes() > high_water {
            if let Some(hottest) = self.hottest_leaf() {
                self.flush_leaf(hottest, false).await?;
                flushed_any = true;
            }
        }

        // (c) Periodic: hottest leaf above low water.
        if !flushed_any {
            if let Some(hottest) = self.hottest_leaf() {
                let pending = self.leaves[hottest].pending_bytes.load(Ordering::Relaxed);
                if pending > self.flush_threshold_bytes / 2 {
                    self.flush_leaf(hottest, false).await?;
                }
            }
        }
        Ok(())
    }

    fn hottest_leaf(&self) -> Option<usize> {
        self.leaves
            .iter()
            .enumerate()
            .max_by_key(|(_, leaf)| leaf.pending_bytes.load(Ordering::Relaxed))
            .filter(|(_, leaf)| leaf.pending_bytes.load(Ordering::Relaxed) > 0)
            .map(|(i, _)| i)
    }

    /// Drains every leaf. With `force` the call waits on each leaf's flush
    /// mutex instead of skipping busy leaves.
    pub async fn flush_all(&self, force: bool) -> Result<()> {
        for i in 0..self.leaves.len() {
            self.flush_leaf(i, force).await?;
        }
        Ok(())
    }

    /// Flushes one leaf into a new delta segment.
    ///
    /// Returns `Ok(None)` when the leaf had nothing to flush or is already
    /// flushing (and `force` is false).
    pub async fn flush_leaf(
        &self,
        leaf_idx: usize,
        force: bool,
    ) -> Result<Option<SegmentDescriptor>> {
        let leaf = &self.leaves[leaf_idx];
        let _guard = if force {
            leaf.flush_lock.lock().await
        } else {
            match leaf.flush_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Ok(None),
            }
        };

        let batch = self
            .buffer
            .slice_for_leaf(leaf.range.start, leaf.range.end, self.batch_cap);
        if batch.is_empty() {
            leaf.pending_bytes.store(0, Ordering::Relaxed);
            return Ok(None);
        }

        // Within the batch, keep only the greatest-epoch message per hash.
        let mut best: HashMap<VectorIdHash, &Arc<BufferedMessage>> = HashMap::new();
        for buffered in &batch {
            best.entry(buffered.msg.entry.id_hash)
                .and_modify(|held| {
                    if buffered.msg.epoch > held.msg.epoch {
                        *held = buffered;
                    }
                })
                .or_insert(buffered);
        }
        let mut effective: Vec<&Arc<BufferedMessage>> = best.into_values().collect();
        effective.sort_by_key(|m| m.msg.epoch);

        let mut records = Vec::with_capacity(effective.len());
        for buffered in &effective {
            let mut record = message_to_record(&buffered.msg);
            if !record.tombstone && record.centroid_id == 0 {
                record.centroid_id = self.assigner.assign(&record.vector)?;
            }
            records.push(record);
        }

        let max_epoch = effective.last().map(|m| m.msg.epoch).unwrap_or(0);
        let seq = self.segment_seq.fetch_add(1, Ordering::Relaxed);
        let segment_id = format!("seg-{:012}-{:06}", max_epoch, seq);
        let path = self.segment_dir.join(format!("{}.vseg", segment_id));

        tracing::debug!(
            leaf = leaf_idx,
            segment = %segment_id,
            batch = batch.len(),
            effective = records.len(),
            "flushing leaf"
        );

        // Segment write, with bounded retries for transient I/O failures.
        let mut attempt = 0u32;
        let write_result = loop {
            let request = SegmentWriteRequest {
                segment_id: segment_id.clone(),
                path: path.clone(),
                dim: self.dim,
                records: records.clone(),
            };
            match self.segment_writer.write(request).await {
                Ok(result) => break result,
                Err(e) if attempt + 1 < FLUSH_RETRY_BUDGET => {
                    attempt += 1;
                    let backoff = FLUSH_RETRY_BASE * 2u32.pow(attempt);
                    tracing::warn!(
                        leaf = leaf_idx,
                        attempt,
                        error = %e,
                        "segment write failed; retrying"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        };

        // The transition becomes observable here; failure above leaves the
        // batch in the buffer untouched.
        self.manifest
            .commit(vec![write_result.descriptor.clone()], vec![])?;

        self.latest
            .move_to_segment(&write_result.roster, &segment_id, max_epoch);
        let (evicted_count, evicted_bytes) = self.buffer.evict(&batch);
        let _ = leaf
            .pending_bytes
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(evicted_bytes))
            });

        if let Err(e) = self.index_builder.build_delta(&write_result.descriptor).await {
            tracing::warn!(segment = %segment_id, error = %e, "delta index build failed");
        }

        self.segments_created.fetch_add(1, Ordering::Relaxed);
        self.messages_flushed
            .fetch_add(evicted_count as u64, Ordering::Relaxed);
        let leaf_flushes = leaf.flushes.fetch_add(1, Ordering::Relaxed) + 1;
        let total = self.total_flushes.fetch_add(1, Ordering::Relaxed) + 1;
        self.adapt_leaf(leaf_idx, leaf_flushes, total);

        Ok(Some(write_result.descriptor))
    }

    /// Hot-partition handling: a leaf taking an outsized share of flushes
    /// gets more buffer capacity (raised local epsilon); past the direct
    /// threshold it bypasses pivot batching entirely.
    fn adapt_leaf(&self, leaf_idx: usize, leaf_flushes: u64, total_flushes: u64) {
        if total_flushes < ADAPT_MIN_FLUSHES {
            return;
        }
        let leaf = &self.leaves[leaf_idx];
        let share = leaf_flushes as f32 / total_flushes as f32;

        if share > self.config.hot_partition_threshold {
            let current = leaf.epsilon();
            if current < EPSILON_MAX {
                let raised = (current + 0.1).min(EPSILON_MAX);
                leaf.epsilon_bits.store(raised.to_bits(), Ordering::Relaxed);
                tracing::debug!(
                    leaf = leaf_idx,
                    share,
                    epsilon = raised,
                    "hot partition: raised local epsilon"
                );
            }
        }
        if share > self.config.direct_flush_threshold
            && !leaf.direct_flush.swap(true, Ordering::Relaxed)
        {
            tracing::debug!(leaf = leaf_idx, share, "hot partition: direct flush enabled");
        }
    }

    pub fn stats(&self) -> FlushStats {
        let hot_leaves = self
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, l)| l.epsilon() > self.config.epsilon)
            .map(|(i, _)| i)
            .collect();
        let direct_flush_leaves = self
            .leaves
            .iter()
            .enumerate()
            .filter(|(_, l)| l.direct_flush.load(Ordering::Relaxed))
            .map(|(i, _)| i)
            .collect();
        FlushStats {
            flush_count: self.total_flushes.load(Ordering::Relaxed),
            segments_created: self.segments_created.load(Ordering::Relaxed),
            messages_flushed: self.messages_flushed.load(Ordering::Relaxed),
            hot_leaves,
            direct_flush_leaves,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_leaf_partition_covers_space() {
        let fanout = 256;
        assert_eq!(leaf_range(0, fanout).start, 0);
        assert_eq!(leaf_range(fanout - 1, fanout).end, u64::MAX);

        // Ranges tile the space with no gaps or overlap.
        for i in 0..fanout - 1 {
            let here = leaf_range(i, fanout);
            let next = leaf_range(i + 1, fanout);
            assert_eq!(here.end.wrapping_add(1), next.start);
        }
    }

    #[test]
    fn test_leaf_for_hash_agrees_with_ranges() {
        let fanout = 16;
        for leaf in 0..fanout {
            let range = leaf_range(leaf, fanout);
            assert_eq!(leaf_for_hash(range.start, fanout), leaf);
            assert_eq!(leaf_for_hash(range.end, fanout), leaf);
            let mid = range.start / 2 + range.end / 2;
            assert_eq!(leaf_for_hash(mid, fanout), leaf);
        }
    }

    #[test]
    fn test_hash_routing_spread() {
        let fanout = 256;
        let mut seen = std::collections::HashSet::new();
        for i in 0..10_000u64 {
            let hash = crate::types::hash_id(&format!("v{}", i));
            let leaf = leaf_for_hash(hash, fanout);
            assert!(leaf < fanout);
            seen.insert(leaf);
        }
        // xxh64 over 10k keys should touch most of 256 leaves.
        assert!(seen.len() > 200, "only {} leaves hit", seen.len());
    }
}
