//! Sharded in-memory message buffer with per-id deduplication and
//! backpressure.
//!
//! Writes land in one of `shard_count` shards chosen by `id_hash % N`. Each
//! shard keeps an arrival-order FIFO plus a dedup map pointing at the newest
//! message per id hash. A superseded message stays queued (so eviction
//! accounting remains append-ordered) but is skipped by flush slicing and
//! query scans; eviction removes it together with the survivor.
//!
//! Total buffered bytes never exceed the configured cap: an append that
//! cannot reserve space parks on a notifier and retries in bounded cycles
//! until its deadline runs out, then surfaces `BufferFull`.

use crate::config::BufferConfig;
use crate::error::{EngineError, Result};
use crate::types::{Message, TagId, VectorEntry, VectorIdHash};
#[cfg(test)]
use crate::types::Operation;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Fixed per-message overhead in the size estimate (queue slot, dedup slot,
/// struct headers).
const MESSAGE_OVERHEAD: usize = 128;

/// Estimated resident size of a message.
pub fn estimate_size(msg: &Message) -> usize {
    MESSAGE_OVERHEAD
        + msg.entry.vector.len() * 4
        + msg.entry.id.len()
        + msg.entry.tenant.len()
        + msg.entry.namespace_id.len()
        + msg.entry.tags.len() * 4
}

/// A message as held by the buffer. `superseded` flips once a newer write
/// for the same id hash lands in the same shard.
#[derive(Debug)]
pub struct BufferedMessage {
    pub msg: Message,
    pub size: usize,
    superseded: AtomicBool,
}

impl BufferedMessage {
    fn new(msg: Message) -> Arc<Self> {
        let size = estimate_size(&msg);
        Arc::new(Self {
            msg,
            size,
            superseded: AtomicBool::new(false),
        })
    }

    pub fn is_superseded(&self) -> bool {
        self.superseded.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct ShardInner {
    fifo: VecDeque<Arc<BufferedMessage>>,
    dedup: HashMap<VectorIdHash, Arc<BufferedMessage>>,
}

struct Shard {
    inner: Mutex<ShardInner>,
    bytes: AtomicUsize,
    count: AtomicUsize,
}

impl Shard {
    fn new() -> Self {
        Self {
            inner: Mutex::new(ShardInner::default()),
            bytes: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
        }
    }
}

/// Buffer statistics.
#[derive(Debug, Clone, Default)]
pub struct BufferStats {
    pub message_count: usize,
    pub bytes_used: usize,
    pub superseded_count: usize,
    pub shard_sizes: Vec<usize>,
}

pub struct MessageBuffer {
    config: BufferConfig,
    shards: Vec<Shard>,
    total_bytes: AtomicUsize,
    total_count: AtomicUsize,
    superseded_count: AtomicUsize,
    space_available: Notify,
}

impl MessageBuffer {
    pub fn new(config: BufferConfig) -> Self {
        let shards = (0..config.shard_count).map(|_| Shard::new()).collect();
        tracing::info!(
            shards = config.shard_count,
            max_bytes = config.size_bytes,
            "message buffer initialized"
        );
        Self {
            config,
            shards,
            total_bytes: AtomicUsize::new(0),
            total_count: AtomicUsize::new(0),
            superseded_count: AtomicUsize::new(0),
            space_available: Notify::new(),
        }
    }

    fn shard_index(&self, id_hash: VectorIdHash) -> usize {
        (id_hash % self.config.shard_count as u64) as usize
    }

    /// Reserves `size` bytes against the cap, or fails within `deadline`.
    ///
    /// The reservation is a compare-exchange so the cap holds at every
    /// observable instant; a zero deadline makes the check immediate.
    async fn reserve(&self, size: usize, deadline: Duration) -> Result<()> {
        let started = tokio::time::Instant::now();
        loop {
            let current = self.total_bytes.load(Ordering::Acquire);
            if current + size <= self.config.size_bytes {
                if self
                    .total_bytes
                    .compare_exchange(current, current + size, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    return Ok(());
                }
                continue;
            }

            let elapsed = started.elapsed();
            if elapsed >= deadline {
                return Err(EngineError::BufferFull);
            }
            let remaining = deadline - elapsed;
            let cycle = Duration::from_millis(self.config.wait_cycle_ms).min(remaining);
            let _ = tokio::time::timeout(cycle, self.space_available.notified()).await;
        }
    }

    /// Appends a message, blocking under backpressure up to `deadline`.
    ///
    /// On `BufferFull` no buffer state has been touched; the caller's WAL
    /// record (if any) stays durable and is re-admitted on recovery.
    pub async fn append(&self, msg: Message, deadline: Duration) -> Result<Arc<BufferedMessage>> {
        let buffered = BufferedMessage::new(msg);
        self.reserve(buffered.size, deadline).await?;

        let shard = &self.shards[self.shard_index(buffered.msg.entry.id_hash)];
        {
            let mut inner = shard.inner.lock();
            self.dedupe_in_shard(&mut inner, &buffered);
            inner.fifo.push_back(buffered.clone());
        }
        shard.bytes.fetch_add(buffered.size, Ordering::Relaxed);
        shard.count.fetch_add(1, Ordering::Relaxed);
        self.total_count.fetch_add(1, Ordering::Relaxed);
        Ok(buffered)
    }

    /// Dedup policy: a non-Delete supersedes any prior entry for the hash; a
    /// Delete replaces a prior non-Delete but never supersedes a prior
    /// Delete. The dedup pointer always tracks the newest message.
    fn dedupe_in_shard(&self, inner: &mut ShardInner, buffered: &Arc<BufferedMessage>) {
        let hash = buffered.msg.entry.id_hash;
        if let Some(prev) = inner.dedup.get(&hash) {
            let supersede = if buffered.msg.op.is_delete() {
                !prev.msg.op.is_delete()
            } else {
                true
            };
            if supersede && !prev.is_superseded() {
                prev.superseded.store(true, Ordering::Release);
                self.superseded_count.fetch_add(1, Ordering::Relaxed);
            }
        }
        inner.dedup.insert(hash, buffered.clone());
    }

    /// Returns up to `max_batch` live (non-superseded) messages whose id
    /// hash falls in `[range_start, range_end]`, without removing them.
    pub fn slice_for_leaf(
        &self,
        range_start: VectorIdHash,
        range_end: VectorIdHash,
        max_batch: usize,
    ) -> Vec<Arc<BufferedMessage>> {
        let mut batch = Vec::new();
        for shard in &self.shards {
            if batch.len() >= max_batch {
                break;
            }
            let inner = shard.inner.lock();
            for buffered in &inner.fifo {
                if batch.len() >= max_batch {
                    break;
                }
                let hash = buffered.msg.entry.id_hash;
                if hash < range_start || hash > range_end {
                    continue;
                }
                if buffered.is_superseded() {
                    continue;
                }
                batch.push(buffered.clone());
            }
        }
        batch
    }

    /// Removes flushed messages after their segment has committed.
    ///
    /// Each message is removed by identity; superseded messages for the same
    /// hash at an epoch no greater than the flushed one ride along, since
    /// nothing will ever flush them. Returns (messages, bytes) removed.
    pub fn evict(&self, flushed: &[Arc<BufferedMessage>]) -> (usize, usize) {
        let mut total_removed_count = 0usize;
        let mut total_removed_bytes = 0usize;
        // Group by shard so each shard's lock is taken once.
        let mut by_shard: HashMap<usize, Vec<&Arc<BufferedMessage>>> = HashMap::new();
        for buffered in flushed {
            by_shard
                .entry(self.shard_index(buffered.msg.entry.id_hash))
                .or_default()
                .push(buffered);
        }

        for (shard_idx, msgs) in by_shard {
            let shard = &self.shards[shard_idx];
            let mut ceiling: HashMap<VectorIdHash, u64> = HashMap::new();
            for buffered in &msgs {
                let entry = ceiling.entry(buffered.msg.entry.id_hash).or_insert(0);
                *entry = (*entry).max(buffered.msg.epoch);
            }

            let mut removed_bytes = 0usize;
            let mut removed_count = 0usize;
            {
                let mut inner = shard.inner.lock();
                inner.fifo.retain(|queued| {
                    let direct = msgs.iter().any(|m| Arc::ptr_eq(m, queued));
                    let shadowed = queued.is_superseded()
                        && ceiling
                            .get(&queued.msg.entry.id_hash)
                            .map(|&max| queued.msg.epoch <= max)
                            .unwrap_or(false);
                    if direct || shadowed {
                        removed_bytes += queued.size;
                        removed_count += 1;
                        if queued.is_superseded() {
                            self.superseded_count.fetch_sub(1, Ordering::Relaxed);
                        }
                        false
                    } else {
                        true
                    }
                });
                // Drop dedup pointers that now target evicted messages.
                inner.dedup.retain(|_, target| {
                    !msgs.iter().any(|m| Arc::ptr_eq(m, target))
                });
            }

            shard.bytes.fetch_sub(removed_bytes, Ordering::Relaxed);
            shard.count.fetch_sub(removed_count, Ordering::Relaxed);
            self.total_bytes.fetch_sub(removed_bytes, Ordering::Relaxed);
            self.total_count.fetch_sub(removed_count, Ordering::Relaxed);
            total_removed_count += removed_count;
            total_removed_bytes += removed_bytes;
        }

        self.space_available.notify_waiters();
        (total_removed_count, total_removed_bytes)
    }

    /// Read-your-writes scan: live buffered entries matching the tenant,
    /// namespace, and any of the query tags. No ordering guarantee; scoring
    /// is the caller's concern.
    pub fn scan_for_query(
        &self,
        tenant: &str,
        namespace: &str,
        tags: &[TagId],
        max_scan: usize,
    ) -> Vec<VectorEntry> {
        let mut results = Vec::new();
        let mut scanned = 0usize;

        for shard in &self.shards {
            if scanned >= max_scan {
                break;
            }
            let inner = shard.inner.lock();
            for buffered in &inner.fifo {
                if scanned >= max_scan {
                    break;
                }
                scanned += 1;

                if buffered.msg.op.is_delete() || buffered.is_superseded() {
                    continue;
                }
                let entry = &buffered.msg.entry;
                if !tenant.is_empty() && entry.tenant != tenant {
                    continue;
                }
                if !namespace.is_empty() && entry.namespace_id != namespace {
                    continue;
                }
                if !tags.is_empty() && !tags.iter().any(|t| entry.tags.contains(t)) {
                    continue;
                }
                results.push(entry.clone());
            }
        }
        results
    }

    /// Blocks until buffered bytes drop below the cap or `timeout` expires.
    pub async fn wait_for_space(&self, timeout: Duration) -> bool {
        let started = tokio::time::Instant::now();
        while self.total_bytes.load(Ordering::Acquire) >= self.config.size_bytes {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                return false;
            }
            let _ = tokio::time::timeout(timeout - elapsed, self.space_available.notified()).await;
        }
        true
    }

    /// Drops everything. Used when recovery rebuilds the buffer from the WAL.
    pub fn clear(&self) {
        for shard in &self.shards {
            let mut inner = shard.inner.lock();
            inner.fifo.clear();
            inner.dedup.clear();
            shard.bytes.store(0, Ordering::Relaxed);
            shard.count.store(0, Ordering::Relaxed);
        }
        self.total_bytes.store(0, Ordering::Relaxed);
        self.total_count.store(0, Ordering::Relaxed);
        self.superseded_count.store(0, Ordering::Relaxed);
        self.space_available.notify_waiters();
    }

    pub fn bytes(&self) -> usize {
        self.total_bytes.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.total_count.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn max_bytes(&self) -> usize {
        self.config.size_bytes
    }

    pub fn stats(&self) -> BufferStats {
        BufferStats {
            message_count: self.len(),
            bytes_used: self.bytes(),
            superseded_count: self.superseded_count.load(Ordering::Relaxed),
            shard_sizes: self
                .shards
                .iter()
                .map(|s| s.count.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::hash_id;

    fn small_config() -> BufferConfig {
        BufferConfig {
            size_bytes: 64 * 1024,
            shard_count: 4,
            flush_threshold_bytes: 16 * 1024,
            wait_cycle_ms: 10,
            max_wait_cycles: 5,
        }
    }

    fn message(id: &str, epoch: u64, op: Operation) -> Message {
        let mut entry = VectorEntry::new(id, vec![1.0, 2.0, 3.0, 4.0], "acme", "default");
        entry.updated_at = epoch as i64;
        if op.is_delete() {
            entry.vector = Vec::new();
            entry.deleted = true;
        }
        Message {
            op,
            entry,
            epoch,
            timestamp: epoch as i64,
        }
    }

    async fn append(buffer: &MessageBuffer, msg: Message) -> Arc<BufferedMessage> {
        buffer
            .append(msg, Duration::from_millis(100))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_append_and_counters() {
        let buffer = MessageBuffer::new(small_config());
        let m = append(&buffer, message("v1", 1, Operation::Insert)).await;

        assert_eq!(buffer.len(), 1);
        assert_eq!(buffer.bytes(), m.size);
        assert!(!m.is_superseded());
    }

    #[tokio::test]
    async fn test_dedup_marks_prior_superseded() {
        let buffer = MessageBuffer::new(small_config());
        let first = append(&buffer, message("v1", 1, Operation::Upsert)).await;
        let second = append(&buffer, message("v1", 2, Operation::Upsert)).await;
        let third = append(&buffer, message("v1", 3, Operation::Upsert)).await;

        assert!(first.is_superseded());
        assert!(second.is_superseded());
        assert!(!third.is_superseded());
        // All three stay queued until eviction.
        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.stats().superseded_count, 2);
    }

    #[tokio::test]
    async fn test_delete_replaces_prior_upsert() {
        let buffer = MessageBuffer::new(small_config());
        let up = append(&buffer, message("v1", 1, Operation::Upsert)).await;
        let del = append(&buffer, message("v1", 2, Operation::Delete)).await;

        assert!(up.is_superseded());
        assert!(!del.is_superseded());
    }

    #[tokio::test]
    async fn test_delete_never_supersedes_delete() {
        let buffer = MessageBuffer::new(small_config());
        let d1 = append(&buffer, message("v1", 1, Operation::Delete)).await;
        let d2 = append(&buffer, message("v1", 2, Operation::Delete)).await;

        assert!(!d1.is_superseded());
        assert!(!d2.is_superseded());
    }

    #[tokio::test]
    async fn test_slice_skips_superseded_and_respects_range() {
        let buffer = MessageBuffer::new(small_config());
        append(&buffer, message("v1", 1, Operation::Upsert)).await;
        append(&buffer, message("v1", 2, Operation::Upsert)).await;
        append(&buffer, message("v2", 3, Operation::Upsert)).await;

        let all = buffer.slice_for_leaf(0, u64::MAX, 100);
        assert_eq!(all.len(), 2);
        let epochs: Vec<u64> = all.iter().map(|m| m.msg.epoch).collect();
        assert!(epochs.contains(&2));
        assert!(epochs.contains(&3));

        // A range covering only v2's hash excludes v1.
        let h2 = hash_id("v2");
        let only_v2 = buffer.slice_for_leaf(h2, h2, 100);
        assert_eq!(only_v2.len(), 1);
        assert_eq!(only_v2[0].msg.entry.id, "v2");
    }

    #[tokio::test]
    async fn test_evict_drops_superseded_queue_entries() {
        let buffer = MessageBuffer::new(small_config());
        append(&buffer, message("v1", 1, Operation::Upsert)).await;
        append(&buffer, message("v1", 2, Operation::Upsert)).await;
        append(&buffer, message("v1", 3, Operation::Upsert)).await;
        assert_eq!(buffer.len(), 3);

        let batch = buffer.slice_for_leaf(0, u64::MAX, 100);
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].msg.epoch, 3);

        buffer.evict(&batch);
        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.bytes(), 0);
        assert_eq!(buffer.stats().superseded_count, 0);
    }

    #[tokio::test]
    async fn test_evict_leaves_newer_write_alone() {
        let buffer = MessageBuffer::new(small_config());
        append(&buffer, message("v1", 1, Operation::Upsert)).await;
        let batch = buffer.slice_for_leaf(0, u64::MAX, 100);

        // A newer write lands after the slice was taken.
        let newer = append(&buffer, message("v1", 2, Operation::Upsert)).await;

        buffer.evict(&batch);
        assert_eq!(buffer.len(), 1);
        assert!(!newer.is_superseded());
        let remaining = buffer.slice_for_leaf(0, u64::MAX, 100);
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].msg.epoch, 2);
    }

    #[tokio::test]
    async fn test_append_slice_evict_restores_counters() {
        let buffer = MessageBuffer::new(small_config());
        for i in 0..10 {
            append(&buffer, message(&format!("v{}", i), i + 1, Operation::Insert)).await;
        }
        let batch = buffer.slice_for_leaf(0, u64::MAX, 100);
        assert_eq!(batch.len(), 10);
        buffer.evict(&batch);

        assert_eq!(buffer.len(), 0);
        assert_eq!(buffer.bytes(), 0);
        assert!(buffer.stats().shard_sizes.iter().all(|&s| s == 0));
    }

    #[tokio::test]
    async fn test_scan_filters() {
        let buffer = MessageBuffer::new(small_config());
        let mut tagged = message("v1", 1, Operation::Upsert);
        tagged.entry.tags = vec![7];
        buffer
            .append(tagged, Duration::from_millis(100))
            .await
            .unwrap();

        let mut other_tenant = message("v2", 2, Operation::Upsert);
        other_tenant.entry.tenant = "umbrella".to_string();
        other_tenant.entry.tenant_hash = hash_id("umbrella");
        buffer
            .append(other_tenant, Duration::from_millis(100))
            .await
            .unwrap();

        append(&buffer, message("v3", 3, Operation::Delete)).await;

        let hits = buffer.scan_for_query("acme", "default", &[], 1000);
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, "v1");

        let tag_hits = buffer.scan_for_query("acme", "default", &[7], 1000);
        assert_eq!(tag_hits.len(), 1);
        let tag_miss = buffer.scan_for_query("acme", "default", &[8], 1000);
        assert!(tag_miss.is_empty());

        // Empty tenant matches everything live.
        let any = buffer.scan_for_query("", "", &[], 1000);
        assert_eq!(any.len(), 2);
    }

    #[tokio::test]
    async fn test_backpressure_deadline() {
        let config = BufferConfig {
            size_bytes: 600,
            shard_count: 2,
            flush_threshold_bytes: 512,
            wait_cycle_ms: 10,
            max_wait_cycles: 5,
        };
        let buffer = MessageBuffer::new(config);

        // Three records fit, the fourth does not.
        for i in 0..3 {
            buffer
                .append(
                    message(&format!("v{}", i), i + 1, Operation::Insert),
                    Duration::from_millis(50),
                )
                .await
                .unwrap();
        }
        let result = buffer
            .append(message("v3", 4, Operation::Insert), Duration::from_millis(50))
            .await;
        assert!(matches!(result, Err(EngineError::BufferFull)));
        assert_eq!(buffer.len(), 3);
    }

    #[tokio::test]
    async fn test_backpressure_zero_deadline_immediate() {
        let config = BufferConfig {
            size_bytes: 200,
            shard_count: 1,
            flush_threshold_bytes: 128,
            wait_cycle_ms: 100,
            max_wait_cycles: 1,
        };
        let buffer = MessageBuffer::new(config);
        buffer
            .append(message("v0", 1, Operation::Insert), Duration::ZERO)
            .await
            .unwrap();

        let started = std::time::Instant::now();
        let result = buffer
            .append(message("v1", 2, Operation::Insert), Duration::ZERO)
            .await;
        assert!(matches!(result, Err(EngineError::BufferFull)));
        assert!(started.elapsed() < Duration::from_millis(50));
    }

    #[tokio::test]
    async fn test_eviction_unblocks_waiter() {
        let config = BufferConfig {
            size_bytes: 400,
            shard_count: 1,
            flush_threshold_bytes: 256,
            wait_cycle_ms: 10,
            max_wait_cycles: 5,
        };
        let buffer = Arc::new(MessageBuffer::new(config));
        let first = append_to(&buffer, message("v0", 1, Operation::Insert)).await;
        let second = append_to(&buffer, message("v1", 2, Operation::Insert)).await;

        let waiter = {
            let buffer = buffer.clone();
            tokio::spawn(async move {
                buffer
                    .append(message("v2", 3, Operation::Insert), Duration::from_secs(5))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        buffer.evict(&[first, second]);

        let admitted = waiter.await.unwrap();
        assert!(admitted.is_ok());
        assert_eq!(buffer.len(), 1);
    }

    async fn append_to(buffer: &MessageBuffer, msg: Message) -> Arc<BufferedMessage> {
        buffer.append(msg, Duration::from_millis(100)).await.unwrap()
    }

    #[tokio::test]
    async fn test_clear_resets_everything() {
        let buffer = MessageBuffer::new(small_config());
        for i in 0..5 {
            append(&buffer, message(&format!("v{}", i), i + 1, Operation::Insert)).await;
        }
        buffer.clear();
        assert!(buffer.is_empty());
        assert_eq!(buffer.bytes(), 0);
    }
}
