//! Core data model: entries, operations, messages, locations, descriptors.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

pub type VectorId = String;
pub type VectorIdHash = u64;
pub type Epoch = u64;
pub type TimestampMicros = i64;
pub type CentroidId = u16;
pub type TagId = u32;
pub type SegmentId = String;

/// Canonical 64-bit hash of a vector ID; also used for tenant and namespace
/// identifiers. The hash routes entries to buffer shards and tree leaves.
pub fn hash_id(id: &str) -> VectorIdHash {
    xxhash_rust::xxh64::xxh64(id.as_bytes(), 0)
}

/// One immutable vector record as carried through the write path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VectorEntry {
    pub id: VectorId,
    pub id_hash: VectorIdHash,
    pub vector: Vec<f32>,
    pub tenant: String,
    pub tenant_hash: u64,
    pub namespace_id: String,
    pub namespace_hash: u64,
    /// Sorted, unique tag ids; at most 16.
    pub tags: Vec<TagId>,
    pub created_at: TimestampMicros,
    pub updated_at: TimestampMicros,
    /// Routing hint for flush coherence; 0 means unassigned.
    pub centroid_id: CentroidId,
    pub deleted: bool,
}

impl VectorEntry {
    pub fn new(
        id: impl Into<String>,
        vector: Vec<f32>,
        tenant: impl Into<String>,
        namespace_id: impl Into<String>,
    ) -> Self {
        let id = id.into();
        let tenant = tenant.into();
        let namespace_id = namespace_id.into();
        let id_hash = hash_id(&id);
        let tenant_hash = hash_id(&tenant);
        let namespace_hash = hash_id(&namespace_id);
        Self {
            id,
            id_hash,
            vector,
            tenant,
            tenant_hash,
            namespace_id,
            namespace_hash,
            tags: Vec::new(),
            created_at: 0,
            updated_at: 0,
            centroid_id: 0,
            deleted: false,
        }
    }

    pub fn with_tags(mut self, mut tags: Vec<TagId>) -> Self {
        tags.sort_unstable();
        tags.dedup();
        self.tags = tags;
        self
    }

    /// A thin tombstone entry carrying only identity and timestamps.
    pub fn tombstone(id: impl Into<String>, ts: TimestampMicros) -> Self {
        let mut entry = Self::new(id, Vec::new(), "", "");
        entry.created_at = ts;
        entry.updated_at = ts;
        entry.deleted = true;
        entry
    }
}

/// Write operations accepted by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Insert,
    Upsert,
    Delete,
}

impl Operation {
    pub fn wire_code(self) -> u8 {
        match self {
            Operation::Insert => vectra_wal::OP_INSERT,
            Operation::Upsert => vectra_wal::OP_UPSERT,
            Operation::Delete => vectra_wal::OP_DELETE,
        }
    }

    pub fn from_wire(code: u8) -> Option<Self> {
        match code {
            vectra_wal::OP_INSERT => Some(Operation::Insert),
            vectra_wal::OP_UPSERT => Some(Operation::Upsert),
            vectra_wal::OP_DELETE => Some(Operation::Delete),
            _ => None,
        }
    }

    pub fn is_delete(self) -> bool {
        matches!(self, Operation::Delete)
    }
}

/// An operation paired with its epoch: the unit held in the message buffer.
///
/// The epoch is assigned at WAL append time and is the engine's global total
/// order; timestamps never decide ordering.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub op: Operation,
    pub entry: VectorEntry,
    pub epoch: Epoch,
    pub timestamp: TimestampMicros,
}

/// Where the latest version of an entry currently lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LocationKind {
    Buffer,
    Segment,
    Deleted,
}

#[derive(Debug, Clone, PartialEq)]
pub struct VectorLocation {
    pub kind: LocationKind,
    /// Present iff `kind == Segment`.
    pub segment_id: Option<SegmentId>,
    /// Record index within the segment.
    pub local_id: u32,
    pub timestamp: TimestampMicros,
    pub epoch: Epoch,
    pub tombstone: bool,
}

impl VectorLocation {
    pub fn buffer(epoch: Epoch, timestamp: TimestampMicros, tombstone: bool) -> Self {
        Self {
            kind: LocationKind::Buffer,
            segment_id: None,
            local_id: 0,
            timestamp,
            epoch,
            tombstone,
        }
    }

    pub fn deleted(epoch: Epoch, timestamp: TimestampMicros) -> Self {
        Self {
            kind: LocationKind::Deleted,
            segment_id: None,
            local_id: 0,
            timestamp,
            epoch,
            tombstone: true,
        }
    }
}

/// Metadata of one committed, immutable segment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentDescriptor {
    pub segment_id: SegmentId,
    pub file_path: PathBuf,
    pub num_vectors: u64,
    pub min_id_hash: u64,
    pub max_id_hash: u64,
    pub min_epoch: Epoch,
    pub max_epoch: Epoch,
    pub tombstone_ratio: f32,
    pub created_at: TimestampMicros,
    /// False for freshly flushed delta segments; a background merger may
    /// later produce stable segments.
    pub is_stable: bool,
}

/// Millisecond/microsecond time source, injectable for tests.
pub trait Clock: Send + Sync {
    /// Microseconds since the Unix epoch, monotonic within the process.
    fn now_micros(&self) -> TimestampMicros;
}

/// Wall-clock backed `Clock` that never runs backwards.
pub struct SystemClock {
    last: AtomicI64,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(0),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_micros(&self) -> TimestampMicros {
        let wall = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or(0);
        // Clamp to monotonic: a stepped-back wall clock repeats the last value.
        self.last.fetch_max(wall, Ordering::AcqRel);
        self.last.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_id_is_stable() {
        let a = hash_id("v0001");
        let b = hash_id("v0001");
        let c = hash_id("v0002");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_entry_builder_hashes() {
        let entry = VectorEntry::new("v1", vec![1.0, 2.0], "acme", "default");
        assert_eq!(entry.id_hash, hash_id("v1"));
        assert_eq!(entry.tenant_hash, hash_id("acme"));
        assert_eq!(entry.namespace_hash, hash_id("default"));
        assert!(!entry.deleted);
    }

    #[test]
    fn test_tags_sorted_and_deduped() {
        let entry = VectorEntry::new("v1", vec![], "t", "n").with_tags(vec![5, 1, 5, 3]);
        assert_eq!(entry.tags, vec![1, 3, 5]);
    }

    #[test]
    fn test_operation_wire_roundtrip() {
        for op in [Operation::Insert, Operation::Upsert, Operation::Delete] {
            assert_eq!(Operation::from_wire(op.wire_code()), Some(op));
        }
        assert_eq!(Operation::from_wire(7), None);
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let mut prev = clock.now_micros();
        for _ in 0..100 {
            let now = clock.now_micros();
            assert!(now >= prev);
            prev = now;
        }
    }
}
