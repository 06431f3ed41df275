//! Latest-by-id directory: one `VectorLocation` per id hash.
//!
//! Keyed by `id_hash` for O(1) lookups, with a secondary string index for
//! exact-id queries. All updates are last-writer-wins by epoch: a write
//! carrying a lower epoch than the stored location is ignored, which is what
//! makes WAL replay after a crash idempotent.
//!
//! On an `id_hash` collision between distinct ids, the stored entry keeps
//! its original string id; lookups compare both and report a miss.

use crate::types::{
    Epoch, LocationKind, SegmentId, TimestampMicros, VectorId, VectorIdHash, VectorLocation,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

#[derive(Debug)]
struct LocationEntry {
    id: VectorId,
    location: VectorLocation,
    /// Optimistic-concurrency stamp; bumped on every accepted update.
    version: u64,
}

#[derive(Default)]
struct Maps {
    by_hash: HashMap<VectorIdHash, LocationEntry>,
    id_to_hash: HashMap<VectorId, VectorIdHash>,
}

/// Directory statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LatestStats {
    pub total_entries: usize,
    pub buffer_entries: usize,
    pub segment_entries: usize,
    pub tombstone_entries: usize,
}

pub struct LatestById {
    maps: RwLock<Maps>,
    buffer_count: AtomicUsize,
    segment_count: AtomicUsize,
    tombstone_count: AtomicUsize,
    global_version: AtomicU64,
}

impl LatestById {
    pub fn new() -> Self {
        Self {
            maps: RwLock::new(Maps::default()),
            buffer_count: AtomicUsize::new(0),
            segment_count: AtomicUsize::new(0),
            tombstone_count: AtomicUsize::new(0),
            global_version: AtomicU64::new(0),
        }
    }

    fn count_out(&self, location: &VectorLocation) {
        match location.kind {
            LocationKind::Buffer => self.buffer_count.fetch_sub(1, Ordering::Relaxed),
            LocationKind::Segment => self.segment_count.fetch_sub(1, Ordering::Relaxed),
            LocationKind::Deleted => 0,
        };
        if location.tombstone {
            self.tombstone_count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    fn count_in(&self, location: &VectorLocation) {
        match location.kind {
            LocationKind::Buffer => self.buffer_count.fetch_add(1, Ordering::Relaxed),
            LocationKind::Segment => self.segment_count.fetch_add(1, Ordering::Relaxed),
            LocationKind::Deleted => 0,
        };
        if location.tombstone {
            self.tombstone_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records the newest location of an entry. Ignored when the stored
    /// location already carries a greater epoch.
    pub fn upsert(&self, id: &str, id_hash: VectorIdHash, location: VectorLocation) {
        let mut maps = self.maps.write();
        let maps = &mut *maps;
        match maps.by_hash.get_mut(&id_hash) {
            Some(entry) => {
                if entry.location.epoch > location.epoch {
                    return;
                }
                self.count_out(&entry.location);
                self.count_in(&location);
                entry.location = location;
                entry.version = self.global_version.fetch_add(1, Ordering::Relaxed);
                if entry.id.is_empty() && !id.is_empty() {
                    // Roster-rebuilt entries learn their string id lazily.
                    entry.id = id.to_string();
                    maps.id_to_hash.insert(id.to_string(), id_hash);
                }
            }
            None => {
                self.count_in(&location);
                maps.by_hash.insert(
                    id_hash,
                    LocationEntry {
                        id: id.to_string(),
                        location,
                        version: self.global_version.fetch_add(1, Ordering::Relaxed),
                    },
                );
                if !id.is_empty() {
                    maps.id_to_hash.insert(id.to_string(), id_hash);
                }
            }
        }
    }

    /// Marks an id tombstoned at the given epoch.
    pub fn mark_deleted(
        &self,
        id: &str,
        id_hash: VectorIdHash,
        timestamp: TimestampMicros,
        epoch: Epoch,
    ) {
        self.upsert(id, id_hash, VectorLocation::deleted(epoch, timestamp));
    }

    /// Latest location for an exact string id.
    pub fn get_latest(&self, id: &str) -> Option<VectorLocation> {
        let maps = self.maps.read();
        let hash = maps
            .id_to_hash
            .get(id)
            .copied()
            .unwrap_or_else(|| crate::types::hash_id(id));
        let entry = maps.by_hash.get(&hash)?;
        // A colliding hash stores someone else's id; that is a miss for us.
        if !entry.id.is_empty() && entry.id != id {
            return None;
        }
        Some(entry.location.clone())
    }

    /// Latest location by hash, without string disambiguation.
    pub fn by_hash(&self, id_hash: VectorIdHash) -> Option<VectorLocation> {
        self.maps
            .read()
            .by_hash
            .get(&id_hash)
            .map(|e| e.location.clone())
    }

    /// True iff the id is present and not tombstoned.
    pub fn exists(&self, id: &str) -> bool {
        self.get_latest(id).map(|l| !l.tombstone).unwrap_or(false)
    }

    /// Bulk transition after a flush commit: each hash whose location is
    /// still Buffer at an epoch no greater than `flush_epoch` becomes
    /// Segment; anything newer has been superseded and is left alone. The
    /// entry keeps its own epoch so the directory still reports the greatest
    /// epoch observed per id.
    pub fn move_to_segment(
        &self,
        moves: &[(VectorIdHash, u32)],
        segment_id: &SegmentId,
        flush_epoch: Epoch,
    ) {
        let mut maps = self.maps.write();
        for &(id_hash, local_id) in moves {
            if let Some(entry) = maps.by_hash.get_mut(&id_hash) {
                if entry.location.kind == LocationKind::Buffer
                    && entry.location.epoch <= flush_epoch
                {
                    self.buffer_count.fetch_sub(1, Ordering::Relaxed);
                    self.segment_count.fetch_add(1, Ordering::Relaxed);
                    entry.location.kind = LocationKind::Segment;
                    entry.location.segment_id = Some(segment_id.clone());
                    entry.location.local_id = local_id;
                    entry.version = self.global_version.fetch_add(1, Ordering::Relaxed);
                }
            }
        }
    }

    /// Drops every entry resident in the given segment (after compaction).
    pub fn remove_segment_entries(&self, segment_id: &SegmentId) {
        let mut maps = self.maps.write();
        let mut removed_ids = Vec::new();
        maps.by_hash.retain(|_, entry| {
            let in_segment = entry.location.kind == LocationKind::Segment
                && entry.location.segment_id.as_ref() == Some(segment_id);
            if in_segment {
                self.count_out(&entry.location);
                if !entry.id.is_empty() {
                    removed_ids.push(entry.id.clone());
                }
            }
            !in_segment
        });
        for id in removed_ids {
            maps.id_to_hash.remove(&id);
        }
    }

    /// Rebuilds the directory from segment-resident entries, replacing any
    /// existing state. Entries apply epoch-gated, so an id that spans
    /// segments keeps its greatest epoch.
    pub fn rebuild<I>(&self, entries: I)
    where
        I: IntoIterator<Item = (VectorId, VectorIdHash, VectorLocation)>,
    {
        self.clear();
        for (id, id_hash, location) in entries {
            self.upsert(&id, id_hash, location);
        }
    }

    pub fn stats(&self) -> LatestStats {
        LatestStats {
            total_entries: self.maps.read().by_hash.len(),
            buffer_entries: self.buffer_count.load(Ordering::Relaxed),
            segment_entries: self.segment_count.load(Ordering::Relaxed),
            tombstone_entries: self.tombstone_count.load(Ordering::Relaxed),
        }
    }

    pub fn clear(&self) {
        let mut maps = self.maps.write();
        maps.by_hash.clear();
        maps.id_to_hash.clear();
        self.buffer_count.store(0, Ordering::Relaxed);
        self.segment_count.store(0, Ordering::Relaxed);
        self.tombstone_count.store(0, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.maps.read().by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for LatestById {
    fn default() -> Self {
        Self::new()
    }
}
