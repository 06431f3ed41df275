use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use vectra_vector::Metric;

/// Engine configuration.
///
/// Sections mirror the on-disk layout: `data_dir/wal/`, `data_dir/segments/`,
/// `data_dir/manifest/`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base directory for all engine data.
    pub data_dir: PathBuf,

    pub collection: CollectionConfig,
    pub wal: WalSection,
    pub buffer: BufferConfig,
    pub btree: BtreeConfig,
    pub segment: SegmentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Vector dimension; every write must match exactly.
    pub dim: u32,
    pub metric: Metric,
    /// Maximum tag ids per vector.
    pub max_tags_per_vector: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalSection {
    /// Group-commit window in milliseconds; 0 commits per record.
    pub group_commit_ms: u64,
    /// Fsync once per this many fences.
    pub fsync_every_fences: u32,
    /// Rotate the active WAL file at this size.
    pub rotate_bytes: u64,
    /// Maximum WAL files retained.
    pub max_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BufferConfig {
    /// Hard cap on buffered bytes; appends block rather than exceed it.
    pub size_bytes: usize,
    pub shard_count: usize,
    /// Per-leaf pending bytes that force a flush.
    pub flush_threshold_bytes: usize,
    /// One backpressure wait cycle.
    pub wait_cycle_ms: u64,
    /// Wait cycles before an append gives up with BufferFull.
    pub max_wait_cycles: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BtreeConfig {
    /// Fraction of node capacity devoted to message buffering.
    pub epsilon: f32,
    /// Number of leaves partitioning the id-hash space.
    pub fanout: usize,
    /// Leaf share of total flushes that marks it hot.
    pub hot_partition_threshold: f32,
    /// Leaf share of total flushes that switches it to direct flush.
    pub direct_flush_threshold: f32,
    /// Periodic flush tick.
    pub flush_interval_ms: u64,
    /// Total-buffer fraction that triggers pressure flushes.
    pub high_water_fraction: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentConfig {
    /// Cap on vectors per flushed segment.
    pub target_size_vectors: u64,
    /// IVF list count for delta-segment indexes.
    pub delta_nlist: u32,
    /// IVF list count for stable-segment indexes.
    pub stable_nlist: u32,
    /// Product-quantization subvector count for stable segments.
    pub stable_pq_m: u32,
    /// Bits per PQ code for stable segments.
    pub stable_pq_nbits: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            collection: CollectionConfig::default(),
            wal: WalSection::default(),
            buffer: BufferConfig::default(),
            btree: BtreeConfig::default(),
            segment: SegmentConfig::default(),
        }
    }
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            dim: 768,
            metric: Metric::InnerProduct,
            max_tags_per_vector: 16,
        }
    }
}

impl Default for WalSection {
    fn default() -> Self {
        Self {
            group_commit_ms: 8,
            fsync_every_fences: 50,
            rotate_bytes: 3_221_225_472,
            max_files: 10,
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            size_bytes: 17_179_869_184,
            shard_count: 16,
            flush_threshold_bytes: 134_217_728,
            wait_cycle_ms: 100,
            max_wait_cycles: 10,
        }
    }
}

impl Default for BtreeConfig {
    fn default() -> Self {
        Self {
            epsilon: 0.5,
            fanout: 256,
            hot_partition_threshold: 0.5,
            direct_flush_threshold: 0.8,
            flush_interval_ms: 100,
            high_water_fraction: 0.8,
        }
    }
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            target_size_vectors: 2_000_000,
            delta_nlist: 1024,
            stable_nlist: 4096,
            stable_pq_m: 96,
            stable_pq_nbits: 8,
        }
    }
}

impl EngineConfig {
    pub fn wal_dir(&self) -> PathBuf {
        self.data_dir.join("wal")
    }

    pub fn segment_dir(&self) -> PathBuf {
        self.data_dir.join("segments")
    }

    pub fn manifest_dir(&self) -> PathBuf {
        self.data_dir.join("manifest")
    }

    /// Validates the configuration, returning an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.collection.dim == 0 {
            return Err(EngineError::Config("collection.dim must be > 0".to_string()));
        }
        if self.collection.max_tags_per_vector == 0 || self.collection.max_tags_per_vector > 255 {
            return Err(EngineError::Config(
                "collection.max_tags_per_vector must be in [1, 255]".to_string(),
            ));
        }
        if self.buffer.shard_count == 0 {
            return Err(EngineError::Config(
                "buffer.shard_count must be > 0".to_string(),
            ));
        }
        if self.buffer.size_bytes == 0 {
            return Err(EngineError::Config(
                "buffer.size_bytes must be > 0".to_string(),
            ));
        }
        if self.buffer.flush_threshold_bytes == 0 {
            return Err(EngineError::Config(
                "buffer.flush_threshold_bytes must be > 0".to_string(),
            ));
        }
        if !(self.btree.epsilon > 0.0 && self.btree.epsilon < 1.0) {
            return Err(EngineError::Config(
                "btree.epsilon must be in (0.0, 1.0)".to_string(),
            ));
        }
        if self.btree.fanout < 2 {
            return Err(EngineError::Config("btree.fanout must be >= 2".to_string()));
        }
        if self.btree.hot_partition_threshold > self.btree.direct_flush_threshold {
            return Err(EngineError::Config(
                "btree.hot_partition_threshold must not exceed direct_flush_threshold".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&self.btree.high_water_fraction) {
            return Err(EngineError::Config(
                "btree.high_water_fraction must be in [0.0, 1.0]".to_string(),
            ));
        }
        if self.segment.target_size_vectors == 0 {
            return Err(EngineError::Config(
                "segment.target_size_vectors must be > 0".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_epsilon() {
        let mut config = EngineConfig::default();
        config.btree.epsilon = 1.0;
        assert!(config.validate().is_err());
        config.btree.epsilon = 0.0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_invalid_fanout() {
        let mut config = EngineConfig::default();
        config.btree.fanout = 1;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_dim_rejected() {
        let mut config = EngineConfig::default();
        config.collection.dim = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_threshold_ordering_enforced() {
        let mut config = EngineConfig::default();
        config.btree.hot_partition_threshold = 0.9;
        config.btree.direct_flush_threshold = 0.8;
        assert!(config.validate().is_err());
    }
}
