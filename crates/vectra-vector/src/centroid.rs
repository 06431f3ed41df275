//! Centroid assignment for flush routing.
//!
//! Every entry gets a 16-bit centroid id before it lands in a segment, so a
//! segment's records cluster by coarse region and the per-segment index
//! trainer sees coherent lists. The assigner is a capability interface; the
//! engine takes whichever implementation is injected.

use crate::distance::Metric;
use crate::error::{Result, VectorError};

/// Assigns a coarse centroid to a vector.
///
/// Implementations must be `Send + Sync`; assignment runs on flush paths
/// from multiple leaves concurrently.
pub trait CentroidAssigner: Send + Sync {
    /// Returns the centroid id for a vector.
    fn assign(&self, vector: &[f32]) -> Result<u16>;

    /// Number of centroids this assigner can produce.
    fn nlist(&self) -> u16;
}

/// Nearest-centroid assignment over a trained centroid table.
pub struct FlatCentroidAssigner {
    centroids: Vec<Vec<f32>>,
    metric: Metric,
    dim: usize,
}

impl FlatCentroidAssigner {
    /// Builds an assigner from a trained centroid table.
    pub fn new(centroids: Vec<Vec<f32>>, metric: Metric) -> Result<Self> {
        if centroids.is_empty() {
            return Err(VectorError::EmptyCentroidTable);
        }
        if centroids.len() > u16::MAX as usize {
            return Err(VectorError::TooManyCentroids(centroids.len()));
        }
        let dim = centroids[0].len();
        if centroids.iter().any(|c| c.len() != dim) {
            return Err(VectorError::DimensionMismatch {
                expected: dim,
                actual: centroids.iter().map(|c| c.len()).find(|&l| l != dim).unwrap_or(dim),
            });
        }
        Ok(Self {
            centroids,
            metric,
            dim,
        })
    }
}

impl CentroidAssigner for FlatCentroidAssigner {
    fn assign(&self, vector: &[f32]) -> Result<u16> {
        if vector.len() != self.dim {
            return Err(VectorError::DimensionMismatch {
                expected: self.dim,
                actual: vector.len(),
            });
        }
        let mut best = 0u16;
        let mut best_dist = f32::INFINITY;
        for (i, centroid) in self.centroids.iter().enumerate() {
            let dist = self.metric.distance(vector, centroid);
            if dist < best_dist {
                best_dist = dist;
                best = i as u16;
            }
        }
        Ok(best)
    }

    fn nlist(&self) -> u16 {
        self.centroids.len() as u16
    }
}

/// Assignment independent of vector content, spreading entries uniformly.
/// Stands in before any centroid table has been trained.
pub struct UniformCentroidAssigner {
    nlist: u16,
    next: std::sync::atomic::AtomicU32,
}

impl UniformCentroidAssigner {
    pub fn new(nlist: u16) -> Self {
        Self {
            nlist: nlist.max(1),
            next: std::sync::atomic::AtomicU32::new(0),
        }
    }
}

impl CentroidAssigner for UniformCentroidAssigner {
    fn assign(&self, _vector: &[f32]) -> Result<u16> {
        let n = self
            .next
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        Ok((n % self.nlist as u32) as u16)
    }

    fn nlist(&self) -> u16 {
        self.nlist
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flat_assigner_picks_nearest() {
        let centroids = vec![
            vec![1.0, 0.0],
            vec![0.0, 1.0],
            vec![-1.0, 0.0],
        ];
        let assigner = FlatCentroidAssigner::new(centroids, Metric::L2).unwrap();

        assert_eq!(assigner.assign(&[0.9, 0.1]).unwrap(), 0);
        assert_eq!(assigner.assign(&[0.1, 0.9]).unwrap(), 1);
        assert_eq!(assigner.assign(&[-0.8, 0.0]).unwrap(), 2);
        assert_eq!(assigner.nlist(), 3);
    }

    #[test]
    fn test_flat_assigner_rejects_mismatched_dim() {
        let assigner = FlatCentroidAssigner::new(vec![vec![0.0; 4]], Metric::L2).unwrap();
        assert!(assigner.assign(&[1.0, 2.0]).is_err());
    }

    #[test]
    fn test_flat_assigner_rejects_empty_table() {
        assert!(matches!(
            FlatCentroidAssigner::new(vec![], Metric::L2),
            Err(VectorError::EmptyCentroidTable)
        ));
    }

    #[test]
    fn test_uniform_assigner_cycles() {
        let assigner = UniformCentroidAssigner::new(4);
        let ids: Vec<u16> = (0..8).map(|_| assigner.assign(&[0.0]).unwrap()).collect();
        assert_eq!(ids, vec![0, 1, 2, 3, 0, 1, 2, 3]);
    }
}
