use thiserror::Error;

#[derive(Debug, Error)]
pub enum VectorError {
    #[error("dimension mismatch: expected {expected}, got {actual}")]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("centroid table is empty")]
    EmptyCentroidTable,

    #[error("too many centroids: {0} (max 65535)")]
    TooManyCentroids(usize),

    #[error("vector contains non-finite values")]
    NonFinite,
}

pub type Result<T> = std::result::Result<T, VectorError>;
