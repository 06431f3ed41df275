use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("buffer full")]
    BufferFull,

    #[error("engine is read-only after a durability failure")]
    ReadOnly,

    #[error("WAL error: {0}")]
    Wal(#[from] vectra_wal::WalError),

    #[error("segment error: {0}")]
    Segment(#[from] vectra_segment::SegmentError),

    #[error("vector error: {0}")]
    Vector(#[from] vectra_vector::VectorError),

    #[error("MANIFEST error: {0}")]
    Manifest(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corruption: {0}")]
    Corruption(String),

    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, EngineError>;
