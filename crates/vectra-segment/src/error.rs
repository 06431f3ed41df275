use thiserror::Error;

#[derive(Debug, Error)]
pub enum SegmentError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },

    #[error("invalid segment format: {0}")]
    InvalidFormat(String),

    #[error("dimension mismatch: segment has {expected}, record has {actual}")]
    DimensionMismatch { expected: u32, actual: u32 },

    #[error("local id {0} out of range")]
    LocalIdOutOfRange(u32),

    #[error("segment is empty")]
    Empty,
}

pub type Result<T> = std::result::Result<T, SegmentError>;
