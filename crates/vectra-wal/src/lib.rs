//! Append-only write-ahead log for the vectra engine.
//!
//! Implements a framed, CRC32C-checksummed log with:
//! - Serial epoch assignment (the engine's global total order)
//! - Group commit with fence records and amortized fsync
//! - Size-based rotation across `wal-*.log` files
//! - Checkpoint-driven retention
//! - Crash recovery with torn-tail truncation
//!
//! # Example
//!
//! ```no_run
//! use vectra_wal::{Wal, WalConfig};
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = WalConfig::default();
//!     let (wal, recovery_info) = Wal::open(config).await?;
//!
//!     println!("recovered {} records", recovery_info.valid_records);
//!
//!     let epoch = wal.append(vectra_wal::OP_UPSERT, Bytes::from_static(b"entry")).await?;
//!     println!("durable at epoch {}", epoch);
//!
//!     wal.close().await?;
//!     Ok(())
//! }
//! ```

pub mod file;
pub mod record;
pub mod recovery;
pub mod wal;

pub use record::{Record, RecordError, OP_DELETE, OP_INSERT, OP_UPSERT};
pub use recovery::RecoveryInfo;
pub use wal::{Wal, WalConfig, WalError};
