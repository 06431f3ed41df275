//! Immutable on-disk vector segments.
//!
//! A segment is the unit the flush engine materializes from the message
//! buffer: a header, a stream of length-prefixed vector records, a
//! fixed-width ID roster, and a checksummed footer. Segments are never
//! rewritten; compaction replaces them wholesale through the manifest.

pub mod builder;
pub mod error;
pub mod format;
pub mod reader;
pub mod record;

pub use builder::{SegmentBuilder, SegmentMeta};
pub use error::{Result, SegmentError};
pub use reader::{SegmentIter, SegmentReader};
pub use record::{RosterEntry, SegmentRecord};
