//! WAL record framing with CRC32C checksumming.
//!
//! Record frame (all integers little-endian):
//! - length: u32 (byte length of epoch + op + payload; 0 marks a fence)
//! - crc32c: u32 (over epoch || op || payload)
//! - epoch: u64
//! - op: u8
//! - payload: bytes[length - 9]
//!
//! A fence is the 4-byte frame `length = 0` with no trailing fields. Fences
//! mark group-commit boundaries and carry no data.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use thiserror::Error;

/// Operation codes stored in the `op` byte.
pub const OP_INSERT: u8 = 0;
pub const OP_UPSERT: u8 = 1;
pub const OP_DELETE: u8 = 2;

/// Fixed bytes in a record body before the payload (epoch + op).
pub const RECORD_BODY_HEADER: usize = 9;

/// Fixed bytes in a record frame before the body (length + crc).
pub const RECORD_FRAME_HEADER: usize = 8;

/// Size of an encoded fence.
pub const FENCE_SIZE: usize = 4;

#[derive(Debug, Error)]
pub enum RecordError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("CRC mismatch: expected {expected:#x}, got {actual:#x}")]
    CrcMismatch { expected: u32, actual: u32 },
    #[error("invalid operation code: {0}")]
    InvalidOp(u8),
    #[error("incomplete record")]
    Incomplete,
}

/// A single framed WAL record: an epoch-stamped operation with an opaque
/// payload. The engine owns payload encoding; the WAL only guarantees the
/// frame survives intact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub epoch: u64,
    pub op: u8,
    pub payload: Bytes,
}

impl Record {
    pub fn new(epoch: u64, op: u8, payload: impl Into<Bytes>) -> Self {
        Self {
            epoch,
            op,
            payload: payload.into(),
        }
    }

    /// Encoded size of this record's frame.
    pub fn encoded_len(&self) -> usize {
        RECORD_FRAME_HEADER + RECORD_BODY_HEADER + self.payload.len()
    }

    /// Appends the framed record to `buf`.
    pub fn encode_into(&self, buf: &mut BytesMut) {
        let body_len = RECORD_BODY_HEADER + self.payload.len();
        buf.reserve(RECORD_FRAME_HEADER + body_len);
        buf.put_u32_le(body_len as u32);

        // CRC covers epoch || op || payload.
        let mut body = BytesMut::with_capacity(body_len);
        body.put_u64_le(self.epoch);
        body.put_u8(self.op);
        body.put_slice(&self.payload);

        buf.put_u32_le(crc32c::crc32c(&body));
        buf.put_slice(&body);
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        self.encode_into(&mut buf);
        buf.freeze()
    }

    /// Decodes one frame from the front of `data`.
    ///
    /// Returns the decoded record (`None` for a fence) and the number of
    /// bytes consumed. `Incomplete` means the buffer ends mid-frame, which
    /// recovery treats as a torn tail.
    pub fn decode(data: &[u8]) -> Result<(Option<Record>, usize), RecordError> {
        if data.len() < FENCE_SIZE {
            return Err(RecordError::Incomplete);
        }

        let mut cursor = data;
        let body_len = cursor.get_u32_le() as usize;
        if body_len == 0 {
            return Ok((None, FENCE_SIZE));
        }
        if body_len < RECORD_BODY_HEADER {
            // A length that cannot hold epoch + op is garbage, not a short frame.
            return Err(RecordError::Incomplete);
        }
        if cursor.len() < 4 + body_len {
            return Err(RecordError::Incomplete);
        }

        let stored_crc = cursor.get_u32_le();
        let body = &cursor[..body_len];
        let actual_crc = crc32c::crc32c(body);
        if stored_crc != actual_crc {
            return Err(RecordError::CrcMismatch {
                expected: stored_crc,
                actual: actual_crc,
            });
        }

        let mut body_cursor = body;
        let epoch = body_cursor.get_u64_le();
        let op = body_cursor.get_u8();
        if op > OP_DELETE {
            return Err(RecordError::InvalidOp(op));
        }
        let payload = Bytes::copy_from_slice(body_cursor);

        Ok((
            Some(Record { epoch, op, payload }),
            RECORD_FRAME_HEADER + body_len,
        ))
    }
}

/// Appends a fence frame to `buf`.
pub fn encode_fence(buf: &mut BytesMut) {
    buf.put_u32_le(0);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_roundtrip() {
        let record = Record::new(42, OP_UPSERT, Bytes::from_static(b"payload"));
        let encoded = record.encode();
        let (decoded, consumed) = Record::decode(&encoded).unwrap();

        assert_eq!(decoded, Some(record));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let record = Record::new(1, OP_DELETE, Bytes::new());
        let encoded = record.encode();
        let (decoded, consumed) = Record::decode(&encoded).unwrap();

        assert_eq!(decoded, Some(record));
        assert_eq!(consumed, encoded.len());
    }

    #[test]
    fn test_fence_roundtrip() {
        let mut buf = BytesMut::new();
        encode_fence(&mut buf);
        assert_eq!(buf.len(), FENCE_SIZE);

        let (decoded, consumed) = Record::decode(&buf).unwrap();
        assert_eq!(decoded, None);
        assert_eq!(consumed, FENCE_SIZE);
    }

    #[test]
    fn test_crc_mismatch_detected() {
        let record = Record::new(7, OP_INSERT, Bytes::from_static(b"some data"));
        let mut corrupted = record.encode().to_vec();
        let mid = corrupted.len() / 2;
        corrupted[mid] ^= 0xFF;

        let result = Record::decode(&corrupted);
        assert!(matches!(result, Err(RecordError::CrcMismatch { .. })));
    }

    #[test]
    fn test_truncated_frame_is_incomplete() {
        let record = Record::new(7, OP_INSERT, Bytes::from_static(b"some data"));
        let encoded = record.encode();

        for cut in 0..encoded.len() {
            let result = Record::decode(&encoded[..cut]);
            assert!(
                matches!(result, Err(RecordError::Incomplete)),
                "cut at {} should be incomplete",
                cut
            );
        }
    }

    #[test]
    fn test_invalid_op_rejected() {
        let mut buf = BytesMut::new();
        let mut body = BytesMut::new();
        body.put_u64_le(1);
        body.put_u8(99);
        buf.put_u32_le(body.len() as u32);
        buf.put_u32_le(crc32c::crc32c(&body));
        buf.put_slice(&body);

        assert!(matches!(
            Record::decode(&buf),
            Err(RecordError::InvalidOp(99))
        ));
    }

    #[test]
    fn test_back_to_back_frames() {
        let mut buf = BytesMut::new();
        Record::new(1, OP_INSERT, Bytes::from_static(b"a")).encode_into(&mut buf);
        encode_fence(&mut buf);
        Record::new(2, OP_DELETE, Bytes::from_static(b"b")).encode_into(&mut buf);

        let (r1, n1) = Record::decode(&buf).unwrap();
        assert_eq!(r1.unwrap().epoch, 1);
        let (fence, n2) = Record::decode(&buf[n1..]).unwrap();
        assert!(fence.is_none());
        let (r2, _) = Record::decode(&buf[n1 + n2..]).unwrap();
        assert_eq!(r2.unwrap().epoch, 2);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn prop_record_roundtrip(
            epoch in any::<u64>(),
            op in 0u8..=2,
            payload in prop::collection::vec(any::<u8>(), 0..2048),
        ) {
            let record = Record::new(epoch, op, Bytes::from(payload));
            let encoded = record.encode();
            let (decoded, consumed) = Record::decode(&encoded).unwrap();

            prop_assert_eq!(decoded, Some(record));
            prop_assert_eq!(consumed, encoded.len());
        }

        #[test]
        fn prop_corruption_detected(
            epoch in any::<u64>(),
            payload in prop::collection::vec(any::<u8>(), 1..256),
            corrupt_index in any::<prop::sample::Index>(),
        ) {
            let record = Record::new(epoch, OP_UPSERT, Bytes::from(payload));
            let mut corrupted = record.encode().to_vec();
            let idx = corrupt_index.index(corrupted.len());
            corrupted[idx] ^= 0xFF;

            // Either the frame no longer parses or it parses to something else;
            // it must never silently decode back to the original.
            match Record::decode(&corrupted) {
                Ok((decoded, _)) => prop_assert_ne!(decoded, Some(record)),
                Err(_) => {}
            }
        }
    }
}
