//! On-disk codecs for segment records and roster entries.

use crate::error::{Result, SegmentError};
use crate::format::ROSTER_ENTRY_SIZE;
use bytes::{Buf, BufMut, BytesMut};

/// One vector record as persisted in a segment.
///
/// Tombstones carry an empty vector; live records carry exactly the
/// segment's dimension.
#[derive(Debug, Clone, PartialEq)]
pub struct SegmentRecord {
    pub id: String,
    pub id_hash: u64,
    pub tenant: String,
    pub tenant_hash: u64,
    pub namespace: String,
    pub namespace_hash: u64,
    pub tags: Vec<u32>,
    pub created_at: i64,
    pub updated_at: i64,
    pub epoch: u64,
    pub centroid_id: u16,
    pub tombstone: bool,
    pub vector: Vec<f32>,
}

impl SegmentRecord {
    /// Appends the length-prefixed record to `buf`, returning the encoded size.
    pub fn encode_into(&self, buf: &mut BytesMut) -> usize {
        let start = buf.len();
        // Placeholder for the length prefix, patched below.
        buf.put_u32_le(0);

        buf.put_u64_le(self.id_hash);
        buf.put_u64_le(self.tenant_hash);
        buf.put_u64_le(self.namespace_hash);
        buf.put_u64_le(self.epoch);
        buf.put_i64_le(self.created_at);
        buf.put_i64_le(self.updated_at);
        buf.put_u16_le(self.centroid_id);
        buf.put_u8(self.tombstone as u8);
        buf.put_u8(self.tags.len() as u8);
        for &tag in &self.tags {
            buf.put_u32_le(tag);
        }
        buf.put_u16_le(self.id.len() as u16);
        buf.put_slice(self.id.as_bytes());
        buf.put_u16_le(self.tenant.len() as u16);
        buf.put_slice(self.tenant.as_bytes());
        buf.put_u16_le(self.namespace.len() as u16);
        buf.put_slice(self.namespace.as_bytes());
        buf.put_u32_le(self.vector.len() as u32);
        for &v in &self.vector {
            buf.put_f32_le(v);
        }

        let body_len = (buf.len() - start - 4) as u32;
        buf[start..start + 4].copy_from_slice(&body_len.to_le_bytes());
        buf.len() - start
    }

    /// Decodes one record from the front of `data`, returning it and the
    /// bytes consumed.
    pub fn decode(data: &[u8]) -> Result<(SegmentRecord, usize)> {
        if data.len() < 4 {
            return Err(SegmentError::InvalidFormat("truncated record length".into()));
        }
        let mut cursor = data;
        let body_len = cursor.get_u32_le() as usize;
        if cursor.len() < body_len {
            return Err(SegmentError::InvalidFormat("truncated record body".into()));
        }
        let mut body = &cursor[..body_len];

        let id_hash = body.get_u64_le();
        let tenant_hash = body.get_u64_le();
        let namespace_hash = body.get_u64_le();
        let epoch = body.get_u64_le();
        let created_at = body.get_i64_le();
        let updated_at = body.get_i64_le();
        let centroid_id = body.get_u16_le();
        let tombstone = body.get_u8() != 0;
        let tag_count = body.get_u8() as usize;
        let mut tags = Vec::with_capacity(tag_count);
        for _ in 0..tag_count {
            tags.push(body.get_u32_le());
        }
        let id = read_string(&mut body)?;
        let tenant = read_string(&mut body)?;
        let namespace = read_string(&mut body)?;
        let vec_len = body.get_u32_le() as usize;
        if body.len() < vec_len * 4 {
            return Err(SegmentError::InvalidFormat("truncated vector data".into()));
        }
        let mut vector = Vec::with_capacity(vec_len);
        for _ in 0..vec_len {
            vector.push(body.get_f32_le());
        }

        Ok((
            SegmentRecord {
                id,
                id_hash,
                tenant,
                tenant_hash,
                namespace,
                namespace_hash,
                tags,
                created_at,
                updated_at,
                epoch,
                centroid_id,
                tombstone,
                vector,
            },
            4 + body_len,
        ))
    }
}

fn read_string(body: &mut &[u8]) -> Result<String> {
    if body.len() < 2 {
        return Err(SegmentError::InvalidFormat("truncated string length".into()));
    }
    let len = body.get_u16_le() as usize;
    if body.len() < len {
        return Err(SegmentError::InvalidFormat("truncated string data".into()));
    }
    let s = std::str::from_utf8(&body[..len])
        .map_err(|_| SegmentError::InvalidFormat("invalid utf-8 string".into()))?
        .to_string();
    body.advance(len);
    Ok(s)
}

/// Roster entry: enough to rebuild the directory and to seek to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RosterEntry {
    pub id_hash: u64,
    pub epoch: u64,
    /// Byte offset of the record's frame within the file.
    pub offset: u64,
    pub local_id: u32,
    pub tombstone: bool,
}

impl RosterEntry {
    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u64_le(self.id_hash);
        buf.put_u64_le(self.epoch);
        buf.put_u64_le(self.offset);
        buf.put_u32_le(self.local_id);
        buf.put_u8(self.tombstone as u8);
    }

    pub fn decode(data: &[u8]) -> Result<RosterEntry> {
        if data.len() < ROSTER_ENTRY_SIZE {
            return Err(SegmentError::InvalidFormat("truncated roster entry".into()));
        }
        let mut cursor = data;
        Ok(RosterEntry {
            id_hash: cursor.get_u64_le(),
            epoch: cursor.get_u64_le(),
            offset: cursor.get_u64_le(),
            local_id: cursor.get_u32_le(),
            tombstone: cursor.get_u8() != 0,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_record() -> SegmentRecord {
        SegmentRecord {
            id: "v0042".to_string(),
            id_hash: 0xDEAD_BEEF,
            tenant: "acme".to_string(),
            tenant_hash: 11,
            namespace: "products".to_string(),
            namespace_hash: 22,
            tags: vec![3, 7, 12],
            created_at: 1_700_000_000_000_000,
            updated_at: 1_700_000_000_000_001,
            epoch: 99,
            centroid_id: 512,
            tombstone: false,
            vector: vec![0.25, -1.5, 3.0, 0.0],
        }
    }

    #[test]
    fn test_record_roundtrip() {
        let record = sample_record();
        let mut buf = BytesMut::new();
        let written = record.encode_into(&mut buf);
        assert_eq!(written, buf.len());

        let (decoded, consumed) = SegmentRecord::decode(&buf).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(consumed, buf.len());
    }

    #[test]
    fn test_tombstone_record_roundtrip() {
        let mut record = sample_record();
        record.tombstone = true;
        record.vector = Vec::new();

        let mut buf = BytesMut::new();
        record.encode_into(&mut buf);
        let (decoded, _) = SegmentRecord::decode(&buf).unwrap();
        assert!(decoded.tombstone);
        assert!(decoded.vector.is_empty());
    }

    #[test]
    fn test_roster_entry_roundtrip() {
        let entry = RosterEntry {
            id_hash: 42,
            epoch: 7,
            offset: 4096,
            local_id: 3,
            tombstone: true,
        };
        let mut buf = BytesMut::new();
        entry.encode_into(&mut buf);
        assert_eq!(buf.len(), ROSTER_ENTRY_SIZE);
        assert_eq!(RosterEntry::decode(&buf).unwrap(), entry);
    }

    #[test]
    fn test_truncated_record_rejected() {
        let record = sample_record();
        let mut buf = BytesMut::new();
        record.encode_into(&mut buf);

        let result = SegmentRecord::decode(&buf[..buf.len() - 3]);
        assert!(result.is_err());
    }
}
