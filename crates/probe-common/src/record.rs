//! Raw event record written by the probes.
//!
//! The probes emit one fixed-size record per syscall, laid out as the
//! following `repr(C)` struct (little-endian, natural alignment):
//!
//! ```text
//! struct raw_event {
//!     u64  sequence;        //    0
//!     u8   kind_tag;        //    8  (+3 bytes padding)
//!     u32  pid;             //   12
//!     char comm[16];        //   16
//!     char path[4096];      //   32
//!     u64  timestamp;       // 4128
//! };                        // 4136
//! ```
//!
//! Any change on the probe side requires a matching decoder version.

use bytes::{BufMut, Bytes, BytesMut};

pub const COMM_LEN: usize = 16;
pub const PATH_LEN: usize = 4096;

pub const SEQUENCE_OFFSET: usize = 0;
pub const KIND_OFFSET: usize = 8;
pub const PID_OFFSET: usize = 12;
pub const COMM_OFFSET: usize = 16;
pub const PATH_OFFSET: usize = COMM_OFFSET + COMM_LEN;
pub const TIMESTAMP_OFFSET: usize = PATH_OFFSET + PATH_LEN;

/// Total size of a record in bytes.
pub const RECORD_SIZE: usize = TIMESTAMP_OFFSET + 8;

/// `kind_tag` values. Zero is never emitted by the probes.
pub const KIND_EXEC: u8 = 1;
pub const KIND_OPENAT: u8 = 2;
pub const KIND_OPENAT2: u8 = 3;

/// A single record as delivered by an [`crate::EventChannel`], not yet validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord(Bytes);

/// Field values used to build a [`RawRecord`].
#[derive(Debug, Clone, Copy)]
pub struct RecordFields<'a> {
    pub sequence: u64,
    pub kind_tag: u8,
    pub pid: u32,
    pub comm: &'a [u8],
    pub path: &'a [u8],
    pub timestamp: u64,
}

impl RawRecord {
    pub fn new(bytes: Bytes) -> Self {
        Self(bytes)
    }

    /// Serialize the given fields with the probe layout. String fields longer
    /// than their slot are cut at the slot size, like the probe helpers do.
    pub fn encode(fields: &RecordFields) -> Self {
        let mut buf = BytesMut::with_capacity(RECORD_SIZE);
        buf.put_u64_le(fields.sequence);
        buf.put_u8(fields.kind_tag);
        buf.put_bytes(0, PID_OFFSET - KIND_OFFSET - 1);
        buf.put_u32_le(fields.pid);
        put_fixed(&mut buf, fields.comm, COMM_LEN);
        put_fixed(&mut buf, fields.path, PATH_LEN);
        buf.put_u64_le(fields.timestamp);
        debug_assert_eq!(buf.len(), RECORD_SIZE);
        Self(buf.freeze())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Sequence number stamped by the probe, `None` if the record is too
    /// short to contain one.
    pub fn sequence(&self) -> Option<u64> {
        let bytes = self.0.get(SEQUENCE_OFFSET..SEQUENCE_OFFSET + 8)?;
        Some(u64::from_le_bytes(bytes.try_into().ok()?))
    }
}

impl From<Bytes> for RawRecord {
    fn from(bytes: Bytes) -> Self {
        Self(bytes)
    }
}

fn put_fixed(buf: &mut BytesMut, value: &[u8], slot: usize) {
    let len = value.len().min(slot);
    buf.put_slice(&value[..len]);
    buf.put_bytes(0, slot - len);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_matches_probe_struct() {
        assert_eq!(PATH_OFFSET, 32);
        assert_eq!(TIMESTAMP_OFFSET, 4128);
        assert_eq!(RECORD_SIZE, 4136);
    }

    #[test]
    fn encode_places_fields_at_offsets() {
        let record = RawRecord::encode(&RecordFields {
            sequence: 7,
            kind_tag: 2,
            pid: 42,
            comm: b"cat",
            path: b"/srv/.env",
            timestamp: 99,
        });
        let bytes = record.as_bytes();
        assert_eq!(record.len(), RECORD_SIZE);
        assert_eq!(record.sequence(), Some(7));
        assert_eq!(bytes[KIND_OFFSET], 2);
        assert_eq!(&bytes[PID_OFFSET..PID_OFFSET + 4], &42u32.to_le_bytes());
        assert_eq!(&bytes[COMM_OFFSET..COMM_OFFSET + 4], b"cat\0");
        assert_eq!(&bytes[PATH_OFFSET..PATH_OFFSET + 9], b"/srv/.env");
        assert_eq!(&bytes[TIMESTAMP_OFFSET..], &99u64.to_le_bytes());
    }

    #[test]
    fn oversized_strings_are_cut_to_slot() {
        let comm = [b'x'; 40];
        let record = RawRecord::encode(&RecordFields {
            sequence: 0,
            kind_tag: 1,
            pid: 1,
            comm: &comm,
            path: b"/",
            timestamp: 0,
        });
        assert_eq!(record.len(), RECORD_SIZE);
        assert_eq!(
            &record.as_bytes()[COMM_OFFSET..PATH_OFFSET],
            &[b'x'; COMM_LEN]
        );
        assert_eq!(record.as_bytes()[PATH_OFFSET], b'/');
    }

    #[test]
    fn short_record_has_no_sequence() {
        let record = RawRecord::new(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(record.sequence(), None);
    }
}
