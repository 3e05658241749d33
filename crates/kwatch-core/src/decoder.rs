//! Conversion between raw probe records and [`SyscallEvent`]s.
//!
//! See [`probe_common::record`] for the binary layout. Strings end at the
//! first NUL byte or at the end of their slot, whichever comes first, and
//! invalid UTF-8 is replaced with U+FFFD. A path filling the whole slot was
//! probably cut by the probe: this is accepted and not reported.

use bytes::Buf;
use probe_common::{
    RawRecord,
    record::{COMM_LEN, PATH_LEN, RECORD_SIZE, RecordFields},
};
use thiserror::Error;

use crate::event::{SyscallEvent, SyscallKind, truncate_str};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DecodeError {
    #[error("truncated record: expected {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("invalid syscall kind tag {0}")]
    InvalidKind(u8),
}

/// Decode a record. Trailing bytes past the layout are ignored.
pub fn decode(record: &RawRecord) -> Result<SyscallEvent, DecodeError> {
    let mut buf = record.as_bytes();
    if buf.len() < RECORD_SIZE {
        return Err(DecodeError::Truncated {
            expected: RECORD_SIZE,
            actual: buf.len(),
        });
    }

    let sequence = buf.get_u64_le();
    let kind_tag = buf.get_u8();
    let kind = SyscallKind::from_tag(kind_tag).ok_or(DecodeError::InvalidKind(kind_tag))?;
    buf.advance(3);
    let pid = buf.get_u32_le();
    let comm = c_string(&buf[..COMM_LEN]);
    buf.advance(COMM_LEN);
    let path = c_string(&buf[..PATH_LEN]);
    buf.advance(PATH_LEN);
    let timestamp = buf.get_u64_le();

    Ok(SyscallEvent {
        sequence,
        kind,
        pid,
        comm: truncate_str(&comm, COMM_LEN).to_string(),
        path: truncate_str(&path, PATH_LEN).to_string(),
        timestamp: timestamp.into(),
    })
}

/// Serialize an event with the probe layout, stamped with its own sequence.
pub fn encode(event: &SyscallEvent) -> RawRecord {
    RawRecord::encode(&RecordFields {
        sequence: event.sequence,
        kind_tag: event.kind.tag(),
        pid: event.pid,
        comm: truncate_str(&event.comm, COMM_LEN).as_bytes(),
        path: truncate_str(&event.path, PATH_LEN).as_bytes(),
        timestamp: event.timestamp.raw(),
    })
}

fn c_string(slot: &[u8]) -> String {
    let end = slot.iter().position(|&c| c == 0).unwrap_or(slot.len());
    String::from_utf8_lossy(&slot[..end]).into_owned()
}
