//! DIS PDU header framing.
//!
//! Only the parts of the header that capture and index rebuilding depend on
//! are described here. Payloads are never decoded beyond these fields.

use crate::index::HEADER_FRAGMENT_SIZE;

/// Fixed length of a DIS PDU header in bytes
pub const PDU_HEADER_LENGTH: usize = 12;

/// Offset of the PDU type discriminator within the header
pub const PDU_TYPE_OFFSET: usize = 2;

/// Offset of the big-endian 16-bit PDU length field within the header
pub const PDU_LENGTH_FIELD_OFFSET: usize = 8;

/// Size of the PDU length field
pub const PDU_LENGTH_FIELD_LENGTH: usize = 2;

/// Largest UDP payload that can arrive in one IPv4 datagram
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// Read the PDU length field from a header.
///
/// Returns `None` when `header` is too short to contain the field.
pub fn pdu_length(header: &[u8]) -> Option<u16> {
    let field = header.get(PDU_LENGTH_FIELD_OFFSET..PDU_LENGTH_FIELD_OFFSET + PDU_LENGTH_FIELD_LENGTH)?;
    Some(u16::from_be_bytes([field[0], field[1]]))
}

/// Read the PDU type discriminator
pub fn pdu_type(payload: &[u8]) -> Option<u8> {
    payload.get(PDU_TYPE_OFFSET).copied()
}

/// Leading bytes of a payload as stored in an index record, zero padded
pub fn header_fragment(payload: &[u8]) -> [u8; HEADER_FRAGMENT_SIZE] {
    let mut fragment = [0u8; HEADER_FRAGMENT_SIZE];
    let n = payload.len().min(HEADER_FRAGMENT_SIZE);
    fragment[..n].copy_from_slice(&payload[..n]);
    fragment
}
