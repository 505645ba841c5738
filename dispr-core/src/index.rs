//! Capture index file format.
//!
//! An index file is a plain sequence of fixed-size records, one per captured
//! PDU, with no header or footer. Each record locates one payload inside the
//! paired data file:
//!
//! ```text
//! offset  size  field
//! ──────  ────  ─────────────────────────────────────────────
//!      0     3  header fragment (first 3 bytes of the payload)
//!      3     8  data file offset          (i64, big-endian)
//!     11     8  capture timestamp in ns   (i64, big-endian)
//!     19     4  payload length in bytes   (i32, big-endian)
//! ```
//!
//! Timestamps are relative to the first record of the capture session.
//! Indexes rebuilt from a data file alone carry a timestamp of zero.

use serde::{Deserialize, Serialize};

use crate::error::FormatError;
use crate::pdu::PDU_TYPE_OFFSET;

/// Version of the index record layout described above
pub const INDEX_FORMAT_VERSION: u16 = 1;

/// Number of leading payload bytes kept in each record
pub const HEADER_FRAGMENT_SIZE: usize = 3;

/// Byte offset of the header fragment
pub const HEADER_FRAGMENT_OFFSET: usize = 0;

/// Byte offset of the data file pointer
pub const FILE_OFFSET_OFFSET: usize = HEADER_FRAGMENT_OFFSET + HEADER_FRAGMENT_SIZE;

/// Byte offset of the relative capture timestamp
pub const TIMESTAMP_OFFSET: usize = FILE_OFFSET_OFFSET + 8;

/// Byte offset of the payload length
pub const LENGTH_OFFSET: usize = TIMESTAMP_OFFSET + 8;

/// Size of one index record in bytes (3 + 8 + 8 + 4)
pub const RECORD_SIZE: usize = LENGTH_OFFSET + 4;

/// One entry of a capture index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexRecord {
    /// First bytes of the payload, enough to read the PDU type
    pub header: [u8; HEADER_FRAGMENT_SIZE],
    /// Offset of the payload in the data file
    pub offset: i64,
    /// Nanoseconds since the first record of the session
    pub timestamp_ns: i64,
    /// Payload length in bytes, always positive
    pub length: i32,
}

impl IndexRecord {
    pub fn new(header: [u8; HEADER_FRAGMENT_SIZE], offset: i64, timestamp_ns: i64, length: i32) -> Self {
        Self {
            header,
            offset,
            timestamp_ns,
            length,
        }
    }

    /// Serialize into the fixed 23-byte layout
    pub fn encode(&self) -> [u8; RECORD_SIZE] {
        let mut buf = [0u8; RECORD_SIZE];

        buf[HEADER_FRAGMENT_OFFSET..FILE_OFFSET_OFFSET].copy_from_slice(&self.header);
        buf[FILE_OFFSET_OFFSET..TIMESTAMP_OFFSET].copy_from_slice(&self.offset.to_be_bytes());
        buf[TIMESTAMP_OFFSET..LENGTH_OFFSET].copy_from_slice(&self.timestamp_ns.to_be_bytes());
        buf[LENGTH_OFFSET..RECORD_SIZE].copy_from_slice(&self.length.to_be_bytes());

        buf
    }

    /// Deserialize from the first [`RECORD_SIZE`] bytes of `bytes`
    pub fn decode(bytes: &[u8]) -> Result<Self, FormatError> {
        if bytes.len() < RECORD_SIZE {
            return Err(FormatError::MalformedRecord {
                detail: format!("expected {} bytes, got {}", RECORD_SIZE, bytes.len()),
            });
        }

        let header = field(bytes, HEADER_FRAGMENT_OFFSET, FILE_OFFSET_OFFSET);
        let offset = i64::from_be_bytes(field(bytes, FILE_OFFSET_OFFSET, TIMESTAMP_OFFSET));
        let timestamp_ns = i64::from_be_bytes(field(bytes, TIMESTAMP_OFFSET, LENGTH_OFFSET));
        let length = i32::from_be_bytes(field(bytes, LENGTH_OFFSET, RECORD_SIZE));

        if length <= 0 {
            return Err(FormatError::MalformedRecord {
                detail: format!("payload length {} at offset {}", length, offset),
            });
        }
        if offset < 0 {
            return Err(FormatError::MalformedRecord {
                detail: format!("negative data file offset {}", offset),
            });
        }

        Ok(Self {
            header,
            offset,
            timestamp_ns,
            length,
        })
    }

    /// PDU type discriminator, taken from the header fragment
    pub fn pdu_type(&self) -> u8 {
        self.header[PDU_TYPE_OFFSET]
    }

    /// Offset just past this record's payload
    pub fn end_offset(&self) -> i64 {
        self.offset + self.length as i64
    }
}

/// Bytes `start..end` of `bytes` as a fixed-size array; `end - start` must be `N`
fn field<const N: usize>(bytes: &[u8], start: usize, end: usize) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[start..end]);
    out
}

/// Encode a record without building an [`IndexRecord`] first
pub fn encode(header: [u8; HEADER_FRAGMENT_SIZE], offset: i64, timestamp_ns: i64, length: i32) -> [u8; RECORD_SIZE] {
    IndexRecord::new(header, offset, timestamp_ns, length).encode()
}

/// Byte position of record `index` inside an index file
pub fn record_position(index: u64) -> u64 {
    index * RECORD_SIZE as u64
}

/// Number of complete records in an index file of `len` bytes
pub fn record_count(len: u64) -> u64 {
    len / RECORD_SIZE as u64
}

/// Bytes left over after the last complete record (non-zero means a damaged file)
pub fn trailing_bytes(len: u64) -> u64 {
    len % RECORD_SIZE as u64
}

/// Result of decoding a whole index file held in memory
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DecodedIndex {
    pub records: Vec<IndexRecord>,
    /// Length of an incomplete record at the end, if any
    pub trailing: usize,
}

/// Decode every complete record in `bytes`.
///
/// A partial record at the end is reported in [`DecodedIndex::trailing`]
/// rather than failing the whole file; a complete but invalid record fails.
pub fn decode_all(bytes: &[u8]) -> Result<DecodedIndex, FormatError> {
    let mut chunks = bytes.chunks_exact(RECORD_SIZE);
    let records = chunks
        .by_ref()
        .map(IndexRecord::decode)
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DecodedIndex {
        records,
        trailing: chunks.remainder().len(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_size() {
        assert_eq!(RECORD_SIZE, 23);
        assert_eq!(FILE_OFFSET_OFFSET, 3);
        assert_eq!(TIMESTAMP_OFFSET, 11);
        assert_eq!(LENGTH_OFFSET, 19);
    }

    #[test]
    fn test_encode_layout_is_big_endian() {
        let buf = encode([7, 1, 2], 0x0102, 0x0A0B, 140);

        assert_eq!(&buf[0..3], &[7, 1, 2]);
        assert_eq!(&buf[3..11], &[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        assert_eq!(&buf[11..19], &[0, 0, 0, 0, 0, 0, 0x0A, 0x0B]);
        assert_eq!(&buf[19..23], &[0, 0, 0, 140]);
    }

    #[test]
    fn test_decode_reads_back_fields() {
        let record = IndexRecord::new([6, 1, 1], 1_000_000_000_000, 170_000_000, 64);
        let decoded = IndexRecord::decode(&record.encode()).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.pdu_type(), 1);
        assert_eq!(decoded.end_offset(), 1_000_000_000_064);
    }

    #[test]
    fn test_decode_hand_laid_bytes() {
        let mut buf = vec![0u8; 25];
        buf[..3].copy_from_slice(&[3, 1, 2]);
        buf[3..11].copy_from_slice(&[0, 0, 0, 0, 0, 0, 0x01, 0x02]);
        buf[11..19].copy_from_slice(&[0xFF; 8]);
        buf[19..23].copy_from_slice(&[0, 0, 0x01, 0x00]);
        buf[23..].copy_from_slice(&[9, 9]);

        let record = IndexRecord::decode(&buf).unwrap();
        assert_eq!(record.header, [3, 1, 2]);
        assert_eq!(record.offset, 0x0102);
        assert_eq!(record.timestamp_ns, -1);
        assert_eq!(record.length, 256);
    }

    #[test]
    fn test_decode_short_buffer() {
        let buf = encode([0, 0, 1], 0, 0, 20);
        let err = IndexRecord::decode(&buf[..22]).unwrap_err();
        assert!(matches!(err, FormatError::MalformedRecord { .. }));
    }

    #[test]
    fn test_decode_rejects_non_positive_length() {
        for length in [0, -1, i32::MIN] {
            let buf = encode([0, 0, 1], 0, 0, length);
            assert!(matches!(
                IndexRecord::decode(&buf),
                Err(FormatError::MalformedRecord { .. })
            ));
        }
    }

    #[test]
    fn test_decode_all_three_records() {
        let lengths = [20, 140, 64];
        let timestamps = [0, 50_000_000, 170_000_000];
        let mut bytes = Vec::new();
        let mut offset = 0i64;
        for (len, ts) in lengths.iter().zip(timestamps) {
            bytes.extend_from_slice(&encode([6, 1, 1], offset, ts, *len));
            offset += *len as i64;
        }

        assert_eq!(bytes.len(), 69);
        assert_eq!(record_count(bytes.len() as u64), 3);
        assert_eq!(trailing_bytes(bytes.len() as u64), 0);

        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded.trailing, 0);
        assert_eq!(decoded.records.len(), 3);
        assert_eq!(decoded.records[1].offset, 20);
        assert_eq!(decoded.records[2].offset, 160);
        assert_eq!(decoded.records[2].timestamp_ns, 170_000_000);
    }

    #[test]
    fn test_decode_all_reports_trailing_bytes() {
        let mut bytes = encode([6, 1, 1], 0, 0, 12).to_vec();
        bytes.extend_from_slice(&[1, 2, 3, 4, 5]);

        let decoded = decode_all(&bytes).unwrap();
        assert_eq!(decoded.records.len(), 1);
        assert_eq!(decoded.trailing, 5);
        assert_eq!(trailing_bytes(bytes.len() as u64), 5);
    }

    #[test]
    fn test_record_position() {
        assert_eq!(record_position(0), 0);
        assert_eq!(record_position(2), 46);
    }
}
