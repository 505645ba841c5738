//! Rebuild an index for a data file that arrived without one.
//!
//! The data file is scanned PDU by PDU using the length field of each
//! header. Capture timing cannot be recovered, so every rebuilt record has
//! timestamp zero and replays without delays.

use log::{debug, info};
use std::fs::File;
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Write};

use dispr_core::pdu::{header_fragment, pdu_length, PDU_HEADER_LENGTH};
use dispr_core::{FormatError, IndexRecord};

use crate::error::Result;

use super::files::CaptureFiles;

/// Fill `buf` as far as the reader allows, returning how much was read
fn read_up_to(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Scan `data` and write one index record per PDU to `index`.
///
/// Returns the number of records written.
pub fn build_index<R: Read, W: Write>(data: R, mut index: W) -> Result<u64> {
    let mut data = BufReader::new(data);
    let mut header = [0u8; PDU_HEADER_LENGTH];
    let mut position: u64 = 0;
    let mut count: u64 = 0;

    loop {
        let got = read_up_to(&mut data, &mut header)?;
        if got == 0 {
            break;
        }
        if got < PDU_HEADER_LENGTH {
            return Err(FormatError::TruncatedCapture {
                offset: position,
                expected: PDU_HEADER_LENGTH,
                actual: got,
            }
            .into());
        }

        let length = pdu_length(&header).unwrap_or(0) as usize;
        if length < PDU_HEADER_LENGTH {
            return Err(FormatError::UnparsableLength {
                offset: position,
                length: length as i64,
            }
            .into());
        }

        // The header is already consumed; skip the rest of the PDU, however
        // many reads that takes
        let rest = (length - PDU_HEADER_LENGTH) as u64;
        let skipped = io::copy(&mut data.by_ref().take(rest), &mut io::sink())?;
        if skipped < rest {
            return Err(FormatError::TruncatedCapture {
                offset: position,
                expected: length,
                actual: PDU_HEADER_LENGTH + skipped as usize,
            }
            .into());
        }

        let record = IndexRecord::new(header_fragment(&header), position as i64, 0, length as i32);
        index.write_all(&record.encode())?;

        position += length as u64;
        count += 1;
    }

    index.flush()?;
    debug!("Indexed {} PDUs in {} bytes", count, position);
    Ok(count)
}

/// Write the index file of `files` from its data file, replacing any existing index
pub fn build_index_file(files: &CaptureFiles) -> Result<u64> {
    let data = File::open(&files.data)?;
    let index = BufWriter::new(File::create(&files.index)?);
    let count = build_index(data, index)?;
    info!("Rebuilt index {} with {} records", files.index.display(), count);
    Ok(count)
}
