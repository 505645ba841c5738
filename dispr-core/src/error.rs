//! Error types for the capture format and the session state machine

use thiserror::Error;

use crate::state::{SessionEvent, SessionState};

/// Errors that can occur when decoding index records or rebuilding an index
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FormatError {
    /// Index record is truncated or carries an impossible payload length
    #[error("Malformed index record: {detail}")]
    MalformedRecord { detail: String },

    /// Data file ends inside a PDU header or payload
    #[error("Truncated capture at offset {offset}: expected {expected} bytes, got {actual}")]
    TruncatedCapture {
        offset: u64,
        expected: usize,
        actual: usize,
    },

    /// PDU header length field cannot describe a PDU
    #[error("Length field not parsed in PDU at offset {offset}: {length}")]
    UnparsableLength { offset: u64, length: i64 },
}

/// An event arrived that the current state does not accept.
///
/// This is a control-surface synchronisation bug: the control for `event`
/// should have been disabled while in `state`.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("Program error in session state machine: got {event} in {state}")]
pub struct InvalidTransition {
    pub state: SessionState,
    pub event: SessionEvent,
}
