//! Error type for the capture and replay engines

use std::io;
use std::net::SocketAddrV4;

use dispr_core::{FormatError, InvalidTransition, SessionState};
use thiserror::Error;

/// Errors surfaced to the caller of the engines and the controller
#[derive(Error, Debug)]
pub enum Error {
    /// Socket could not be bound or the multicast group could not be joined
    #[error("Cannot bind {addr}: {source}")]
    Bind {
        addr: SocketAddrV4,
        #[source]
        source: io::Error,
    },

    /// File or socket I/O failed
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Index record or data file content is not usable
    #[error(transparent)]
    Format(#[from] FormatError),

    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Port does not fit in 16 bits
    #[error("Port must be a 16-bit number, got {0}")]
    InvalidPort(u32),

    /// Network interface name did not resolve to an IPv4 address
    #[error("No IPv4 address for interface '{0}'")]
    InvalidInterface(String),

    /// Replay requested with no capture loaded
    #[error("No capture loaded")]
    NoCapture,

    /// File operation attempted while an engine is running
    #[error("Not allowed while {0}")]
    Busy(SessionState),
}

pub type Result<T> = std::result::Result<T, Error>;
