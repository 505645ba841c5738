//! # dispr Core
//!
//! Platform-independent pieces of the DIS player/recorder.
//!
//! This crate contains the capture index format, PDU header framing and the
//! session state machine. It has **no I/O dependencies**: sockets, files
//! and worker threads live in the `dispr` crate, which drives the types
//! defined here.
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  dispr-core (no sockets, no threads)                        │
//! │  ├── index     (23-byte index record codec)                 │
//! │  ├── pdu       (header fields the recorder depends on)      │
//! │  └── state     (session state machine, control set)         │
//! └─────────────────────────────────────────────────────────────┘
//!                              ▲
//!               ┌──────────────┴──────────────┐
//!               │  dispr                      │
//!               │  (Grabber, Player, sockets) │
//!               └─────────────────────────────┘
//! ```
//!
//! ## Example: Driving the State Machine
//!
//! ```rust
//! use dispr_core::{Effect, SessionEvent, SessionMachine, SessionState};
//!
//! let mut machine = SessionMachine::new();
//! let effects = machine.handle(SessionEvent::Record).unwrap();
//! assert_eq!(effects, vec![Effect::StartCapture]);
//! assert_eq!(machine.state(), SessionState::Recording);
//!
//! // Playing while recording is a control synchronisation bug
//! assert!(machine.handle(SessionEvent::Play).is_err());
//! ```

pub mod error;
pub mod index;
pub mod pdu;
pub mod state;

pub use error::{FormatError, InvalidTransition};
pub use index::{IndexRecord, INDEX_FORMAT_VERSION, RECORD_SIZE};
pub use state::{
    transition, Controls, Effect, Engine, PlaybackMode, SessionEvent, SessionMachine, SessionState,
    Transition,
};
