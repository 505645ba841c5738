//! Capture and replay of DIS traffic.
//!
//! This module provides:
//! - Capture file pairs (`.disbin` data plus `.disbinidx` index)
//! - The capture engine ([`Grabber`])
//! - Index reconstruction for data files without an index
//! - The replay engine ([`Player`])

pub mod files;
pub mod grabber;
pub mod index_builder;
pub mod player;

pub use files::{free_capture_path, index_path_for, CaptureFiles, DATA_EXTENSION, INDEX_EXTENSION};
pub use grabber::{Capture, CaptureConfig, CaptureEnd, Grabber, SharedRecords};
pub use index_builder::{build_index, build_index_file};
pub use player::{PlaybackOptions, Player, PlayerConfig, StopReason};
