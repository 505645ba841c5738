//! # dispr
//!
//! Capture and replay of DIS (Distributed Interactive Simulation) traffic.
//!
//! This crate:
//! - Joins a multicast group and records every datagram into a `.disbin`
//!   data file plus a fixed-width `.disbinidx` index
//! - Rebuilds a missing index from the PDU headers in a data file
//! - Replays a capture with its recorded timing, forward or reverse, at
//!   normal or fast speed, with pause, single step, looping and a send count
//! - Keeps the capture and replay engines in step with the session state
//!   machine from [`dispr_core`]
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │                          dispr                             │
//! │  ┌──────────────┐    notices     ┌──────────────────────┐  │
//! │  │ Controller   │◄───(channel)───│ Grabber  (thread)    │  │
//! │  │ SessionMachine│               │ Player   (thread)    │  │
//! │  └──────┬───────┘───effects─────►└──────────┬───────────┘  │
//! │         │                                   │              │
//! │         ▼                                   ▼              │
//! │  ┌──────────────┐                 ┌──────────────────────┐ │
//! │  │ CaptureFiles │                 │ network (socket2)    │ │
//! │  │ index builder│                 │ multicast join/send  │ │
//! │  └──────────────┘                 └──────────────────────┘ │
//! └────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example: Record and Replay
//!
//! ```rust,no_run
//! use dispr::{Config, Controller};
//! use dispr_core::SessionEvent;
//! use std::time::Duration;
//!
//! let mut controller = Controller::from_config(&Config::default()).unwrap();
//! controller.handle(SessionEvent::Record).unwrap();
//! std::thread::sleep(Duration::from_secs(10));
//! controller.handle(SessionEvent::RecordStop).unwrap();
//!
//! controller.handle(SessionEvent::Play).unwrap();
//! while controller.state().is_playing() {
//!     controller.pump_timeout(Duration::from_millis(100)).unwrap();
//! }
//! ```

use clap::{Parser, Subcommand};
use std::net::Ipv4Addr;
use std::path::PathBuf;

pub mod config;
pub mod controller;
pub mod error;
pub mod listener;
pub mod network;
pub mod recording;

pub use config::Config;
pub use controller::{Controller, Notice};
pub use error::{Error, Result};
pub use network::MulticastTarget;
pub use recording::{Capture, CaptureFiles, Grabber, PlaybackOptions, Player, StopReason};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Parser, Clone, Debug)]
#[command(version, about, long_about = None)]
pub struct Cli {
    #[clap(flatten)]
    pub verbose: clap_verbosity_flag::Verbosity<clap_verbosity_flag::InfoLevel>,

    /// Multicast group to capture from and replay to
    #[arg(short, long, global = true)]
    pub group: Option<Ipv4Addr>,

    /// UDP port, 0 to 65535
    #[arg(short, long, global = true)]
    pub port: Option<u32>,

    /// Limit multicast to a specific network interface
    #[arg(short, long, global = true)]
    pub interface: Option<String>,

    /// Configuration file, instead of the one in the user config directory
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Capture traffic and save it
    Record {
        /// Data file to write; the index is written next to it
        out: PathBuf,

        /// Stop after this many seconds
        #[arg(short, long)]
        seconds: Option<u64>,

        /// Stop once the data file grows past this many bytes
        #[arg(long)]
        size_limit: Option<u64>,

        /// Replace `out` if it exists, instead of picking a free name
        #[arg(long, default_value_t = false)]
        overwrite: bool,
    },

    /// Replay a capture
    Play {
        file: PathBuf,

        #[arg(short, long, default_value_t = false)]
        reverse: bool,

        /// Ignore recorded timing and send at the fast interval
        #[arg(short, long, default_value_t = false)]
        fast: bool,

        #[arg(short, long = "loop", default_value_t = false)]
        looping: bool,

        /// Stop after this many datagrams
        #[arg(short = 'n', long)]
        count: Option<u64>,

        /// Record to start at
        #[arg(short, long)]
        start: Option<u64>,
    },

    /// Rebuild the index of a data file
    Reindex {
        file: PathBuf,

        /// Rebuild even if an index exists
        #[arg(long, default_value_t = false)]
        force: bool,
    },

    /// Print the index of a capture
    List {
        file: PathBuf,

        #[arg(long, default_value_t = false)]
        json: bool,
    },
}

impl Cli {
    /// Configuration file contents with command line overrides applied
    pub fn config(&self) -> Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::load(path)?,
            None => Config::load_default()?,
        };

        if let Some(group) = self.group {
            config.group = group;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(interface) = &self.interface {
            config.interface = Some(interface.clone());
        }
        if let Command::Record {
            size_limit: Some(size_limit),
            ..
        } = self.command
        {
            config.size_limit = size_limit;
        }

        // Reject a bad port before anything is bound
        config.target()?;
        Ok(config)
    }
}
