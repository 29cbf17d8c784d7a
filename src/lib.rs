//! Synheart Link - On-device BLE link for Synheart wearable bands
//!
//! Link keeps a band connected in the background and turns its notification
//! stream into health samples: raw byte chunks → frame decoding → record
//! interpretation → bounded, durable history → events for the application.
//!
//! ## Modules
//!
//! - **Stream**: `decoder` cuts frames out of the byte stream, `interpreter`
//!   turns them into samples or wear reminders
//! - **State**: `history` and `storage` keep samples and settings across restarts
//! - **Link**: `connection` drives the transport through the link state machine
//!   and reconnects after drops; `service` hosts it as a long-running process
//! - **Application boundary**: `bridge` events, `commands`, and the C ABI in `ffi`

pub mod bridge;
pub mod commands;
pub mod config;
pub mod connection;
pub mod decoder;
pub mod error;
pub mod history;
pub mod interpreter;
pub mod platform;
pub mod service;
pub mod steps;
pub mod storage;
pub mod transport;
pub mod types;

#[cfg(feature = "btleplug")]
pub mod btleplug_backend;

// FFI bindings for C interop (always available for cdylib/staticlib builds)
pub mod ffi;

pub use bridge::{Bridge, BroadcastSink, ChannelSink, EventSink};
pub use commands::{Command, CommandHandler, CommandResponse};
pub use config::LinkConfig;
pub use connection::{ConnectionManager, LinkDeps};
pub use decoder::FrameDecoder;
pub use error::{CommandError, ConfigError, ServiceError, StoreError, TransportError};
pub use history::HistoryStore;
pub use interpreter::{Clock, RecordInterpreter, SystemClock};
pub use service::{HealthService, StartOutcome};
pub use steps::StepCounter;
pub use storage::{FileStore, KeyValueStore, MemoryStore};
pub use transport::{Transport, TransportEvent};
pub use types::{BridgeEvent, DeviceIdentity, HealthSample, LinkState, Record};

/// Link library version
pub const LINK_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Producer name reported by diagnostics
pub const PRODUCER_NAME: &str = "synheart-link";
