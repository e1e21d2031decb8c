//! voicebridge - real-time, full-duplex voice conversation server.
//!
//! A persistent per-connection pipeline that chains voice-activity
//! detection, speech recognition, an LLM chat engine, and speech synthesis
//! behind uniform capability traits, streaming text and audio back to the
//! client on the same connection it arrived on.

pub mod adapters;
pub mod audio;
pub mod capability;
pub mod cli;
pub mod config;
pub mod conversation;
pub mod error;
pub mod protocol;
pub mod session;

pub use config::Config;
pub use protocol::{router, ServerState};

/// Library version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
