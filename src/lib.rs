//! # Burrow
//!
//! A secure, multiplexing tunnel client. Burrow accepts traffic on local
//! TCP/UDP endpoints, encrypts and frames it, and forwards it through a pool
//! of authenticated, multiplexed transport connections to a remote
//! counterpart, scaling worker and connection concurrency to load while
//! enforcing idle/ping timeouts.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                 Project Orchestrator                 │
//! │     (endpoint registrations, lifecycle, pings)       │
//! ├─────────────────────────────────────────────────────┤
//! │                 Transceiver Client                   │
//! │   (logical channels over pooled physical links)      │
//! ├─────────────────────────────────────────────────────┤
//! │                  AEAD Stream Codec                   │
//! │      (framing, encryption, implicit nonces)          │
//! ├──────────────────────────┬──────────────────────────┤
//! │       Worker Pool        │         Ticker           │
//! │  (bounded task runners)  │  (shared timeout loop)   │
//! ├──────────────────────────┴──────────────────────────┤
//! │                  Network Boundary                    │
//! │        (connections, dialers, TCP and UDP)           │
//! └─────────────────────────────────────────────────────┘
//! ```

pub mod codec;
pub mod config;
pub mod network;
pub mod project;
pub mod ticker;
pub mod transceiver;
pub mod worker;

pub use config::Config;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] codec::CodecError),

    #[error("Ticker error: {0}")]
    Ticker(#[from] ticker::TickerError),

    #[error("Worker error: {0}")]
    Worker(#[from] worker::WorkerError),

    #[error("Transceiver error: {0}")]
    Transceiver(#[from] transceiver::TransceiverError),

    #[error("Project error: {0}")]
    Project(#[from] project::ProjectError),

    #[error("Network error: {0}")]
    Network(#[from] network::NetworkError),

    #[error("Configuration error: {0}")]
    Config(String),
}
