//! Transceiver client
//!
//! Multiplexes logical channels over a smaller pool of physical
//! connections. Each physical link carries up to `connection_channels`
//! concurrently active channels through one AEAD codec; new links are dialed
//! on saturation up to `max_concurrent`, and idle links are reaped through
//! the shared ticker.

mod client;
mod frame;

pub use client::{Channel, Client, CodecBuilder, Requester};
pub use frame::{ChannelFrame, FrameType, FRAME_HEADER_SIZE};

use crate::codec::CodecError;
use crate::network::NetworkError;
use std::time::Duration;
use thiserror::Error;

/// Transceiver errors
#[derive(Debug, Error)]
pub enum TransceiverError {
    #[error("transceiver is closed")]
    Closed,

    #[error("all {max_concurrent} connection slots are busy")]
    Exhausted { max_concurrent: usize },

    #[error("connection setup exceeded {timeout:?}")]
    DialTimeout { timeout: Duration },

    #[error("invalid channel frame: {0}")]
    Frame(&'static str),

    #[error("transceiver misconfigured: {reason}")]
    Misconfigured { reason: &'static str },

    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    #[error("network error: {0}")]
    Network(#[from] NetworkError),
}

/// Transceiver configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Ceiling on concurrently open physical connections
    pub max_concurrent: usize,
    /// Retries per channel request; kept minimal because the owning
    /// orchestrator layers its own retry on top
    pub request_retries: usize,
    /// Idle time before a persistent physical connection is reaped
    pub idle_timeout: Duration,
    /// Bound on dialing and handshaking a new physical connection
    pub initial_timeout: Duration,
    /// Keep physical connections pooled across requests once idle
    pub connection_persistent: bool,
    /// Logical channels sharing one physical connection
    pub connection_channels: usize,
}
