//! Network boundary
//!
//! Collaborator interfaces the core is written against:
//! - `Connection`: a byte stream with an identifier, independent timeout
//!   setters and a closed notification
//! - `Listener`/`Acceptor`: inbound connection sources
//! - `Dial`: outbound connection factories
//!
//! Concrete TCP and UDP wrappers live in the `tcp` and `udp` submodules.

pub mod tcp;
pub mod udp;

use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

/// Network errors
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("operation timed out")]
    Timeout,

    #[error("connection closed")]
    Closed,

    #[error("unresolvable address: {0}")]
    InvalidAddress(String),
}

/// Stable identifier of a connection
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Read side of a split connection
pub type ConnectionReadHalf = Box<dyn AsyncRead + Send + Unpin>;

/// Write side of a split connection
pub type ConnectionWriteHalf = Box<dyn AsyncWrite + Send + Unpin>;

/// One-shot closed-notification handle.
///
/// Resolves once the connection is closed locally or its owner goes away.
#[derive(Debug, Clone)]
pub struct ClosedSignal {
    rx: watch::Receiver<bool>,
}

impl ClosedSignal {
    pub(crate) fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// Wait until the connection is closed.
    pub async fn wait(mut self) {
        loop {
            if *self.rx.borrow() {
                return;
            }

            // A dropped sender means the connection owner is gone
            if self.rx.changed().await.is_err() {
                return;
            }
        }
    }
}

/// A network connection
#[async_trait]
pub trait Connection: Send {
    /// Stable identifier for logging and bookkeeping
    fn id(&self) -> &ConnectionId;

    /// Bound both directions when no per-direction timeout is set
    fn set_timeout(&mut self, timeout: Option<Duration>);

    fn set_read_timeout(&mut self, timeout: Option<Duration>);

    fn set_write_timeout(&mut self, timeout: Option<Duration>);

    /// Closed-notification handle
    fn closed(&self) -> ClosedSignal;

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError>;

    async fn write_all(&mut self, data: &[u8]) -> Result<(), NetworkError>;

    async fn close(&mut self) -> Result<(), NetworkError>;

    /// Give up the timeout surface and split into raw halves for framing.
    fn into_split(self: Box<Self>) -> (ConnectionReadHalf, ConnectionWriteHalf);
}

/// Binds a local address and yields an acceptor
#[async_trait]
pub trait Listener: fmt::Display + Send + Sync {
    async fn listen(&self) -> Result<Box<dyn Acceptor>, NetworkError>;
}

/// Accepts inbound connections
#[async_trait]
pub trait Acceptor: Send {
    /// Address the acceptor is bound to
    fn local_addr(&self) -> Option<std::net::SocketAddr>;

    async fn accept(&mut self) -> Result<Box<dyn Connection>, NetworkError>;

    async fn close(&mut self) -> Result<(), NetworkError>;
}

/// Opens outbound connections to a configured remote
#[async_trait]
pub trait Dial: fmt::Display + Send + Sync {
    async fn dial(&self) -> Result<Box<dyn Connection>, NetworkError>;
}
