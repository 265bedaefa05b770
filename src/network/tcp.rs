//! TCP connection wrappers

use super::{
    Acceptor, ClosedSignal, Connection, ConnectionId, ConnectionReadHalf, ConnectionWriteHalf,
    Dial, Listener, NetworkError,
};
use async_trait::async_trait;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::timeout;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Dials a configured TCP remote
pub struct Dialer {
    host: String,
    port: u16,
    connect_timeout: Duration,
}

impl Dialer {
    pub fn new(host: impl Into<String>, port: u16, connect_timeout: Duration) -> Self {
        Self {
            host: host.into(),
            port,
            connect_timeout,
        }
    }
}

impl fmt::Display for Dialer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Dial for Dialer {
    async fn dial(&self) -> Result<Box<dyn Connection>, NetworkError> {
        let stream = timeout(
            self.connect_timeout,
            TcpStream::connect((self.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| NetworkError::Timeout)??;

        stream.set_nodelay(true).ok();

        Ok(Box::new(TcpConnection::new(stream)))
    }
}

/// Binds a local TCP address
pub struct Binder {
    host: String,
    port: u16,
}

impl Binder {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for Binder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tcp://{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Listener for Binder {
    async fn listen(&self) -> Result<Box<dyn Acceptor>, NetworkError> {
        let listener = tokio::net::TcpListener::bind((self.host.as_str(), self.port)).await?;

        Ok(Box::new(TcpAcceptor {
            listener: Some(listener),
        }))
    }
}

struct TcpAcceptor {
    listener: Option<tokio::net::TcpListener>,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.listener.as_ref().and_then(|l| l.local_addr().ok())
    }

    async fn accept(&mut self) -> Result<Box<dyn Connection>, NetworkError> {
        let listener = self.listener.as_ref().ok_or(NetworkError::Closed)?;
        let (stream, _) = listener.accept().await?;

        stream.set_nodelay(true).ok();

        Ok(Box::new(TcpConnection::new(stream)))
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        self.listener.take();

        Ok(())
    }
}

/// A TCP stream behind the [`Connection`] contract
pub struct TcpConnection {
    stream: TcpStream,
    id: ConnectionId,
    timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl TcpConnection {
    pub fn new(stream: TcpStream) -> Self {
        let serial = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let peer = stream
            .peer_addr()
            .map(|addr| addr.to_string())
            .unwrap_or_else(|_| "unknown".to_string());
        let (closed_tx, closed_rx) = watch::channel(false);

        Self {
            stream,
            id: ConnectionId::new(format!("tcp/{peer}#{serial}")),
            timeout: None,
            read_timeout: None,
            write_timeout: None,
            closed_tx,
            closed_rx,
        }
    }
}

#[async_trait]
impl Connection for TcpConnection {
    fn id(&self) -> &ConnectionId {
        &self.id
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn set_read_timeout(&mut self, timeout: Option<Duration>) {
        self.read_timeout = timeout;
    }

    fn set_write_timeout(&mut self, timeout: Option<Duration>) {
        self.write_timeout = timeout;
    }

    fn closed(&self) -> ClosedSignal {
        ClosedSignal::new(self.closed_rx.clone())
    }

    async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
        let n = match self.read_timeout.or(self.timeout) {
            Some(bound) => timeout(bound, self.stream.read(buf))
                .await
                .map_err(|_| NetworkError::Timeout)??,
            None => self.stream.read(buf).await?,
        };

        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        match self.write_timeout.or(self.timeout) {
            Some(bound) => timeout(bound, self.stream.write_all(data))
                .await
                .map_err(|_| NetworkError::Timeout)??,
            None => self.stream.write_all(data).await?,
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        self.closed_tx.send_replace(true);
        self.stream.shutdown().await.ok();

        Ok(())
    }

    fn into_split(self: Box<Self>) -> (ConnectionReadHalf, ConnectionWriteHalf) {
        let (read, write) = self.stream.into_split();

        (Box::new(read), Box::new(write))
    }
}
