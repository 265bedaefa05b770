//! UDP connection wrappers
//!
//! A dialed UDP "connection" is a connected socket: reads yield whole
//! datagrams and writes send one datagram each.

use super::{
    ClosedSignal, Connection, ConnectionId, ConnectionReadHalf, ConnectionWriteHalf, Dial,
    NetworkError,
};
use async_trait::async_trait;
use std::fmt;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::timeout;

static NEXT_CONNECTION: AtomicU64 = AtomicU64::new(0);

/// Dials a configured UDP remote by connecting a local socket to it
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
        write!(f, "udp://{}:{}", self.host, self.port)
    }
}

#[async_trait]
impl Dial for Dialer {
    async fn dial(&self) -> Result<Box<dyn Connection>, NetworkError> {
        let remote = tokio::net::lookup_host((self.host.as_str(), self.port))
            .await?
            .next()
            .ok_or_else(|| {
                NetworkError::InvalidAddress(format!("{}:{}", self.host, self.port))
            })?;

        let bind = if remote.is_ipv4() {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
        } else {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0)
        };

        let socket = UdpSocket::bind(bind).await?;

        timeout(self.connect_timeout, socket.connect(remote))
            .await
            .map_err(|_| NetworkError::Timeout)??;

        Ok(Box::new(UdpConnection::new(socket, remote)))
    }
}

/// A connected UDP socket behind the [`Connection`] contract
pub struct UdpConnection {
    socket: Arc<UdpSocket>,
    id: ConnectionId,
    timeout: Option<Duration>,
    read_timeout: Option<Duration>,
    write_timeout: Option<Duration>,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
}

impl UdpConnection {
    pub fn new(socket: UdpSocket, remote: SocketAddr) -> Self {
        let serial = NEXT_CONNECTION.fetch_add(1, Ordering::Relaxed);
        let (closed_tx, closed_rx) = watch::channel(false);

        Self {
            socket: Arc::new(socket),
            id: ConnectionId::new(format!("udp/{remote}#{serial}")),
            timeout: None,
            read_timeout: None,
            write_timeout: None,
            closed_tx,
            closed_rx,
        }
    }
}

#[async_trait]
impl Connection for UdpConnection {
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
            Some(bound) => timeout(bound, self.socket.recv(buf))
                .await
                .map_err(|_| NetworkError::Timeout)??,
            None => self.socket.recv(buf).await?,
        };

        Ok(n)
    }

    async fn write_all(&mut self, data: &[u8]) -> Result<(), NetworkError> {
        let sent = match self.write_timeout.or(self.timeout) {
            Some(bound) => timeout(bound, self.socket.send(data))
                .await
                .map_err(|_| NetworkError::Timeout)??,
            None => self.socket.send(data).await?,
        };

        if sent != data.len() {
            return Err(NetworkError::Io(io::Error::new(
                io::ErrorKind::WriteZero,
                "datagram truncated",
            )));
        }

        Ok(())
    }

    async fn close(&mut self) -> Result<(), NetworkError> {
        self.closed_tx.send_replace(true);

        Ok(())
    }

    fn into_split(self: Box<Self>) -> (ConnectionReadHalf, ConnectionWriteHalf) {
        (
            Box::new(UdpReadHalf {
                socket: Arc::clone(&self.socket),
            }),
            Box::new(UdpWriteHalf {
                socket: self.socket,
            }),
        )
    }
}

struct UdpReadHalf {
    socket: Arc<UdpSocket>,
}

impl AsyncRead for UdpReadHalf {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.socket.poll_recv(cx, buf)
    }
}

struct UdpWriteHalf {
    socket: Arc<UdpSocket>,
}

impl AsyncWrite for UdpWriteHalf {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        self.socket.poll_send(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        Poll::Ready(Ok(()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dial_and_echo() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let echo = tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (n, peer) = server.recv_from(&mut buf).await.unwrap();
            server.send_to(&buf[..n], peer).await.unwrap();
        });

        let dialer = Dialer::new("127.0.0.1", addr.port(), Duration::from_secs(2));
        let mut conn = dialer.dial().await.unwrap();

        conn.write_all(b"ping over udp").await.unwrap();

        let mut buf = [0u8; 64];
        let n = conn.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping over udp");

        conn.close().await.unwrap();
        echo.await.unwrap();
    }

    #[tokio::test]
    async fn test_read_timeout_applies() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = server.local_addr().unwrap();

        let dialer = Dialer::new("127.0.0.1", addr.port(), Duration::from_secs(2));
        let mut conn = dialer.dial().await.unwrap();
        conn.set_read_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 8];
        assert!(matches!(
            conn.read(&mut buf).await,
            Err(NetworkError::Timeout)
        ));
    }
}
