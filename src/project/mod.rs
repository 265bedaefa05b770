//! Project orchestrator
//!
//! Owns the whole forwarding subsystem: endpoint registrations, the shared
//! transceiver, the worker pool and the ticker. `bootup` wires everything
//! together, `kick` stops admitting new endpoint work, and `close` tears
//! the stack down in a fixed order.

use crate::config::{Config, EndpointConfig};
use crate::network::{tcp, udp, Connection, Dial};
use crate::ticker::{Ticker, TickerHandle};
use crate::transceiver::{self, Channel, Client, CodecBuilder, Requester};
use crate::worker::{self, automatic_min_worker_count, Pool, Runner};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Mutex, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Resolution of the shared ticker loop
const TICKER_RESOLUTION: Duration = Duration::from_millis(300);

/// Capacity of the ticker's registration queue
const TICKER_CAPACITY: usize = 1024;

/// Cap on the per-endpoint minimum worker allotment
const ENDPOINT_WORKER_CAP: usize = 64;

/// Cap on the pool-wide minimum worker count
const POOL_WORKER_CAP: usize = 128;

/// Pause before a failed endpoint session is retried
const SESSION_RETRY_DELAY: Duration = Duration::from_secs(1);

/// Project errors
#[derive(Debug, Error)]
pub enum ProjectError {
    #[error("no endpoint to project")]
    NoEndpoints,

    #[error("unknown endpoint protocol: {0}")]
    UnknownProtocol(String),

    #[error("project is not booted")]
    NotBooted,

    #[error("project already booted")]
    AlreadyBooted,

    #[error("project is closed")]
    Closed,

    #[error("ticker error: {0}")]
    Ticker(#[from] crate::ticker::TickerError),

    #[error("worker error: {0}")]
    Worker(#[from] crate::worker::WorkerError),

    #[error("transceiver error: {0}")]
    Transceiver(#[from] crate::transceiver::TransceiverError),
}

/// Endpoint transport protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
}

impl FromStr for Protocol {
    type Err = ProjectError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.to_ascii_lowercase().as_str() {
            "tcp" => Ok(Protocol::Tcp),
            "udp" => Ok(Protocol::Udp),
            other => Err(ProjectError::UnknownProtocol(other.to_string())),
        }
    }
}

/// A configured endpoint resolved to its dialer; immutable after boot
pub struct Registration {
    pub endpoint: EndpointConfig,
    pub dialer: Arc<dyn Dial>,
    pub min_workers: usize,
}

impl Registration {
    fn resolve(endpoint: &EndpointConfig) -> Result<Self, ProjectError> {
        let protocol = endpoint.protocol.parse::<Protocol>()?;

        let dialer: Arc<dyn Dial> = match protocol {
            Protocol::Tcp => Arc::new(tcp::Dialer::new(
                endpoint.host.clone(),
                endpoint.port,
                endpoint.request_timeout(),
            )),
            Protocol::Udp => Arc::new(udp::Dialer::new(
                endpoint.host.clone(),
                endpoint.port,
                endpoint.request_timeout(),
            )),
        };

        Ok(Self {
            endpoint: endpoint.clone(),
            dialer,
            min_workers: automatic_min_worker_count(endpoint.max_connections, ENDPOINT_WORKER_CAP),
        })
    }
}

/// Keep-alive interval: half the idle window, lowered to the configured
/// ping ceiling when one is set and smaller.
fn ping_interval(idle_timeout: Duration, ping_timeout: Option<Duration>) -> Duration {
    let derived = idle_timeout / 2;

    match ping_timeout {
        Some(ceiling) if ceiling < derived => ceiling,
        _ => derived,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lifecycle {
    Created,
    Booted,
    Kicked,
    Closed,
}

struct Inner {
    state: Lifecycle,
    ticker: Option<Arc<TickerHandle>>,
    runner: Option<Arc<Runner>>,
    transceiver: Option<Arc<Requester>>,
    supervisors: Vec<oneshot::Receiver<()>>,
    ping: Option<(watch::Sender<bool>, JoinHandle<()>)>,
}

/// The aggregate owning endpoint registrations, transceiver and pings
pub struct Project {
    config: Config,
    dial: Arc<dyn Dial>,
    codec: Arc<dyn CodecBuilder>,
    kicked_tx: watch::Sender<bool>,
    kicked_rx: watch::Receiver<bool>,
    inner: Mutex<Inner>,
}

impl Project {
    /// Create a project over a remote dialer and a per-connection codec
    /// builder.
    pub fn new(config: Config, dial: Arc<dyn Dial>, codec: Arc<dyn CodecBuilder>) -> Self {
        let (kicked_tx, kicked_rx) = watch::channel(false);

        Self {
            config,
            dial,
            codec,
            kicked_tx,
            kicked_rx,
            inner: Mutex::new(Inner {
                state: Lifecycle::Created,
                ticker: None,
                runner: None,
                transceiver: None,
                supervisors: Vec::new(),
                ping: None,
            }),
        }
    }

    /// Boot the subsystem: validate configuration, then start ticker,
    /// worker pool, transceiver, endpoint supervisors and the ping
    /// schedule.
    ///
    /// Fails fast on configuration errors, leaving nothing running.
    pub async fn bootup(&self) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            Lifecycle::Created => {}
            Lifecycle::Booted | Lifecycle::Kicked => return Err(ProjectError::AlreadyBooted),
            Lifecycle::Closed => return Err(ProjectError::Closed),
        }

        // Validate everything before any sub-resource starts
        if self.config.endpoints.is_empty() {
            return Err(ProjectError::NoEndpoints);
        }

        let mut registrations = Vec::with_capacity(self.config.endpoints.len());
        for endpoint in &self.config.endpoints {
            registrations.push(Arc::new(Registration::resolve(endpoint)?));
        }

        let total_connections = self.config.total_connections().max(1);
        let tuning = &self.config.transceiver;

        let ticker = Arc::new(Ticker::new(TICKER_RESOLUTION, TICKER_CAPACITY).serve()?);

        let max_workers = total_connections * 2;
        let endpoint_minimum: usize = registrations
            .iter()
            .map(|registration| registration.min_workers)
            .sum();
        let pool_config = worker::Config {
            max_workers,
            min_workers: automatic_min_worker_count(max_workers, POOL_WORKER_CAP)
                .max(endpoint_minimum)
                .min(max_workers),
            max_worker_idle: tuning.idle_timeout() * 2,
            job_receive_timeout: tuning.initial_timeout(),
        };

        let runner = match Pool::new(Arc::clone(&ticker), pool_config).serve() {
            Ok(runner) => Arc::new(runner),
            Err(worker_error) => {
                ticker.close().await;
                return Err(worker_error.into());
            }
        };

        let link_count = total_connections.div_ceil(tuning.connection_channels.max(1));

        let transceiver_config = transceiver::Config {
            max_concurrent: link_count,
            // Each supervisor retries failed sessions itself
            request_retries: 1,
            idle_timeout: tuning.idle_timeout(),
            initial_timeout: tuning.initial_timeout(),
            connection_persistent: tuning.connection_persistent,
            connection_channels: tuning.connection_channels,
        };

        let requester = match Client::new(
            Arc::clone(&self.dial),
            Arc::clone(&self.codec),
            Arc::clone(&ticker),
            transceiver_config,
        )
        .serve()
        {
            Ok(requester) => Arc::new(requester),
            Err(transceiver_error) => {
                let _ = runner.close().await;
                ticker.close().await;
                return Err(transceiver_error.into());
            }
        };

        // Reset a kick left over from a previous life of the channel
        self.kicked_tx.send_replace(false);

        let mut supervisors = Vec::with_capacity(registrations.len());

        for (index, registration) in registrations.iter().enumerate() {
            let (done_tx, done_rx) = oneshot::channel();

            let job = supervise(
                index as u8,
                Arc::clone(registration),
                Arc::clone(&requester),
                Arc::clone(&runner),
                Arc::clone(&ticker),
                self.kicked_rx.clone(),
                done_tx,
            );

            if let Err(worker_error) = runner.run(job).await {
                error!(error = %worker_error, "failed to start endpoint supervisor");

                self.kicked_tx.send_replace(true);
                supervisors.clear();

                let _ = requester.close().await;
                let _ = runner.close().await;
                ticker.close().await;

                return Err(worker_error.into());
            }

            supervisors.push(done_rx);

            debug!(
                endpoint = %registration.dialer,
                max_connections = registration.endpoint.max_connections,
                "endpoint registered"
            );
        }

        let interval = ping_interval(tuning.idle_timeout(), tuning.ping_timeout());
        let (ping_stop_tx, ping_stop_rx) = watch::channel(false);
        let ping_handle = tokio::spawn(ping_loop(
            Arc::clone(&ticker),
            Arc::clone(&requester),
            interval,
            ping_stop_rx,
        ));

        inner.ticker = Some(ticker);
        inner.runner = Some(runner);
        inner.transceiver = Some(requester);
        inner.supervisors = supervisors;
        inner.ping = Some((ping_stop_tx, ping_handle));
        inner.state = Lifecycle::Booted;

        info!(endpoints = self.config.endpoints.len(), "ready");

        Ok(())
    }

    /// Stop admitting new endpoint work while in-flight sessions finish.
    ///
    /// Returns once every endpoint supervisor has acknowledged, so no new
    /// transceiver request originates from this project afterwards. Must be
    /// called before [`close`](Self::close).
    pub async fn kick(&self) -> Result<(), ProjectError> {
        let mut inner = self.inner.lock().await;

        match inner.state {
            Lifecycle::Booted => {}
            Lifecycle::Kicked | Lifecycle::Closed => return Ok(()),
            Lifecycle::Created => return Err(ProjectError::NotBooted),
        }

        info!("kicking endpoint admissions");

        self.kicked_tx.send_replace(true);

        for done in inner.supervisors.drain(..) {
            let _ = done.await;
        }

        inner.state = Lifecycle::Kicked;

        Ok(())
    }

    /// Tear down transceiver, ping schedule, worker pool and ticker, in
    /// that order.
    ///
    /// Booted projects are kicked first. Teardown is best-effort: every
    /// sub-resource is closed and the first error observed is returned.
    /// Idempotent per sub-resource.
    pub async fn close(&self) -> Result<(), ProjectError> {
        let state = self.inner.lock().await.state;

        match state {
            Lifecycle::Created => {
                self.inner.lock().await.state = Lifecycle::Closed;
                return Ok(());
            }
            Lifecycle::Booted => self.kick().await?,
            Lifecycle::Kicked => {}
            Lifecycle::Closed => return Ok(()),
        }

        let mut inner = self.inner.lock().await;
        if inner.state == Lifecycle::Closed {
            return Ok(());
        }

        info!("closing");

        let mut first_error: Option<ProjectError> = None;

        // Transceiver first: nothing may write to a draining resource
        if let Some(requester) = inner.transceiver.take() {
            if let Err(close_error) = requester.close().await {
                error!(error = %close_error, "failed to shut down transceiver");
                first_error.get_or_insert(close_error.into());
            }
        }

        // Then the project's own machinery
        if let Some((stop, handle)) = inner.ping.take() {
            stop.send_replace(true);
            let _ = handle.await;
        }

        // Worker pool after the transceiver so in-flight jobs can drain
        if let Some(runner) = inner.runner.take() {
            if let Err(close_error) = runner.close().await {
                error!(error = %close_error, "failed to shut down worker pool");
                first_error.get_or_insert(close_error.into());
            }
        }

        // Ticker last; earlier shutdowns may still hold registrations
        if let Some(ticker) = inner.ticker.take() {
            ticker.close().await;
        }

        inner.state = Lifecycle::Closed;

        info!("project is down");

        match first_error {
            Some(project_error) => Err(project_error),
            None => Ok(()),
        }
    }
}

/// Keep up to `max_connections` sessions established for one endpoint.
async fn supervise(
    index: u8,
    registration: Arc<Registration>,
    requester: Arc<Requester>,
    runner: Arc<Runner>,
    ticker: Arc<TickerHandle>,
    mut kicked: watch::Receiver<bool>,
    done: oneshot::Sender<()>,
) {
    let limit = Arc::new(Semaphore::new(registration.endpoint.max_connections));

    loop {
        if *kicked.borrow() {
            break;
        }

        let permit = tokio::select! {
            _ = kicked.wait_for(|kicked| *kicked) => break,
            permit = Arc::clone(&limit).acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
        };

        let job = session(
            index,
            Arc::clone(&registration),
            Arc::clone(&requester),
            Arc::clone(&ticker),
            kicked.clone(),
            permit,
        );

        if let Err(submit_error) = runner.run(job).await {
            debug!(
                endpoint = %registration.dialer,
                error = %submit_error,
                "session not scheduled"
            );

            let waiting = match ticker.register(SESSION_RETRY_DELAY).await {
                Ok(waiting) => waiting,
                Err(_) => break,
            };

            tokio::select! {
                _ = kicked.wait_for(|kicked| *kicked) => break,
                _ = waiting.wait() => {}
            }
        }
    }

    let _ = done.send(());
}

/// One endpoint session: a pre-established channel waiting for the remote
/// to start a conversation, then a relay to the dialed endpoint.
async fn session(
    index: u8,
    registration: Arc<Registration>,
    requester: Arc<Requester>,
    ticker: Arc<TickerHandle>,
    mut kicked: watch::Receiver<bool>,
    _permit: tokio::sync::OwnedSemaphorePermit,
) {
    if *kicked.borrow() {
        return;
    }

    let mut channel = match requester.request().await {
        Ok(channel) => channel,
        Err(request_error) => {
            debug!(
                endpoint = %registration.dialer,
                error = %request_error,
                "channel acquisition failed"
            );
            backoff(&ticker, &mut kicked).await;
            return;
        }
    };

    // Announce which endpoint this channel serves
    if channel.send(&[index]).await.is_err() {
        return;
    }

    // The remote opens the conversation; a closed channel before any data
    // simply retires this session
    let first = tokio::select! {
        _ = async { let _ = kicked.wait_for(|kicked| *kicked).await; } => {
            let _ = channel.close().await;
            return;
        }
        received = channel.recv() => match received {
            Ok(Some(data)) => data,
            Ok(None) => {
                let _ = channel.close().await;
                return;
            }
            Err(_) => return,
        },
    };

    let mut connection = match registration.dialer.dial().await {
        Ok(connection) => connection,
        Err(dial_error) => {
            warn!(
                endpoint = %registration.dialer,
                error = %dial_error,
                "endpoint dial failed"
            );
            let _ = channel.close().await;
            return;
        }
    };

    connection.set_write_timeout(Some(registration.endpoint.request_timeout()));

    if connection.write_all(&first).await.is_err() {
        let _ = channel.close().await;
        return;
    }

    relay(channel, connection).await;
}

/// Pipe bytes both ways until either side ends.
async fn relay(mut channel: Channel, mut connection: Box<dyn Connection>) {
    let mut buf = vec![0u8; 16 * 1024];

    loop {
        tokio::select! {
            incoming = channel.recv() => match incoming {
                Ok(Some(data)) => {
                    if connection.write_all(&data).await.is_err() {
                        break;
                    }
                }
                Ok(None) | Err(_) => break,
            },
            outgoing = connection.read(&mut buf) => match outgoing {
                Ok(0) => break,
                Ok(n) => {
                    if channel.send(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(_) => break,
            },
        }
    }

    let _ = connection.close().await;
    let _ = channel.close().await;
}

/// Ticker-paced pause between session attempts; a kick cuts it short.
async fn backoff(ticker: &TickerHandle, kicked: &mut watch::Receiver<bool>) {
    if let Ok(waiting) = ticker.register(SESSION_RETRY_DELAY).await {
        tokio::select! {
            _ = kicked.wait_for(|kicked| *kicked) => {}
            _ = waiting.wait() => {}
        }
    }
}

/// Re-armed keep-alive schedule over the shared ticker.
async fn ping_loop(
    ticker: Arc<TickerHandle>,
    requester: Arc<Requester>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        let waiting = match ticker.register(interval).await {
            Ok(waiting) => waiting,
            Err(_) => break,
        };

        tokio::select! {
            _ = async { let _ = stop.wait_for(|stop| *stop).await; } => break,
            fired = waiting.wait() => {
                if fired.is_err() {
                    break;
                }

                if let Err(ping_error) = requester.ping().await {
                    debug!(error = %ping_error, "keep-alive failed");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AeadCodec, FrameLock, NullMarker, PresharedKeySource};
    use crate::config::{LoggingConfig, RemoteConfig, TransceiverConfig};

    fn test_codec_builder() -> Arc<dyn CodecBuilder> {
        Arc::new(|lock: FrameLock| {
            let source = PresharedKeySource::new(b"project test secret");
            AeadCodec::new(&source, 32, Arc::new(NullMarker), lock)
        })
    }

    fn test_remote_dial() -> Arc<dyn Dial> {
        // Nothing listens here; sessions fail and back off
        Arc::new(tcp::Dialer::new(
            "127.0.0.1",
            9,
            Duration::from_millis(200),
        ))
    }

    fn test_config(endpoints: Vec<EndpointConfig>) -> Config {
        Config {
            remote: RemoteConfig {
                host: "127.0.0.1".to_string(),
                port: 9,
                preshared_key: "unused".to_string(),
                key_size: 32,
            },
            endpoints,
            transceiver: TransceiverConfig {
                idle_timeout: 2,
                initial_timeout: 1,
                connection_persistent: true,
                connection_channels: 4,
                ping_timeout: 0,
            },
            logging: LoggingConfig::default(),
        }
    }

    fn tcp_endpoint() -> EndpointConfig {
        EndpointConfig {
            host: "127.0.0.1".to_string(),
            port: 8080,
            protocol: "tcp".to_string(),
            max_connections: 4,
            request_timeout: 1,
        }
    }

    #[test]
    fn test_protocol_parsing() {
        assert_eq!("tcp".parse::<Protocol>().unwrap(), Protocol::Tcp);
        assert_eq!("UDP".parse::<Protocol>().unwrap(), Protocol::Udp);
        assert!(matches!(
            "sctp".parse::<Protocol>(),
            Err(ProjectError::UnknownProtocol(_))
        ));
    }

    #[test]
    fn test_ping_interval_derivation() {
        let idle = Duration::from_secs(60);

        assert_eq!(ping_interval(idle, None), Duration::from_secs(30));
        assert_eq!(
            ping_interval(idle, Some(Duration::from_secs(10))),
            Duration::from_secs(10)
        );
        assert_eq!(
            ping_interval(idle, Some(Duration::from_secs(45))),
            Duration::from_secs(30)
        );
    }

    #[tokio::test]
    async fn test_bootup_without_endpoints_fails() {
        let project = Project::new(test_config(Vec::new()), test_remote_dial(), test_codec_builder());

        assert!(matches!(
            project.bootup().await,
            Err(ProjectError::NoEndpoints)
        ));

        // Nothing was booted; close is a no-op
        project.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_bootup_with_unknown_protocol_fails() {
        let endpoint = EndpointConfig {
            protocol: "carrier-pigeon".to_string(),
            ..tcp_endpoint()
        };
        let project = Project::new(
            test_config(vec![endpoint]),
            test_remote_dial(),
            test_codec_builder(),
        );

        assert!(matches!(
            project.bootup().await,
            Err(ProjectError::UnknownProtocol(_))
        ));

        project.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_kick_requires_boot() {
        let project = Project::new(
            test_config(vec![tcp_endpoint()]),
            test_remote_dial(),
            test_codec_builder(),
        );

        assert!(matches!(project.kick().await, Err(ProjectError::NotBooted)));
    }

    #[tokio::test]
    async fn test_lifecycle_with_unreachable_remote() {
        let project = Project::new(
            test_config(vec![tcp_endpoint()]),
            test_remote_dial(),
            test_codec_builder(),
        );

        // Boot succeeds even though sessions cannot reach the remote yet;
        // they fail and back off under the supervisors.
        project.bootup().await.unwrap();

        assert!(matches!(
            project.bootup().await,
            Err(ProjectError::AlreadyBooted)
        ));

        project.kick().await.unwrap();
        // Idempotent
        project.kick().await.unwrap();

        project.close().await.unwrap();
        // Idempotent
        project.close().await.unwrap();

        // A closed project cannot boot again
        assert!(matches!(project.bootup().await, Err(ProjectError::Closed)));
    }
}
