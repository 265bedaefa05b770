//! Multiplexing transceiver client
//!
//! Physical connections ("links") are dialed on demand and shared by up to
//! `connection_channels` logical channels each. A link owns one AEAD codec
//! pair: a demux task routes decoded channel frames to per-channel queues,
//! and every channel writes through the link's encoder behind the codec's
//! shared frame lock, so concurrent channels interleave only as whole
//! frames.

use super::frame::MAX_FRAME_PAYLOAD;
use super::{ChannelFrame, Config, FrameType, TransceiverError};
use crate::codec::{frame_lock, AeadCodec, CodecError, FrameDecoder, FrameLock};
use crate::network::{ConnectionReadHalf, ConnectionWriteHalf, Dial};
use crate::ticker::TickerHandle;
use bytes::{Bytes, BytesMut};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

type FrameEncoder = crate::codec::FrameEncoder<ConnectionWriteHalf>;

/// Builds one codec per physical connection.
///
/// The lock handed in is the connection's critical-section handle; every
/// codec bound to that connection must share it.
pub trait CodecBuilder: Send + Sync {
    fn build(&self, lock: FrameLock) -> Result<AeadCodec, CodecError>;
}

impl<F> CodecBuilder for F
where
    F: Fn(FrameLock) -> Result<AeadCodec, CodecError> + Send + Sync,
{
    fn build(&self, lock: FrameLock) -> Result<AeadCodec, CodecError> {
        self(lock)
    }
}

/// Per-channel routing slot on a link.
///
/// A channel leaves `Active` when either side closes it and the slot frees
/// once both sides have; a slot is never reused while the remote may still
/// address frames at it.
enum Slot {
    Free,
    Active(mpsc::Sender<Bytes>),
    Draining,
}

struct Link {
    id: usize,
    encoder: Mutex<Option<FrameEncoder>>,
    slots: StdMutex<Vec<Slot>>,
    active: AtomicUsize,
    /// Bumped on every channel acquisition and ping so a pending idle
    /// deadline cannot reap a link that became busy again
    idle_epoch: AtomicU64,
    closed_tx: watch::Sender<bool>,
    closed_rx: watch::Receiver<bool>,
    /// Marked on every allocate/release; level-triggered for the keeper
    activity_tx: watch::Sender<u64>,
    activity_rx: watch::Receiver<u64>,
    demux: StdMutex<Option<JoinHandle<()>>>,
    keeper: StdMutex<Option<JoinHandle<()>>>,
}

impl Link {
    fn new(id: usize, encoder: FrameEncoder, channels: usize) -> Self {
        let mut slots = Vec::with_capacity(channels);
        slots.resize_with(channels, || Slot::Free);

        let (closed_tx, closed_rx) = watch::channel(false);
        let (activity_tx, activity_rx) = watch::channel(0);

        Self {
            id,
            encoder: Mutex::new(Some(encoder)),
            slots: StdMutex::new(slots),
            active: AtomicUsize::new(0),
            idle_epoch: AtomicU64::new(0),
            closed_tx,
            closed_rx,
            activity_tx,
            activity_rx,
            demux: StdMutex::new(None),
            keeper: StdMutex::new(None),
        }
    }

    fn is_closed(&self) -> bool {
        *self.closed_rx.borrow()
    }

    fn mark_activity(&self) {
        self.activity_tx.send_modify(|mark| *mark += 1);
    }

    fn allocate_slot(&self) -> Option<(u8, mpsc::Receiver<Bytes>)> {
        let allocated = {
            let mut slots = self.slots.lock().expect("slot lock poisoned");

            match slots.iter().position(|slot| matches!(slot, Slot::Free)) {
                Some(index) => {
                    let (tx, rx) = mpsc::channel(64);
                    slots[index] = Slot::Active(tx);
                    Some((index as u8, rx))
                }
                None => None,
            }
        };

        if allocated.is_some() {
            self.active.fetch_add(1, Ordering::AcqRel);
            self.idle_epoch.fetch_add(1, Ordering::AcqRel);
            self.mark_activity();
        }

        allocated
    }

    /// One side of the channel is done with the slot; the second mover
    /// returns it to the free list.
    fn half_close_slot(&self, channel: u8) {
        let was_active = {
            let mut slots = self.slots.lock().expect("slot lock poisoned");

            match slots.get_mut(channel as usize) {
                Some(slot) => match slot {
                    Slot::Active(_) => {
                        *slot = Slot::Draining;
                        true
                    }
                    Slot::Draining => {
                        *slot = Slot::Free;
                        false
                    }
                    Slot::Free => false,
                },
                None => false,
            }
        };

        if was_active {
            self.active.fetch_sub(1, Ordering::AcqRel);
            self.mark_activity();
        }
    }

    fn data_sender(&self, channel: u8) -> Option<mpsc::Sender<Bytes>> {
        let slots = self.slots.lock().expect("slot lock poisoned");

        match slots.get(channel as usize) {
            Some(Slot::Active(tx)) => Some(tx.clone()),
            _ => None,
        }
    }

    async fn write_frame(&self, frame: &ChannelFrame) -> Result<(), TransceiverError> {
        let mut guard = self.encoder.lock().await;
        let encoder = guard.as_mut().ok_or(TransceiverError::Closed)?;

        let wire = frame.encode();
        encoder.write(&wire).await?;
        encoder.flush().await?;

        Ok(())
    }

    /// Tear down the link. Idempotent; only the first caller acts.
    async fn close(&self) {
        if self.closed_tx.send_replace(true) {
            return;
        }

        debug!(link = self.id, "closing link");

        // Dropping the encoder releases the write half of the connection
        self.encoder.lock().await.take();

        // Dropping the senders wakes every channel with end-of-stream
        let mut slots = self.slots.lock().expect("slot lock poisoned");
        for slot in slots.iter_mut() {
            *slot = Slot::Free;
        }
        drop(slots);

        self.active.store(0, Ordering::Release);
        self.mark_activity();
    }
}

/// A logical channel multiplexed onto a physical link
pub struct Channel {
    link: Arc<Link>,
    id: u8,
    rx: mpsc::Receiver<Bytes>,
    released: bool,
}

impl Channel {
    /// Channel slot on the carrying link.
    pub fn id(&self) -> u8 {
        self.id
    }

    /// Send bytes on this channel.
    pub async fn send(&self, data: &[u8]) -> Result<(), TransceiverError> {
        if self.link.is_closed() {
            return Err(TransceiverError::Closed);
        }

        for chunk in data.chunks(MAX_FRAME_PAYLOAD) {
            self.link
                .write_frame(&ChannelFrame::data(self.id, Bytes::copy_from_slice(chunk)))
                .await?;
        }

        Ok(())
    }

    /// Receive the next payload.
    ///
    /// `Ok(None)` means the remote closed this channel; an error means the
    /// carrying link or the whole transceiver went away.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TransceiverError> {
        match self.rx.recv().await {
            Some(data) => Ok(Some(data)),
            None => {
                if self.link.is_closed() {
                    Err(TransceiverError::Closed)
                } else {
                    Ok(None)
                }
            }
        }
    }

    /// Close the channel, announcing it to the remote.
    pub async fn close(mut self) -> Result<(), TransceiverError> {
        let announce = self.link.write_frame(&ChannelFrame::close(self.id)).await;

        self.link.half_close_slot(self.id);
        self.released = true;

        announce
    }
}

impl Drop for Channel {
    fn drop(&mut self) {
        if !self.released {
            self.link.half_close_slot(self.id);
        }
    }
}

/// Transceiver client under construction
pub struct Client {
    dial: Arc<dyn Dial>,
    codec: Arc<dyn CodecBuilder>,
    ticker: Arc<TickerHandle>,
    config: Config,
}

impl Client {
    pub fn new(
        dial: Arc<dyn Dial>,
        codec: Arc<dyn CodecBuilder>,
        ticker: Arc<TickerHandle>,
        config: Config,
    ) -> Self {
        Self {
            dial,
            codec,
            ticker,
            config,
        }
    }

    /// Validate the configuration and hand out the requester.
    pub fn serve(self) -> Result<Requester, TransceiverError> {
        if self.config.max_concurrent == 0 {
            return Err(TransceiverError::Misconfigured {
                reason: "max_concurrent must be non-zero",
            });
        }

        if self.config.connection_channels == 0 || self.config.connection_channels > 256 {
            return Err(TransceiverError::Misconfigured {
                reason: "connection_channels must be between 1 and 256",
            });
        }

        Ok(Requester {
            shared: Arc::new(Shared {
                dial: self.dial,
                codec: self.codec,
                ticker: self.ticker,
                config: self.config,
                links: Mutex::new(Vec::new()),
                next_link: AtomicUsize::new(0),
                open: AtomicBool::new(true),
            }),
        })
    }
}

struct Shared {
    dial: Arc<dyn Dial>,
    codec: Arc<dyn CodecBuilder>,
    ticker: Arc<TickerHandle>,
    config: Config,
    links: Mutex<Vec<Arc<Link>>>,
    next_link: AtomicUsize,
    open: AtomicBool,
}

/// Handle to a running transceiver client
pub struct Requester {
    shared: Arc<Shared>,
}

impl Requester {
    /// Acquire a logical channel, retrying per configuration.
    pub async fn request(&self) -> Result<Channel, TransceiverError> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(TransceiverError::Closed);
        }

        let mut last_error = None;

        for attempt in 0..=self.shared.config.request_retries {
            match self.acquire().await {
                Ok(channel) => return Ok(channel),
                Err(error) => {
                    debug!(attempt, error = %error, "channel acquisition failed");
                    last_error = Some(error);
                }
            }
        }

        Err(last_error.unwrap_or(TransceiverError::Closed))
    }

    async fn acquire(&self) -> Result<Channel, TransceiverError> {
        // The links lock is held across the dial so concurrent acquisitions
        // cannot overshoot max_concurrent.
        let mut links = self.shared.links.lock().await;

        links.retain(|link| !link.is_closed());

        // Least-loaded open link with a free channel slot
        let candidate = links
            .iter()
            .filter(|link| {
                link.active.load(Ordering::Acquire) < self.shared.config.connection_channels
            })
            .min_by_key(|link| link.active.load(Ordering::Acquire))
            .cloned();

        if let Some(link) = candidate {
            if let Some((id, rx)) = link.allocate_slot() {
                return Ok(Channel {
                    link,
                    id,
                    rx,
                    released: false,
                });
            }
        }

        if links.len() >= self.shared.config.max_concurrent {
            return Err(TransceiverError::Exhausted {
                max_concurrent: self.shared.config.max_concurrent,
            });
        }

        let link = self.dial_link().await?;
        links.push(Arc::clone(&link));

        let (id, rx) = link.allocate_slot().ok_or(TransceiverError::Exhausted {
            max_concurrent: self.shared.config.max_concurrent,
        })?;

        drop(links);

        let keeper = tokio::spawn(keeper_loop(Arc::clone(&link), Arc::clone(&self.shared)));
        *link.keeper.lock().expect("keeper lock poisoned") = Some(keeper);

        Ok(Channel {
            link,
            id,
            rx,
            released: false,
        })
    }

    async fn dial_link(&self) -> Result<Arc<Link>, TransceiverError> {
        let initial_timeout = self.shared.config.initial_timeout;

        let connection = timeout(initial_timeout, self.shared.dial.dial())
            .await
            .map_err(|_| TransceiverError::DialTimeout {
                timeout: initial_timeout,
            })??;

        let id = self.shared.next_link.fetch_add(1, Ordering::Relaxed);
        debug!(
            link = id,
            connection = %connection.id(),
            dial = %self.shared.dial,
            "link established"
        );

        let lock = frame_lock();
        let codec = self.shared.codec.build(lock)?;

        let (read, write) = connection.into_split();
        let encoder = codec.encode(write);
        let decoder = codec.decode(read);

        let link = Arc::new(Link::new(
            id,
            encoder,
            self.shared.config.connection_channels,
        ));

        let demux = tokio::spawn(demux_loop(Arc::clone(&link), decoder));
        *link.demux.lock().expect("demux lock poisoned") = Some(demux);

        Ok(link)
    }

    /// Send a keep-alive on every open link, refreshing its idle state.
    pub async fn ping(&self) -> Result<(), TransceiverError> {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(TransceiverError::Closed);
        }

        let links = self.shared.links.lock().await.clone();

        for link in links {
            if link.is_closed() {
                continue;
            }

            link.idle_epoch.fetch_add(1, Ordering::AcqRel);

            if let Err(error) = link.write_frame(&ChannelFrame::ping()).await {
                debug!(link = link.id, error = %error, "ping failed");
            }
        }

        Ok(())
    }

    /// Open physical connections.
    pub async fn active_links(&self) -> usize {
        let mut links = self.shared.links.lock().await;
        links.retain(|link| !link.is_closed());
        links.len()
    }

    /// Stop accepting requests and close every link.
    ///
    /// In-flight channels observe a closed-stream error. Idempotent.
    pub async fn close(&self) -> Result<(), TransceiverError> {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        let links = {
            let mut links = self.shared.links.lock().await;
            std::mem::take(&mut *links)
        };

        for link in &links {
            link.close().await;
        }

        for link in links {
            let demux = link.demux.lock().expect("demux lock poisoned").take();
            if let Some(handle) = demux {
                let _ = handle.await;
            }

            let keeper = link.keeper.lock().expect("keeper lock poisoned").take();
            if let Some(handle) = keeper {
                let _ = handle.await;
            }
        }

        debug!("transceiver closed");

        Ok(())
    }
}

/// Route decoded channel frames to their slots until the link dies.
async fn demux_loop(link: Arc<Link>, mut decoder: FrameDecoder<ConnectionReadHalf>) {
    let mut closed = link.closed_rx.clone();
    let mut buffer = BytesMut::with_capacity(8 * 1024);
    let mut chunk = [0u8; 4096];

    'io: loop {
        loop {
            match ChannelFrame::decode(&mut buffer) {
                Ok(Some(frame)) => handle_frame(&link, frame).await,
                Ok(None) => break,
                Err(error) => {
                    warn!(link = link.id, error = %error, "malformed traffic on link");
                    break 'io;
                }
            }
        }

        tokio::select! {
            _ = closed.wait_for(|closed| *closed) => break,
            read = decoder.read(&mut chunk) => match read {
                Ok(0) => {
                    debug!(link = link.id, "remote closed link");
                    break;
                }
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
                Err(error) => {
                    debug!(link = link.id, error = %error, "link read failed");
                    break;
                }
            }
        }
    }

    link.close().await;
}

async fn handle_frame(link: &Arc<Link>, frame: ChannelFrame) {
    match frame.frame_type {
        FrameType::Data => {
            if let Some(sender) = link.data_sender(frame.channel) {
                // Per-channel backpressure; a full queue slows the link
                let _ = sender.send(frame.payload).await;
            }
        }
        FrameType::Close => {
            link.half_close_slot(frame.channel);
        }
        FrameType::Ping => {
            if let Err(error) = link.write_frame(&ChannelFrame::pong()).await {
                debug!(link = link.id, error = %error, "pong failed");
            }
        }
        FrameType::Pong => {}
    }
}

/// Reap the link when it sits idle past the configured window.
///
/// Non-persistent links close as soon as their channels drain; persistent
/// links wait out `idle_timeout` on the shared ticker first.
async fn keeper_loop(link: Arc<Link>, shared: Arc<Shared>) {
    let mut closed = link.closed_rx.clone();
    let mut activity = link.activity_rx.clone();

    loop {
        if link.is_closed() {
            break;
        }

        // Consume pending activity marks before sampling the channel count,
        // so any change after this point wakes the select below.
        activity.borrow_and_update();

        if link.active.load(Ordering::Acquire) == 0 {
            if !shared.config.connection_persistent {
                link.close().await;
                break;
            }

            let epoch = link.idle_epoch.load(Ordering::Acquire);

            let waiting = match shared.ticker.register(shared.config.idle_timeout).await {
                Ok(waiting) => waiting,
                Err(_) => break,
            };

            tokio::select! {
                _ = async { let _ = closed.wait_for(|closed| *closed).await; } => break,
                _ = activity.changed() => {}
                fired = waiting.wait() => {
                    if fired.is_ok()
                        && link.active.load(Ordering::Acquire) == 0
                        && link.idle_epoch.load(Ordering::Acquire) == epoch
                    {
                        debug!(link = link.id, "idle link reaped");
                        link.close().await;
                        break;
                    }
                }
            }
        } else {
            tokio::select! {
                _ = closed.wait_for(|closed| *closed) => break,
                _ = activity.changed() => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{KeySource, NullMarker, PresharedKeySource};
    use crate::network::{ClosedSignal, Connection, ConnectionId, NetworkError};
    use crate::ticker::Ticker;
    use async_trait::async_trait;
    use std::fmt;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::time::sleep;

    const TEST_SECRET: &[u8] = b"transceiver test secret";

    fn test_codec_builder() -> Arc<dyn CodecBuilder> {
        Arc::new(|lock: FrameLock| {
            let source = PresharedKeySource::new(TEST_SECRET);
            AeadCodec::new(&source, 32, Arc::new(NullMarker), lock)
        })
    }

    /// Frame-echo peer speaking the tunnel protocol on the far duplex half.
    async fn echo_peer(stream: DuplexStream) {
        let source = PresharedKeySource::new(TEST_SECRET);
        let codec = AeadCodec::new(&source, 32, Arc::new(NullMarker), frame_lock()).unwrap();

        let (read, write) = tokio::io::split(stream);
        let mut decoder = codec.decode(read);
        let mut encoder = codec.encode(write);

        let mut buffer = BytesMut::new();
        let mut chunk = [0u8; 4096];

        loop {
            loop {
                let frame = match ChannelFrame::decode(&mut buffer) {
                    Ok(Some(frame)) => frame,
                    Ok(None) => break,
                    Err(_) => return,
                };

                let reply = match frame.frame_type {
                    FrameType::Data => ChannelFrame::data(frame.channel, frame.payload),
                    FrameType::Close => ChannelFrame::close(frame.channel),
                    FrameType::Ping => ChannelFrame::pong(),
                    FrameType::Pong => continue,
                };

                if encoder.write(&reply.encode()).await.is_err() {
                    return;
                }
            }

            match decoder.read(&mut chunk).await {
                Ok(0) | Err(_) => return,
                Ok(n) => buffer.extend_from_slice(&chunk[..n]),
            }
        }
    }

    struct MemoryConnection {
        id: ConnectionId,
        stream: DuplexStream,
        closed_tx: watch::Sender<bool>,
        closed_rx: watch::Receiver<bool>,
    }

    #[async_trait]
    impl Connection for MemoryConnection {
        fn id(&self) -> &ConnectionId {
            &self.id
        }

        fn set_timeout(&mut self, _timeout: Option<Duration>) {}
        fn set_read_timeout(&mut self, _timeout: Option<Duration>) {}
        fn set_write_timeout(&mut self, _timeout: Option<Duration>) {}

        fn closed(&self) -> ClosedSignal {
            ClosedSignal::new(self.closed_rx.clone())
        }

        async fn read(&mut self, buf: &mut [u8]) -> Result<usize, NetworkError> {
            Ok(self.stream.read(buf).await?)
        }

        async fn write_all(&mut self, data: &[u8]) -> Result<(), NetworkError> {
            Ok(self.stream.write_all(data).await?)
        }

        async fn close(&mut self) -> Result<(), NetworkError> {
            self.closed_tx.send_replace(true);
            Ok(())
        }

        fn into_split(self: Box<Self>) -> (ConnectionReadHalf, ConnectionWriteHalf) {
            let (read, write) = tokio::io::split(self.stream);
            (Box::new(read), Box::new(write))
        }
    }

    struct MemoryDial;

    impl fmt::Display for MemoryDial {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "mem://echo-peer")
        }
    }

    #[async_trait]
    impl Dial for MemoryDial {
        async fn dial(&self) -> Result<Box<dyn Connection>, NetworkError> {
            let (local, remote) = tokio::io::duplex(1 << 16);

            tokio::spawn(echo_peer(remote));

            let (closed_tx, closed_rx) = watch::channel(false);

            Ok(Box::new(MemoryConnection {
                id: ConnectionId::new("mem/echo"),
                stream: local,
                closed_tx,
                closed_rx,
            }))
        }
    }

    fn test_ticker() -> Arc<TickerHandle> {
        Arc::new(Ticker::new(Duration::from_millis(20), 64).serve().unwrap())
    }

    fn test_requester(ticker: Arc<TickerHandle>, config: Config) -> Requester {
        Client::new(Arc::new(MemoryDial), test_codec_builder(), ticker, config)
            .serve()
            .unwrap()
    }

    fn test_config() -> Config {
        Config {
            max_concurrent: 2,
            request_retries: 1,
            idle_timeout: Duration::from_secs(5),
            initial_timeout: Duration::from_secs(2),
            connection_persistent: true,
            connection_channels: 4,
        }
    }

    #[tokio::test]
    async fn test_channels_share_one_link() {
        let ticker = test_ticker();
        let requester = test_requester(ticker.clone(), test_config());

        let mut first = requester.request().await.unwrap();
        let mut second = requester.request().await.unwrap();

        assert_ne!(first.id(), second.id());
        assert_eq!(requester.active_links().await, 1);

        first.send(b"payload for channel one").await.unwrap();
        second.send(b"payload for channel two").await.unwrap();

        assert_eq!(
            first.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"payload for channel one")
        );
        assert_eq!(
            second.recv().await.unwrap().unwrap(),
            Bytes::from_static(b"payload for channel two")
        );

        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_saturation_opens_new_link_up_to_ceiling() {
        let ticker = test_ticker();
        let config = Config {
            connection_channels: 1,
            ..test_config()
        };
        let requester = test_requester(ticker.clone(), config);

        let _first = requester.request().await.unwrap();
        let _second = requester.request().await.unwrap();

        assert_eq!(requester.active_links().await, 2);

        let third = requester.request().await;
        assert!(matches!(
            third,
            Err(TransceiverError::Exhausted { max_concurrent: 2 })
        ));

        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_large_payload_chunked_through_channel() {
        let ticker = test_ticker();
        let requester = test_requester(ticker.clone(), test_config());

        let mut channel = requester.request().await.unwrap();

        let data: Vec<u8> = (0..64 * 1024).map(|i| (i % 241) as u8).collect();
        channel.send(&data).await.unwrap();

        let mut received = Vec::new();
        while received.len() < data.len() {
            let payload = channel.recv().await.unwrap().unwrap();
            received.extend_from_slice(&payload);
        }

        assert_eq!(received, data);

        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_close_fails_in_flight_channels() {
        let ticker = test_ticker();
        let requester = test_requester(ticker.clone(), test_config());

        let mut channel = requester.request().await.unwrap();

        requester.close().await.unwrap();

        assert!(matches!(channel.recv().await, Err(TransceiverError::Closed)));
        assert!(matches!(
            channel.send(b"late").await,
            Err(TransceiverError::Closed)
        ));
        assert!(matches!(
            requester.request().await,
            Err(TransceiverError::Closed)
        ));

        // Idempotent
        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_non_persistent_link_closes_after_drain() {
        let ticker = test_ticker();
        let config = Config {
            connection_persistent: false,
            ..test_config()
        };
        let requester = test_requester(ticker.clone(), config);

        let channel = requester.request().await.unwrap();
        assert_eq!(requester.active_links().await, 1);

        channel.close().await.unwrap();

        sleep(Duration::from_millis(100)).await;
        assert_eq!(requester.active_links().await, 0);

        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_idle_persistent_link_reaped_unless_pinged() {
        let ticker = test_ticker();
        let config = Config {
            idle_timeout: Duration::from_millis(300),
            ..test_config()
        };
        let requester = test_requester(ticker.clone(), config);

        let channel = requester.request().await.unwrap();
        channel.close().await.unwrap();
        assert_eq!(requester.active_links().await, 1);

        // Keep-alives hold the idle link open past its window
        for _ in 0..5 {
            sleep(Duration::from_millis(100)).await;
            requester.ping().await.unwrap();
        }
        assert_eq!(requester.active_links().await, 1);

        // Without pings the window elapses and the link is reaped
        sleep(Duration::from_millis(800)).await;
        assert_eq!(requester.active_links().await, 0);

        requester.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_rejects_bad_configuration() {
        let ticker = test_ticker();

        let result = Client::new(
            Arc::new(MemoryDial),
            test_codec_builder(),
            ticker.clone(),
            Config {
                max_concurrent: 0,
                ..test_config()
            },
        )
        .serve();

        assert!(matches!(result, Err(TransceiverError::Misconfigured { .. })));

        ticker.close().await;
    }

    struct MismatchedKey;

    impl KeySource for MismatchedKey {
        fn get(&self, size: usize) -> Result<Vec<u8>, CodecError> {
            Ok(vec![0xA5; size])
        }
    }

    #[tokio::test]
    async fn test_key_mismatch_fails_authentication() {
        let ticker = test_ticker();

        let builder: Arc<dyn CodecBuilder> = Arc::new(|lock: FrameLock| {
            AeadCodec::new(&MismatchedKey, 32, Arc::new(NullMarker), lock)
        });

        let requester = Client::new(Arc::new(MemoryDial), builder, ticker.clone(), test_config())
            .serve()
            .unwrap();

        let mut channel = requester.request().await.unwrap();

        // The peer cannot authenticate our frames and tears the stream down;
        // our side observes the dead link as a closed channel.
        let _ = channel.send(b"will not authenticate").await;
        assert!(channel.recv().await.is_err());

        requester.close().await.unwrap();
        ticker.close().await;
    }
}
