//! Time-driven scheduler
//!
//! A single background loop dispatches deadline notifications to many
//! waiters. Registrations share the loop's coarse tick resolution instead of
//! carrying one timer each, keeping per-waiter overhead to a queue slot.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex, Notify};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::debug;

/// Ticker errors
#[derive(Debug, Error)]
pub enum TickerError {
    #[error("ticker is closed")]
    Closed,

    #[error("tick resolution must be non-zero")]
    ZeroResolution,

    #[error("registration queue capacity must be non-zero")]
    ZeroCapacity,
}

/// A deadline registration pending in the ticker loop
struct Registration {
    fire_at: Instant,
    notify: oneshot::Sender<()>,
}

/// One-shot deadline notification.
///
/// Resolves when the deadline elapses; dropping it (or calling `cancel`)
/// before then withdraws the registration and it never fires.
pub struct Waiting {
    rx: oneshot::Receiver<()>,
}

impl Waiting {
    /// Wait for the deadline.
    ///
    /// An error means the registration was released by a closing ticker,
    /// which callers must treat as cancellation, not as an elapsed deadline.
    pub async fn wait(self) -> Result<(), TickerError> {
        self.rx.await.map_err(|_| TickerError::Closed)
    }

    /// Withdraw the registration before it fires.
    pub fn cancel(self) {}
}

/// Ticker under construction
pub struct Ticker {
    resolution: Duration,
    capacity: usize,
}

impl Ticker {
    /// Configure a ticker with a tick resolution and a bounded queue for
    /// pending scheduling requests.
    pub fn new(resolution: Duration, capacity: usize) -> Self {
        Self {
            resolution,
            capacity,
        }
    }

    /// Start the background loop.
    pub fn serve(self) -> Result<TickerHandle, TickerError> {
        if self.resolution.is_zero() {
            return Err(TickerError::ZeroResolution);
        }

        if self.capacity == 0 {
            return Err(TickerError::ZeroCapacity);
        }

        let (tx, rx) = mpsc::channel(self.capacity);
        let shutdown = Arc::new(Notify::new());
        let (done_tx, done_rx) = oneshot::channel();

        tokio::spawn(run_loop(rx, self.resolution, Arc::clone(&shutdown), done_tx));

        Ok(TickerHandle {
            tx,
            shutdown,
            done: Mutex::new(Some(done_rx)),
        })
    }
}

/// Handle to a running ticker loop
pub struct TickerHandle {
    tx: mpsc::Sender<Registration>,
    shutdown: Arc<Notify>,
    done: Mutex<Option<oneshot::Receiver<()>>>,
}

impl TickerHandle {
    /// Register a deadline `delay` from now.
    ///
    /// Blocks while the registration queue is full.
    pub async fn register(&self, delay: Duration) -> Result<Waiting, TickerError> {
        let (notify, rx) = oneshot::channel();

        self.tx
            .send(Registration {
                fire_at: Instant::now() + delay,
                notify,
            })
            .await
            .map_err(|_| TickerError::Closed)?;

        Ok(Waiting { rx })
    }

    /// Stop the loop and release all pending registrations.
    ///
    /// Returns once the loop has acknowledged teardown. Waiters observe
    /// cancellation, never a spurious fire. Idempotent.
    pub async fn close(&self) {
        self.shutdown.notify_one();

        let done = self.done.lock().await.take();
        if let Some(done) = done {
            let _ = done.await;
        }
    }
}

async fn run_loop(
    mut rx: mpsc::Receiver<Registration>,
    resolution: Duration,
    shutdown: Arc<Notify>,
    done: oneshot::Sender<()>,
) {
    let mut pending: Vec<Registration> = Vec::new();
    let mut tick = interval(resolution);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = shutdown.notified() => break,
            registration = rx.recv() => match registration {
                Some(registration) => pending.push(registration),
                None => break,
            },
            _ = tick.tick() => {
                let now = Instant::now();
                let mut idx = 0;

                while idx < pending.len() {
                    if pending[idx].notify.is_closed() {
                        // Canceled by the waiter
                        pending.swap_remove(idx);
                    } else if pending[idx].fire_at <= now {
                        let registration = pending.swap_remove(idx);
                        let _ = registration.notify.send(());
                    } else {
                        idx += 1;
                    }
                }
            }
        }
    }

    debug!(pending = pending.len(), "ticker loop stopped");

    // Dropping pending registrations delivers cancellation to their waiters
    drop(pending);
    let _ = done.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    #[tokio::test]
    async fn test_deadline_fires() {
        let ticker = Ticker::new(Duration::from_millis(10), 16).serve().unwrap();

        let start = Instant::now();
        let waiting = ticker.register(Duration::from_millis(50)).await.unwrap();
        waiting.wait().await.unwrap();

        assert!(start.elapsed() >= Duration::from_millis(50));

        ticker.close().await;
    }

    #[tokio::test]
    async fn test_cancel_prevents_fire() {
        let ticker = Ticker::new(Duration::from_millis(10), 16).serve().unwrap();

        let canceled = ticker.register(Duration::from_millis(30)).await.unwrap();
        let kept = ticker.register(Duration::from_millis(30)).await.unwrap();

        canceled.cancel();
        kept.wait().await.unwrap();

        ticker.close().await;
    }

    #[tokio::test]
    async fn test_close_releases_pending() {
        let ticker = Ticker::new(Duration::from_millis(10), 16).serve().unwrap();

        let waiting = ticker.register(Duration::from_secs(60)).await.unwrap();

        let close = tokio::spawn(async move {
            sleep(Duration::from_millis(30)).await;
            ticker.close().await;
            ticker
        });

        assert!(matches!(waiting.wait().await, Err(TickerError::Closed)));

        let ticker = close.await.unwrap();
        assert!(matches!(
            ticker.register(Duration::from_millis(10)).await,
            Err(TickerError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_many_waiters_one_loop() {
        let ticker = Ticker::new(Duration::from_millis(10), 64).serve().unwrap();

        let mut waiters = Vec::new();
        for i in 0..32 {
            let delay = Duration::from_millis(20 + (i % 4) * 10);
            waiters.push(ticker.register(delay).await.unwrap());
        }

        for waiting in waiters {
            waiting.wait().await.unwrap();
        }

        ticker.close().await;
    }

    #[test]
    fn test_rejects_zero_configuration() {
        assert!(matches!(
            Ticker::new(Duration::ZERO, 16).serve(),
            Err(TickerError::ZeroResolution)
        ));
        assert!(matches!(
            Ticker::new(Duration::from_millis(10), 0).serve(),
            Err(TickerError::ZeroCapacity)
        ));
    }
}
