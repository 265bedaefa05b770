//! Adaptive worker pool
//!
//! A bounded set of long-lived task runners. The pool grows on demand up to
//! `max_workers`, keeps at least `min_workers` alive while open, and retires
//! workers whose idle time exceeds `max_worker_idle`. Idle reclamation rides
//! the shared [`Ticker`](crate::ticker) loop rather than one timer per
//! worker.

use crate::ticker::TickerHandle;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Worker pool errors
#[derive(Debug, Error)]
pub enum WorkerError {
    #[error("worker pool is closed")]
    Closed,

    #[error("no worker accepted the job within {timeout:?}")]
    JobReceiveTimeout { timeout: Duration },

    #[error("worker pool misconfigured: {reason}")]
    Misconfigured { reason: &'static str },

    #[error("worker task aborted: {0}")]
    Aborted(String),
}

/// Worker pool configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Workers kept alive while the pool is open
    pub min_workers: usize,
    /// Hard ceiling on concurrent workers
    pub max_workers: usize,
    /// Idle time after which a worker above the minimum retires
    pub max_worker_idle: Duration,
    /// How long a submission waits for a worker before failing
    pub job_receive_timeout: Duration,
}

/// A unit of work owned by the submitter until a worker accepts it
pub type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Derive a minimum worker count from an expected connection count.
///
/// Readiness scales with expected load but is hard-capped so configurations
/// with very large endpoint counts do not pre-warm unbounded workers.
pub fn automatic_min_worker_count(expected: usize, cap: usize) -> usize {
    expected.min(cap).max(1)
}

struct Shared {
    config: Config,
    ticker: Arc<TickerHandle>,
    job_rx: Mutex<mpsc::Receiver<Job>>,
    live: AtomicUsize,
    idle: AtomicUsize,
    open: AtomicBool,
    handles: StdMutex<Vec<JoinHandle<()>>>,
}

/// Worker pool under construction
pub struct Pool {
    ticker: Arc<TickerHandle>,
    config: Config,
}

impl Pool {
    pub fn new(ticker: Arc<TickerHandle>, config: Config) -> Self {
        Self { ticker, config }
    }

    /// Start the pool, pre-spawning `min_workers`.
    pub fn serve(self) -> Result<Runner, WorkerError> {
        if self.config.max_workers == 0 {
            return Err(WorkerError::Misconfigured {
                reason: "max_workers must be non-zero",
            });
        }

        if self.config.min_workers > self.config.max_workers {
            return Err(WorkerError::Misconfigured {
                reason: "min_workers must not exceed max_workers",
            });
        }

        let (job_tx, job_rx) = mpsc::channel(1);

        let shared = Arc::new(Shared {
            config: self.config,
            ticker: self.ticker,
            job_rx: Mutex::new(job_rx),
            live: AtomicUsize::new(0),
            idle: AtomicUsize::new(0),
            open: AtomicBool::new(true),
            handles: StdMutex::new(Vec::new()),
        });

        for _ in 0..shared.config.min_workers {
            spawn_worker(&shared);
        }

        Ok(Runner {
            shared,
            job_tx: StdMutex::new(Some(job_tx)),
        })
    }
}

/// Handle to a running worker pool
pub struct Runner {
    shared: Arc<Shared>,
    job_tx: StdMutex<Option<mpsc::Sender<Job>>>,
}

impl Runner {
    /// Submit a job to the first available worker.
    ///
    /// Grows the pool when every worker is busy and the ceiling allows it.
    /// Fails with [`WorkerError::JobReceiveTimeout`] when no worker accepts
    /// the job within `job_receive_timeout`.
    pub async fn run<F>(&self, job: F) -> Result<(), WorkerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if !self.shared.open.load(Ordering::Acquire) {
            return Err(WorkerError::Closed);
        }

        let tx = self
            .job_tx
            .lock()
            .expect("job sender lock poisoned")
            .clone()
            .ok_or(WorkerError::Closed)?;

        if self.shared.idle.load(Ordering::Acquire) == 0 {
            grow(&self.shared);
        }

        let job: Job = Box::pin(job);
        let receive_timeout = self.shared.config.job_receive_timeout;

        match timeout(receive_timeout, tx.send(job)).await {
            Err(_) => Err(WorkerError::JobReceiveTimeout {
                timeout: receive_timeout,
            }),
            Ok(Err(_)) => Err(WorkerError::Closed),
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Live worker count.
    pub fn workers(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    /// Workers currently waiting for a job.
    pub fn idle_workers(&self) -> usize {
        self.shared.idle.load(Ordering::Acquire)
    }

    /// Stop accepting jobs, retire every worker and wait for them to exit.
    ///
    /// All workers are drained regardless of individual failures; the first
    /// abort observed is returned afterwards. Idempotent.
    pub async fn close(&self) -> Result<(), WorkerError> {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return Ok(());
        }

        // Dropping the sender ends every worker's receive loop
        self.job_tx
            .lock()
            .expect("job sender lock poisoned")
            .take();

        let handles = std::mem::take(
            &mut *self
                .shared
                .handles
                .lock()
                .expect("worker handle lock poisoned"),
        );

        let mut first_error = None;

        for handle in handles {
            if let Err(join_error) = handle.await {
                warn!(error = %join_error, "worker exited abnormally");
                first_error.get_or_insert(WorkerError::Aborted(join_error.to_string()));
            }
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

/// Reserve a live slot and spawn a worker into it.
fn spawn_worker(shared: &Arc<Shared>) {
    shared.live.fetch_add(1, Ordering::AcqRel);

    let handle = tokio::spawn(worker_loop(Arc::clone(shared)));

    shared
        .handles
        .lock()
        .expect("worker handle lock poisoned")
        .push(handle);
}

/// Grow the pool by one worker unless the ceiling is reached.
fn grow(shared: &Arc<Shared>) {
    let mut live = shared.live.load(Ordering::Acquire);

    loop {
        if live >= shared.config.max_workers {
            return;
        }

        match shared.live.compare_exchange(
            live,
            live + 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => break,
            Err(current) => live = current,
        }
    }

    let handle = tokio::spawn(worker_loop(Arc::clone(shared)));

    shared
        .handles
        .lock()
        .expect("worker handle lock poisoned")
        .push(handle);
}

/// Release a live slot if doing so keeps the pool at or above its minimum.
fn try_retire(shared: &Shared) -> bool {
    let mut live = shared.live.load(Ordering::Acquire);

    loop {
        if live <= shared.config.min_workers {
            return false;
        }

        match shared.live.compare_exchange(
            live,
            live - 1,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => return true,
            Err(current) => live = current,
        }
    }
}

async fn next_job(shared: &Shared) -> Option<Job> {
    shared.job_rx.lock().await.recv().await
}

async fn worker_loop(shared: Arc<Shared>) {
    loop {
        let idle_timer = match shared
            .ticker
            .register(shared.config.max_worker_idle)
            .await
        {
            Ok(waiting) => Some(waiting),
            // Ticker gone: shutdown is imminent, keep serving without
            // idle reclamation until the job channel closes.
            Err(_) => None,
        };

        shared.idle.fetch_add(1, Ordering::AcqRel);

        let received = match idle_timer {
            Some(waiting) => {
                tokio::select! {
                    job = next_job(&shared) => Some(job),
                    _ = waiting.wait() => None,
                }
            }
            None => Some(next_job(&shared).await),
        };

        shared.idle.fetch_sub(1, Ordering::AcqRel);

        match received {
            Some(Some(job)) => job.await,
            // Job channel closed: the pool is shutting down
            Some(None) => break,
            // Idle past the limit; retire unless that would undercut the
            // configured minimum
            None => {
                if try_retire(&shared) {
                    debug!("idle worker retired");
                    return;
                }
            }
        }
    }

    shared.live.fetch_sub(1, Ordering::AcqRel);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ticker::Ticker;
    use tokio::time::sleep;

    fn test_ticker() -> Arc<TickerHandle> {
        Arc::new(
            Ticker::new(Duration::from_millis(20), 64)
                .serve()
                .unwrap(),
        )
    }

    fn test_config() -> Config {
        Config {
            min_workers: 2,
            max_workers: 4,
            max_worker_idle: Duration::from_millis(150),
            job_receive_timeout: Duration::from_millis(200),
        }
    }

    #[test]
    fn test_automatic_min_worker_count() {
        assert_eq!(automatic_min_worker_count(6, 64), 6);
        assert_eq!(automatic_min_worker_count(500, 128), 128);
        assert_eq!(automatic_min_worker_count(0, 64), 1);
    }

    #[tokio::test]
    async fn test_prewarms_minimum() {
        let ticker = test_ticker();
        let runner = Pool::new(ticker.clone(), test_config()).serve().unwrap();

        assert_eq!(runner.workers(), 2);

        runner.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_grows_under_load_within_bounds() {
        let ticker = test_ticker();
        let runner = Pool::new(ticker.clone(), test_config()).serve().unwrap();

        let counter = Arc::new(AtomicUsize::new(0));

        for _ in 0..4 {
            let counter = Arc::clone(&counter);
            runner
                .run(async move {
                    sleep(Duration::from_millis(100)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .await
                .unwrap();
        }

        assert!(runner.workers() <= 4);

        sleep(Duration::from_millis(600)).await;
        assert_eq!(counter.load(Ordering::SeqCst), 4);
        assert!(runner.workers() >= 2);

        runner.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_idle_workers_retire_to_minimum() {
        let ticker = test_ticker();
        let runner = Pool::new(ticker.clone(), test_config()).serve().unwrap();

        for _ in 0..4 {
            runner
                .run(async {
                    sleep(Duration::from_millis(50)).await;
                })
                .await
                .unwrap();
        }

        // Well past max_worker_idle plus ticker resolution
        sleep(Duration::from_millis(600)).await;

        assert_eq!(runner.workers(), 2);

        runner.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_submission_times_out_when_saturated() {
        let ticker = test_ticker();
        let config = Config {
            min_workers: 1,
            max_workers: 1,
            max_worker_idle: Duration::from_secs(5),
            job_receive_timeout: Duration::from_millis(100),
        };
        let runner = Pool::new(ticker.clone(), config).serve().unwrap();

        // One job occupies the only worker, one sits in the hand-off slot;
        // the third has nobody to accept it.
        for _ in 0..2 {
            runner
                .run(async {
                    sleep(Duration::from_secs(1)).await;
                })
                .await
                .unwrap();
        }

        let result = runner.run(async {}).await;
        assert!(matches!(
            result,
            Err(WorkerError::JobReceiveTimeout { .. })
        ));

        runner.close().await.unwrap();
        ticker.close().await;
    }

    #[tokio::test]
    async fn test_close_drains_and_rejects() {
        let ticker = test_ticker();
        let runner = Pool::new(ticker.clone(), test_config()).serve().unwrap();

        let done = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&done);
        runner
            .run(async move {
                sleep(Duration::from_millis(50)).await;
                flag.store(true, Ordering::SeqCst);
            })
            .await
            .unwrap();

        runner.close().await.unwrap();

        // In-flight work finished before close returned
        assert!(done.load(Ordering::SeqCst));
        assert_eq!(runner.workers(), 0);

        assert!(matches!(
            runner.run(async {}).await,
            Err(WorkerError::Closed)
        ));

        // Idempotent
        runner.close().await.unwrap();

        ticker.close().await;
    }

    #[tokio::test]
    async fn test_rejects_bad_configuration() {
        let ticker = test_ticker();

        let result = Pool::new(
            ticker.clone(),
            Config {
                min_workers: 8,
                max_workers: 4,
                max_worker_idle: Duration::from_secs(1),
                job_receive_timeout: Duration::from_secs(1),
            },
        )
        .serve();

        assert!(matches!(result, Err(WorkerError::Misconfigured { .. })));

        ticker.close().await;
    }
}
