//! Delayed background jobs
//!
//! The primitive shared by the importer and the subscription deployer: a
//! job that runs once, some delay after it was triggered, coalescing
//! repeated triggers into a single run. At most one execution is active
//! per job; termination is cooperative via a cancellation token which
//! runners observe between work items. A job has exactly one start/stop
//! lifecycle and cannot be recycled.
//!
//! [`TickerJob`] is the production implementation; [`MockJob`] never
//! executes and exists for unit tests.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// The work a delayed job executes when its deadline fires.
#[async_trait]
pub trait JobRunner: Send + Sync {
    /// Runs one batch of work. Implementations check `cancel` between
    /// items and exit promptly once it is set.
    async fn run(&self, cancel: &CancellationToken);
}

/// A single-shot-with-coalescing delayed job.
#[async_trait]
pub trait DelayedJob: Send + Sync {
    /// Schedules one execution after the job's default delay. Repeated
    /// triggers before the run coalesce into one run.
    fn trigger(&self);

    /// Schedules with an explicit delay, which may be zero. An earlier
    /// already-pending deadline wins.
    fn trigger_after(&self, delay: Duration);

    /// Signals cancellation. No further work begins; a running worker is
    /// asked to exit at its next cancellation check.
    fn terminate(&self);

    fn is_terminated(&self) -> bool;

    /// Waits until the worker has exited. Returns false on timeout.
    /// Only meaningful after [`DelayedJob::terminate`].
    async fn wait_for_termination(&self, timeout: Duration) -> bool;
}

/// Production job backed by a tokio task.
pub struct TickerJob {
    default_delay: Duration,
    tx: mpsc::UnboundedSender<Duration>,
    cancel: CancellationToken,
    finished: watch::Receiver<bool>,
}

impl TickerJob {
    /// Spawns the worker task. `name` is used for log correlation only.
    pub fn start(
        name: impl Into<String>,
        default_delay: Duration,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        let name = name.into();
        let (tx, mut rx) = mpsc::unbounded_channel::<Duration>();
        let cancel = CancellationToken::new();
        let (finished_tx, finished_rx) = watch::channel(false);

        let token = cancel.clone();
        tokio::spawn(async move {
            let mut deadline: Option<Instant> = None;
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    request = rx.recv() => match request {
                        Some(delay) => {
                            let at = Instant::now() + delay;
                            deadline = Some(deadline.map_or(at, |d| d.min(at)));
                        }
                        None => break,
                    },
                    _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)),
                        if deadline.is_some() =>
                    {
                        deadline = None;
                        runner.run(&token).await;
                    }
                }
            }
            debug!(job = %name, "job worker exited");
            let _ = finished_tx.send(true);
        });

        Arc::new(Self {
            default_delay,
            tx,
            cancel,
            finished: finished_rx,
        })
    }
}

#[async_trait]
impl DelayedJob for TickerJob {
    fn trigger(&self) {
        let _ = self.tx.send(self.default_delay);
    }

    fn trigger_after(&self, delay: Duration) {
        let _ = self.tx.send(delay);
    }

    fn terminate(&self) {
        self.cancel.cancel();
    }

    fn is_terminated(&self) -> bool {
        self.cancel.is_cancelled()
    }

    async fn wait_for_termination(&self, timeout: Duration) -> bool {
        let mut finished = self.finished.clone();
        let result = tokio::time::timeout(timeout, finished.wait_for(|done| *done)).await;
        result.is_ok()
    }
}

/// Test double: never executes. Counts triggers so tests can assert on
/// scheduling behavior.
#[derive(Default)]
pub struct MockJob {
    triggers: AtomicU64,
    terminated: AtomicBool,
}

impl MockJob {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn trigger_count(&self) -> u64 {
        self.triggers.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DelayedJob for MockJob {
    fn trigger(&self) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }

    fn trigger_after(&self, _delay: Duration) {
        self.triggers.fetch_add(1, Ordering::SeqCst);
    }

    fn terminate(&self) {
        self.terminated.store(true, Ordering::SeqCst);
    }

    fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::SeqCst)
    }

    async fn wait_for_termination(&self, _timeout: Duration) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingRunner {
        runs: AtomicUsize,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _cancel: &CancellationToken) {
            self.runs.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn triggers_coalesce_into_one_run() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let job = TickerJob::start("test", Duration::from_secs(60), runner.clone());

        job.trigger();
        job.trigger();
        job.trigger();

        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);

        // A later trigger schedules a fresh run.
        job.trigger();
        tokio::time::sleep(Duration::from_secs(61)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn explicit_delay_wins_when_earlier() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let job = TickerJob::start("test", Duration::from_secs(60), runner.clone());

        job.trigger();
        job.trigger_after(Duration::ZERO);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn no_work_begins_after_terminate() {
        let runner = Arc::new(CountingRunner {
            runs: AtomicUsize::new(0),
        });
        let job = TickerJob::start("test", Duration::from_secs(1), runner.clone());

        job.trigger();
        job.terminate();
        assert!(job.is_terminated());
        assert!(job.wait_for_termination(Duration::from_secs(5)).await);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(runner.runs.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mock_job_never_executes() {
        let job = MockJob::new();
        job.trigger();
        job.trigger_after(Duration::ZERO);
        assert_eq!(job.trigger_count(), 2);
        assert!(!job.is_terminated());
        job.terminate();
        assert!(job.is_terminated());
        assert!(job.wait_for_termination(Duration::ZERO).await);
    }
}
