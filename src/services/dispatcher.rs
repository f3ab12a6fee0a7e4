//! Deadline-bound dispatch of webhook processing.
//!
//! The marketplace disables an integration whose responses keep exceeding
//! its hard ceiling, while processing (store writes, API calls) has no upper
//! bound. The dispatcher races the work against a timer set to
//! `deadline - buffer` and answers with whichever settles first.
//!
//! # Abandon, Don't Cancel
//!
//! The work runs as its own task on the shared [`TaskTracker`]. When the timer
//! wins, the `JoinHandle` is dropped, which detaches the task rather than
//! aborting it: processing still runs to completion and may write to the
//! store after the response went out. Handlers are idempotent overwrites, so
//! a late finish is harmless. Shutdown waits on the tracker, so abandoned work
//! is not cut off by a deploy.

use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::time::{Instant, sleep_until};
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use crate::metrics;

/// Which side of the race settled first.
#[derive(Debug)]
pub enum Dispatched<T> {
    /// The work finished inside the budget.
    Completed { value: T, elapsed: Duration },
    /// The budget ran out; the work keeps running detached.
    TimedOut { elapsed: Duration },
    /// The work panicked inside the budget.
    Panicked { elapsed: Duration },
}

impl<T> Dispatched<T> {
    pub fn elapsed(&self) -> Duration {
        match self {
            Dispatched::Completed { elapsed, .. }
            | Dispatched::TimedOut { elapsed }
            | Dispatched::Panicked { elapsed } => *elapsed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DeadlineDispatcher {
    budget: Duration,
    tracker: TaskTracker,
}

impl DeadlineDispatcher {
    /// `budget` is the hard deadline minus the safety buffer.
    pub fn new(budget: Duration, tracker: TaskTracker) -> Self {
        Self { budget, tracker }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    /// Race `work` against the budget.
    ///
    /// Always returns within the budget (plus scheduling jitter), whatever
    /// `work` does, including never resolving.
    pub async fn dispatch<F, T>(&self, work: F) -> Dispatched<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.dispatch_from(Instant::now(), work).await
    }

    /// Like [`Self::dispatch`], but the budget is measured from `started`
    /// (request arrival) so time spent before dispatch counts against it.
    pub async fn dispatch_from<F, T>(&self, started: Instant, work: F) -> Dispatched<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let deadline = started + self.budget;
        let abandoned = Arc::new(AtomicBool::new(false));
        let flag = abandoned.clone();

        let mut handle = self.tracker.spawn(async move {
            let value = work.await;
            if flag.load(Ordering::Acquire) {
                debug!("Abandoned webhook processing finished after its response");
                metrics::record_abandoned_completion("completed");
            }
            value
        });

        tokio::select! {
            biased;

            joined = &mut handle => match joined {
                Ok(value) => Dispatched::Completed {
                    value,
                    elapsed: started.elapsed(),
                },
                Err(e) => {
                    error!(error = %e, "Webhook processing task failed");
                    Dispatched::Panicked {
                        elapsed: started.elapsed(),
                    }
                }
            },

            _ = sleep_until(deadline) => {
                abandoned.store(true, Ordering::Release);
                metrics::record_deadline_timeout();
                warn!(
                    budget_ms = self.budget.as_millis() as u64,
                    "Processing budget exhausted, responding before completion"
                );
                Dispatched::TimedOut {
                    elapsed: started.elapsed(),
                }
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use tokio::time::sleep;

    fn dispatcher(budget_ms: u64) -> (DeadlineDispatcher, TaskTracker) {
        let tracker = TaskTracker::new();
        (
            DeadlineDispatcher::new(Duration::from_millis(budget_ms), tracker.clone()),
            tracker,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_fast_work_completes() {
        let (dispatcher, _) = dispatcher(475);

        let result = dispatcher
            .dispatch(async {
                sleep(Duration::from_millis(10)).await;
                42
            })
            .await;

        match result {
            Dispatched::Completed { value, elapsed } => {
                assert_eq!(value, 42);
                assert!(elapsed < Duration::from_millis(475));
            }
            other => panic!("expected completion, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_work_times_out_and_keeps_running() {
        let (dispatcher, tracker) = dispatcher(475);
        let finished = Arc::new(AtomicBool::new(false));
        let done = finished.clone();

        let result = dispatcher
            .dispatch(async move {
                sleep(Duration::from_secs(2)).await;
                done.store(true, Ordering::SeqCst);
            })
            .await;

        let elapsed = result.elapsed();
        assert!(matches!(result, Dispatched::TimedOut { .. }));
        assert!(elapsed >= Duration::from_millis(475));
        assert!(elapsed < Duration::from_millis(500));
        assert!(!finished.load(Ordering::SeqCst));

        tracker.close();
        tracker.wait().await;
        assert!(finished.load(Ordering::SeqCst));
    }

    #[tokio::test(start_paused = true)]
    async fn test_never_resolving_work_still_answers() {
        let (dispatcher, _) = dispatcher(100);

        let result = dispatcher.dispatch(std::future::pending::<()>()).await;

        assert!(matches!(result, Dispatched::TimedOut { .. }));
        assert!(result.elapsed() >= Duration::from_millis(100));
        assert!(result.elapsed() < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_counts_from_request_arrival() {
        let (dispatcher, _) = dispatcher(100);
        let arrived = Instant::now();
        sleep(Duration::from_millis(60)).await;

        let result = dispatcher
            .dispatch_from(arrived, std::future::pending::<()>())
            .await;

        assert!(matches!(result, Dispatched::TimedOut { .. }));
        assert!(result.elapsed() >= Duration::from_millis(100));
        assert!(result.elapsed() < Duration::from_millis(110));
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_work_is_contained() {
        let (dispatcher, _) = dispatcher(100);

        let result = dispatcher
            .dispatch(async {
                panic!("handler bug");
            })
            .await;

        assert!(matches!(result, Dispatched::<()>::Panicked { .. }));
    }
}
