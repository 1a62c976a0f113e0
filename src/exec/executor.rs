// src/exec/executor.rs

//! Per-module executor: runs jobs, tracks them until completion and funnels
//! uncaught failures to the exception sink.

use std::backtrace::Backtrace;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::errors::{AthomeError, Result};
use crate::exec::job::{Job, JobCallbacks, JobId, JobOutcome, JobShared, Reporter};
use crate::exec::sink::{FailureHandler, TaskFailure, default_handler, deliver, spawn_sink};

/// Cheaply cloneable; clones share the same live set and sink.
#[derive(Clone)]
pub struct Executor {
    inner: Arc<Inner>,
}

struct Inner {
    name: String,
    next_id: AtomicU64,
    live: Mutex<HashMap<JobId, CancellationToken>>,
    live_count: watch::Sender<usize>,
    handler: FailureHandler,
    sink_tx: Mutex<Option<mpsc::UnboundedSender<TaskFailure>>>,
    sink_task: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("name", &self.inner.name)
            .field("live_jobs", &self.live_jobs())
            .finish_non_exhaustive()
    }
}

impl Executor {
    /// Create an executor whose sink logs failures.
    ///
    /// Must be called inside a Tokio runtime: the sink task is spawned here.
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_handler(name, default_handler())
    }

    pub fn with_handler(name: impl Into<String>, handler: FailureHandler) -> Self {
        let (sink_tx, sink_rx) = mpsc::unbounded_channel();
        let sink_task = spawn_sink(sink_rx, handler.clone());
        let (live_count, _) = watch::channel(0);

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                next_id: AtomicU64::new(1),
                live: Mutex::new(HashMap::new()),
                live_count,
                handler,
                sink_tx: Mutex::new(Some(sink_tx)),
                sink_task: Mutex::new(Some(sink_task)),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Schedule `work` and return immediately.
    #[track_caller]
    pub fn execute<F>(&self, work: F) -> Job
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(work, JobCallbacks::default(), Location::caller())
    }

    /// Schedule `work` with completion callbacks.
    #[track_caller]
    pub fn execute_with<F>(&self, work: F, callbacks: JobCallbacks) -> Job
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        self.spawn(work, callbacks, Location::caller())
    }

    fn spawn<F>(
        &self,
        work: F,
        callbacks: JobCallbacks,
        spawned_at: &'static Location<'static>,
    ) -> Job
    where
        F: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let token = CancellationToken::new();
        let reporter: Reporter = {
            let inner = self.inner.clone();
            Arc::new(move |failure: TaskFailure| inner.report(failure))
        };
        let shared = Arc::new(JobShared::new(reporter));
        let backtrace = Arc::new(Backtrace::capture());

        self.inner.track(id, token.clone());
        debug!(executor = %self.inner.name, job = id, %spawned_at, "job scheduled");

        let inner = self.inner.clone();
        let job_token = token.clone();
        let job_shared = shared.clone();
        tokio::spawn(async move {
            let _tracked = Tracked {
                inner: &inner,
                shared: &job_shared,
                id,
            };
            let outcome = run_work(work, &job_token).await;
            debug!(executor = %inner.name, job = id, ?outcome, "job completed");

            let failure = settle_contained(outcome, callbacks).map(|error| TaskFailure {
                job: id,
                executor: inner.name.clone(),
                spawned_at,
                backtrace,
                error,
            });
            job_shared.settle(failure);
        });

        Job::new(id, token, shared)
    }

    /// Request cancellation of every live job. Never blocks.
    pub fn cancel(&self) {
        let tokens: Vec<CancellationToken> = match self.inner.live.lock() {
            Ok(live) => live.values().cloned().collect(),
            Err(_) => return,
        };
        debug!(executor = %self.inner.name, jobs = tokens.len(), "cancelling live jobs");
        for token in tokens {
            token.cancel();
        }
    }

    /// Wait until no job is live. `None` waits forever.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let mut rx = self.inner.live_count.subscribe();
        let drained = async move {
            let _ = rx.wait_for(|count| *count == 0).await;
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, drained)
                .await
                .map_err(|_| AthomeError::Timeout(limit)),
            None => {
                drained.await;
                Ok(())
            }
        }
    }

    pub fn live_jobs(&self) -> usize {
        *self.inner.live_count.borrow()
    }

    /// Cancel everything, wait for the jobs to finish, then stop the sink
    /// once it has handled every pending failure.
    pub async fn close(&self, timeout: Option<Duration>) -> Result<()> {
        self.cancel();
        let drained = self.wait(timeout).await;

        let sender = self.inner.sink_tx.lock().ok().and_then(|mut tx| tx.take());
        drop(sender);
        let sink = self.inner.sink_task.lock().ok().and_then(|mut task| task.take());
        if let Some(sink) = sink {
            if let Err(err) = sink.await {
                warn!(executor = %self.inner.name, error = %err, "exception sink ended abnormally");
            }
        }
        drained
    }
}

impl Inner {
    fn track(&self, id: JobId, token: CancellationToken) {
        if let Ok(mut live) = self.live.lock() {
            live.insert(id, token);
            self.live_count.send_replace(live.len());
        }
    }

    fn untrack(&self, id: JobId) {
        if let Ok(mut live) = self.live.lock() {
            if live.remove(&id).is_some() {
                self.live_count.send_replace(live.len());
            }
        }
    }

    fn report(&self, failure: TaskFailure) {
        let tx = self.sink_tx.lock().ok().and_then(|tx| tx.clone());
        match tx {
            Some(tx) => {
                if let Err(mpsc::error::SendError(failure)) = tx.send(failure) {
                    deliver(&self.handler, &failure);
                }
            }
            // Closed executor: no sink left, handle inline.
            None => deliver(&self.handler, &failure),
        }
    }
}

/// Removes the job from the live set and wakes its waiters however the
/// task ends.
struct Tracked<'a> {
    inner: &'a Inner,
    shared: &'a JobShared,
    id: JobId,
}

impl Drop for Tracked<'_> {
    fn drop(&mut self) {
        self.inner.untrack(self.id);
        self.shared.mark_finished();
    }
}

/// Run the completion callback; a panicking callback counts as a failure.
fn settle_contained(outcome: JobOutcome, callbacks: JobCallbacks) -> Option<anyhow::Error> {
    match catch_unwind(AssertUnwindSafe(|| outcome.settle(callbacks))) {
        Ok(left) => left,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Some(anyhow::anyhow!("completion callback panicked: {message}"))
        }
    }
}

/// Drive `work` on its own task so a panic or cancellation ends only the work.
async fn run_work<F>(work: F, token: &CancellationToken) -> JobOutcome
where
    F: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    let mut task = tokio::spawn(work);

    tokio::select! {
        biased;
        _ = token.cancelled() => {
            task.abort();
            let _ = task.await;
            JobOutcome::Cancelled
        }
        joined = &mut task => {
            if token.is_cancelled() {
                return JobOutcome::Cancelled;
            }
            match joined {
                Ok(Ok(())) => JobOutcome::Success,
                Ok(Err(err)) => JobOutcome::Error(err),
                Err(err) if err.is_cancelled() => JobOutcome::Cancelled,
                Err(err) => JobOutcome::Error(anyhow::anyhow!("job panicked: {err}")),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use anyhow::anyhow;

    use super::*;

    #[tokio::test]
    async fn live_set_empties_after_completion() {
        let executor = Executor::new("t");
        let job = executor.execute(async { Ok(()) });
        job.wait(Some(Duration::from_secs(1))).await.unwrap();
        executor.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(executor.live_jobs(), 0);
        assert!(job.is_finished());
    }

    #[tokio::test]
    async fn waited_job_returns_its_own_failure() {
        let sunk = Arc::new(AtomicUsize::new(0));
        let counter = sunk.clone();
        let executor = Executor::with_handler(
            "t",
            Arc::new(move |_: &TaskFailure| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let job = executor.execute(async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            Err(anyhow!("boom"))
        });
        let err = job.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, AthomeError::TaskFailure(ref msg) if msg.contains("boom")));

        executor.close(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(sunk.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn cancel_beats_pending_work() {
        let executor = Executor::new("t");
        let cancelled = Arc::new(AtomicUsize::new(0));
        let seen = cancelled.clone();
        let job = executor.execute_with(
            std::future::pending(),
            JobCallbacks::new()
                .on_success(|| Err(anyhow!("must not run")))
                .on_cancel(move || {
                    seen.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }),
        );

        executor.cancel();
        job.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(cancelled.load(Ordering::SeqCst), 1);
        assert_eq!(executor.live_jobs(), 0);
    }

    #[tokio::test]
    async fn wait_times_out_with_live_job() {
        let executor = Executor::new("t");
        let _job = executor.execute(std::future::pending());
        let err = executor.wait(Some(Duration::from_millis(30))).await.unwrap_err();
        assert!(matches!(err, AthomeError::Timeout(_)));
        executor.cancel();
        executor.wait(Some(Duration::from_secs(1))).await.unwrap();
    }

    #[tokio::test]
    async fn panicking_work_is_reported() {
        let executor = Executor::new("t");
        let job = executor.execute(async { panic!("kaboom") });
        let err = job.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(matches!(err, AthomeError::TaskFailure(ref msg) if msg.contains("panicked")));
    }

    fn counting_handler() -> (FailureHandler, Arc<AtomicUsize>) {
        let sunk = Arc::new(AtomicUsize::new(0));
        let counter = sunk.clone();
        let handler: FailureHandler = Arc::new(move |_: &TaskFailure| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        (handler, sunk)
    }

    #[tokio::test]
    async fn failure_after_timed_out_wait_reaches_the_sink() {
        let (handler, sunk) = counting_handler();
        let executor = Executor::with_handler("t", handler);

        let job = executor.execute(async {
            tokio::time::sleep(Duration::from_millis(100)).await;
            Err(anyhow!("late"))
        });
        let err = job.wait(Some(Duration::from_millis(10))).await.unwrap_err();
        assert!(matches!(err, AthomeError::Timeout(_)));

        executor.wait(Some(Duration::from_secs(1))).await.unwrap();
        executor.close(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(sunk.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dropped_wait_releases_the_failure() {
        let (handler, sunk) = counting_handler();
        let executor = Executor::with_handler("t", handler);

        let job = executor.execute(async {
            tokio::time::sleep(Duration::from_millis(50)).await;
            Err(anyhow!("late"))
        });
        {
            let pending = job.wait(None);
            let _ = tokio::time::timeout(Duration::from_millis(5), pending).await;
        }

        executor.wait(Some(Duration::from_secs(1))).await.unwrap();
        executor.close(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(sunk.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn panicking_callback_is_a_failure_and_untracks_the_job() {
        let (handler, sunk) = counting_handler();
        let executor = Executor::with_handler("t", handler);

        let job = executor.execute_with(
            async { Ok(()) },
            JobCallbacks::new().on_success(|| panic!("callback exploded")),
        );

        executor.wait(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(executor.live_jobs(), 0);
        assert!(job.is_finished());

        executor.close(Some(Duration::from_secs(1))).await.unwrap();
        assert_eq!(sunk.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn waiter_sees_panicking_callback_failure() {
        let executor = Executor::new("t");
        let job = executor.execute_with(
            async { Ok(()) },
            JobCallbacks::new().on_success(|| panic!("callback exploded")),
        );
        let err = job.wait(Some(Duration::from_secs(1))).await.unwrap_err();
        assert!(
            matches!(err, AthomeError::TaskFailure(ref msg) if msg.contains("callback exploded"))
        );
    }
}
