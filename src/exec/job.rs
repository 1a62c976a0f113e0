// src/exec/job.rs

//! A single tracked unit of background work.

use std::fmt;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::errors::{AthomeError, Result};
use crate::exec::sink::TaskFailure;

pub type JobId = u64;

type SuccessFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;
type ErrorFn = Box<dyn FnOnce(&anyhow::Error) -> anyhow::Result<()> + Send>;
type CancelFn = Box<dyn FnOnce() -> anyhow::Result<()> + Send>;

/// Optional completion callbacks. Exactly one fires per job, chosen by
/// outcome with priority cancellation > error > success.
///
/// A callback that returns `Err` is reported like a failure of the work
/// itself.
#[derive(Default)]
pub struct JobCallbacks {
    pub(crate) on_success: Option<SuccessFn>,
    pub(crate) on_error: Option<ErrorFn>,
    pub(crate) on_cancel: Option<CancelFn>,
}

impl JobCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.on_success = Some(Box::new(f));
        self
    }

    /// Handle the work's error. Returning `Ok` marks it as handled; without
    /// this callback the error goes to the exception sink.
    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: FnOnce(&anyhow::Error) -> anyhow::Result<()> + Send + 'static,
    {
        self.on_error = Some(Box::new(f));
        self
    }

    pub fn on_cancel<F>(mut self, f: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<()> + Send + 'static,
    {
        self.on_cancel = Some(Box::new(f));
        self
    }
}

impl fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobCallbacks")
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_cancel", &self.on_cancel.is_some())
            .finish()
    }
}

/// How a job's work ended, before callbacks run.
#[derive(Debug)]
pub(crate) enum JobOutcome {
    Success,
    Error(anyhow::Error),
    Cancelled,
}

impl JobOutcome {
    /// Run the matching callback and return whatever is left as a failure.
    pub(crate) fn settle(self, callbacks: JobCallbacks) -> Option<anyhow::Error> {
        match self {
            JobOutcome::Cancelled => callbacks.on_cancel.and_then(|cb| cb().err()),
            JobOutcome::Error(err) => match callbacks.on_error {
                Some(cb) => cb(&err).err(),
                None => Some(err),
            },
            JobOutcome::Success => callbacks.on_success.and_then(|cb| cb().err()),
        }
    }
}

/// Where a failure goes when no waiter claims it.
pub(crate) type Reporter = Arc<dyn Fn(TaskFailure) + Send + Sync>;

#[derive(Debug, Default)]
struct Settlement {
    waiters: usize,
    done: bool,
    failure: Option<TaskFailure>,
}

pub(crate) struct JobShared {
    settlement: Mutex<Settlement>,
    finished: watch::Sender<bool>,
    report: Reporter,
}

impl fmt::Debug for JobShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobShared")
            .field("settlement", &self.settlement)
            .finish_non_exhaustive()
    }
}

impl JobShared {
    pub(crate) fn new(report: Reporter) -> Self {
        let (finished, _) = watch::channel(false);
        Self {
            settlement: Mutex::new(Settlement::default()),
            finished,
            report,
        }
    }

    /// Record how the job ended. A failure is parked for a live waiter,
    /// otherwise it is reported right away.
    pub(crate) fn settle(&self, failure: Option<TaskFailure>) {
        let orphan = match self.settlement.lock() {
            Ok(mut settlement) => {
                settlement.done = true;
                if settlement.waiters > 0 {
                    settlement.failure = failure;
                    None
                } else {
                    failure
                }
            }
            Err(_) => failure,
        };
        if let Some(failure) = orphan {
            (self.report)(failure);
        }
    }

    pub(crate) fn mark_finished(&self) {
        self.finished.send_replace(true);
    }

    fn claim(&self) -> WaitClaim<'_> {
        if let Ok(mut settlement) = self.settlement.lock() {
            settlement.waiters += 1;
        }
        WaitClaim { shared: self }
    }

    fn take_failure(&self) -> Option<TaskFailure> {
        self.settlement.lock().ok().and_then(|mut s| s.failure.take())
    }
}

/// Held by an in-flight `Job::wait`. When the last waiter gives up after the
/// job finished, the parked failure goes to the reporter.
struct WaitClaim<'a> {
    shared: &'a JobShared,
}

impl Drop for WaitClaim<'_> {
    fn drop(&mut self) {
        let orphan = match self.shared.settlement.lock() {
            Ok(mut settlement) => {
                settlement.waiters = settlement.waiters.saturating_sub(1);
                if settlement.waiters == 0 && settlement.done {
                    settlement.failure.take()
                } else {
                    None
                }
            }
            Err(_) => None,
        };
        if let Some(failure) = orphan {
            (self.shared.report)(failure);
        }
    }
}

/// Handle to a job scheduled on an [`Executor`](crate::exec::Executor).
///
/// Dropping the handle does not cancel the job.
#[derive(Debug, Clone)]
pub struct Job {
    id: JobId,
    token: CancellationToken,
    shared: Arc<JobShared>,
}

impl Job {
    pub(crate) fn new(id: JobId, token: CancellationToken, shared: Arc<JobShared>) -> Self {
        Self { id, token, shared }
    }

    pub fn id(&self) -> JobId {
        self.id
    }

    /// Request cooperative cancellation. Never blocks.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        *self.shared.finished.borrow()
    }

    /// Wait for the job and take its failure for yourself.
    ///
    /// A failure that ends the job while `wait` is pending is returned here
    /// as `TaskFailure` and never reaches the exception sink. If the wait
    /// times out or is dropped first, the failure is reported as usual. A
    /// failure that was already reported before `wait` was called is not
    /// returned again.
    pub async fn wait(&self, timeout: Option<Duration>) -> Result<()> {
        let _claim = self.shared.claim();

        let mut rx = self.shared.finished.subscribe();
        let finished = async move {
            let _ = rx.wait_for(|done| *done).await;
        };
        match timeout {
            Some(limit) => tokio::time::timeout(limit, finished)
                .await
                .map_err(|_| AthomeError::Timeout(limit))?,
            None => finished.await,
        }

        match self.shared.take_failure() {
            Some(failure) => Err(AthomeError::TaskFailure(failure.to_string())),
            None => Ok(()),
        }
    }
}
