// src/exec/sink.rs

//! The exception sink: one background task per executor that receives every
//! job failure nobody waited for and hands it to a handler.

use std::backtrace::Backtrace;
use std::fmt;
use std::panic::{AssertUnwindSafe, Location, catch_unwind};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::error;

use crate::exec::job::JobId;

/// Handler invoked by the sink for each uncaught failure.
pub type FailureHandler = Arc<dyn Fn(&TaskFailure) + Send + Sync>;

/// Everything known about a failed job.
pub struct TaskFailure {
    pub job: JobId,
    pub executor: String,
    /// Where `execute` was called.
    pub spawned_at: &'static Location<'static>,
    /// Stack captured at `execute` (only populated when `RUST_BACKTRACE` is set).
    pub backtrace: Arc<Backtrace>,
    pub error: anyhow::Error,
}

impl fmt::Debug for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskFailure")
            .field("job", &self.job)
            .field("executor", &self.executor)
            .field("spawned_at", &self.spawned_at)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "job {} on executor '{}' (spawned at {}) failed: {:#}",
            self.job, self.executor, self.spawned_at, self.error
        )
    }
}

/// Default handler: one `error` record per failure.
pub fn log_failure(failure: &TaskFailure) {
    error!(
        executor = %failure.executor,
        job = failure.job,
        spawned_at = %failure.spawned_at,
        error = ?failure.error,
        backtrace = %failure.backtrace,
        "uncaught job failure"
    );
}

pub(crate) fn default_handler() -> FailureHandler {
    Arc::new(log_failure)
}

/// Invoke `handler`, containing a panicking handler.
pub(crate) fn deliver(handler: &FailureHandler, failure: &TaskFailure) {
    if catch_unwind(AssertUnwindSafe(|| handler(failure))).is_err() {
        error!(
            executor = %failure.executor,
            job = failure.job,
            "exception handler panicked"
        );
    }
}

/// Spawn the sink task draining `rx` until every sender is gone.
pub(crate) fn spawn_sink(
    mut rx: mpsc::UnboundedReceiver<TaskFailure>,
    handler: FailureHandler,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(failure) = rx.recv().await {
            deliver(&handler, &failure);
        }
    })
}
