// src/runner/service.rs

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::protocol::{Line, messages};
use crate::types::Env;

/// Subsystem-specific logic hosted by a [`Runner`](crate::runner::Runner).
#[async_trait]
pub trait Service: Send + Sync {
    /// The activity. Call `ctx.started()` once it is live and return soon
    /// after `ctx.cancelled()` fires.
    async fn activity(&self, ctx: RunnerContext) -> anyhow::Result<()>;

    /// Answer a correlated request. An `Err` is sent back as the response's
    /// `error` field.
    async fn request(
        &self,
        ctx: &RunnerContext,
        message: &str,
        payload: Value,
    ) -> anyhow::Result<Value>;

    /// One-way notification from the parent.
    async fn notify(&self, _ctx: &RunnerContext, message: &str, _payload: Value) -> anyhow::Result<()> {
        debug!(%message, "notification ignored");
        Ok(())
    }
}

/// What a service sees of its runner.
#[derive(Debug, Clone)]
pub struct RunnerContext {
    name: String,
    env: Env,
    config: Value,
    out: mpsc::UnboundedSender<Line>,
    announced: Arc<AtomicBool>,
    cancel: CancellationToken,
}

impl RunnerContext {
    pub(crate) fn new(
        name: String,
        env: Env,
        config: Value,
        out: mpsc::UnboundedSender<Line>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            env,
            config,
            out,
            announced: Arc::new(AtomicBool::new(false)),
            cancel,
        }
    }

    /// Subsystem name given by the parent.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    pub fn config(&self) -> &Value {
        &self.config
    }

    /// Tell the parent the activity is live. Only the first call counts.
    pub fn started(&self) {
        if !self.announced.swap(true, Ordering::SeqCst) {
            self.send(Line::control(messages::STARTED));
        }
    }

    pub fn notify(&self, message: impl Into<String>, payload: Value) {
        self.send(Line::notification(message, payload));
    }

    /// Log through the parent's log at `level`.
    pub fn log(&self, level: &str, message: impl Into<String>) {
        self.send(Line::notification(
            messages::LOG,
            json!({ "level": level, "message": message.into() }),
        ));
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves when the runner is winding down.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn send(&self, line: Line) {
        if self.out.send(line).is_err() {
            debug!(subsystem = %self.name, "runner output closed");
        }
    }
}
