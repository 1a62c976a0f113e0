// src/module/handle.rs

use std::time::Duration;

use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::debug;

use crate::errors::{AthomeError, Result};
use crate::lifecycle::LifecycleState;
use crate::module::message::{Message, Signal};
use crate::protocol::Line;

/// Non-owning handle to a module: its name, its queue and its observable
/// state. Everything a handle does goes through the queue.
#[derive(Debug, Clone)]
pub struct ModuleHandle {
    name: String,
    tx: mpsc::UnboundedSender<Message>,
    state: watch::Receiver<LifecycleState>,
}

impl ModuleHandle {
    pub(crate) fn new(
        name: String,
        tx: mpsc::UnboundedSender<Message>,
        state: watch::Receiver<LifecycleState>,
    ) -> Self {
        Self { name, tx, state }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    /// Enqueue `message`. Returns `false` once the module's cycle has ended.
    pub fn send(&self, message: Message) -> bool {
        match self.tx.send(message) {
            Ok(()) => true,
            Err(err) => {
                debug!(module = %self.name, kind = err.0.kind(), "module queue closed");
                false
            }
        }
    }

    pub fn start(&self) -> bool {
        self.send(Message::Start)
    }

    pub fn stop(&self) -> bool {
        self.send(Message::Stop)
    }

    pub fn shutdown(&self) -> bool {
        self.send(Message::Shutdown)
    }

    pub fn event(&self, value: impl Into<String>, data: Value) -> bool {
        self.send(Message::event(value, data))
    }

    /// The activity is live.
    pub fn started(&self) -> bool {
        self.send(Message::Signal(Signal::Started))
    }

    /// The activity has wound down.
    pub fn stopped(&self) -> bool {
        self.send(Message::Signal(Signal::Stopped))
    }

    pub fn fail(&self, reason: impl Into<String>) -> bool {
        self.send(Message::Signal(Signal::Failed(reason.into())))
    }

    pub fn line(&self, line: Option<Line>) -> bool {
        self.send(Message::Line(line))
    }

    /// Wait until the state satisfies `pred`, bounded by `timeout`.
    pub async fn wait_for<P>(&self, timeout: Duration, mut pred: P) -> Result<LifecycleState>
    where
        P: FnMut(LifecycleState) -> bool,
    {
        let mut rx = self.state.clone();
        let reached = async move {
            match rx.wait_for(|state| pred(*state)).await {
                Ok(state) => Some(*state),
                Err(_) => None,
            }
        };
        match tokio::time::timeout(timeout, reached).await {
            Ok(Some(state)) => Ok(state),
            // The module is gone; report whatever it ended in.
            Ok(None) => Ok(self.state()),
            Err(_) => Err(AthomeError::Timeout(timeout)),
        }
    }
}
