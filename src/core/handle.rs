// src/core/handle.rs

use serde_json::Value;
use tokio::sync::mpsc;
use tracing::debug;

/// Requests flowing from subsystems (and signal handlers) to the supervisor.
#[derive(Debug, Clone, PartialEq)]
pub enum CoreCommand {
    /// Broadcast `event` to every registered subsystem.
    Emit { event: String, data: Value },
    /// Leave the serve loop and stop the system.
    RequestStop,
    /// Leave the serve loop, stop and shut down.
    RequestShutdown,
}

/// Shared handle to the supervisor's queue. Passed to every subsystem.
#[derive(Debug, Clone)]
pub struct CoreHandle {
    tx: mpsc::UnboundedSender<CoreCommand>,
}

impl CoreHandle {
    /// New handle plus the receiving end the supervisor consumes.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<CoreCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Handle whose commands go nowhere. Handy for standalone modules.
    pub fn detached() -> Self {
        Self::channel().0
    }

    pub fn emit(&self, event: impl Into<String>, data: Value) {
        self.send(CoreCommand::Emit {
            event: event.into(),
            data,
        });
    }

    pub fn request_stop(&self) {
        self.send(CoreCommand::RequestStop);
    }

    pub fn request_shutdown(&self) {
        self.send(CoreCommand::RequestShutdown);
    }

    fn send(&self, command: CoreCommand) {
        if let Err(err) = self.tx.send(command) {
            debug!(command = ?err.0, "core queue closed; dropping command");
        }
    }
}
