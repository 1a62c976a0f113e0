// src/module/message.rs

use serde_json::Value;

use crate::protocol::Line;

/// Supervisor-wide lifecycle events.
pub mod events {
    pub const STARTING: &str = "athome_starting";
    pub const STARTED: &str = "athome_started";
    pub const STOPPING: &str = "athome_stopping";
    pub const STOPPED: &str = "athome_stopped";
    pub const SHUTDOWN: &str = "athome_shutdown";

    pub fn subsystem_started(name: &str) -> String {
        format!("{name}_started")
    }

    pub fn subsystem_stopped(name: &str) -> String {
        format!("{name}_stopped")
    }
}

/// Entry of a module's message queue.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Start,
    Stop,
    Shutdown,
    Event { value: String, data: Value },
    /// A frame from the child process; `None` is end of stream.
    Line(Option<Line>),
    /// Completion signal from the module's own background work.
    Signal(Signal),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Signal {
    Started,
    Stopped,
    Failed(String),
}

impl Message {
    pub fn event(value: impl Into<String>, data: Value) -> Self {
        Message::Event {
            value: value.into(),
            data,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Message::Start => "start",
            Message::Stop => "stop",
            Message::Shutdown => "shutdown",
            Message::Event { .. } => "event",
            Message::Line(_) => "line",
            Message::Signal(_) => "signal",
        }
    }
}
