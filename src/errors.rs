// src/errors.rs

//! Crate-wide error type and `Result` alias.

use std::time::Duration;

use thiserror::Error;

use crate::lifecycle::{LifecycleState, Trigger};

#[derive(Error, Debug)]
pub enum AthomeError {
    /// A lifecycle trigger was fired from a state that has no edge for it.
    #[error("invalid transition for module '{module}': cannot {trigger} while {state}")]
    InvalidTransition {
        module: String,
        trigger: Trigger,
        state: LifecycleState,
    },

    /// Malformed line, correlation mismatch or out-of-order handshake.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A child process did not acknowledge stop/shutdown in time.
    #[error("child of subsystem '{name}' did not exit within {timeout:?}")]
    ChildTimeout { name: String, timeout: Duration },

    /// Uncaught failure of background work.
    #[error("task failure: {0}")]
    TaskFailure(String),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Cycle detected in subsystem dependencies: {0}")]
    DependencyCycle(String),

    #[error("unknown subsystem class '{class}' for subsystem '{name}'")]
    UnknownSubsystemClass { name: String, class: String },

    #[error("subsystem not found: {0}")]
    SubsystemNotFound(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parsing error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl AthomeError {
    /// Short stable label for log fields.
    pub fn as_label(&self) -> &'static str {
        match self {
            AthomeError::InvalidTransition { .. } => "invalid_transition",
            AthomeError::ProtocolViolation(_) => "protocol_violation",
            AthomeError::ChildTimeout { .. } => "child_timeout",
            AthomeError::TaskFailure(_) => "task_failure",
            AthomeError::Timeout(_) => "timeout",
            AthomeError::ConfigError(_) => "config_error",
            AthomeError::DependencyCycle(_) => "dependency_cycle",
            AthomeError::UnknownSubsystemClass { .. } => "unknown_subsystem_class",
            AthomeError::SubsystemNotFound(_) => "subsystem_not_found",
            AthomeError::Io(_) => "io",
            AthomeError::Json(_) => "json",
            AthomeError::Toml(_) => "toml",
            AthomeError::Other(_) => "other",
        }
    }

    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        AthomeError::ProtocolViolation(msg.into())
    }
}

pub use anyhow::Error;
pub type Result<T> = std::result::Result<T, AthomeError>;
