// src/config/model.rs

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::types::{Env, HumanDuration, ShutdownPolicy};

/// Configuration as read from `athome.toml`, before validation.
///
/// ```toml
/// [env]
/// run_dir = "./run"
///
/// [core]
/// stop_timeout = "5s"
/// shutdown_policy = "implicit_stop"
///
/// [subsystem.broker]
/// class = "proc"
/// [subsystem.broker.process]
/// module = "echo"
/// ```
///
/// All sections are optional and have reasonable defaults.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct RawConfigFile {
    #[serde(default)]
    pub env: Env,

    #[serde(default)]
    pub core: CoreSection,

    #[serde(default)]
    pub logging: LoggingSection,

    /// All subsystems from `[subsystem.<name>]`, keyed by subsystem name.
    #[serde(default)]
    pub subsystem: BTreeMap<String, SubsystemConfig>,
}

/// Validated configuration. Only obtainable through `TryFrom<RawConfigFile>`.
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub env: Env,
    pub core: CoreSection,
    pub logging: LoggingSection,
    pub subsystem: BTreeMap<String, SubsystemConfig>,
}

impl ConfigFile {
    pub(crate) fn new_unchecked(raw: RawConfigFile) -> Self {
        Self {
            env: raw.env,
            core: raw.core,
            logging: raw.logging,
            subsystem: raw.subsystem,
        }
    }

    /// Enabled subsystems in name order.
    pub fn enabled_subsystems(&self) -> impl Iterator<Item = (&String, &SubsystemConfig)> {
        self.subsystem.iter().filter(|(_, cfg)| cfg.enable)
    }
}

/// `[core]` section: supervisor timeouts and shutdown policy.
#[derive(Debug, Clone, Deserialize)]
pub struct CoreSection {
    /// How long `stop` waits for subsystems to leave their active states.
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: HumanDuration,

    /// How long `shutdown` waits for every subsystem to close.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: HumanDuration,

    #[serde(default)]
    pub shutdown_policy: ShutdownPolicy,
}

fn default_stop_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(5))
}

fn default_shutdown_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(10))
}

impl Default for CoreSection {
    fn default() -> Self {
        Self {
            stop_timeout: default_stop_timeout(),
            shutdown_timeout: default_shutdown_timeout(),
            shutdown_policy: ShutdownPolicy::default(),
        }
    }
}

/// `[logging]` section.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct LoggingSection {
    /// Used when neither `--log-level` nor `ATHOME_LOG` is set.
    #[serde(default)]
    pub level: Option<String>,
}

/// `[subsystem.<name>]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct SubsystemConfig {
    #[serde(default = "default_enable")]
    pub enable: bool,

    /// Factory key, e.g. `"proc"` or `"ticker"`.
    pub class: String,

    /// Subsystems that must have started before this one starts.
    #[serde(default)]
    pub after: Vec<String>,

    /// How to run the child process for out-of-process classes.
    #[serde(default)]
    pub process: Option<ProcessConfig>,

    /// Opaque to the kernel; forwarded to the subsystem as-is.
    #[serde(default = "empty_object")]
    pub config: Value,
}

fn default_enable() -> bool {
    true
}

fn empty_object() -> Value {
    Value::Object(Default::default())
}

impl SubsystemConfig {
    pub fn new(class: impl Into<String>) -> Self {
        Self {
            enable: true,
            class: class.into(),
            after: Vec::new(),
            process: None,
            config: empty_object(),
        }
    }
}

/// `[subsystem.<name>.process]` section.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct ProcessConfig {
    /// Runner service name (or first argument to `program`).
    pub module: String,

    #[serde(default)]
    pub args: Vec<String>,

    /// Runtime to launch. Defaults to the current executable in `runner`
    /// mode.
    #[serde(default)]
    pub program: Option<PathBuf>,

    /// Bound on each escalation step.
    #[serde(default = "default_child_stop_timeout")]
    pub stop_timeout: HumanDuration,

    #[serde(default = "default_request_timeout")]
    pub request_timeout: HumanDuration,

    /// Child notifications re-emitted as `"{subsystem}_{message}"` events.
    #[serde(default)]
    pub forward: Vec<String>,
}

fn default_child_stop_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(3))
}

fn default_request_timeout() -> HumanDuration {
    HumanDuration(Duration::from_secs(10))
}

impl ProcessConfig {
    pub fn new(module: impl Into<String>) -> Self {
        Self {
            module: module.into(),
            args: Vec::new(),
            program: None,
            stop_timeout: default_child_stop_timeout(),
            request_timeout: default_request_timeout(),
            forward: Vec::new(),
        }
    }
}
