#![allow(dead_code)]

use std::path::Path;
use std::time::Duration;

use athome::config::{ConfigFile, ProcessConfig, RawConfigFile, SubsystemConfig};
use athome::types::{HumanDuration, ShutdownPolicy};
use serde_json::Value;

/// Builder for `ConfigFile` to simplify test setup.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile::default(),
        }
    }

    pub fn with_subsystem(mut self, name: &str, subsystem: SubsystemConfig) -> Self {
        self.config.subsystem.insert(name.to_string(), subsystem);
        self
    }

    pub fn run_dir(mut self, dir: &Path) -> Self {
        self.config.env.run_dir = dir.to_path_buf();
        self
    }

    pub fn stop_timeout(mut self, timeout: Duration) -> Self {
        self.config.core.stop_timeout = HumanDuration(timeout);
        self
    }

    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.core.shutdown_timeout = HumanDuration(timeout);
        self
    }

    pub fn shutdown_policy(mut self, policy: ShutdownPolicy) -> Self {
        self.config.core.shutdown_policy = policy;
        self
    }

    /// The unvalidated model, for tests that expect validation to fail.
    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for `SubsystemConfig`.
pub struct SubsystemConfigBuilder {
    subsystem: SubsystemConfig,
}

impl SubsystemConfigBuilder {
    pub fn new(class: &str) -> Self {
        Self {
            subsystem: SubsystemConfig::new(class),
        }
    }

    /// A `proc` subsystem hosting runner service `module`.
    pub fn proc(module: &str) -> Self {
        let mut builder = Self::new(athome::config::PROC_CLASS);
        builder.subsystem.process = Some(ProcessConfig::new(module));
        builder
    }

    pub fn after(mut self, dep: &str) -> Self {
        self.subsystem.after.push(dep.to_string());
        self
    }

    pub fn disabled(mut self) -> Self {
        self.subsystem.enable = false;
        self
    }

    pub fn config(mut self, config: Value) -> Self {
        self.subsystem.config = config;
        self
    }

    /// Requires a process section (see [`SubsystemConfigBuilder::proc`]).
    pub fn process(mut self, f: impl FnOnce(&mut ProcessConfig)) -> Self {
        if let Some(process) = self.subsystem.process.as_mut() {
            f(process);
        }
        self
    }

    pub fn build(self) -> SubsystemConfig {
        self.subsystem
    }
}
