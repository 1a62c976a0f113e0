// src/core/registry.rs

//! Subsystem classes and the registry of constructed subsystems.

use std::collections::BTreeMap;
use std::fmt;

use tokio::task::JoinHandle;

use crate::config::{PROC_CLASS, SubsystemConfig};
use crate::errors::{AthomeError, Result};
use crate::lifecycle::LifecycleState;
use crate::module::{Behaviour, ModuleHandle};
use crate::proc::{ProcClient, ProcSubsystem};
use crate::subsystems::Ticker;

/// A freshly constructed subsystem.
pub struct BuiltSubsystem {
    pub behaviour: Box<dyn Behaviour>,
    /// Present for subsystems that accept correlated requests.
    pub client: Option<ProcClient>,
}

impl BuiltSubsystem {
    pub fn new(behaviour: Box<dyn Behaviour>) -> Self {
        Self {
            behaviour,
            client: None,
        }
    }

    pub fn with_client(mut self, client: ProcClient) -> Self {
        self.client = Some(client);
        self
    }
}

pub type SubsystemFactory =
    Box<dyn Fn(&str, &SubsystemConfig) -> Result<BuiltSubsystem> + Send + Sync>;

/// Configuration `class` -> factory. Populated at program start.
pub struct SubsystemFactories {
    factories: BTreeMap<String, SubsystemFactory>,
}

impl fmt::Debug for SubsystemFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.factories.keys()).finish()
    }
}

impl SubsystemFactories {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// `proc` (child process) and `ticker` (in-process heartbeat).
    pub fn with_builtins() -> Self {
        let mut factories = Self::empty();
        factories.register(PROC_CLASS, Box::new(build_proc));
        factories.register(
            "ticker",
            Box::new(|_name: &str, _cfg: &SubsystemConfig| {
                Ok(BuiltSubsystem::new(Box::new(Ticker::new())))
            }),
        );
        factories
    }

    pub fn register(&mut self, class: impl Into<String>, factory: SubsystemFactory) {
        self.factories.insert(class.into(), factory);
    }

    pub fn build(&self, name: &str, cfg: &SubsystemConfig) -> Result<BuiltSubsystem> {
        let factory =
            self.factories
                .get(&cfg.class)
                .ok_or_else(|| AthomeError::UnknownSubsystemClass {
                    name: name.to_string(),
                    class: cfg.class.clone(),
                })?;
        factory(name, cfg)
    }
}

impl Default for SubsystemFactories {
    fn default() -> Self {
        Self::with_builtins()
    }
}

fn build_proc(name: &str, cfg: &SubsystemConfig) -> Result<BuiltSubsystem> {
    let process = cfg.process.clone().ok_or_else(|| {
        AthomeError::ConfigError(format!("subsystem '{name}' has no process section"))
    })?;
    let subsystem = ProcSubsystem::new(name, process);
    let client = subsystem.client();
    Ok(BuiltSubsystem::new(Box::new(subsystem)).with_client(client))
}

/// One registered subsystem as the supervisor sees it.
#[derive(Debug)]
pub struct RegistryEntry {
    pub handle: ModuleHandle,
    pub client: Option<ProcClient>,
    pub(crate) task: Option<JoinHandle<LifecycleState>>,
}

/// Name -> entry. Filled during initialization, read-only afterwards.
#[derive(Debug, Default)]
pub struct Registry {
    entries: BTreeMap<String, RegistryEntry>,
}

impl Registry {
    pub(crate) fn insert(&mut self, name: String, entry: RegistryEntry) {
        self.entries.insert(name, entry);
    }

    pub fn get(&self, name: &str) -> Option<&RegistryEntry> {
        self.entries.get(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn handles(&self) -> impl Iterator<Item = &ModuleHandle> {
        self.entries.values().map(|entry| &entry.handle)
    }

    pub(crate) fn entries_mut(&mut self) -> impl Iterator<Item = (&String, &mut RegistryEntry)> {
        self.entries.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
