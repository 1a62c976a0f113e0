// src/runner/registry.rs

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::runner::service::Service;
use crate::runner::services::{EchoService, TickerService};

pub type ServiceFactory = Box<dyn Fn() -> Arc<dyn Service> + Send + Sync>;

/// Runner module name -> service factory.
pub struct RunnerRegistry {
    factories: BTreeMap<String, ServiceFactory>,
}

impl RunnerRegistry {
    pub fn empty() -> Self {
        Self {
            factories: BTreeMap::new(),
        }
    }

    /// Registry holding the built-in `echo` and `ticker` services.
    pub fn with_builtins() -> Self {
        let mut registry = Self::empty();
        registry.register("echo", Box::new(|| Arc::new(EchoService) as Arc<dyn Service>));
        registry.register(
            "ticker",
            Box::new(|| Arc::new(TickerService::default()) as Arc<dyn Service>),
        );
        registry
    }

    pub fn register(&mut self, module: impl Into<String>, factory: ServiceFactory) {
        self.factories.insert(module.into(), factory);
    }

    pub fn create(&self, module: &str) -> Option<Arc<dyn Service>> {
        self.factories.get(module).map(|factory| factory())
    }

    pub fn modules(&self) -> impl Iterator<Item = &str> {
        self.factories.keys().map(String::as_str)
    }
}

impl Default for RunnerRegistry {
    fn default() -> Self {
        Self::with_builtins()
    }
}
