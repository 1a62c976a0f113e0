//! An in-process subsystem that records what happens to it.

use std::sync::{Arc, Mutex, MutexGuard};

use athome::config::SubsystemConfig;
use athome::core::{BuiltSubsystem, SubsystemFactories};
use athome::module::{Behaviour, Context};
use serde_json::Value;

/// Shared log of hook calls (`"start"`, `"stop"`, ...) and received events.
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    hooks: Arc<Mutex<Vec<String>>>,
    events: Arc<Mutex<Vec<(String, Value)>>>,
}

impl Recorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn hooks(&self) -> Vec<String> {
        lock(&self.hooks).clone()
    }

    pub fn events(&self) -> Vec<(String, Value)> {
        lock(&self.events).clone()
    }

    /// Received events whose name starts with `prefix`.
    pub fn events_with_prefix(&self, prefix: &str) -> Vec<(String, Value)> {
        self.events()
            .into_iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .collect()
    }

    fn hook(&self, name: &str) {
        lock(&self.hooks).push(name.to_string());
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Behaviour that signals `started()`/`stopped()` from background jobs and
/// records every hook.
pub struct RecordingBehaviour {
    recorder: Recorder,
    auto_start: bool,
}

impl RecordingBehaviour {
    pub fn new(recorder: Recorder) -> Self {
        Self {
            recorder,
            auto_start: true,
        }
    }

    /// Never signal `started()`; the test drives it through the handle.
    pub fn manual_start(mut self) -> Self {
        self.auto_start = false;
        self
    }
}

impl Behaviour for RecordingBehaviour {
    fn on_initialize(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        self.recorder.hook("initialize");
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        self.recorder.hook("start");
        if self.auto_start {
            let handle = ctx.handle().clone();
            ctx.executor().execute(async move {
                handle.started();
                Ok(())
            });
        }
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        self.recorder.hook("stop");
        let handle = ctx.handle().clone();
        ctx.executor().execute(async move {
            handle.stopped();
            Ok(())
        });
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        self.recorder.hook("shutdown");
        Ok(())
    }

    fn on_fail(&mut self, _ctx: &mut Context, _reason: &str) {
        self.recorder.hook("fail");
    }

    fn after_started(&mut self, _ctx: &mut Context) {
        self.recorder.hook("after_started");
    }

    fn after_stopped(&mut self, _ctx: &mut Context) {
        self.recorder.hook("after_stopped");
    }

    fn on_event(&mut self, _ctx: &mut Context, event: &str, data: &Value) -> anyhow::Result<()> {
        lock(&self.recorder.events).push((event.to_string(), data.clone()));
        Ok(())
    }
}

/// Factories with a `recording` class; each subsystem gets a recorder named
/// after it, returned alongside.
pub fn recording_factories(
    names: &[&str],
) -> (SubsystemFactories, std::collections::BTreeMap<String, Recorder>) {
    let recorders: std::collections::BTreeMap<String, Recorder> = names
        .iter()
        .map(|name| (name.to_string(), Recorder::new()))
        .collect();
    let lookup = recorders.clone();

    let mut factories = SubsystemFactories::empty();
    factories.register(
        "recording",
        Box::new(move |name: &str, _cfg: &SubsystemConfig| {
            let recorder = lookup.get(name).cloned().unwrap_or_default();
            Ok(BuiltSubsystem::new(Box::new(RecordingBehaviour::new(recorder))))
        }),
    );
    (factories, recorders)
}
