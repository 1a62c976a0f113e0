// src/module/behaviour.rs

//! The hooks a subsystem implements and the context they run with.

use serde_json::Value;

use crate::core::CoreHandle;
use crate::exec::Executor;
use crate::module::handle::ModuleHandle;
use crate::protocol::Line;
use crate::types::Env;

/// Subsystem-specific logic driven by a [`Module`](crate::module::Module).
///
/// Hooks are synchronous and run on the module's own task, strictly in queue
/// order. Long-running work belongs on `ctx.executor()`; completion is
/// reported back with `ctx.handle().started()` / `stopped()` / `fail()`.
pub trait Behaviour: Send {
    fn on_initialize(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    /// Schedule the activity. The module reaches `Running` only after the
    /// activity signals `started()`.
    fn on_start(&mut self, ctx: &mut Context) -> anyhow::Result<()>;

    /// Ask the activity to wind down; it signals `stopped()` when done.
    fn on_stop(&mut self, ctx: &mut Context) -> anyhow::Result<()>;

    /// Errors returned here are logged and swallowed.
    fn on_shutdown(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        Ok(())
    }

    fn on_fail(&mut self, _ctx: &mut Context, _reason: &str) {}

    fn after_started(&mut self, _ctx: &mut Context) {}

    fn after_stopped(&mut self, _ctx: &mut Context) {}

    /// Events that are not supervisor lifecycle events.
    fn on_event(&mut self, _ctx: &mut Context, _event: &str, _data: &Value) -> anyhow::Result<()> {
        Ok(())
    }

    /// Frames from a child process. `None` is end of stream.
    fn on_line(&mut self, _ctx: &mut Context, _line: Option<Line>) -> anyhow::Result<()> {
        Ok(())
    }
}

/// What a behaviour can see and reach while one of its hooks runs.
#[derive(Debug)]
pub struct Context {
    name: String,
    env: Env,
    config: Value,
    executor: Executor,
    handle: ModuleHandle,
    core: CoreHandle,
}

impl Context {
    pub(crate) fn new(
        name: String,
        executor: Executor,
        handle: ModuleHandle,
        core: CoreHandle,
    ) -> Self {
        Self {
            name,
            env: Env::default(),
            config: Value::Null,
            executor,
            handle,
            core,
        }
    }

    pub(crate) fn configure(&mut self, env: Env, config: Value) {
        self.env = env;
        self.config = config;
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn env(&self) -> &Env {
        &self.env
    }

    /// The subsystem's opaque configuration object.
    pub fn config(&self) -> &Value {
        &self.config
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Handle to this module's own queue; clone it into background work.
    pub fn handle(&self) -> &ModuleHandle {
        &self.handle
    }

    pub fn core(&self) -> &CoreHandle {
        &self.core
    }

    /// Broadcast an event to every subsystem through the supervisor.
    pub fn emit(&self, event: impl Into<String>, data: Value) {
        self.core.emit(event, data);
    }
}
