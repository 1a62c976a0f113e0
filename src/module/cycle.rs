// src/module/cycle.rs

//! A lifecycle-governed module and the message cycle that drives it.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::core::CoreHandle;
use crate::errors::{AthomeError, Result};
use crate::exec::Executor;
use crate::lifecycle::{LifecycleState, StateMachine, Trigger};
use crate::module::behaviour::{Behaviour, Context};
use crate::module::handle::ModuleHandle;
use crate::module::message::{Message, Signal, events};
use crate::protocol::Line;
use crate::types::{Env, ShutdownPolicy};

#[derive(Debug, Clone)]
pub struct ModuleOptions {
    pub shutdown_policy: ShutdownPolicy,
    /// Bound on draining the executor once the cycle has ended.
    pub shutdown_timeout: Duration,
    /// Subsystems that must announce `{dep}_started` before this one starts.
    pub after: Vec<String>,
}

impl Default for ModuleOptions {
    fn default() -> Self {
        Self {
            shutdown_policy: ShutdownPolicy::default(),
            shutdown_timeout: Duration::from_secs(10),
            after: Vec::new(),
        }
    }
}

/// Tracks whether the supervisor has started and which dependencies are
/// still missing.
#[derive(Debug)]
struct StartGate {
    core_started: bool,
    after: Vec<String>,
    missing: BTreeSet<String>,
}

impl StartGate {
    fn new(after: &[String]) -> Self {
        Self {
            core_started: false,
            after: after.to_vec(),
            missing: after.iter().cloned().collect(),
        }
    }

    /// Record a dependency announcement. Returns true if it concerned us.
    fn observe(&mut self, event: &str) -> bool {
        for dep in &self.after {
            if event == events::subsystem_started(dep) {
                self.missing.remove(dep);
                return true;
            }
            if event == events::subsystem_stopped(dep) {
                self.missing.insert(dep.clone());
                return true;
            }
        }
        false
    }

    fn is_open(&self) -> bool {
        self.core_started && self.missing.is_empty()
    }
}

/// A module: state machine, behaviour, executor and message queue.
///
/// All triggers run on the task that drives [`Module::run`], one message at
/// a time. Other tasks reach the module only through its [`ModuleHandle`].
pub struct Module {
    machine: StateMachine,
    behaviour: Box<dyn Behaviour>,
    ctx: Context,
    rx: mpsc::UnboundedReceiver<Message>,
    options: ModuleOptions,
    pending_stop: bool,
    gate: StartGate,
}

impl fmt::Debug for Module {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.machine.name())
            .field("state", &self.machine.state())
            .field("pending_stop", &self.pending_stop)
            .field("gate", &self.gate)
            .finish_non_exhaustive()
    }
}

impl Module {
    /// Must be called inside a Tokio runtime (the executor spawns its sink).
    pub fn new(
        name: impl Into<String>,
        behaviour: Box<dyn Behaviour>,
        options: ModuleOptions,
        core: CoreHandle,
    ) -> Self {
        let name = name.into();
        let machine = StateMachine::new(name.clone());
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ModuleHandle::new(name.clone(), tx, machine.subscribe());
        let executor = Executor::new(name.clone());
        let gate = StartGate::new(&options.after);

        Self {
            machine,
            behaviour,
            ctx: Context::new(name, executor, handle, core),
            rx,
            options,
            pending_stop: false,
            gate,
        }
    }

    pub fn name(&self) -> &str {
        self.machine.name()
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    pub fn failure(&self) -> Option<&str> {
        self.machine.failure()
    }

    pub fn handle(&self) -> ModuleHandle {
        self.ctx.handle().clone()
    }

    pub fn executor(&self) -> &Executor {
        self.ctx.executor()
    }

    /// Loaded -> Initializing -> Ready around `on_initialize`.
    pub fn initialize(&mut self, env: Env, config: Value) -> Result<()> {
        self.machine.fire(Trigger::Initialize)?;
        self.ctx.configure(env, config);
        if let Err(err) = self.behaviour.on_initialize(&mut self.ctx) {
            return Err(self.fail_with(err));
        }
        self.machine.fire(Trigger::Initialized)?;
        info!(module = %self.name(), "initialized");
        Ok(())
    }

    /// Ready -> Starting and schedule the activity.
    pub fn start(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Start)?;
        if let Err(err) = self.behaviour.on_start(&mut self.ctx) {
            return Err(self.fail_with(err));
        }
        debug!(module = %self.name(), "activity scheduled");
        Ok(())
    }

    /// Starting -> Running. Runs a stop deferred while starting.
    pub fn started(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Started)?;
        info!(module = %self.name(), "running");
        self.behaviour.after_started(&mut self.ctx);
        self.ctx
            .emit(events::subsystem_started(self.machine.name()), Value::Null);

        if std::mem::take(&mut self.pending_stop) {
            debug!(module = %self.name(), "running stop deferred while starting");
            self.stop()?;
        }
        Ok(())
    }

    /// Running -> Stopping. While `Starting` the stop is deferred until the
    /// activity has signalled `started()`.
    pub fn stop(&mut self) -> Result<()> {
        if self.state() == LifecycleState::Starting {
            debug!(module = %self.name(), "stop requested while starting; deferring");
            self.pending_stop = true;
            return Ok(());
        }
        self.machine.fire(Trigger::Stop)?;
        if let Err(err) = self.behaviour.on_stop(&mut self.ctx) {
            return Err(self.fail_with(err));
        }
        Ok(())
    }

    /// Stopping -> Ready.
    pub fn stopped(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Stopped)?;
        info!(module = %self.name(), "stopped");
        self.behaviour.after_stopped(&mut self.ctx);
        self.ctx
            .emit(events::subsystem_stopped(self.machine.name()), Value::Null);
        Ok(())
    }

    /// Any state but `Closed` -> Closed. Hook errors are logged and swallowed.
    pub fn shutdown(&mut self) -> Result<()> {
        if !self.machine.can(Trigger::Shutdown) {
            self.machine.fire(Trigger::Shutdown)?;
        }

        if self.state() == LifecycleState::Running
            && self.options.shutdown_policy == ShutdownPolicy::ImplicitStop
        {
            self.machine.fire(Trigger::Stop)?;
            if let Err(err) = self.behaviour.on_stop(&mut self.ctx) {
                warn!(module = %self.name(), error = %err, "on_stop failed during shutdown");
            }
        }
        self.pending_stop = false;

        if let Err(err) = self.behaviour.on_shutdown(&mut self.ctx) {
            warn!(module = %self.name(), error = %err, "on_shutdown failed");
        }
        self.machine.fire(Trigger::Shutdown)?;
        info!(module = %self.name(), "closed");
        Ok(())
    }

    /// Any state but `Closed`/`Failed` -> Failed.
    pub fn fail(&mut self, reason: impl Into<String>) -> Result<()> {
        let reason = reason.into();
        if !self.machine.can(Trigger::Fail) {
            self.machine.fire(Trigger::Fail)?;
        }
        self.enter_failed(&reason);
        Ok(())
    }

    fn fail_with(&mut self, err: anyhow::Error) -> AthomeError {
        let reason = format!("{err:#}");
        if self.machine.can(Trigger::Fail) {
            self.enter_failed(&reason);
        }
        AthomeError::Other(err)
    }

    fn enter_failed(&mut self, reason: &str) {
        if self.machine.fail(reason).is_ok() {
            error!(module = %self.name(), %reason, "module failed");
            self.behaviour.on_fail(&mut self.ctx, reason);
        }
    }

    /// Consume the queue until the module is closed, then drain the executor.
    pub async fn run(mut self) -> LifecycleState {
        debug!(module = %self.name(), "message cycle started");

        while let Some(message) = self.rx.recv().await {
            self.dispatch(message);
            if self.state().is_closed() {
                break;
            }
        }

        self.drain().await;
        debug!(module = %self.name(), "message cycle finished");
        self.state()
    }

    /// Run the message cycle on its own task.
    pub fn spawn(self) -> JoinHandle<LifecycleState> {
        tokio::spawn(self.run())
    }

    fn dispatch(&mut self, message: Message) {
        if self.state().is_failed() && !is_shutdown(&message) {
            debug!(module = %self.name(), kind = message.kind(), "ignored while failed");
            return;
        }

        let result = match message {
            Message::Start => self.start(),
            Message::Stop => self.stop(),
            Message::Shutdown => self.shutdown(),
            Message::Event { value, data } => self.on_event(&value, &data),
            Message::Signal(signal) => self.on_signal(signal),
            Message::Line(line) => self.on_line(line),
        };

        if let Err(err) = result {
            error!(
                module = %self.name(),
                kind = err.as_label(),
                error = %err,
                state = %self.state(),
                "lifecycle trigger failed"
            );
        }
    }

    fn on_event(&mut self, event: &str, data: &Value) -> Result<()> {
        match event {
            events::STARTED => {
                self.gate.core_started = true;
                self.start_if_ready()
            }
            events::STOPPING => {
                self.gate.core_started = false;
                match self.state() {
                    LifecycleState::Running | LifecycleState::Starting => self.stop(),
                    _ => Ok(()),
                }
            }
            events::SHUTDOWN => self.shutdown(),
            events::STARTING | events::STOPPED => Ok(()),
            _ => {
                if self.gate.observe(event) {
                    self.start_if_ready()?;
                }
                if let Err(err) = self.behaviour.on_event(&mut self.ctx, event, data) {
                    return Err(self.fail_with(err));
                }
                Ok(())
            }
        }
    }

    fn start_if_ready(&mut self) -> Result<()> {
        if self.state() != LifecycleState::Ready {
            return Ok(());
        }
        if !self.gate.is_open() {
            debug!(module = %self.name(), missing = ?self.gate.missing, "waiting for dependencies");
            return Ok(());
        }
        self.start()
    }

    fn on_signal(&mut self, signal: Signal) -> Result<()> {
        let state = self.state();
        match signal {
            Signal::Started if state == LifecycleState::Starting => self.started(),
            Signal::Stopped if state == LifecycleState::Stopping => self.stopped(),
            Signal::Failed(reason) => self.fail(reason),
            stale => {
                debug!(module = %self.name(), signal = ?stale, %state, "stale signal ignored");
                Ok(())
            }
        }
    }

    fn on_line(&mut self, line: Option<Line>) -> Result<()> {
        if let Err(err) = self.behaviour.on_line(&mut self.ctx, line) {
            return Err(self.fail_with(err));
        }
        Ok(())
    }

    async fn drain(&mut self) {
        let executor = self.ctx.executor().clone();
        let limit = self.options.shutdown_timeout;

        if let Err(err) = executor.wait(Some(limit)).await {
            warn!(
                module = %self.name(),
                live = executor.live_jobs(),
                error = %err,
                "jobs still live after shutdown; cancelling"
            );
        }
        if let Err(err) = executor.close(Some(limit)).await {
            warn!(module = %self.name(), error = %err, "executor did not close cleanly");
        }
    }
}

fn is_shutdown(message: &Message) -> bool {
    match message {
        Message::Shutdown => true,
        Message::Event { value, .. } => value == events::SHUTDOWN,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    /// Hooks that do nothing; tests drive signals by hand.
    struct Inert;

    impl Behaviour for Inert {
        fn on_start(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_stop(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    struct FailsToStart;

    impl Behaviour for FailsToStart {
        fn on_start(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            anyhow::bail!("port in use")
        }

        fn on_stop(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn module(behaviour: Box<dyn Behaviour>) -> Module {
        let mut module = Module::new(
            "m",
            behaviour,
            ModuleOptions::default(),
            CoreHandle::detached(),
        );
        module.initialize(Env::default(), Value::Null).unwrap();
        module
    }

    #[tokio::test]
    async fn haste_stop_is_deferred_until_started() {
        let mut m = module(Box::new(Inert));
        m.start().unwrap();
        m.stop().unwrap();
        assert_eq!(m.state(), LifecycleState::Starting);

        m.started().unwrap();
        assert_eq!(m.state(), LifecycleState::Stopping);
        m.stopped().unwrap();
        assert_eq!(m.state(), LifecycleState::Ready);
    }

    struct Hooks(Arc<Mutex<Vec<&'static str>>>);

    impl Behaviour for Hooks {
        fn on_start(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("start");
            Ok(())
        }

        fn on_stop(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("stop");
            anyhow::bail!("stop hook broke")
        }

        fn on_shutdown(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
            self.0.lock().unwrap().push("shutdown");
            Ok(())
        }
    }

    async fn shutdown_from_running(policy: ShutdownPolicy) -> Vec<&'static str> {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let options = ModuleOptions {
            shutdown_policy: policy,
            ..ModuleOptions::default()
        };
        let mut m = Module::new("m", Box::new(Hooks(seen.clone())), options, CoreHandle::detached());
        m.initialize(Env::default(), Value::Null).unwrap();
        m.start().unwrap();
        m.started().unwrap();

        m.shutdown().unwrap();
        assert_eq!(m.state(), LifecycleState::Closed);
        assert!(m.shutdown().is_err());
        let hooks = seen.lock().unwrap().clone();
        hooks
    }

    #[tokio::test]
    async fn implicit_stop_runs_on_stop_and_swallows_its_error() {
        let hooks = shutdown_from_running(ShutdownPolicy::ImplicitStop).await;
        assert_eq!(hooks, vec!["start", "stop", "shutdown"]);
    }

    #[tokio::test]
    async fn direct_policy_skips_on_stop() {
        let hooks = shutdown_from_running(ShutdownPolicy::Direct).await;
        assert_eq!(hooks, vec!["start", "shutdown"]);
    }

    #[tokio::test]
    async fn start_hook_error_fails_module() {
        let mut m = module(Box::new(FailsToStart));
        assert!(m.start().is_err());
        assert_eq!(m.state(), LifecycleState::Failed);
        assert_eq!(m.failure(), Some("port in use"));

        let err = m.start().unwrap_err();
        assert!(matches!(err, AthomeError::InvalidTransition { .. }));
        m.shutdown().unwrap();
        assert_eq!(m.state(), LifecycleState::Closed);
    }

    #[test]
    fn gate_waits_for_core_and_every_dependency() {
        let mut gate = StartGate::new(&["broker".to_string(), "db".to_string()]);
        assert!(!gate.is_open());
        gate.core_started = true;
        assert!(gate.observe("broker_started"));
        assert!(!gate.is_open());
        assert!(gate.observe("db_started"));
        assert!(gate.is_open());
        assert!(gate.observe("db_stopped"));
        assert!(!gate.is_open());
        assert!(!gate.observe("http_started"));
    }
}
