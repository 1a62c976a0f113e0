// src/core/supervisor.rs

//! The supervisor: owns the subsystem registry and drives the lifecycle of
//! the whole system.
//!
//! Subsystems never talk to the supervisor directly. They push
//! [`CoreCommand`]s through a cloned [`CoreHandle`]; the supervisor consumes
//! that queue on its own task and fans events out to every subsystem queue,
//! so per-subsystem delivery follows emission order.

use serde_json::Value;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::ConfigFile;
use crate::core::handle::{CoreCommand, CoreHandle};
use crate::core::registry::{Registry, RegistryEntry, SubsystemFactories};
use crate::errors::{AthomeError, Result};
use crate::lifecycle::{LifecycleState, StateMachine, Trigger};
use crate::module::{Module, ModuleHandle, ModuleOptions, events};
use crate::types::ShutdownPolicy;

/// Why [`Supervisor::serve`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeExit {
    StopRequested,
    ShutdownRequested,
    Signalled,
}

pub struct Supervisor {
    machine: StateMachine,
    config: ConfigFile,
    factories: SubsystemFactories,
    registry: Registry,
    core: CoreHandle,
    commands: mpsc::UnboundedReceiver<CoreCommand>,
}

impl std::fmt::Debug for Supervisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Supervisor")
            .field("state", &self.machine.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl Supervisor {
    pub fn new(config: ConfigFile, factories: SubsystemFactories) -> Self {
        let (core, commands) = CoreHandle::channel();
        Self {
            machine: StateMachine::new("athome"),
            config,
            factories,
            registry: Registry::default(),
            core,
            commands,
        }
    }

    /// Handle to pass around; the same one every subsystem receives.
    pub fn handle(&self) -> CoreHandle {
        self.core.clone()
    }

    pub fn state(&self) -> LifecycleState {
        self.machine.state()
    }

    pub fn failure(&self) -> Option<&str> {
        self.machine.failure()
    }

    pub fn config(&self) -> &ConfigFile {
        &self.config
    }

    pub fn subsystem_names(&self) -> Vec<String> {
        self.registry.names().map(str::to_string).collect()
    }

    pub fn subsystem_state(&self, name: &str) -> Option<LifecycleState> {
        self.registry.get(name).map(|entry| entry.handle.state())
    }

    pub fn subsystem(&self, name: &str) -> Option<&ModuleHandle> {
        self.registry.get(name).map(|entry| &entry.handle)
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Loaded -> Ready: build, initialize and spawn every enabled subsystem.
    ///
    /// On failure the supervisor is `Failed`; subsystems registered so far
    /// keep running until [`Supervisor::shutdown`].
    pub fn initialize(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Initialize)?;
        if let Err(err) = self.on_initialize() {
            let reason = err.to_string();
            error!(kind = err.as_label(), error = %reason, "supervisor initialization failed");
            self.machine.fail(reason)?;
            return Err(err);
        }
        self.machine.fire(Trigger::Initialized)?;
        info!(subsystems = self.registry.len(), "supervisor initialized");
        Ok(())
    }

    fn on_initialize(&mut self) -> Result<()> {
        let core = &self.config.core;
        let enabled: Vec<_> = self
            .config
            .enabled_subsystems()
            .map(|(name, cfg)| (name.clone(), cfg.clone()))
            .collect();

        for (name, cfg) in enabled {
            let built = self.factories.build(&name, &cfg)?;
            let options = ModuleOptions {
                shutdown_policy: core.shutdown_policy,
                shutdown_timeout: core.shutdown_timeout.as_duration(),
                after: cfg.after.clone(),
            };
            let mut module = Module::new(name.clone(), built.behaviour, options, self.core.clone());
            let handle = module.handle();

            let init = module.initialize(self.config.env.clone(), cfg.config.clone());
            let task = module.spawn();
            self.registry.insert(
                name.clone(),
                RegistryEntry {
                    handle,
                    client: built.client,
                    task: Some(task),
                },
            );
            init?;
            debug!(subsystem = %name, class = %cfg.class, "subsystem registered");
        }
        Ok(())
    }

    /// Enqueue `event` for every registered subsystem.
    pub fn emit(&self, event: &str, data: Value) {
        debug!(%event, "broadcast");
        for handle in self.registry.handles() {
            handle.event(event, data.clone());
        }
    }

    /// Ready -> Running, announcing `athome_starting` then `athome_started`.
    pub fn start(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Start)?;
        self.emit(events::STARTING, Value::Null);
        self.machine.fire(Trigger::Started)?;
        info!("supervisor running");
        self.emit(events::STARTED, Value::Null);
        Ok(())
    }

    /// Fan out queued commands until a stop or shutdown is requested or
    /// `signal` fires.
    pub async fn serve(&mut self, signal: CancellationToken) -> ServeExit {
        loop {
            tokio::select! {
                _ = signal.cancelled() => {
                    info!("termination signal; stopping");
                    return ServeExit::Signalled;
                }
                command = self.commands.recv() => {
                    // The supervisor holds a sender itself, so the queue
                    // never closes while we are here.
                    let Some(command) = command else {
                        return ServeExit::StopRequested;
                    };
                    if let Some(exit) = self.apply(command) {
                        return exit;
                    }
                }
            }
        }
    }

    fn apply(&self, command: CoreCommand) -> Option<ServeExit> {
        match command {
            CoreCommand::Emit { event, data } => {
                self.emit(&event, data);
                None
            }
            CoreCommand::RequestStop => {
                info!("stop requested");
                Some(ServeExit::StopRequested)
            }
            CoreCommand::RequestShutdown => {
                info!("shutdown requested");
                Some(ServeExit::ShutdownRequested)
            }
        }
    }

    /// Running -> Ready. Announces `athome_stopping`, waits up to
    /// `stop_timeout` for every subsystem to leave its active states, then
    /// announces `athome_stopped`.
    pub async fn stop(&mut self) -> Result<()> {
        self.machine.fire(Trigger::Stop)?;
        self.emit(events::STOPPING, Value::Null);

        let limit = self.config.core.stop_timeout.as_duration();
        let deadline = Instant::now() + limit;
        let handles: Vec<ModuleHandle> = self.registry.handles().cloned().collect();
        let mut stragglers = Vec::new();

        for handle in &handles {
            let settled = self
                .pump_until(deadline, handle, |state| !state.is_active())
                .await;
            if settled.is_err() {
                stragglers.push(format!("{}={}", handle.name(), handle.state()));
            }
        }
        if !stragglers.is_empty() {
            warn!(?limit, ?stragglers, "subsystems still active after stop timeout");
        }

        self.emit(events::STOPPED, Value::Null);
        self.machine.fire(Trigger::Stopped)?;
        info!("supervisor stopped");
        Ok(())
    }

    /// Wait for `handle` to satisfy `pred` while still fanning out events, so
    /// `{name}_stopped` announcements reach dependents during the wait.
    async fn pump_until<P>(
        &mut self,
        deadline: Instant,
        handle: &ModuleHandle,
        mut pred: P,
    ) -> Result<LifecycleState>
    where
        P: FnMut(LifecycleState) -> bool,
    {
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            tokio::select! {
                reached = handle.wait_for(remaining, &mut pred) => return reached,
                Some(command) = self.commands.recv() => {
                    if let CoreCommand::Emit { event, data } = command {
                        self.emit(&event, data);
                    } else {
                        debug!(?command, "ignored while winding down");
                    }
                }
            }
        }
    }

    /// Any state but `Closed` -> Closed.
    ///
    /// With the implicit-stop policy a running supervisor stops first.
    /// Subsystem cycles that have not finished within `shutdown_timeout` are
    /// aborted; dropping a child-process subsystem kills its child.
    pub async fn shutdown(&mut self) -> Result<()> {
        if !self.machine.can(Trigger::Shutdown) {
            self.machine.fire(Trigger::Shutdown)?;
        }

        if self.state() == LifecycleState::Running
            && self.config.core.shutdown_policy == ShutdownPolicy::ImplicitStop
        {
            if let Err(err) = self.stop().await {
                warn!(error = %err, "stop failed during shutdown");
            }
        }

        self.emit(events::SHUTDOWN, Value::Null);

        let limit = self.config.core.shutdown_timeout.as_duration();
        let deadline = Instant::now() + limit;
        for (name, entry) in self.registry.entries_mut() {
            let Some(mut task) = entry.task.take() else {
                continue;
            };
            let remaining = deadline.saturating_duration_since(Instant::now());
            match tokio::time::timeout(remaining, &mut task).await {
                Ok(Ok(LifecycleState::Closed)) => debug!(subsystem = %name, "closed"),
                Ok(Ok(state)) => warn!(subsystem = %name, %state, "cycle ended without closing"),
                Ok(Err(err)) => error!(subsystem = %name, error = %err, "message cycle panicked"),
                Err(_) => {
                    task.abort();
                    let err = AthomeError::Timeout(limit);
                    error!(
                        subsystem = %name,
                        kind = err.as_label(),
                        state = %entry.handle.state(),
                        "subsystem did not close before shutdown timeout; aborted"
                    );
                }
            }
        }

        self.machine.fire(Trigger::Shutdown)?;
        info!("supervisor closed");
        Ok(())
    }

    /// Start, serve until asked to stop, stop and shut down.
    ///
    /// A shutdown request skips the explicit stop; whether subsystems still
    /// get `on_stop` is then up to the shutdown policy.
    pub async fn run_forever(&mut self, signal: CancellationToken) -> Result<ServeExit> {
        self.start()?;
        let exit = self.serve(signal).await;
        if exit != ServeExit::ShutdownRequested {
            if let Err(err) = self.stop().await {
                warn!(error = %err, "stop failed");
            }
        }
        self.shutdown().await?;
        Ok(exit)
    }

    /// Forward a correlated request to an out-of-process subsystem.
    pub async fn request(&self, name: &str, message: &str, payload: Value) -> Result<Value> {
        let entry = self
            .registry
            .get(name)
            .ok_or_else(|| AthomeError::SubsystemNotFound(name.to_string()))?;
        let client = entry.client.as_ref().ok_or_else(|| {
            AthomeError::Other(anyhow::anyhow!("subsystem '{name}' does not accept requests"))
        })?;
        client.request(message, payload).await
    }

}
