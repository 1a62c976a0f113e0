// src/proc/subsystem.rs

//! Out-of-process subsystem: the parent half of the runner protocol.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, error, info, trace, warn};

use crate::config::ProcessConfig;
use crate::errors::AthomeError;
use crate::exec::JobCallbacks;
use crate::lifecycle::LifecycleState;
use crate::module::{Behaviour, Context};
use crate::proc::child::ChildProcess;
use crate::proc::client::{ClientShared, ProcClient};
use crate::proc::pidfile::remove_stale_pid_file;
use crate::protocol::{Line, LogPayload, StartPayload, messages};

/// Handler for a subsystem-specific notification from the child.
pub type LineHandler = Box<dyn FnMut(&mut Context, &Line) -> anyhow::Result<()> + Send>;

/// Where the handshake with the current child stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handshake {
    NoChild,
    AwaitingReady,
    Ready,
    Started,
    /// `exit` received; end of stream is next.
    Exiting,
}

/// Behaviour whose activity is a child process speaking the line protocol.
pub struct ProcSubsystem {
    name: String,
    process: ProcessConfig,
    child: Option<ChildProcess>,
    handshake: Handshake,
    client: Arc<ClientShared>,
    handlers: HashMap<String, LineHandler>,
}

impl ProcSubsystem {
    pub fn new(name: impl Into<String>, process: ProcessConfig) -> Self {
        let name = name.into();
        let client = Arc::new(ClientShared::new(
            name.clone(),
            process.request_timeout.as_duration(),
        ));
        let mut subsystem = Self {
            name,
            process,
            child: None,
            handshake: Handshake::NoChild,
            client,
            handlers: HashMap::new(),
        };
        for message in subsystem.process.forward.clone() {
            subsystem = subsystem.forward(message);
        }
        subsystem
    }

    /// Client for correlated requests to this subsystem's child.
    pub fn client(&self) -> ProcClient {
        ProcClient::new(self.client.clone())
    }

    /// Register a handler for notification `message`.
    pub fn on_message(mut self, message: impl Into<String>, handler: LineHandler) -> Self {
        self.handlers.insert(message.into(), handler);
        self
    }

    /// Re-emit notification `message` as the `"{name}_{message}"` event.
    pub fn forward(self, message: impl Into<String>) -> Self {
        let message = message.into();
        let event = format!("{}_{}", self.name, message);
        self.on_message(
            message,
            Box::new(move |ctx: &mut Context, line: &Line| {
                ctx.emit(event.clone(), line.payload.clone());
                Ok(())
            }),
        )
    }

    fn child_gone(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let previous = std::mem::replace(&mut self.handshake, Handshake::NoChild);
        self.client.detach("child exited");
        let mut status = None;
        if let Some(child) = self.child.take() {
            status = child.exit_status();
            debug!(
                subsystem = %self.name,
                ?status,
                escalation = ?child.escalation(),
                "child gone"
            );
            if let Some(pid) = child.pid() {
                let _ = remove_stale_pid_file(&ctx.env().pid_file(&self.name), pid);
            }
        }

        match ctx.handle().state() {
            LifecycleState::Stopping => {
                ctx.handle().stopped();
                Ok(())
            }
            LifecycleState::Starting | LifecycleState::Running => {
                let status = status.map_or_else(|| "unknown status".to_string(), |s| s.to_string());
                anyhow::bail!(
                    "child of '{}' exited unexpectedly ({status}, {previous:?})",
                    self.name
                )
            }
            _ => Ok(()),
        }
    }

    fn on_frame(&mut self, ctx: &mut Context, line: Line) -> anyhow::Result<()> {
        trace!(subsystem = %self.name, ?line, "frame from child");

        if self.handshake == Handshake::AwaitingReady {
            if !line.is(messages::READY) {
                return Err(AthomeError::protocol(format!(
                    "expected 'ready' as first line, got '{}'",
                    line.message
                ))
                .into());
            }
            self.handshake = Handshake::Ready;
            debug!(subsystem = %self.name, "child ready");
            return Ok(());
        }

        match line.message.as_str() {
            messages::READY => {
                Err(AthomeError::protocol("duplicate 'ready' line").into())
            }
            messages::STARTED => {
                if self.handshake != Handshake::Ready {
                    return Err(AthomeError::protocol(format!(
                        "'started' out of order ({:?})",
                        self.handshake
                    ))
                    .into());
                }
                self.handshake = Handshake::Started;
                ctx.handle().started();
                Ok(())
            }
            messages::EXIT => {
                debug!(subsystem = %self.name, "child announced exit");
                self.handshake = Handshake::Exiting;
                Ok(())
            }
            messages::RESPONSE => Ok(self.client.resolve(line)?),
            messages::LOG => {
                relog(&self.name, &line.payload);
                Ok(())
            }
            _ => match self.handlers.get_mut(&line.message) {
                Some(handler) => handler(ctx, &line),
                None => {
                    debug!(subsystem = %self.name, message = %line.message, "unhandled notification");
                    Ok(())
                }
            },
        }
    }
}

impl Drop for ProcSubsystem {
    fn drop(&mut self) {
        if let Some(child) = self.child.take() {
            if !child.has_exited() {
                child.kill();
            }
        }
    }
}

impl Behaviour for ProcSubsystem {
    fn on_start(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let child = ChildProcess::spawn(&self.name, &self.process, ctx.executor(), ctx.handle())?;
        info!(subsystem = %self.name, pid = ?child.pid(), "child spawned");

        let start = StartPayload {
            env: ctx.env().clone(),
            subsystem_config: ctx.config().clone(),
            name: Some(self.name.clone()),
        };
        child.send(Line::notification(
            messages::START,
            serde_json::to_value(&start)?,
        ))?;

        self.client.attach(child.writer());
        self.child = Some(child);
        self.handshake = Handshake::AwaitingReady;
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let Some(child) = self.child.clone() else {
            ctx.handle().stopped();
            return Ok(());
        };
        self.client.abandon("subsystem stopping");

        let step = self.process.stop_timeout.as_duration();
        let handle = ctx.handle().clone();
        ctx.executor().execute_with(
            async move { Ok(child.stop_gracefully(step).await?) },
            JobCallbacks::new().on_error(move |err| {
                handle.fail(format!("{err:#}"));
                Ok(())
            }),
        );
        Ok(())
    }

    fn on_shutdown(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        self.client.detach("subsystem shutting down");
        let Some(child) = self.child.clone() else {
            return Ok(());
        };
        if child.has_exited() {
            return Ok(());
        }

        let step = self.process.stop_timeout.as_duration();
        let name = self.name.clone();
        ctx.executor().execute(async move {
            child.shutdown(step).await?;
            debug!(subsystem = %name, "child gone after shutdown");
            Ok(())
        });
        Ok(())
    }

    fn on_fail(&mut self, _ctx: &mut Context, reason: &str) {
        self.client.abandon(reason);
    }

    fn on_line(&mut self, ctx: &mut Context, line: Option<Line>) -> anyhow::Result<()> {
        match line {
            Some(line) => self.on_frame(ctx, line),
            None => self.child_gone(ctx),
        }
    }
}

/// Re-emit a child's `log` line at its level.
fn relog(name: &str, payload: &Value) {
    let Ok(log) = serde_json::from_value::<LogPayload>(payload.clone()) else {
        warn!(subsystem = %name, %payload, "malformed log line");
        return;
    };
    match log.level.to_lowercase().as_str() {
        "error" => error!(subsystem = %name, "{}", log.message),
        "warn" | "warning" => warn!(subsystem = %name, "{}", log.message),
        "debug" => debug!(subsystem = %name, "{}", log.message),
        "trace" => trace!(subsystem = %name, "{}", log.message),
        _ => info!(subsystem = %name, "{}", log.message),
    }
}
