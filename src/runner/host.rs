// src/runner/host.rs

//! The child half of a proc subsystem: reads frames, drives a [`Service`]
//! and answers the parent.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context as _;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::exec::{Executor, JobCallbacks};
use crate::proc::pidfile::{remove_pid_file, write_pid_file};
use crate::protocol::{Line, StartPayload, decode_line, messages, read_raw_line, write_line};
use crate::runner::service::{RunnerContext, Service};

/// How long the activity gets to wind down after cancellation.
const GRACE: Duration = Duration::from_secs(2);

/// Why the runner loop ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopRequested,
    InputClosed,
    Signalled,
    ActivityEnded,
}

struct Active {
    ctx: RunnerContext,
    cancel: CancellationToken,
    pid_file: PathBuf,
}

/// Runs one service over a reader/writer pair (stdin/stdout in production).
pub struct Runner<R, W> {
    module: String,
    name: Option<String>,
    service: Arc<dyn Service>,
    reader: R,
    writer: W,
    shutdown: CancellationToken,
}

impl<R, W> Runner<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    pub fn new(module: impl Into<String>, service: Arc<dyn Service>, reader: R, writer: W) -> Self {
        Self {
            module: module.into(),
            name: None,
            service,
            reader,
            writer,
            shutdown: CancellationToken::new(),
        }
    }

    /// Subsystem name from the command line; the `start` payload wins.
    pub fn with_name(mut self, name: Option<String>) -> Self {
        self.name = name;
        self
    }

    /// Leave the loop gracefully when `token` is cancelled (OS signals).
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    pub async fn run(self) -> anyhow::Result<ExitReason> {
        let Runner {
            module,
            name,
            service,
            reader,
            writer,
            shutdown,
        } = self;

        let (out, out_rx) = mpsc::unbounded_channel::<Line>();
        let output = tokio::spawn(write_frames(writer, out_rx));
        // `ready` is always the first frame.
        let _ = out.send(Line::control(messages::READY));

        let executor = Executor::new(format!("runner:{module}"));
        let activity_done = CancellationToken::new();
        let mut input = BufReader::new(reader);
        let mut buf = Vec::new();
        let mut active: Option<Active> = None;

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break ExitReason::Signalled,
                _ = activity_done.cancelled() => break ExitReason::ActivityEnded,
                next = read_raw_line(&mut input, &mut buf) => match next {
                    Ok(true) => {}
                    Ok(false) => break ExitReason::InputClosed,
                    Err(err) => {
                        warn!(error = %err, "reading stdin failed");
                        break ExitReason::InputClosed;
                    }
                },
            }

            let line = match decode_line(&String::from_utf8_lossy(&buf)) {
                Ok(line) => line,
                Err(err) => {
                    warn!(error = %err, "ignoring malformed line");
                    continue;
                }
            };

            match line.message.as_str() {
                messages::START => {
                    if active.is_some() {
                        warn!("duplicate start ignored");
                        continue;
                    }
                    let start: StartPayload = match serde_json::from_value(line.payload) {
                        Ok(start) => start,
                        Err(err) => {
                            warn!(error = %err, "ignoring start with malformed payload");
                            continue;
                        }
                    };
                    let name = start
                        .name
                        .clone()
                        .or_else(|| name.clone())
                        .unwrap_or_else(|| module.clone());
                    match launch(&executor, &service, &out, &activity_done, name, start) {
                        Ok(launched) => active = Some(launched),
                        Err(err) => {
                            error!(error = ?err, "could not start activity");
                            break ExitReason::ActivityEnded;
                        }
                    }
                }
                messages::STOP => break ExitReason::StopRequested,
                _ if line.is_request() => {
                    spawn_answer(&executor, &service, active.as_ref(), &out, line);
                }
                message => match active.as_ref() {
                    Some(active) => {
                        if let Err(err) = service.notify(&active.ctx, message, line.payload).await {
                            warn!(%message, error = %err, "notification failed");
                        }
                    }
                    None => debug!(%message, "notification before start ignored"),
                },
            }
        };

        info!(?reason, "runner leaving");
        if let Some(active) = active {
            active.cancel.cancel();
            if executor.wait(Some(GRACE)).await.is_err() {
                warn!(subsystem = %active.ctx.name(), "activity did not wind down in time");
            }
            if let Err(err) = remove_pid_file(&active.pid_file) {
                warn!(error = %err, "could not remove pid file");
            }
        }
        if let Err(err) = executor.close(Some(GRACE)).await {
            warn!(error = %err, "runner executor did not close cleanly");
        }

        let _ = out.send(Line::control(messages::EXIT));
        drop(out);
        output.await.context("joining output writer")??;
        Ok(reason)
    }
}

/// Write the pid file and schedule the activity.
fn launch(
    executor: &Executor,
    service: &Arc<dyn Service>,
    out: &mpsc::UnboundedSender<Line>,
    activity_done: &CancellationToken,
    name: String,
    start: StartPayload,
) -> anyhow::Result<Active> {
    let pid_file = start.env.pid_file(&name);
    write_pid_file(&pid_file, std::process::id())?;
    info!(subsystem = %name, pid_file = %pid_file.display(), "starting activity");

    let cancel = CancellationToken::new();
    let ctx = RunnerContext::new(
        name,
        start.env,
        start.subsystem_config,
        out.clone(),
        cancel.clone(),
    );

    let service = service.clone();
    let activity_ctx = ctx.clone();
    let error_ctx = ctx.clone();
    let ended = activity_done.clone();
    let failed = activity_done.clone();
    executor.execute_with(
        async move { service.activity(activity_ctx).await },
        JobCallbacks::new()
            .on_success(move || {
                ended.cancel();
                Ok(())
            })
            .on_error(move |err| {
                error!(error = ?err, "activity failed");
                error_ctx.log("error", format!("activity failed: {err:#}"));
                failed.cancel();
                Ok(())
            }),
    );

    Ok(Active {
        ctx,
        cancel,
        pid_file,
    })
}

/// Answer `line` from a job so the read loop keeps seeing `stop` and
/// signals. Leaving the loop cancels a request still in flight.
fn spawn_answer(
    executor: &Executor,
    service: &Arc<dyn Service>,
    active: Option<&Active>,
    out: &mpsc::UnboundedSender<Line>,
    line: Line,
) {
    let Line {
        req_id,
        message,
        payload,
    } = line;
    let Some(active) = active else {
        let _ = out.send(Line::response(
            req_id,
            Err(format!("request '{message}' before start")),
        ));
        return;
    };

    let service = service.clone();
    let ctx = active.ctx.clone();
    let cancel = active.cancel.clone();
    let out = out.clone();
    executor.execute(async move {
        let reply = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(%message, "request cancelled by shutdown");
                return Ok(());
            }
            reply = service.request(&ctx, &message, payload) => reply,
        };
        let reply = reply.map_err(|err| format!("{err:#}"));
        let _ = out.send(Line::response(req_id, reply));
        Ok(())
    });
}

async fn write_frames<W>(mut writer: W, mut frames: mpsc::UnboundedReceiver<Line>) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
{
    while let Some(line) = frames.recv().await {
        write_line(&mut writer, &line).await?;
    }
    Ok(())
}
