// src/proc/child.rs

//! Spawning and supervising the child process of a proc subsystem.

use std::ffi::OsString;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, Ordering};
use std::time::Duration;

use tokio::io::BufReader;
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::config::ProcessConfig;
use crate::errors::{AthomeError, Result};
use crate::exec::Executor;
use crate::module::ModuleHandle;
use crate::protocol::{Line, decode_line, messages, read_raw_line, write_line};

/// How hard we have pushed the child to exit. Only ever increases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum Escalation {
    None = 0,
    Request = 1,
    Terminate = 2,
    Kill = 3,
}

impl Escalation {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Escalation::None,
            1 => Escalation::Request,
            2 => Escalation::Terminate,
            _ => Escalation::Kill,
        }
    }
}

/// How long the stdout reader may lag behind the child's exit.
const STDOUT_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, Copy)]
enum ChildCommand {
    Terminate,
    Kill,
}

/// Program and arguments for subsystem `name`.
///
/// Without a configured `program` this is
/// `<current exe> runner <module> --name <name> [args]`; with one it is
/// `<program> <module> [args]`.
pub fn command_line(name: &str, process: &ProcessConfig) -> Result<(PathBuf, Vec<OsString>)> {
    match &process.program {
        Some(program) => {
            let mut args = vec![OsString::from(&process.module)];
            args.extend(process.args.iter().map(OsString::from));
            Ok((program.clone(), args))
        }
        None => {
            let program = std::env::current_exe()?;
            let mut args: Vec<OsString> = ["runner", process.module.as_str(), "--name", name]
                .into_iter()
                .map(OsString::from)
                .collect();
            args.extend(process.args.iter().map(OsString::from));
            Ok((program, args))
        }
    }
}

/// Control side of a running child. Cheap to clone; the `Child` itself is
/// owned by a watcher job on the module's executor.
#[derive(Debug, Clone)]
pub struct ChildProcess {
    name: String,
    pid: Option<u32>,
    writer: mpsc::UnboundedSender<Line>,
    commands: mpsc::UnboundedSender<ChildCommand>,
    exit: watch::Receiver<Option<ExitStatus>>,
    level: Arc<AtomicU8>,
}

impl ChildProcess {
    /// Spawn the child and its I/O jobs on `executor`. Frames read from the
    /// child's stdout are delivered to `handle` as `Message::Line`.
    pub fn spawn(
        name: &str,
        process: &ProcessConfig,
        executor: &Executor,
        handle: &ModuleHandle,
    ) -> Result<Self> {
        let (program, args) = command_line(name, process)?;
        info!(subsystem = %name, program = %program.display(), ?args, "spawning child process");

        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let pid = child.id();
        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let (exit_tx, exit_rx) = watch::channel(None);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (line_tx, line_rx) = mpsc::unbounded_channel();

        let (stdout_done, stdout_closed) = watch::channel(stdout.is_none());
        executor.execute(watch_child(
            name.to_string(),
            child,
            cmd_rx,
            exit_tx,
            handle.clone(),
            stdout_closed,
        ));

        if let Some(stdin) = stdin {
            executor.execute(write_frames(stdin, line_rx, exit_rx.clone()));
        }
        if let Some(stdout) = stdout {
            executor.execute(read_frames(name.to_string(), stdout, handle.clone(), stdout_done));
        }
        if let Some(stderr) = stderr {
            let name = name.to_string();
            executor.execute(async move {
                let mut reader = BufReader::new(stderr);
                let mut buf = Vec::new();
                while read_raw_line(&mut reader, &mut buf).await? {
                    info!(subsystem = %name, "{}", String::from_utf8_lossy(&buf));
                }
                Ok(())
            });
        }

        Ok(Self {
            name: name.to_string(),
            pid,
            writer: line_tx,
            commands: cmd_tx,
            exit: exit_rx,
            level: Arc::new(AtomicU8::new(Escalation::None as u8)),
        })
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Sender feeding the child's stdin.
    pub(crate) fn writer(&self) -> mpsc::UnboundedSender<Line> {
        self.writer.clone()
    }

    pub fn send(&self, line: Line) -> Result<()> {
        self.writer.send(line).map_err(|_| {
            AthomeError::protocol(format!("stdin of subsystem '{}' is closed", self.name))
        })
    }

    pub fn escalation(&self) -> Escalation {
        Escalation::from_u8(self.level.load(Ordering::SeqCst))
    }

    pub fn exit_status(&self) -> Option<ExitStatus> {
        *self.exit.borrow()
    }

    pub fn has_exited(&self) -> bool {
        self.exit_status().is_some()
    }

    /// Raise the escalation level. False if we were already at `to` or above.
    fn raise(&self, to: Escalation) -> bool {
        let previous = self.level.fetch_max(to as u8, Ordering::SeqCst);
        previous < to as u8
    }

    /// Politely ask the child to stop with a `stop` line.
    pub fn request_stop(&self) {
        if self.raise(Escalation::Request) {
            debug!(subsystem = %self.name, "sending stop line");
            if let Err(err) = self.send(Line::control(messages::STOP)) {
                debug!(subsystem = %self.name, error = %err, "could not send stop line");
            }
        }
    }

    /// SIGTERM on unix, a hard kill elsewhere.
    pub fn terminate(&self) {
        if self.raise(Escalation::Terminate) {
            warn!(subsystem = %self.name, pid = ?self.pid, "terminating child");
            let _ = self.commands.send(ChildCommand::Terminate);
        }
    }

    pub fn kill(&self) {
        if self.raise(Escalation::Kill) {
            warn!(subsystem = %self.name, pid = ?self.pid, "killing child");
            let _ = self.commands.send(ChildCommand::Kill);
        }
    }

    /// Wait up to `timeout` for the child to exit.
    pub async fn wait_exit(&self, timeout: Duration) -> bool {
        let mut exit = self.exit.clone();
        let exited = async move {
            let _ = exit.wait_for(|status| status.is_some()).await;
        };
        tokio::time::timeout(timeout, exited).await.is_ok() || self.has_exited()
    }

    /// `stop` line, wait, terminate, wait, kill, wait.
    pub async fn stop_gracefully(&self, step: Duration) -> Result<()> {
        self.request_stop();
        if self.wait_exit(step).await {
            return Ok(());
        }
        self.terminate();
        if self.wait_exit(step).await {
            return Ok(());
        }
        self.kill();
        self.wait_or_timeout(step).await
    }

    /// `stop` line plus terminate at once, wait, kill, wait. Bounded by
    /// twice `step`.
    pub async fn shutdown(&self, step: Duration) -> Result<()> {
        self.request_stop();
        self.terminate();
        if self.wait_exit(step).await {
            return Ok(());
        }
        self.kill();
        self.wait_or_timeout(step).await
    }

    async fn wait_or_timeout(&self, step: Duration) -> Result<()> {
        if self.wait_exit(step).await {
            Ok(())
        } else {
            Err(AthomeError::ChildTimeout {
                name: self.name.clone(),
                timeout: step,
            })
        }
    }
}

/// Own the `Child`: reap it and carry out terminate/kill commands. Once it
/// is gone the module gets end of stream, after the stdout reader has handed
/// over whatever the child wrote last.
async fn watch_child(
    name: String,
    mut child: Child,
    mut commands: mpsc::UnboundedReceiver<ChildCommand>,
    exit: watch::Sender<Option<ExitStatus>>,
    handle: ModuleHandle,
    mut stdout_closed: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let mut controlled = true;
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            command = commands.recv(), if controlled => match command {
                Some(ChildCommand::Terminate) => {
                    if let Err(err) = terminate(&mut child) {
                        warn!(subsystem = %name, error = %err, "failed to terminate child");
                    }
                }
                Some(ChildCommand::Kill) => {
                    if let Err(err) = child.start_kill() {
                        warn!(subsystem = %name, error = %err, "failed to kill child");
                    }
                }
                None => {
                    // Every controller is gone; nobody can stop it anymore.
                    controlled = false;
                    if let Err(err) = child.start_kill() {
                        debug!(subsystem = %name, error = %err, "kill after controller drop failed");
                    }
                }
            },
        }
    };

    match &status {
        Ok(status) => {
            info!(subsystem = %name, %status, "child exited");
            exit.send_replace(Some(*status));
        }
        Err(err) => warn!(subsystem = %name, error = %err, "could not reap child"),
    }

    let closed = async move {
        let _ = stdout_closed.wait_for(|closed| *closed).await;
    };
    let drained = tokio::time::timeout(STDOUT_GRACE, closed).await.is_ok();
    if !drained {
        // A descendant still holds the pipe.
        warn!(subsystem = %name, "child stdout still open after exit");
    }
    handle.line(None);

    status?;
    Ok(())
}

/// Decode frames from the child's stdout. Anything that is not a frame is
/// logged, invalid UTF-8 included.
async fn read_frames(
    name: String,
    stdout: ChildStdout,
    handle: ModuleHandle,
    done: watch::Sender<bool>,
) -> anyhow::Result<()> {
    let mut reader = BufReader::new(stdout);
    let mut buf = Vec::new();
    loop {
        match read_raw_line(&mut reader, &mut buf).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(err) => {
                warn!(subsystem = %name, error = %err, "reading child stdout failed");
                break;
            }
        }
        let text = String::from_utf8_lossy(&buf);
        match decode_line(&text) {
            Ok(line) => {
                handle.line(Some(line));
            }
            Err(_) => info!(subsystem = %name, "stdout: {text}"),
        }
    }
    debug!(subsystem = %name, "child stdout closed");
    done.send_replace(true);
    Ok(())
}

#[cfg(unix)]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    let Some(pid) = child.id() else {
        return Ok(());
    };
    let rc = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(std::io::Error::last_os_error())
    }
}

#[cfg(not(unix))]
fn terminate(child: &mut Child) -> std::io::Result<()> {
    child.start_kill()
}

/// Feed queued frames to the child's stdin until the child exits.
async fn write_frames(
    mut stdin: ChildStdin,
    mut lines: mpsc::UnboundedReceiver<Line>,
    mut exit: watch::Receiver<Option<ExitStatus>>,
) -> anyhow::Result<()> {
    loop {
        tokio::select! {
            line = lines.recv() => {
                let Some(line) = line else { break };
                if let Err(err) = write_line(&mut stdin, &line).await {
                    debug!(error = %err, "child stdin closed");
                    break;
                }
            }
            _ = exit.changed() => break,
        }
    }
    Ok(())
}
