mod common;
use crate::common::{init_tracing, with_timeout};

use std::error::Error;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use athome::protocol::{Line, StartPayload, decode_line, messages, write_line};
use athome::runner::{EchoService, ExitReason, Runner, RunnerContext, Service, TickerService};
use athome::types::Env;
use serde_json::{Value, json};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

type TestResult = Result<(), Box<dyn Error>>;

/// The parent's end of an in-memory pipe to a runner.
struct Parent {
    lines: Lines<BufReader<DuplexStream>>,
    writer: DuplexStream,
}

impl Parent {
    async fn send(&mut self, line: Line) {
        write_line(&mut self.writer, &line).await.unwrap();
    }

    async fn recv(&mut self) -> Line {
        let text = with_timeout(self.lines.next_line())
            .await
            .unwrap()
            .expect("runner closed its output");
        decode_line(&text).unwrap()
    }

    /// Next frame that is not a `log` line.
    async fn recv_frame(&mut self) -> Line {
        loop {
            let line = self.recv().await;
            if !line.is(messages::LOG) {
                return line;
            }
        }
    }
}

fn spawn_runner(
    module: &str,
    service: Arc<dyn Service>,
    shutdown: CancellationToken,
) -> (Parent, JoinHandle<anyhow::Result<ExitReason>>) {
    // One pipe per direction so dropping the parent's writer is EOF for
    // the runner.
    let (parent_w, child_r) = tokio::io::duplex(8 * 1024);
    let (child_w, parent_r) = tokio::io::duplex(8 * 1024);

    let runner = Runner::new(module, service, child_r, child_w).with_shutdown(shutdown);
    let task = tokio::spawn(runner.run());
    let parent = Parent {
        lines: BufReader::new(parent_r).lines(),
        writer: parent_w,
    };
    (parent, task)
}

fn start_line(env: &Env, config: Value) -> Line {
    let payload = StartPayload {
        env: env.clone(),
        subsystem_config: config,
        name: Some("broker".to_string()),
    };
    Line::notification(messages::START, serde_json::to_value(payload).unwrap())
}

#[tokio::test]
async fn handshake_request_and_stop() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let env = Env {
        run_dir: dir.path().to_path_buf(),
        tmp_dir: dir.path().join("tmp"),
    };
    let (mut parent, task) = spawn_runner("echo", Arc::new(EchoService), CancellationToken::new());

    // `ready` comes before anything else, even before `start` is sent.
    assert!(parent.recv().await.is(messages::READY));

    parent.send(start_line(&env, json!({}))).await;
    assert!(parent.recv_frame().await.is(messages::STARTED));

    let pid_file = env.pid_file("broker");
    let pid: u32 = std::fs::read_to_string(&pid_file)?.trim().parse()?;
    assert_eq!(pid, std::process::id());

    parent.send(Line::request("abc", "ping", Value::Null)).await;
    let response = parent.recv_frame().await;
    assert_eq!(response.message, messages::RESPONSE);
    assert_eq!(response.req_id.as_deref(), Some("abc"));
    assert_eq!(response.into_response()?, json!("pong"));

    parent.send(Line::request("def", "reboot", Value::Null)).await;
    let err = parent.recv_frame().await.into_response().unwrap_err();
    assert!(err.to_string().contains("unknown request"));

    parent.send(Line::control(messages::STOP)).await;
    assert!(parent.recv_frame().await.is(messages::EXIT));

    let reason = with_timeout(task).await??;
    assert_eq!(reason, ExitReason::StopRequested);
    assert!(!pid_file.exists(), "pid file removed on clean exit");
    Ok(())
}

#[tokio::test]
async fn closed_input_ends_the_runner() -> TestResult {
    init_tracing();
    let (mut parent, task) = spawn_runner("echo", Arc::new(EchoService), CancellationToken::new());
    assert!(parent.recv().await.is(messages::READY));

    let Parent { mut lines, writer } = parent;
    drop(writer);

    let reason = with_timeout(task).await??;
    assert_eq!(reason, ExitReason::InputClosed);
    let last = with_timeout(lines.next_line()).await?.expect("exit line");
    assert!(decode_line(&last)?.is(messages::EXIT));
    Ok(())
}

#[tokio::test]
async fn signal_exits_gracefully_and_ticker_notifies() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let env = Env {
        run_dir: dir.path().to_path_buf(),
        tmp_dir: dir.path().join("tmp"),
    };
    let signal = CancellationToken::new();
    let (mut parent, task) =
        spawn_runner("ticker", Arc::new(TickerService::default()), signal.clone());
    assert!(parent.recv().await.is(messages::READY));

    parent.send(start_line(&env, json!({ "interval": "10ms" }))).await;
    assert!(parent.recv_frame().await.is(messages::STARTED));

    let tick = parent.recv_frame().await;
    assert!(tick.is("tick"));
    assert_eq!(tick.payload["count"], 1);

    signal.cancel();
    loop {
        if parent.recv_frame().await.is(messages::EXIT) {
            break;
        }
    }
    let reason = with_timeout(task).await??;
    assert_eq!(reason, ExitReason::Signalled);
    Ok(())
}

/// Echo, except `slow` never answers.
struct Sluggish;

#[async_trait]
impl Service for Sluggish {
    async fn activity(&self, ctx: RunnerContext) -> anyhow::Result<()> {
        ctx.started();
        ctx.cancelled().await;
        Ok(())
    }

    async fn request(
        &self,
        ctx: &RunnerContext,
        message: &str,
        payload: Value,
    ) -> anyhow::Result<Value> {
        if message == "slow" {
            std::future::pending::<()>().await;
        }
        EchoService.request(ctx, message, payload).await
    }
}

fn temp_env(dir: &tempfile::TempDir) -> Env {
    Env {
        run_dir: dir.path().to_path_buf(),
        tmp_dir: dir.path().join("tmp"),
    }
}

#[tokio::test]
async fn invalid_utf8_input_is_skipped() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let env = temp_env(&dir);
    let (mut parent, task) = spawn_runner("echo", Arc::new(EchoService), CancellationToken::new());
    assert!(parent.recv().await.is(messages::READY));

    parent.send(start_line(&env, json!({}))).await;
    assert!(parent.recv_frame().await.is(messages::STARTED));

    parent.writer.write_all(b"\xff\xfe\n").await?;
    parent.send(Line::request("abc", "ping", Value::Null)).await;
    assert_eq!(parent.recv_frame().await.into_response()?, json!("pong"));

    parent.send(Line::control(messages::STOP)).await;
    assert!(parent.recv_frame().await.is(messages::EXIT));
    assert_eq!(with_timeout(task).await??, ExitReason::StopRequested);
    assert!(!env.pid_file("broker").exists());
    Ok(())
}

#[tokio::test]
async fn stop_is_heard_while_a_request_is_in_flight() -> TestResult {
    init_tracing();
    let dir = tempfile::tempdir()?;
    let env = temp_env(&dir);
    let (mut parent, task) = spawn_runner("slow", Arc::new(Sluggish), CancellationToken::new());
    assert!(parent.recv().await.is(messages::READY));

    parent.send(start_line(&env, json!({}))).await;
    assert!(parent.recv_frame().await.is(messages::STARTED));

    parent.send(Line::request("abc", "slow", Value::Null)).await;
    parent.send(Line::control(messages::STOP)).await;

    // No response to the abandoned request; the next frame is `exit`.
    let exit = tokio::time::timeout(Duration::from_secs(1), parent.recv_frame()).await?;
    assert!(exit.is(messages::EXIT));
    assert_eq!(with_timeout(task).await??, ExitReason::StopRequested);
    Ok(())
}
