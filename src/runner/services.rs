// src/runner/services.rs

//! Built-in runner services.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use serde_json::{Value, json};

use crate::runner::service::{RunnerContext, Service};
use crate::types::parse_duration;

/// Answers `ping` with `"pong"` and `echo` with its payload.
#[derive(Debug, Default)]
pub struct EchoService;

#[async_trait]
impl Service for EchoService {
    async fn activity(&self, ctx: RunnerContext) -> anyhow::Result<()> {
        ctx.started();
        ctx.cancelled().await;
        Ok(())
    }

    async fn request(
        &self,
        _ctx: &RunnerContext,
        message: &str,
        payload: Value,
    ) -> anyhow::Result<Value> {
        match message {
            "ping" => Ok(json!("pong")),
            "echo" => Ok(payload),
            other => bail!("unknown request '{other}'"),
        }
    }
}

/// Sends a `tick` notification every `interval` and answers `count`.
#[derive(Debug, Default)]
pub struct TickerService {
    ticks: AtomicU64,
}

pub(crate) fn interval_from(config: &Value, default: Duration) -> anyhow::Result<Duration> {
    match config.get("interval") {
        None | Some(Value::Null) => Ok(default),
        Some(Value::String(s)) => parse_duration(s).map_err(anyhow::Error::msg),
        Some(Value::Number(n)) => match n.as_u64() {
            Some(ms) => Ok(Duration::from_millis(ms)),
            None => bail!("interval must be a non-negative number of milliseconds"),
        },
        Some(other) => bail!("invalid interval {other}"),
    }
}

#[async_trait]
impl Service for TickerService {
    async fn activity(&self, ctx: RunnerContext) -> anyhow::Result<()> {
        let interval = interval_from(ctx.config(), Duration::from_secs(1))?;
        if interval.is_zero() {
            bail!("interval must be greater than zero");
        }
        ctx.log("info", format!("ticking every {interval:?}"));
        ctx.started();

        let mut timer = tokio::time::interval(interval);
        timer.tick().await;
        loop {
            tokio::select! {
                _ = ctx.cancelled() => return Ok(()),
                _ = timer.tick() => {
                    let n = self.ticks.fetch_add(1, Ordering::SeqCst) + 1;
                    ctx.notify("tick", json!({ "count": n }));
                }
            }
        }
    }

    async fn request(
        &self,
        _ctx: &RunnerContext,
        message: &str,
        _payload: Value,
    ) -> anyhow::Result<Value> {
        match message {
            "count" => Ok(json!(self.ticks.load(Ordering::SeqCst))),
            other => bail!("unknown request '{other}'"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_accepts_strings_numbers_and_default() {
        let d = Duration::from_secs(1);
        assert_eq!(interval_from(&json!({}), d).unwrap(), d);
        assert_eq!(
            interval_from(&json!({ "interval": "250ms" }), d).unwrap(),
            Duration::from_millis(250)
        );
        assert_eq!(
            interval_from(&json!({ "interval": 40 }), d).unwrap(),
            Duration::from_millis(40)
        );
        assert!(interval_from(&json!({ "interval": "fast" }), d).is_err());
        assert!(interval_from(&json!({ "interval": [1] }), d).is_err());
    }
}
