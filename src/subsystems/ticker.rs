// src/subsystems/ticker.rs

//! In-process heartbeat: emits `"{name}_tick"` every `interval`.

use std::time::Duration;

use serde_json::json;
use tracing::debug;

use crate::core::CoreHandle;
use crate::exec::{Job, JobCallbacks};
use crate::module::{Behaviour, Context, ModuleHandle};
use crate::runner::services::interval_from;

const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Default)]
pub struct Ticker {
    interval: Option<Duration>,
    job: Option<Job>,
}

impl Ticker {
    pub fn new() -> Self {
        Self::default()
    }

    fn cancel(&mut self) {
        if let Some(job) = self.job.take() {
            job.cancel();
        }
    }
}

async fn tick(
    handle: ModuleHandle,
    core: CoreHandle,
    event: String,
    interval: Duration,
) -> anyhow::Result<()> {
    handle.started();
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;
    let mut count: u64 = 0;
    loop {
        timer.tick().await;
        count += 1;
        core.emit(event.clone(), json!({ "count": count }));
    }
}

impl Behaviour for Ticker {
    fn on_initialize(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let interval = interval_from(ctx.config(), DEFAULT_INTERVAL)?;
        anyhow::ensure!(!interval.is_zero(), "interval must be greater than zero");
        self.interval = Some(interval);
        Ok(())
    }

    fn on_start(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        let interval = self.interval.unwrap_or(DEFAULT_INTERVAL);
        let event = format!("{}_tick", ctx.name());
        let core = ctx.core().clone();
        let handle = ctx.handle().clone();
        let on_cancel = handle.clone();
        let on_error = handle.clone();

        let job = ctx.executor().execute_with(
            tick(handle, core, event, interval),
            JobCallbacks::new()
                .on_cancel(move || {
                    on_cancel.stopped();
                    Ok(())
                })
                .on_error(move |err| {
                    on_error.fail(format!("{err:#}"));
                    Ok(())
                }),
        );
        self.job = Some(job);
        Ok(())
    }

    fn on_stop(&mut self, ctx: &mut Context) -> anyhow::Result<()> {
        match self.job.take() {
            Some(job) => job.cancel(),
            None => {
                debug!(subsystem = %ctx.name(), "no activity to stop");
                ctx.handle().stopped();
            }
        }
        Ok(())
    }

    fn on_shutdown(&mut self, _ctx: &mut Context) -> anyhow::Result<()> {
        self.cancel();
        Ok(())
    }

    fn on_fail(&mut self, _ctx: &mut Context, _reason: &str) {
        self.cancel();
    }
}
