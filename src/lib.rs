// src/lib.rs

pub mod cli;
pub mod config;
pub mod core;
pub mod errors;
pub mod exec;
pub mod lifecycle;
pub mod logging;
pub mod module;
pub mod proc;
pub mod protocol;
pub mod runner;
pub mod shutdown;
pub mod subsystems;
pub mod types;

use anyhow::Result;
use tracing::{debug, info};

use crate::cli::{CliArgs, Command};
use crate::config::{ConfigFile, load_and_validate};
use crate::core::{SubsystemFactories, Supervisor};
use crate::runner::{Runner, RunnerRegistry};

/// High-level entry point used by `main.rs`.
///
/// Without a subcommand this runs the supervisor:
/// - config loading and logging setup
/// - subsystem construction through the factory registry
/// - start, serve until a stop request or signal, stop, shutdown
///
/// `runner` hosts one service on stdin/stdout instead.
pub async fn run(args: CliArgs) -> Result<()> {
    match args.command {
        Some(Command::Runner { module, name, args: extra }) => {
            logging::init_logging(args.log_level, None)?;
            run_runner(&module, name, extra).await
        }
        None => {
            let cfg = load_and_validate(&args.config)?;

            if args.dry_run {
                print_dry_run(&cfg);
                return Ok(());
            }

            logging::init_logging(args.log_level, cfg.logging.level.as_deref())?;
            run_supervisor(cfg).await
        }
    }
}

/// Initialize, run and wind down the supervisor until a termination signal
/// or a stop request.
pub async fn run_supervisor(cfg: ConfigFile) -> Result<()> {
    let signal = shutdown::shutdown_token();
    let mut supervisor = Supervisor::new(cfg, SubsystemFactories::with_builtins());

    if let Err(err) = supervisor.initialize() {
        supervisor.shutdown().await?;
        return Err(err.into());
    }

    let exit = supervisor.run_forever(signal).await?;
    info!(?exit, "athome exiting");
    Ok(())
}

/// Child half of a proc subsystem over stdin/stdout.
pub async fn run_runner(module: &str, name: Option<String>, extra: Vec<String>) -> Result<()> {
    let registry = RunnerRegistry::with_builtins();
    let Some(service) = registry.create(module) else {
        let known: Vec<_> = registry.modules().collect();
        anyhow::bail!("unknown runner module '{module}' (known: {known:?})");
    };
    if !extra.is_empty() {
        debug!(?extra, "extra runner arguments ignored");
    }

    let reason = Runner::new(module, service, tokio::io::stdin(), tokio::io::stdout())
        .with_name(name)
        .with_shutdown(shutdown::shutdown_token())
        .run()
        .await?;
    info!(?reason, module, "runner exiting");
    Ok(())
}

/// Simple dry-run output: print subsystems, classes and dependencies.
fn print_dry_run(cfg: &ConfigFile) {
    println!("athome dry-run");
    println!("  env.run_dir = {}", cfg.env.run_dir.display());
    println!("  env.tmp_dir = {}", cfg.env.tmp_dir.display());
    println!("  core.stop_timeout = {}", cfg.core.stop_timeout);
    println!("  core.shutdown_timeout = {}", cfg.core.shutdown_timeout);
    println!("  core.shutdown_policy = {:?}", cfg.core.shutdown_policy);
    println!();

    println!("subsystems ({}):", cfg.subsystem.len());
    for (name, sub) in cfg.subsystem.iter() {
        println!("  - {name}");
        println!("      class: {}", sub.class);
        if !sub.enable {
            println!("      enable: false");
        }
        if !sub.after.is_empty() {
            println!("      after: {:?}", sub.after);
        }
        if let Some(ref process) = sub.process {
            println!("      module: {}", process.module);
            if !process.args.is_empty() {
                println!("      args: {:?}", process.args);
            }
            if let Some(ref program) = process.program {
                println!("      program: {}", program.display());
            }
            println!("      stop_timeout: {}", process.stop_timeout);
        }
        if !sub.config.is_null() && sub.config.as_object().is_none_or(|o| !o.is_empty()) {
            println!("      config: {}", sub.config);
        }
    }

    debug!("dry-run complete (nothing started)");
}
