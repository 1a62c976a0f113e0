// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::default_config_path;

/// Command-line arguments for `athome`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "athome",
    version,
    about = "Supervise home-automation subsystems in and out of process.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `athome.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_config_path())]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `ATHOME_LOG`, the config file or a default level is used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    /// Parse + validate, print the subsystems, but don't start anything.
    #[arg(long)]
    pub dry_run: bool,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Child half of an out-of-process subsystem; speaks the line protocol
    /// on stdin/stdout.
    Runner {
        /// Service to host, e.g. `echo` or `ticker`.
        module: String,

        /// Subsystem name, used for the pid file and log fields.
        #[arg(long, value_name = "NAME")]
        name: Option<String>,

        /// Extra arguments, ignored by the built-in services.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}
