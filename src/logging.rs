// src/logging.rs

//! Logging setup for `athome` using `tracing` + `tracing-subscriber`.
//!
//! Priority for determining the log level:
//! 1. `--log-level` CLI flag (if provided)
//! 2. `ATHOME_LOG` environment variable (e.g. "info", "debug")
//! 3. `[logging] level` from the config file
//! 4. default to `info`
//!
//! Logs always go to STDERR. In runner mode stdout carries protocol frames.

use anyhow::Result;
use tracing_subscriber::fmt;

use crate::cli::LogLevel;

pub const LOG_ENV: &str = "ATHOME_LOG";

/// Initialise the global logging subscriber.
///
/// Safe to call once at startup.
pub fn init_logging(cli_level: Option<LogLevel>, config_level: Option<&str>) -> Result<()> {
    let env_level = std::env::var(LOG_ENV).ok();
    let level = resolve_level(cli_level, env_level.as_deref(), config_level);

    fmt()
        .with_max_level(level)
        .with_target(true)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_writer(std::io::stderr)
        .try_init()
        .map_err(|err| anyhow::anyhow!("failed to install logger: {err}"))?;

    Ok(())
}

/// First usable level in priority order.
pub fn resolve_level(
    cli_level: Option<LogLevel>,
    env_level: Option<&str>,
    config_level: Option<&str>,
) -> tracing::Level {
    if let Some(lvl) = cli_level {
        return level_from_log_level(lvl);
    }
    env_level
        .and_then(parse_level_str)
        .or_else(|| config_level.and_then(parse_level_str))
        .unwrap_or(tracing::Level::INFO)
}

fn level_from_log_level(lvl: LogLevel) -> tracing::Level {
    match lvl {
        LogLevel::Error => tracing::Level::ERROR,
        LogLevel::Warn => tracing::Level::WARN,
        LogLevel::Info => tracing::Level::INFO,
        LogLevel::Debug => tracing::Level::DEBUG,
        LogLevel::Trace => tracing::Level::TRACE,
    }
}

fn parse_level_str(s: &str) -> Option<tracing::Level> {
    match s.trim().to_lowercase().as_str() {
        "error" => Some(tracing::Level::ERROR),
        "warn" | "warning" => Some(tracing::Level::WARN),
        "info" => Some(tracing::Level::INFO),
        "debug" => Some(tracing::Level::DEBUG),
        "trace" => Some(tracing::Level::TRACE),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::Level;

    #[test]
    fn flag_wins_over_env_and_config() {
        let level = resolve_level(Some(LogLevel::Warn), Some("trace"), Some("debug"));
        assert_eq!(level, Level::WARN);
    }

    #[test]
    fn env_then_config_then_info() {
        assert_eq!(resolve_level(None, Some("debug"), Some("error")), Level::DEBUG);
        assert_eq!(resolve_level(None, Some("bogus"), Some("error")), Level::ERROR);
        assert_eq!(resolve_level(None, None, None), Level::INFO);
    }
}
