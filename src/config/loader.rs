// src/config/loader.rs

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::Result;

/// Read and deserialize a configuration file without semantic validation.
/// Use [`load_and_validate`] for that.
pub fn load_from_path(path: impl AsRef<Path>) -> Result<RawConfigFile> {
    let contents = fs::read_to_string(path.as_ref())?;
    parse_str(&contents)
}

pub fn parse_str(contents: &str) -> Result<RawConfigFile> {
    let config: RawConfigFile = toml::from_str(contents)?;
    Ok(config)
}

/// Load a configuration file and validate it:
///
/// - Reads TOML and applies defaults.
/// - Checks classes, `process` sections, `after` references and dependency
///   cycles.
pub fn load_and_validate(path: impl AsRef<Path>) -> Result<ConfigFile> {
    let raw_config = load_from_path(&path)?;
    let config = ConfigFile::try_from(raw_config)?;
    Ok(config)
}

/// `athome.toml` in the current working directory.
pub fn default_config_path() -> PathBuf {
    PathBuf::from("athome.toml")
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::types::ShutdownPolicy;

    #[test]
    fn parses_full_example() {
        let raw = parse_str(
            r#"
            [env]
            run_dir = "/tmp/athome/run"

            [core]
            stop_timeout = "2s"
            shutdown_policy = "direct"

            [logging]
            level = "debug"

            [subsystem.broker]
            class = "proc"
            [subsystem.broker.process]
            module = "echo"
            stop_timeout = "500ms"
            [subsystem.broker.config]
            port = 1883

            [subsystem.heartbeat]
            class = "ticker"
            after = ["broker"]
            "#,
        )
        .unwrap();
        let cfg = ConfigFile::try_from(raw).unwrap();

        assert_eq!(cfg.env.run_dir, PathBuf::from("/tmp/athome/run"));
        assert_eq!(cfg.env.tmp_dir, PathBuf::from("./tmp"));
        assert_eq!(cfg.core.stop_timeout.as_duration(), Duration::from_secs(2));
        assert_eq!(cfg.core.shutdown_timeout.as_duration(), Duration::from_secs(10));
        assert_eq!(cfg.core.shutdown_policy, ShutdownPolicy::Direct);
        assert_eq!(cfg.logging.level.as_deref(), Some("debug"));

        let broker = &cfg.subsystem["broker"];
        assert!(broker.enable);
        assert_eq!(broker.config["port"], 1883);
        let process = broker.process.as_ref().unwrap();
        assert_eq!(process.stop_timeout.as_duration(), Duration::from_millis(500));
        assert_eq!(process.request_timeout.as_duration(), Duration::from_secs(10));

        assert_eq!(cfg.subsystem["heartbeat"].after, vec!["broker".to_string()]);
        assert!(cfg.subsystem["heartbeat"].config.as_object().unwrap().is_empty());
    }

    #[test]
    fn bad_duration_is_a_toml_error() {
        let err = parse_str("[core]\nstop_timeout = \"soon\"\n").unwrap_err();
        assert_eq!(err.as_label(), "toml");
    }
}
