// src/types.rs

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize};

/// What `shutdown()` does when the module is still `Running`.
///
/// - `ImplicitStop`: run `stop()` first (Running -> Stopping, `on_stop`) and
///   close from `Stopping` (default).
/// - `Direct`: close straight from `Running`; only `on_shutdown` runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ShutdownPolicy {
    #[default]
    ImplicitStop,
    Direct,
}

impl FromStr for ShutdownPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "implicit_stop" => Ok(ShutdownPolicy::ImplicitStop),
            "direct" => Ok(ShutdownPolicy::Direct),
            other => Err(format!(
                "invalid shutdown_policy: {other} (expected \"implicit_stop\" or \"direct\")"
            )),
        }
    }
}

/// Filesystem locations shared by the supervisor and every subsystem.
///
/// Serialized as-is into the `env` field of the `start` line.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Env {
    #[serde(default = "default_run_dir")]
    pub run_dir: PathBuf,
    #[serde(default = "default_tmp_dir")]
    pub tmp_dir: PathBuf,
}

fn default_run_dir() -> PathBuf {
    PathBuf::from("./run")
}

fn default_tmp_dir() -> PathBuf {
    PathBuf::from("./tmp")
}

impl Default for Env {
    fn default() -> Self {
        Self {
            run_dir: default_run_dir(),
            tmp_dir: default_tmp_dir(),
        }
    }
}

impl Env {
    /// Path of the pid file a child writes for subsystem `name`.
    pub fn pid_file(&self, name: &str) -> PathBuf {
        self.run_dir.join(format!("{name}_subsystem.pid"))
    }
}

/// A `Duration` written as `<n>ms|s|m|h` in configuration files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct HumanDuration(pub Duration);

impl HumanDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }
}

impl From<Duration> for HumanDuration {
    fn from(value: Duration) -> Self {
        HumanDuration(value)
    }
}

impl FromStr for HumanDuration {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        parse_duration(s).map(HumanDuration)
    }
}

impl fmt::Display for HumanDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ms = self.0.as_millis();
        if ms % 1000 != 0 {
            write!(f, "{ms}ms")
        } else {
            write!(f, "{}s", ms / 1000)
        }
    }
}

impl<'de> Deserialize<'de> for HumanDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

impl Serialize for HumanDuration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.collect_str(self)
    }
}

/// Parse `"250ms"`, `"5s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| format!("duration '{s}' is missing a unit suffix"))?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 60 * 60)),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_all_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration("5s").unwrap(), Duration::from_secs(5));
        assert_eq!(parse_duration(" 2m ").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_missing_or_unknown_unit() {
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("10d").is_err());
        assert!(parse_duration("").is_err());
        assert!(parse_duration("ms").is_err());
    }

    #[test]
    fn display_prefers_seconds() {
        assert_eq!(HumanDuration(Duration::from_secs(3)).to_string(), "3s");
        assert_eq!(HumanDuration(Duration::from_millis(1500)).to_string(), "1500ms");
    }

    #[test]
    fn pid_file_lives_in_run_dir() {
        let env = Env {
            run_dir: PathBuf::from("/var/run/athome"),
            tmp_dir: PathBuf::from("/tmp"),
        };
        assert_eq!(
            env.pid_file("broker"),
            PathBuf::from("/var/run/athome/broker_subsystem.pid")
        );
    }

    #[test]
    fn shutdown_policy_from_str() {
        assert_eq!("direct".parse::<ShutdownPolicy>(), Ok(ShutdownPolicy::Direct));
        assert_eq!(
            "Implicit_Stop".parse::<ShutdownPolicy>(),
            Ok(ShutdownPolicy::ImplicitStop)
        );
        assert!("later".parse::<ShutdownPolicy>().is_err());
    }
}
