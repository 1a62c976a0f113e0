mod common;
use crate::common::builders::{ConfigFileBuilder, SubsystemConfigBuilder};

use std::error::Error;
use std::fs;
use std::time::Duration;

use athome::config::{ConfigFile, load_and_validate};
use athome::errors::AthomeError;
use athome::types::ShutdownPolicy;

type TestResult = Result<(), Box<dyn Error>>;

fn write_config(contents: &str) -> Result<(tempfile::TempDir, std::path::PathBuf), Box<dyn Error>> {
    let dir = tempfile::tempdir()?;
    let path = dir.path().join("athome.toml");
    fs::write(&path, contents)?;
    Ok((dir, path))
}

#[test]
fn full_file_loads_with_defaults_applied() -> TestResult {
    let (_dir, path) = write_config(
        r#"
[core]
stop_timeout = "750ms"
shutdown_policy = "direct"

[subsystem.broker]
class = "proc"
[subsystem.broker.process]
module = "echo"
[subsystem.broker.config]
port = 1883

[subsystem.heartbeat]
class = "ticker"
after = ["broker"]
[subsystem.heartbeat.config]
interval = "5s"

[subsystem.legacy]
enable = false
class = "ticker"
"#,
    )?;

    let cfg = load_and_validate(&path)?;
    assert_eq!(cfg.core.stop_timeout.as_duration(), Duration::from_millis(750));
    assert_eq!(cfg.core.shutdown_timeout.as_duration(), Duration::from_secs(10));
    assert_eq!(cfg.core.shutdown_policy, ShutdownPolicy::Direct);

    let broker = &cfg.subsystem["broker"];
    let process = broker.process.as_ref().unwrap();
    assert_eq!(process.module, "echo");
    assert_eq!(process.stop_timeout.as_duration(), Duration::from_secs(3));
    assert_eq!(broker.config["port"], 1883);

    let enabled: Vec<_> = cfg.enabled_subsystems().map(|(n, _)| n.as_str()).collect();
    assert_eq!(enabled, vec!["broker", "heartbeat"]);
    Ok(())
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_and_validate(dir.path().join("nope.toml")).unwrap_err();
    assert!(matches!(err, AthomeError::Io(_)));
}

#[test]
fn malformed_toml_is_reported_as_toml() -> TestResult {
    let (_dir, path) = write_config("[subsystem.broker\nclass = 1")?;
    let err = load_and_validate(&path).unwrap_err();
    assert_eq!(err.as_label(), "toml");
    Ok(())
}

#[test]
fn proc_without_process_section_is_rejected() {
    let raw = ConfigFileBuilder::new()
        .with_subsystem("broker", SubsystemConfigBuilder::new("proc").build())
        .raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(matches!(err, AthomeError::ConfigError(ref msg) if msg.contains("broker")));
}

#[test]
fn dependency_on_disabled_subsystem_is_rejected() {
    let raw = ConfigFileBuilder::new()
        .with_subsystem("broker", SubsystemConfigBuilder::proc("echo").disabled().build())
        .with_subsystem(
            "bridge",
            SubsystemConfigBuilder::new("ticker").after("broker").build(),
        )
        .raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(matches!(err, AthomeError::ConfigError(ref msg) if msg.contains("disabled")));
}

#[test]
fn dependency_cycle_is_rejected() {
    let raw = ConfigFileBuilder::new()
        .with_subsystem("a", SubsystemConfigBuilder::new("ticker").after("c").build())
        .with_subsystem("b", SubsystemConfigBuilder::new("ticker").after("a").build())
        .with_subsystem("c", SubsystemConfigBuilder::new("ticker").after("b").build())
        .raw();
    let err = ConfigFile::try_from(raw).unwrap_err();
    assert!(matches!(err, AthomeError::DependencyCycle(_)));
}
