// src/config/validate.rs

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::config::model::{ConfigFile, RawConfigFile};
use crate::errors::{AthomeError, Result};

/// Name of the class whose subsystems run in a child process.
pub const PROC_CLASS: &str = "proc";

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = AthomeError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        validate_raw_config(&raw)?;
        Ok(ConfigFile::new_unchecked(raw))
    }
}

pub fn validate_raw_config(cfg: &RawConfigFile) -> Result<()> {
    validate_core(cfg)?;
    validate_subsystems(cfg)?;
    validate_dependencies(cfg)?;
    validate_dependency_graph(cfg)?;
    Ok(())
}

fn validate_core(cfg: &RawConfigFile) -> Result<()> {
    if cfg.core.shutdown_timeout.as_duration().is_zero() {
        return Err(AthomeError::ConfigError(
            "[core].shutdown_timeout must be greater than zero".to_string(),
        ));
    }
    Ok(())
}

fn validate_subsystems(cfg: &RawConfigFile) -> Result<()> {
    for (name, sub) in cfg.subsystem.iter() {
        if sub.class.trim().is_empty() {
            return Err(AthomeError::ConfigError(format!(
                "subsystem '{name}' has an empty `class`"
            )));
        }
        if sub.class == PROC_CLASS {
            match &sub.process {
                None => {
                    return Err(AthomeError::ConfigError(format!(
                        "subsystem '{name}' has class \"proc\" but no [subsystem.{name}.process] section"
                    )));
                }
                Some(process) if process.module.trim().is_empty() => {
                    return Err(AthomeError::ConfigError(format!(
                        "subsystem '{name}' has an empty `process.module`"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn validate_dependencies(cfg: &RawConfigFile) -> Result<()> {
    for (name, sub) in cfg.subsystem.iter().filter(|(_, s)| s.enable) {
        for dep in sub.after.iter() {
            if dep == name {
                return Err(AthomeError::ConfigError(format!(
                    "subsystem '{name}' cannot depend on itself in `after`"
                )));
            }
            match cfg.subsystem.get(dep) {
                None => {
                    return Err(AthomeError::ConfigError(format!(
                        "subsystem '{name}' has unknown dependency '{dep}' in `after`"
                    )));
                }
                Some(target) if !target.enable => {
                    return Err(AthomeError::ConfigError(format!(
                        "subsystem '{name}' depends on disabled subsystem '{dep}'"
                    )));
                }
                Some(_) => {}
            }
        }
    }
    Ok(())
}

fn validate_dependency_graph(cfg: &RawConfigFile) -> Result<()> {
    // Edge direction: dep -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for (name, sub) in cfg.subsystem.iter().filter(|(_, s)| s.enable) {
        graph.add_node(name.as_str());
        for dep in sub.after.iter() {
            graph.add_edge(dep.as_str(), name.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(AthomeError::DependencyCycle(format!(
            "cycle involving subsystem '{}'",
            cycle.node_id()
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::model::{ProcessConfig, SubsystemConfig};

    fn raw(entries: Vec<(&str, SubsystemConfig)>) -> RawConfigFile {
        let mut cfg = RawConfigFile::default();
        for (name, sub) in entries {
            cfg.subsystem.insert(name.to_string(), sub);
        }
        cfg
    }

    fn after(mut sub: SubsystemConfig, deps: &[&str]) -> SubsystemConfig {
        sub.after = deps.iter().map(|d| d.to_string()).collect();
        sub
    }

    #[test]
    fn empty_config_is_valid() {
        assert!(ConfigFile::try_from(RawConfigFile::default()).is_ok());
    }

    #[test]
    fn proc_requires_process_section() {
        let err = ConfigFile::try_from(raw(vec![("b", SubsystemConfig::new("proc"))])).unwrap_err();
        assert!(matches!(err, AthomeError::ConfigError(ref m) if m.contains("process")));

        let mut ok = SubsystemConfig::new("proc");
        ok.process = Some(ProcessConfig::new("echo"));
        assert!(ConfigFile::try_from(raw(vec![("b", ok)])).is_ok());
    }

    #[test]
    fn rejects_self_and_unknown_dependencies() {
        let err = ConfigFile::try_from(raw(vec![(
            "a",
            after(SubsystemConfig::new("ticker"), &["a"]),
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("itself"));

        let err = ConfigFile::try_from(raw(vec![(
            "a",
            after(SubsystemConfig::new("ticker"), &["ghost"]),
        )]))
        .unwrap_err();
        assert!(err.to_string().contains("ghost"));
    }

    #[test]
    fn rejects_dependency_on_disabled_subsystem() {
        let mut off = SubsystemConfig::new("ticker");
        off.enable = false;
        let err = ConfigFile::try_from(raw(vec![
            ("a", after(SubsystemConfig::new("ticker"), &["b"])),
            ("b", off),
        ]))
        .unwrap_err();
        assert!(err.to_string().contains("disabled"));
    }

    #[test]
    fn detects_cycles() {
        let err = ConfigFile::try_from(raw(vec![
            ("a", after(SubsystemConfig::new("ticker"), &["c"])),
            ("b", after(SubsystemConfig::new("ticker"), &["a"])),
            ("c", after(SubsystemConfig::new("ticker"), &["b"])),
        ]))
        .unwrap_err();
        assert!(matches!(err, AthomeError::DependencyCycle(_)));
    }
}
