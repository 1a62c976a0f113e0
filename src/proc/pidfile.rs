// src/proc/pidfile.rs

//! `{run_dir}/{name}_subsystem.pid` bookkeeping.

use std::fs;
use std::io;
use std::path::Path;

use anyhow::{Context, Result};

pub fn write_pid_file(path: &Path, pid: u32) -> Result<()> {
    if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating run directory {}", dir.display()))?;
    }
    fs::write(path, format!("{pid}\n"))
        .with_context(|| format!("writing pid file {}", path.display()))?;
    Ok(())
}

/// `None` if the file does not exist or does not hold a pid.
pub fn read_pid_file(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

/// Remove the pid file; a missing file is fine.
pub fn remove_pid_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err).with_context(|| format!("removing pid file {}", path.display())),
    }
}

/// Remove the pid file only if it still names `pid`.
pub fn remove_stale_pid_file(path: &Path, pid: u32) -> Result<bool> {
    if read_pid_file(path) == Some(pid) {
        remove_pid_file(path)?;
        return Ok(true);
    }
    Ok(false)
}
