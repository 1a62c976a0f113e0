// src/proc/mod.rs

//! Out-of-process subsystems.
//!
//! - [`subsystem`] is the `Behaviour` proxying the lifecycle over the pipe.
//! - [`child`] spawns the process and carries out the escalation.
//! - [`client`] sends correlated requests.
//! - [`pidfile`] is shared with the runner side.

pub mod child;
pub mod client;
pub mod pidfile;
pub mod subsystem;

pub use child::{ChildProcess, Escalation, command_line};
pub use client::ProcClient;
pub use subsystem::{LineHandler, ProcSubsystem};
