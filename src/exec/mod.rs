// src/exec/mod.rs

//! Background work execution.
//!
//! - [`executor`] owns the live set of jobs, cancellation and draining.
//! - [`job`] is the handle returned by `execute` plus completion callbacks.
//! - [`sink`] receives every failure nobody waited for.

pub mod executor;
pub mod job;
pub mod sink;

pub use executor::Executor;
pub use job::{Job, JobCallbacks, JobId};
pub use sink::{FailureHandler, TaskFailure, log_failure};
