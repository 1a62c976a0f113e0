// src/runner/mod.rs

//! Child side of the line protocol.
//!
//! - [`host`] is the generic [`Runner`] loop.
//! - [`service`] is the trait services implement and their context.
//! - [`services`] holds the built-in `echo` and `ticker` services.
//! - [`registry`] maps runner module names to service factories.

pub mod host;
pub mod registry;
pub mod service;
pub mod services;

pub use host::{ExitReason, Runner};
pub use registry::{RunnerRegistry, ServiceFactory};
pub use service::{RunnerContext, Service};
pub use services::{EchoService, TickerService};
