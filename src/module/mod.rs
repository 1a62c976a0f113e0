// src/module/mod.rs

//! Modules: a lifecycle state machine plus the message cycle that drives it.
//!
//! - [`behaviour`] is the trait subsystems implement and the hook context.
//! - [`cycle`] holds [`Module`] and its queue-consuming loop.
//! - [`handle`] is the cloneable, queue-backed handle to a running module.
//! - [`message`] defines queue entries and lifecycle event names.

pub mod behaviour;
pub mod cycle;
pub mod handle;
pub mod message;

pub use behaviour::{Behaviour, Context};
pub use cycle::{Module, ModuleOptions};
pub use handle::ModuleHandle;
pub use message::{Message, Signal, events};
