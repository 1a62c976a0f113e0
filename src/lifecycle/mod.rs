// src/lifecycle/mod.rs

//! Lifecycle state machine shared by the supervisor and every subsystem.
//!
//! - [`state`] holds the typed states, triggers and the transition table.
//! - [`machine`] wraps the table in a [`StateMachine`] that rejects illegal
//!   triggers and publishes the current state on a `watch` channel.

pub mod machine;
pub mod state;

pub use machine::StateMachine;
pub use state::{LifecycleState, Trigger, next_state};
