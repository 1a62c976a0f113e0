// src/subsystems/mod.rs

//! In-process subsystem classes.

pub mod ticker;

pub use ticker::Ticker;
