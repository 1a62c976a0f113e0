// src/config/mod.rs

//! Configuration loading and validation for athome.
//!
//! - [`model`] is the TOML-backed data model.
//! - [`loader`] reads a file from disk.
//! - [`validate`] turns a `RawConfigFile` into a `ConfigFile`.

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{default_config_path, load_and_validate, load_from_path, parse_str};
pub use model::{
    ConfigFile, CoreSection, LoggingSection, ProcessConfig, RawConfigFile, SubsystemConfig,
};
pub use validate::{PROC_CLASS, validate_raw_config};
