// src/core/mod.rs

//! The supervisor ("core") and the handle subsystems use to reach it.

pub mod handle;
pub mod registry;
pub mod supervisor;

pub use handle::{CoreCommand, CoreHandle};
pub use registry::{
    BuiltSubsystem, Registry, RegistryEntry, SubsystemFactories, SubsystemFactory,
};
pub use supervisor::{ServeExit, Supervisor};
