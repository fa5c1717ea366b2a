//! CLI commands for the arbitrage engine.

pub mod config;
pub mod registry;
pub mod run;

pub use config::{run_config, ConfigArgs};
pub use registry::{run_registry, RegistryArgs};
pub use run::{run_replay, RunArgs};
