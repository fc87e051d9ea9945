// src/config/mod.rs

//! TOML configuration: raw serde model, unit parsers, validation and loading.

pub mod loader;
pub mod model;
pub mod units;
pub mod validate;

pub use loader::{load_and_validate, load_from_path, parse_str};
pub use model::{
    CommandSpec, ConfigFile, ConfigSection, RawConfigFile, RawServiceConfig, RawTaskConfig,
    RawWorkflowConfig, ServiceSpec, Settings,
};
