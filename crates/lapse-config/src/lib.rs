//! Configuration for the lapse cache scheduler.
//!
//! Provides TOML-based configuration with:
//! - Idle-timeout expiration (`[expiration]`)
//! - LRU capacity eviction (`[eviction]`)
//! - Log level and format (`[logging]`)
//! - Config file layering (user config + project-local overrides)

pub mod discovery;
pub mod error;
pub mod types;

pub use discovery::{
    ConfigSource, LoadedConfig, load_config, load_config_file, load_config_with_options, save_config,
    xdg_config_dir, xdg_config_path,
};
pub use error::{ConfigError, Result};
pub use types::*;
