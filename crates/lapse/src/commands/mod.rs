//! CLI command handlers.

use std::path::PathBuf;

use lapse_config::LoadedConfig;

pub mod config;
pub mod simulate;

/// Shared context for all commands.
#[derive(Debug, Clone)]
pub struct Context {
    /// Output as JSON for scripting.
    pub json_output: bool,
    /// Verbose output enabled.
    pub verbose: bool,
    /// Explicit user config directory, if one was given.
    pub config_dir: Option<PathBuf>,
    /// Discovered and merged configuration.
    pub loaded: LoadedConfig,
}
