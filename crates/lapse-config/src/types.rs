//! Configuration types mapping to the TOML schema.
//!
//! ```toml
//! [expiration]
//! idle_timeout_ms = 300000   # negative for immortal entries
//!
//! [eviction]
//! max_entries = 10000        # negative for an unbounded cache
//!
//! [logging]
//! level = "info"
//! json = false
//! ```

use std::time::Duration;

use lapse_cache::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ENTRIES, SchedulerConfig};
use serde::{Deserialize, Serialize};

use crate::{ConfigError, Result};

/// Log levels accepted in `[logging] level`.
const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

// ─────────────────────────────────────────────────────────────────────────────
// Top-level Config
// ─────────────────────────────────────────────────────────────────────────────

/// Root configuration structure.
///
/// All sections are optional so that partial configs (e.g. project-local
/// overrides) can be loaded and merged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LapseConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expiration: Option<ExpirationConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub eviction: Option<EvictionConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

impl LapseConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from a TOML string.
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        Ok(toml::from_str(toml_str)?)
    }

    /// Serialize to a TOML string.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Merge another config on top of this one (other takes priority).
    pub fn merge(&mut self, other: LapseConfig) {
        if other.expiration.is_some() {
            self.expiration = other.expiration;
        }

        if other.eviction.is_some() {
            self.eviction = other.eviction;
        }

        if other.logging.is_some() {
            self.logging = other.logging;
        }
    }

    /// Check values the schema alone cannot rule out.
    pub fn validate(&self) -> Result<()> {
        if let Some(ms) = self.expiration.as_ref().and_then(|e| e.idle_timeout_ms)
            && ms == 0
        {
            return Err(invalid(
                "expiration.idle_timeout_ms",
                "must not be zero; use a negative value for immortal entries",
            ));
        }

        if let Some(max) = self.eviction.as_ref().and_then(|e| e.max_entries)
            && max == 0
        {
            return Err(invalid(
                "eviction.max_entries",
                "must not be zero; use a negative value for an unbounded cache",
            ));
        }

        if let Some(level) = self.logging.as_ref().and_then(|l| l.level.as_deref())
            && !LOG_LEVELS.contains(&level.to_ascii_lowercase().as_str())
        {
            return Err(invalid(
                "logging.level",
                &format!("'{}' is not one of {}", level, LOG_LEVELS.join(", ")),
            ));
        }

        Ok(())
    }

    /// Effective idle timeout; `None` means entries never expire.
    pub fn idle_timeout(&self) -> Option<Duration> {
        match self.expiration.as_ref().and_then(|e| e.idle_timeout_ms) {
            Some(ms) if ms < 0 => None,
            Some(ms) => Some(Duration::from_millis(ms.unsigned_abs())),
            None => DEFAULT_IDLE_TIMEOUT,
        }
    }

    /// Effective capacity; `None` means the cache is unbounded.
    pub fn max_entries(&self) -> Option<usize> {
        match self.eviction.as_ref().and_then(|e| e.max_entries) {
            Some(max) if max < 0 => None,
            Some(max) => usize::try_from(max).ok(),
            None => DEFAULT_MAX_ENTRIES,
        }
    }

    /// Effective log level.
    pub fn log_level(&self) -> &str {
        self.logging
            .as_ref()
            .and_then(|l| l.level.as_deref())
            .unwrap_or("info")
    }

    /// Whether logs should be emitted as JSON.
    pub fn json_logs(&self) -> bool {
        self.logging.as_ref().is_some_and(|l| l.json)
    }
}

impl From<&LapseConfig> for SchedulerConfig {
    fn from(config: &LapseConfig) -> Self {
        SchedulerConfig {
            idle_timeout: config.idle_timeout(),
            max_entries: config.max_entries(),
        }
    }
}

fn invalid(field: &str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field: field.to_string(),
        reason: reason.to_string(),
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Sections
// ─────────────────────────────────────────────────────────────────────────────

/// Idle-timeout expiration section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpirationConfig {
    /// Idle time before an entry expires, in milliseconds. Negative values
    /// disable expiration.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idle_timeout_ms: Option<i64>,
}

/// LRU capacity eviction section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EvictionConfig {
    /// Maximum resident entries. Negative values disable eviction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<i64>,
}

/// Logging section.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level filter when `RUST_LOG` is unset.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
