//! Configuration for the expiration/eviction scheduler.

use std::time::Duration;

use crate::error::{Error, Result};

/// Default maximum number of resident entries before LRU eviction.
pub const DEFAULT_MAX_ENTRIES: Option<usize> = Some(10_000);

/// Default idle timeout (none by default - entries are immortal).
pub const DEFAULT_IDLE_TIMEOUT: Option<Duration> = None;

/// Configuration for a [`Scheduler`](crate::Scheduler).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    /// How long an entry may sit unused before it expires.
    /// `None` means entries are immortal and the expiration driver stays inert.
    pub idle_timeout: Option<Duration>,

    /// Maximum number of resident entries before the least recently used one
    /// is evicted. `None` disables capacity eviction.
    pub max_entries: Option<usize>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            max_entries: DEFAULT_MAX_ENTRIES,
        }
    }
}

impl SchedulerConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expire entries idle for longer than `timeout`.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Never expire entries based on idle time.
    pub fn immortal(mut self) -> Self {
        self.idle_timeout = None;
        self
    }

    /// Evict the least recently used entry once more than `max` are resident.
    pub fn with_max_entries(mut self, max: usize) -> Self {
        self.max_entries = Some(max);
        self
    }

    /// Disable capacity eviction.
    pub fn unbounded(mut self) -> Self {
        self.max_entries = None;
        self
    }

    /// Whether idle-timeout expiration is disabled.
    pub fn is_immortal(&self) -> bool {
        self.idle_timeout.is_none()
    }

    /// Reject configurations the scheduler cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.max_entries == Some(0) {
            return Err(Error::Config(
                "max_entries must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SchedulerConfig::default();
        assert!(config.is_immortal());
        assert_eq!(config.max_entries, Some(10_000));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = SchedulerConfig::new()
            .with_idle_timeout(Duration::from_secs(30))
            .unbounded();
        assert_eq!(config.idle_timeout, Some(Duration::from_secs(30)));
        assert_eq!(config.max_entries, None);
        assert!(config.immortal().is_immortal());
    }

    #[test]
    fn test_zero_capacity_rejected() {
        let config = SchedulerConfig::new().with_max_entries(0);
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }
}
