//! Expiration and eviction scheduling for cached entries.
//!
//! This crate decides *which* resident entry should leave a per-node cache
//! and *when*:
//! - Idle-timeout expiration driven by a single background timer
//! - LRU eviction when the number of resident entries exceeds a maximum
//! - A removal protocol that re-validates candidates and wraps the removal
//!   in a transactional batch
//!
//! Storage, locking and the transactional substrate are supplied by the
//! caller through the traits in [`removal`].
//!
//! # Example
//!
//! ```rust,ignore
//! use lapse_cache::{RemovalProtocol, Scheduler, SchedulerConfig};
//!
//! let config = SchedulerConfig::default()
//!     .with_idle_timeout(Duration::from_secs(300))
//!     .with_max_entries(1000);
//!
//! let protocol = RemovalProtocol::new(store, batcher).with_idle_timeout(config.idle_timeout);
//! let scheduler = Scheduler::start(config, Arc::new(protocol))?;
//! scheduler.on_access("bean-1".to_string());
//! ```

pub mod clock;
mod config;
pub mod driver;
mod error;
pub mod eviction;
pub mod index;
pub mod memory;
pub mod removal;
mod scheduler;
mod stats;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_ENTRIES, SchedulerConfig};
pub use driver::ExpirationDriver;
pub use error::{Error, Result};
pub use eviction::{Eviction, EvictionQueue};
pub use index::ExpirationIndex;
pub use memory::{MemoryBatch, MemoryBatcher, MemoryEntry, MemoryStore};
pub use removal::{
    Acquire, Batch, Batcher, CachedEntry, EntryStore, EvictionBackend, NoopListener,
    RemovalCause, RemovalListener, RemovalOutcome, RemovalProtocol, Remover, SkipReason,
};
pub use scheduler::Scheduler;
pub use stats::{SchedulerStats, StatsCounter};
