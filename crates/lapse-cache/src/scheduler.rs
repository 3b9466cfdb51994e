//! The entry point the cache calls on every touch and removal.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::config::SchedulerConfig;
use crate::driver::ExpirationDriver;
use crate::error::{Error, Result};
use crate::eviction::{Eviction, EvictionQueue};
use crate::removal::{RemovalCause, RemovalOutcome, Remover};
use crate::stats::{SchedulerStats, StatsCounter};

/// Expiration and eviction scheduling for one cache.
///
/// Combines an [`ExpirationDriver`] (idle timeout) and an optional
/// [`EvictionQueue`] (capacity) over the same removal protocol. The two are
/// independent and may race for the same id; the protocol's
/// acquire-then-revalidate step makes the loser a no-op.
///
/// Bookkeeping after a successful removal only forgets an id if it was not
/// touched again while the removal ran, so a concurrent access is never
/// lost. Access marks the eviction queue before the expiration driver, so
/// at rest every queued id is also tracked whenever an idle timeout is set.
pub struct Scheduler<K: Hash + Eq> {
    driver: ExpirationDriver<K>,
    eviction: Option<Arc<EvictionQueue<K>>>,
    stats: Arc<StatsCounter>,
    config: SchedulerConfig,
    closed: AtomicBool,
}

impl<K> Scheduler<K>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Start scheduling with `config`, removing through `remover`.
    ///
    /// Returns [`Error::Runtime`] when an idle timeout is configured outside
    /// a tokio runtime.
    pub fn start(config: SchedulerConfig, remover: Arc<dyn Remover<K>>) -> Result<Self> {
        config.validate()?;

        let stats = Arc::new(StatsCounter::new());
        let eviction = match config.max_entries {
            Some(max) => {
                let max = NonZeroUsize::new(max)
                    .ok_or_else(|| Error::Config("max_entries must be greater than zero".into()))?;
                Some(Arc::new(EvictionQueue::new(
                    max,
                    Arc::clone(&remover),
                    Arc::clone(&stats),
                )))
            }
            None => None,
        };

        // Expired entries leave the LRU order too.
        let expiring: Arc<dyn Remover<K>> = match &eviction {
            Some(queue) => Arc::new(Dequeuing {
                inner: remover,
                queue: Arc::clone(queue),
            }),
            None => remover,
        };
        let driver = ExpirationDriver::start(config.idle_timeout, expiring, Arc::clone(&stats))?;

        info!(
            idle_timeout_ms = config.idle_timeout.map(|t| t.as_millis() as u64),
            max_entries = config.max_entries,
            "Scheduler started"
        );

        Ok(Self {
            driver,
            eviction,
            stats,
            config,
            closed: AtomicBool::new(false),
        })
    }

    /// Get the scheduler configuration.
    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    /// Record a touch of `id`.
    ///
    /// Restarts its idle countdown and marks it most recently used. If this
    /// pushes the cache over capacity, the least recently used entry is
    /// evicted on the calling thread and the attempt is returned.
    pub fn on_access(&self, id: K) -> Option<Eviction<K>> {
        if self.closed.load(Ordering::Acquire) {
            return None;
        }
        let Some(queue) = &self.eviction else {
            self.driver.schedule(id);
            return None;
        };

        let admitted = queue.admit(id.clone(), |victim| self.driver.generation(victim));
        self.driver.schedule(id);
        let (victim, tracked) = admitted?;

        let eviction = queue.evict(victim);
        if let Ok(RemovalOutcome::Removed) = eviction.outcome
            && let Some(generation) = tracked
        {
            self.driver.cancel_if(&eviction.victim, generation);
        }
        Some(eviction)
    }

    /// Record that the application removed `id` itself.
    pub fn on_remove(&self, id: &K) {
        self.driver.cancel(id);
        if let Some(queue) = &self.eviction {
            queue.remove(id);
        }
    }

    /// Hold off expiring `id` while a caller is using it.
    ///
    /// The next [`on_access`](Self::on_access) restarts the countdown.
    pub fn suspend(&self, id: &K) {
        self.driver.suspend(id);
    }

    /// Restart the countdown for a tracked `id` with its previous duration.
    pub fn retry_expiration(&self, id: &K) {
        self.driver.retry(id);
    }

    /// Whether `id` is tracked for expiration or queued for eviction.
    pub fn is_scheduled(&self, id: &K) -> bool {
        self.driver.is_tracked(id) || self.eviction.as_ref().is_some_and(|q| q.contains(id))
    }

    /// Get scheduler statistics.
    pub fn stats(&self) -> SchedulerStats {
        let queued = self.eviction.as_ref().map_or(0, |q| q.len());
        self.stats.snapshot(self.driver.tracked(), queued)
    }

    /// Stop the driver and release all bookkeeping.
    ///
    /// Later calls to [`on_access`](Self::on_access) are ignored.
    pub async fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.driver.shutdown().await;
        if let Some(queue) = &self.eviction {
            queue.clear();
        }
        debug!("Scheduler shut down");
    }
}

/// Drops successfully expired ids from the eviction queue.
struct Dequeuing<K: Hash + Eq> {
    inner: Arc<dyn Remover<K>>,
    queue: Arc<EvictionQueue<K>>,
}

impl<K> Remover<K> for Dequeuing<K>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync,
{
    fn remove(&self, id: &K, cause: RemovalCause) -> Result<RemovalOutcome> {
        let queued = self.queue.generation(id);
        let outcome = self.inner.remove(id, cause)?;
        if outcome == RemovalOutcome::Removed
            && let Some(generation) = queued
        {
            self.queue.remove_if(id, generation);
        }
        Ok(outcome)
    }
}
