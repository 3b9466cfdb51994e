//! The background expiration driver.
//!
//! One tokio task per driver sleeps until the earliest deadline in its
//! [`ExpirationIndex`], pops everything that is due, and hands the batch to
//! the removal protocol on the blocking pool. Access paths re-arm it only
//! when they move the earliest deadline.

use std::collections::HashSet;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::index::ExpirationIndex;
use crate::removal::{self, RemovalCause, RemovalOutcome, Remover};
use crate::stats::StatsCounter;

/// State shared between the driver handle and its task.
struct Shared<K> {
    index: Mutex<ExpirationIndex<K>>,
    timeout: Duration,
    rearm: Notify,
    shutdown: CancellationToken,
    remover: Arc<dyn Remover<K>>,
    stats: Arc<StatsCounter>,
    clock: Arc<dyn Clock>,
}

/// Drives idle-timeout expiration with a single timer.
///
/// An immortal driver (no idle timeout) never spawns a task and ignores
/// every call.
pub struct ExpirationDriver<K> {
    shared: Option<Arc<Shared<K>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl<K> ExpirationDriver<K>
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    /// Start a driver expiring ids `timeout` after their last schedule.
    ///
    /// With `None` the driver is inert. Otherwise the task is spawned on the
    /// current tokio runtime, and [`Error::Runtime`] is returned if there is
    /// none.
    pub fn start(
        timeout: Option<Duration>,
        remover: Arc<dyn Remover<K>>,
        stats: Arc<StatsCounter>,
    ) -> Result<Self> {
        let Some(timeout) = timeout else {
            debug!("Idle timeout disabled, expiration driver is inert");
            return Ok(Self::inert());
        };
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| Error::Runtime(e.to_string()))?;

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let shared = Arc::new(Shared {
            index: Mutex::new(ExpirationIndex::with_clock(Arc::clone(&clock))),
            timeout,
            rearm: Notify::new(),
            shutdown: CancellationToken::new(),
            remover,
            stats,
            clock,
        });

        let task = runtime.spawn(run(Arc::clone(&shared)));
        info!(timeout_ms = timeout.as_millis() as u64, "Expiration driver started");

        Ok(Self {
            shared: Some(shared),
            task: Mutex::new(Some(task)),
        })
    }

    /// A driver that never expires anything.
    pub fn inert() -> Self {
        Self {
            shared: None,
            task: Mutex::new(None),
        }
    }

    /// Whether this driver ignores all scheduling.
    pub fn is_inert(&self) -> bool {
        self.shared.is_none()
    }

    /// The configured idle timeout, if any.
    pub fn timeout(&self) -> Option<Duration> {
        self.shared.as_ref().map(|s| s.timeout)
    }

    fn active(&self) -> Option<&Arc<Shared<K>>> {
        self.shared.as_ref().filter(|s| !s.shutdown.is_cancelled())
    }

    /// (Re)start the idle countdown for `id`.
    pub fn schedule(&self, id: K) {
        let Some(shared) = self.active() else { return };
        let earliest = {
            let mut index = shared.index.lock();
            // Shutdown cancels and clears under this lock.
            if shared.shutdown.is_cancelled() {
                return;
            }
            let deadline = index.track(id, shared.timeout);
            index.next_deadline() == Some(deadline)
        };
        if earliest {
            shared.rearm.notify_one();
        }
    }

    /// Restart the countdown for a tracked id with its previous duration.
    /// Does nothing if the id is not tracked.
    pub fn retry(&self, id: &K) {
        let Some(shared) = self.active() else { return };
        let earliest = {
            let mut index = shared.index.lock();
            if shared.shutdown.is_cancelled() {
                return;
            }
            index
                .retry_expiration(id)
                .is_some_and(|deadline| index.next_deadline() == Some(deadline))
        };
        if earliest {
            shared.rearm.notify_one();
        }
    }

    /// Stop counting down for `id` until it is scheduled again.
    pub fn suspend(&self, id: &K) {
        if let Some(shared) = self.active() {
            shared.index.lock().suspend(id);
        }
    }

    /// Stop tracking `id`.
    ///
    /// The timer is left armed; a wake with nothing due is harmless.
    pub fn cancel(&self, id: &K) {
        if let Some(shared) = self.active() {
            shared.index.lock().forget(id);
        }
    }

    /// Stop tracking `id` unless it was scheduled again after `generation`
    /// was read with [`generation`](Self::generation).
    pub fn cancel_if(&self, id: &K, generation: u64) -> bool {
        self.active()
            .is_some_and(|s| s.index.lock().forget_if(id, generation))
    }

    /// Stamp of the last schedule of `id`, or `None` if untracked.
    pub fn generation(&self, id: &K) -> Option<u64> {
        self.active().and_then(|s| s.index.lock().generation(id))
    }

    /// Earliest pending deadline.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.shared
            .as_ref()
            .and_then(|s| s.index.lock().next_deadline())
    }

    /// Number of tracked ids.
    pub fn tracked(&self) -> usize {
        self.shared.as_ref().map_or(0, |s| s.index.lock().len())
    }

    /// Whether `id` is tracked.
    pub fn is_tracked(&self, id: &K) -> bool {
        self.shared
            .as_ref()
            .is_some_and(|s| s.index.lock().contains(id))
    }

    /// Every tracked id, suspended ones included.
    pub fn tracked_ids(&self) -> HashSet<K> {
        self.shared
            .as_ref()
            .map_or_else(HashSet::new, |s| s.index.lock().tracked_ids())
    }

    #[cfg(test)]
    pub(crate) fn assert_consistent(&self) {
        if let Some(shared) = &self.shared {
            shared.index.lock().assert_consistent();
        }
    }

    /// Stop the driver.
    ///
    /// Disarms the timer and forgets every tracked id. Removals already
    /// running are allowed to finish; none are started afterwards.
    pub async fn shutdown(&self) {
        let Some(shared) = &self.shared else { return };
        {
            let mut index = shared.index.lock();
            shared.shutdown.cancel();
            index.clear();
        }

        let task = self.task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Expiration driver task ended abnormally");
        }
    }
}

impl<K> Drop for ExpirationDriver<K> {
    fn drop(&mut self) {
        if let Some(shared) = &self.shared {
            shared.shutdown.cancel();
        }
    }
}

/// Sleep until `deadline`, or forever if there is none.
async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline.into()).await,
        None => std::future::pending().await,
    }
}

async fn run<K>(shared: Arc<Shared<K>>)
where
    K: Hash + Eq + Clone + fmt::Debug + Send + Sync + 'static,
{
    let mut in_flight = JoinSet::new();

    loop {
        let next = shared.index.lock().next_deadline();
        trace!(armed = next.is_some(), "Expiration timer armed");

        tokio::select! {
            _ = shared.shutdown.cancelled() => break,
            _ = shared.rearm.notified() => continue,
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    warn!(error = %e, "Expiration batch panicked");
                }
            }
            _ = wait_until(next) => {
                let due = {
                    let now = shared.clock.now();
                    shared.index.lock().drain_expired(now)
                };
                if !due.is_empty() {
                    debug!(count = due.len(), "Expiration timer fired");
                    let shared = Arc::clone(&shared);
                    in_flight.spawn_blocking(move || expire(&shared, due));
                }
            }
        }
    }

    debug!(in_flight = in_flight.len(), "Expiration driver stopping");
    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            warn!(error = %e, "Expiration batch panicked");
        }
    }
    info!("Expiration driver stopped");
}

/// Run the removal protocol for each due id, outside the index lock.
fn expire<K>(shared: &Shared<K>, due: Vec<K>)
where
    K: fmt::Debug,
{
    for id in due {
        if shared.shutdown.is_cancelled() {
            break;
        }
        if let Ok(RemovalOutcome::Failed) = removal::attempt(
            shared.remover.as_ref(),
            &shared.stats,
            &id,
            RemovalCause::Expiration,
        ) {
            debug!(id = ?id, "Expired entry left resident until its next trigger");
        }
    }
}
