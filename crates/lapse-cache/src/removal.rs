//! The removal protocol and the collaborators it drives.
//!
//! Both the expiration driver and the eviction queue hand candidate ids to a
//! [`Remover`]. The standard implementation, [`RemovalProtocol`], never blocks
//! on an entry that is in use, re-checks eligibility against the store's own
//! bookkeeping, and performs the removal inside a transactional [`Batch`] that
//! is closed exactly once on every exit path.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, error, trace, warn};

use crate::error::Result;
use crate::stats::StatsCounter;

/// Why a removal was attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemovalCause {
    /// The entry sat idle past its timeout.
    Expiration,
    /// The cache grew past its maximum size.
    Eviction,
}

impl fmt::Display for RemovalCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RemovalCause::Expiration => write!(f, "expiration"),
            RemovalCause::Eviction => write!(f, "eviction"),
        }
    }
}

/// Why a candidate was left alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SkipReason {
    /// Another caller holds the entry.
    Locked,
    /// The entry is no longer in the store.
    Absent,
    /// The entry was used after the deadline was computed.
    NotExpired,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::Locked => write!(f, "locked"),
            SkipReason::Absent => write!(f, "absent"),
            SkipReason::NotExpired => write!(f, "not expired"),
        }
    }
}

/// Result of a removal attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovalOutcome {
    /// The entry was removed and the listener notified.
    Removed,
    /// Nothing was removed; not an error.
    Skipped(SkipReason),
    /// Removal was attempted but the store reported failure.
    Failed,
}

/// Outcome of a non-blocking lookup.
#[derive(Debug)]
pub enum Acquire<E> {
    /// No such entry.
    Absent,
    /// The entry exists but is held by someone else.
    Locked,
    /// The entry, held exclusively until dropped.
    Acquired(E),
}

/// An entry obtained from an [`EntryStore`].
pub trait CachedEntry {
    /// Whether the entry has been idle for at least `timeout`, judged by its
    /// own last-access time.
    fn is_expired(&self, timeout: Duration) -> bool;
}

/// Keyed storage with try-lock semantics.
pub trait EntryStore<K>: Send + Sync {
    /// The handle returned by [`try_acquire`](Self::try_acquire).
    type Entry: CachedEntry;

    /// Look up and lock `id` without waiting.
    fn try_acquire(&self, id: &K) -> Acquire<Self::Entry>;

    /// Remove `id`. Returns `false` if the store could not remove it.
    fn remove(&self, id: &K) -> bool;
}

/// Target for capacity evictions (e.g. passivation to a backing store).
pub trait EvictionBackend<K>: Send + Sync {
    /// Evict `id`. Returns `false` if the backend could not evict it.
    fn evict(&self, id: &K) -> bool;
}

/// A transactional unit of work wrapping one removal.
pub trait Batch: Send {
    /// Commit the work.
    fn close(self);

    /// Roll the work back.
    fn discard(self);
}

/// Opens [`Batch`]es.
pub trait Batcher: Send + Sync {
    /// The batch type.
    type Batch: Batch;

    /// Begin a new batch.
    ///
    /// Failure here means the transactional substrate is unavailable and is
    /// propagated to the caller of the protocol.
    fn begin(&self) -> Result<Self::Batch>;
}

/// Notified after an entry has been removed.
pub trait RemovalListener<K>: Send + Sync {
    /// Called once per successful removal, inside the batch.
    fn on_removal(&self, id: &K, cause: RemovalCause);
}

impl<K, F> RemovalListener<K> for F
where
    F: Fn(&K, RemovalCause) + Send + Sync,
{
    fn on_removal(&self, id: &K, cause: RemovalCause) {
        self(id, cause)
    }
}

/// A listener that ignores every removal.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopListener;

impl<K> RemovalListener<K> for NoopListener {
    fn on_removal(&self, _id: &K, _cause: RemovalCause) {}
}

/// Attempts to remove a candidate id.
pub trait Remover<K>: Send + Sync {
    /// Try to remove `id` for `cause`.
    fn remove(&self, id: &K, cause: RemovalCause) -> Result<RemovalOutcome>;
}

/// Closes or discards its batch exactly once.
///
/// [`commit`](Self::commit) closes; dropping without committing discards,
/// which covers early returns and unwinding.
struct BatchGuard<B: Batch> {
    batch: Option<B>,
}

impl<B: Batch> BatchGuard<B> {
    fn new(batch: B) -> Self {
        Self { batch: Some(batch) }
    }

    fn commit(mut self) {
        if let Some(batch) = self.batch.take() {
            batch.close();
        }
    }
}

impl<B: Batch> Drop for BatchGuard<B> {
    fn drop(&mut self) {
        if let Some(batch) = self.batch.take() {
            batch.discard();
        }
    }
}

/// Lock, re-validate, and remove inside a batch.
pub struct RemovalProtocol<K, S, B> {
    store: Arc<S>,
    batcher: Arc<B>,
    backend: Option<Arc<dyn EvictionBackend<K>>>,
    listener: Arc<dyn RemovalListener<K>>,
    idle_timeout: Option<Duration>,
    _key: PhantomData<fn(&K)>,
}

impl<K, S, B> RemovalProtocol<K, S, B>
where
    K: fmt::Debug + 'static,
    S: EntryStore<K>,
    B: Batcher,
{
    /// Create a protocol over `store` and `batcher`.
    ///
    /// Without an idle timeout, expiration candidates are never eligible.
    /// Without an eviction backend, eviction removes from `store`.
    pub fn new(store: Arc<S>, batcher: Arc<B>) -> Self {
        Self {
            store,
            batcher,
            backend: None,
            listener: Arc::new(NoopListener),
            idle_timeout: None,
            _key: PhantomData,
        }
    }

    /// Set the idle timeout used to re-validate expiration candidates.
    pub fn with_idle_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Route evictions through `backend`.
    pub fn with_eviction_backend(mut self, backend: Arc<dyn EvictionBackend<K>>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Notify `listener` after each removal.
    pub fn with_listener(mut self, listener: Arc<dyn RemovalListener<K>>) -> Self {
        self.listener = listener;
        self
    }

    fn is_eligible(&self, entry: &S::Entry, cause: RemovalCause) -> bool {
        match cause {
            RemovalCause::Eviction => true,
            RemovalCause::Expiration => self
                .idle_timeout
                .is_some_and(|timeout| entry.is_expired(timeout)),
        }
    }

    fn perform(&self, id: &K, cause: RemovalCause) -> bool {
        match (cause, &self.backend) {
            (RemovalCause::Eviction, Some(backend)) => backend.evict(id),
            _ => self.store.remove(id),
        }
    }
}

impl<K, S, B> Remover<K> for RemovalProtocol<K, S, B>
where
    K: fmt::Debug + 'static,
    S: EntryStore<K>,
    B: Batcher,
{
    fn remove(&self, id: &K, cause: RemovalCause) -> Result<RemovalOutcome> {
        let entry = match self.store.try_acquire(id) {
            Acquire::Acquired(entry) => entry,
            Acquire::Locked => {
                debug!(id = ?id, cause = %cause, "Entry in use, skipping removal");
                return Ok(RemovalOutcome::Skipped(SkipReason::Locked));
            }
            Acquire::Absent => {
                trace!(id = ?id, cause = %cause, "Entry already gone");
                return Ok(RemovalOutcome::Skipped(SkipReason::Absent));
            }
        };

        if !self.is_eligible(&entry, cause) {
            debug!(id = ?id, cause = %cause, "Entry used since scheduling, skipping removal");
            return Ok(RemovalOutcome::Skipped(SkipReason::NotExpired));
        }

        let batch = BatchGuard::new(self.batcher.begin()?);

        if !self.perform(id, cause) {
            warn!(id = ?id, cause = %cause, "Removal failed, discarding batch");
            return Ok(RemovalOutcome::Failed);
        }

        self.listener.on_removal(id, cause);
        batch.commit();
        drop(entry);

        debug!(id = ?id, cause = %cause, "Entry removed");
        Ok(RemovalOutcome::Removed)
    }
}

/// Run `remover` for one candidate and count the outcome.
pub(crate) fn attempt<K: fmt::Debug>(
    remover: &dyn Remover<K>,
    stats: &StatsCounter,
    id: &K,
    cause: RemovalCause,
) -> Result<RemovalOutcome> {
    match remover.remove(id, cause) {
        Ok(outcome) => {
            stats.record(cause, outcome);
            Ok(outcome)
        }
        Err(e) => {
            error!(id = ?id, cause = %cause, error = %e, "Could not begin removal batch");
            stats.record_batch_error();
            Err(e)
        }
    }
}
