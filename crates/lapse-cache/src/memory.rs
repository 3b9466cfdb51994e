//! In-memory store and batcher.
//!
//! Enough of a cache to drive a [`RemovalProtocol`](crate::RemovalProtocol)
//! end to end: entries carry a last-access time and an in-use flag, and
//! evictions are recorded as passivated rather than dropped.

use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::trace;

use crate::clock::{Clock, SystemClock};
use crate::error::{Error, Result};
use crate::removal::{Acquire, Batch, Batcher, CachedEntry, EntryStore, EvictionBackend};

#[derive(Debug, Clone, Copy)]
struct Slot {
    last_accessed: Instant,
    in_use: bool,
    /// Distinguishes a re-created slot from the one a handle was taken on.
    generation: u64,
}

type Slots<K> = Arc<Mutex<HashMap<K, Slot>>>;

/// A keyed map of entries with try-lock semantics.
pub struct MemoryStore<K> {
    slots: Slots<K>,
    passivated: Mutex<Vec<K>>,
    next_generation: AtomicU64,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq + Clone + Send + 'static> MemoryStore<K> {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that timestamps accesses with `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            slots: Arc::new(Mutex::new(HashMap::new())),
            passivated: Mutex::new(Vec::new()),
            next_generation: AtomicU64::new(0),
            clock,
        }
    }

    fn fresh_slot(&self, now: Instant) -> Slot {
        Slot {
            last_accessed: now,
            in_use: false,
            generation: self.next_generation.fetch_add(1, Ordering::Relaxed),
        }
    }

    /// Insert `id` or refresh its last-access time.
    pub fn touch(&self, id: K) {
        let now = self.clock.now();
        self.slots
            .lock()
            .entry(id)
            .and_modify(|slot| slot.last_accessed = now)
            .or_insert_with(|| self.fresh_slot(now));
    }

    /// Touch `id` and mark it in use. Returns `false` if it already was.
    pub fn check_out(&self, id: K) -> bool {
        let now = self.clock.now();
        let mut slots = self.slots.lock();
        let slot = slots.entry(id).or_insert_with(|| self.fresh_slot(now));
        if slot.in_use {
            return false;
        }
        slot.last_accessed = now;
        slot.in_use = true;
        true
    }

    /// Clear the in-use mark on `id`.
    pub fn release(&self, id: &K) {
        if let Some(slot) = self.slots.lock().get_mut(id) {
            slot.in_use = false;
        }
    }

    /// Drop `id` on behalf of the application.
    pub fn discard(&self, id: &K) -> bool {
        self.slots.lock().remove(id).is_some()
    }

    pub fn contains(&self, id: &K) -> bool {
        self.slots.lock().contains_key(id)
    }

    pub fn is_in_use(&self, id: &K) -> bool {
        self.slots.lock().get(id).is_some_and(|slot| slot.in_use)
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.lock().is_empty()
    }

    /// Ids evicted to the passivation list, oldest first.
    pub fn passivated(&self) -> Vec<K> {
        self.passivated.lock().clone()
    }
}

impl<K: Hash + Eq + Clone + Send + 'static> Default for MemoryStore<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// An entry held exclusively until dropped.
pub struct MemoryEntry<K: Hash + Eq> {
    id: K,
    generation: u64,
    last_accessed: Instant,
    slots: Slots<K>,
    clock: Arc<dyn Clock>,
}

impl<K: Hash + Eq> MemoryEntry<K> {
    pub fn id(&self) -> &K {
        &self.id
    }

    pub fn last_accessed(&self) -> Instant {
        self.last_accessed
    }
}

impl<K: Hash + Eq> CachedEntry for MemoryEntry<K> {
    fn is_expired(&self, timeout: Duration) -> bool {
        self.clock.now().saturating_duration_since(self.last_accessed) >= timeout
    }
}

impl<K: Hash + Eq> Drop for MemoryEntry<K> {
    fn drop(&mut self) {
        // The slot may have been removed, or removed and re-created, while
        // held. Only the slot this handle locked is released.
        if let Some(slot) = self.slots.lock().get_mut(&self.id)
            && slot.generation == self.generation
        {
            slot.in_use = false;
        }
    }
}

impl<K> EntryStore<K> for MemoryStore<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    type Entry = MemoryEntry<K>;

    fn try_acquire(&self, id: &K) -> Acquire<MemoryEntry<K>> {
        let mut slots = self.slots.lock();
        let Some(slot) = slots.get_mut(id) else {
            return Acquire::Absent;
        };
        if slot.in_use {
            return Acquire::Locked;
        }
        slot.in_use = true;

        Acquire::Acquired(MemoryEntry {
            id: id.clone(),
            generation: slot.generation,
            last_accessed: slot.last_accessed,
            slots: Arc::clone(&self.slots),
            clock: Arc::clone(&self.clock),
        })
    }

    fn remove(&self, id: &K) -> bool {
        self.slots.lock().remove(id).is_some()
    }
}

impl<K> EvictionBackend<K> for MemoryStore<K>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
{
    fn evict(&self, id: &K) -> bool {
        if self.slots.lock().remove(id).is_none() {
            return false;
        }
        self.passivated.lock().push(id.clone());
        true
    }
}

#[derive(Debug, Default)]
struct BatchCounts {
    begun: AtomicU64,
    closed: AtomicU64,
    discarded: AtomicU64,
}

/// Counts batches instead of running transactions.
#[derive(Debug, Default)]
pub struct MemoryBatcher {
    counts: Arc<BatchCounts>,
    unavailable: AtomicBool,
}

impl MemoryBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make [`begin`](Batcher::begin) fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::Release);
    }

    pub fn begun(&self) -> u64 {
        self.counts.begun.load(Ordering::Acquire)
    }

    pub fn closed(&self) -> u64 {
        self.counts.closed.load(Ordering::Acquire)
    }

    pub fn discarded(&self) -> u64 {
        self.counts.discarded.load(Ordering::Acquire)
    }
}

impl Batcher for MemoryBatcher {
    type Batch = MemoryBatch;

    fn begin(&self) -> Result<MemoryBatch> {
        if self.unavailable.load(Ordering::Acquire) {
            return Err(Error::Batch("batcher unavailable".to_string()));
        }
        self.counts.begun.fetch_add(1, Ordering::AcqRel);
        trace!("Batch begun");
        Ok(MemoryBatch {
            counts: Arc::clone(&self.counts),
        })
    }
}

/// A batch opened by [`MemoryBatcher`].
#[derive(Debug)]
pub struct MemoryBatch {
    counts: Arc<BatchCounts>,
}

impl Batch for MemoryBatch {
    fn close(self) {
        self.counts.closed.fetch_add(1, Ordering::AcqRel);
    }

    fn discard(self) {
        self.counts.discarded.fetch_add(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::removal::{RemovalCause, RemovalOutcome, RemovalProtocol, Remover, SkipReason};

    fn id(s: &str) -> String {
        s.to_string()
    }

    fn fixture() -> (Arc<ManualClock>, Arc<MemoryStore<String>>, Arc<MemoryBatcher>) {
        let clock = Arc::new(ManualClock::new());
        let store = Arc::new(MemoryStore::with_clock(clock.clone()));
        (clock, store, Arc::new(MemoryBatcher::new()))
    }

    #[test]
    fn test_acquire_marks_in_use_until_dropped() {
        let (_, store, _) = fixture();
        store.touch(id("a"));

        let Acquire::Acquired(entry) = store.try_acquire(&id("a")) else {
            panic!("entry should be free");
        };
        assert_eq!(entry.id(), "a");
        assert!(matches!(store.try_acquire(&id("a")), Acquire::Locked));

        drop(entry);
        assert!(!store.is_in_use(&id("a")));
        assert!(matches!(store.try_acquire(&id("b")), Acquire::Absent));
    }

    #[test]
    fn test_stale_handle_leaves_recreated_slot_locked() {
        let (_, store, _) = fixture();
        store.touch(id("a"));
        let Acquire::Acquired(stale) = store.try_acquire(&id("a")) else {
            panic!("entry should be free");
        };

        // Removed and re-created under the same id while the handle is held.
        assert!(store.discard(&id("a")));
        assert!(store.check_out(id("a")));

        drop(stale);
        assert!(store.is_in_use(&id("a")));
        assert!(matches!(store.try_acquire(&id("a")), Acquire::Locked));

        store.release(&id("a"));
        assert!(!store.is_in_use(&id("a")));
    }

    #[test]
    fn test_checked_out_entry_is_locked() {
        let (_, store, _) = fixture();
        assert!(store.check_out(id("a")));
        assert!(!store.check_out(id("a")));
        assert!(matches!(store.try_acquire(&id("a")), Acquire::Locked));

        store.release(&id("a"));
        assert!(matches!(store.try_acquire(&id("a")), Acquire::Acquired(_)));
    }

    #[test]
    fn test_expiry_follows_last_access() {
        let (clock, store, _) = fixture();
        store.touch(id("a"));
        clock.advance(Duration::from_secs(5));

        let Acquire::Acquired(entry) = store.try_acquire(&id("a")) else {
            panic!("entry should be free");
        };
        assert!(entry.is_expired(Duration::from_secs(5)));
        assert!(!entry.is_expired(Duration::from_secs(6)));
        drop(entry);

        store.touch(id("a"));
        let Acquire::Acquired(entry) = store.try_acquire(&id("a")) else {
            panic!("entry should be free");
        };
        assert!(!entry.is_expired(Duration::from_secs(5)));
    }

    #[test]
    fn test_evict_passivates() {
        let (_, store, _) = fixture();
        store.touch(id("a"));

        assert!(store.evict(&id("a")));
        assert!(!store.evict(&id("a")));
        assert!(!store.contains(&id("a")));
        assert_eq!(store.passivated(), vec!["a"]);
    }

    #[test]
    fn test_batcher_counts() {
        let batcher = MemoryBatcher::new();
        batcher.begin().unwrap().close();
        batcher.begin().unwrap().discard();

        batcher.set_unavailable(true);
        assert!(matches!(batcher.begin(), Err(Error::Batch(_))));
        batcher.set_unavailable(false);

        assert_eq!(batcher.begun(), 2);
        assert_eq!(batcher.closed(), 1);
        assert_eq!(batcher.discarded(), 1);
    }

    #[test]
    fn test_protocol_over_memory_store() {
        let (clock, store, batcher) = fixture();
        let protocol = RemovalProtocol::<String, _, _>::new(store.clone(), batcher.clone())
            .with_idle_timeout(Some(Duration::from_secs(10)))
            .with_eviction_backend(store.clone());

        store.touch(id("idle"));
        store.touch(id("busy"));
        store.touch(id("fresh"));
        clock.advance(Duration::from_secs(10));
        store.touch(id("fresh"));
        assert!(store.check_out(id("busy")));

        assert_eq!(
            protocol.remove(&id("idle"), RemovalCause::Expiration).unwrap(),
            RemovalOutcome::Removed
        );
        assert_eq!(
            protocol.remove(&id("busy"), RemovalCause::Expiration).unwrap(),
            RemovalOutcome::Skipped(SkipReason::Locked)
        );
        assert_eq!(
            protocol.remove(&id("fresh"), RemovalCause::Expiration).unwrap(),
            RemovalOutcome::Skipped(SkipReason::NotExpired)
        );
        assert_eq!(
            protocol.remove(&id("fresh"), RemovalCause::Eviction).unwrap(),
            RemovalOutcome::Removed
        );

        assert!(!store.contains(&id("idle")));
        assert!(store.contains(&id("busy")));
        assert_eq!(store.passivated(), vec!["fresh"]);
        assert!(store.is_in_use(&id("busy")));
        assert!(!store.is_in_use(&id("fresh")));
        assert_eq!(batcher.begun(), 2);
        assert_eq!(batcher.closed(), 2);
        assert_eq!(batcher.discarded(), 0);
    }
}
