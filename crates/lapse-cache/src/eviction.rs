//! Capacity eviction in least-recently-used order.

use std::fmt;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::error::Result;
use crate::removal::{self, RemovalCause, RemovalOutcome, Remover};
use crate::stats::StatsCounter;

/// An eviction triggered by [`EvictionQueue::schedule`].
#[derive(Debug)]
pub struct Eviction<K> {
    /// The least recently used id, already dropped from the queue.
    pub victim: K,

    /// What the removal protocol did with it.
    pub outcome: Result<RemovalOutcome>,
}

/// Ids in access order, evicting the least recently used one whenever the
/// queue grows past its maximum size.
///
/// Eviction is demand driven: the caller of [`schedule`](Self::schedule)
/// that pushes the queue over capacity runs the removal itself, after the
/// queue lock is released.
///
/// Every mark stamps the id with a fresh generation, so cleanup that ran
/// concurrently with a later mark can tell it is stale.
pub struct EvictionQueue<K: Hash + Eq> {
    order: Mutex<Order<K>>,
    max_entries: NonZeroUsize,
    remover: Arc<dyn Remover<K>>,
    stats: Arc<StatsCounter>,
}

struct Order<K: Hash + Eq> {
    lru: LruCache<K, u64>,
    next_generation: u64,
}

impl<K> EvictionQueue<K>
where
    K: Hash + Eq + Clone + fmt::Debug,
{
    /// Create a queue holding at most `max_entries` ids.
    pub fn new(
        max_entries: NonZeroUsize,
        remover: Arc<dyn Remover<K>>,
        stats: Arc<StatsCounter>,
    ) -> Self {
        Self {
            order: Mutex::new(Order {
                lru: LruCache::unbounded(),
                next_generation: 0,
            }),
            max_entries,
            remover,
            stats,
        }
    }

    /// Mark `id` as most recently used.
    ///
    /// If that leaves the queue over capacity, the least recently used id is
    /// dropped from the queue and handed to the removal protocol. At most one
    /// id is evicted per call. The victim is dropped from the queue even if
    /// the protocol leaves the entry in place.
    pub fn schedule(&self, id: K) -> Option<Eviction<K>> {
        let (victim, ()) = self.admit(id, |_| ())?;
        Some(self.evict(victim))
    }

    /// Mark `id` as most recently used and pop the victim if that leaves
    /// the queue over capacity, without running the removal.
    ///
    /// `inspect` sees the victim while the queue lock is still held, so
    /// anything it reads happens before a later mark of the victim.
    pub fn admit<T>(&self, id: K, inspect: impl FnOnce(&K) -> T) -> Option<(K, T)> {
        let mut order = self.order.lock();
        let generation = order.next_generation;
        order.next_generation += 1;
        order.lru.put(id, generation);
        if order.lru.len() <= self.max_entries.get() {
            return None;
        }
        let (victim, _) = order.lru.pop_lru()?;
        let inspected = inspect(&victim);
        Some((victim, inspected))
    }

    /// Hand a victim popped by [`admit`](Self::admit) to the removal
    /// protocol.
    pub fn evict(&self, victim: K) -> Eviction<K> {
        debug!(id = ?victim, max_entries = self.max_entries.get(), "Evicting least recently used entry");
        let outcome = removal::attempt(
            self.remover.as_ref(),
            &self.stats,
            &victim,
            RemovalCause::Eviction,
        );
        Eviction { victim, outcome }
    }

    /// Drop `id` from the queue without evicting it.
    pub fn remove(&self, id: &K) -> bool {
        let removed = self.order.lock().lru.pop(id).is_some();
        if removed {
            trace!(id = ?id, "Dropped from eviction queue");
        }
        removed
    }

    /// Drop `id` only if it has not been marked again since `generation`
    /// was read with [`generation`](Self::generation).
    pub fn remove_if(&self, id: &K, generation: u64) -> bool {
        let mut order = self.order.lock();
        if order.lru.peek(id) != Some(&generation) {
            return false;
        }
        order.lru.pop(id);
        trace!(id = ?id, "Dropped from eviction queue");
        true
    }

    /// Stamp of the last mark of `id`, or `None` if it is not queued.
    pub fn generation(&self, id: &K) -> Option<u64> {
        self.order.lock().lru.peek(id).copied()
    }

    /// Whether `id` is queued.
    pub fn contains(&self, id: &K) -> bool {
        self.order.lock().lru.contains(id)
    }

    /// The id that would be evicted next, without touching the order.
    pub fn peek_lru(&self) -> Option<K> {
        self.order.lock().lru.peek_lru().map(|(id, _)| id.clone())
    }

    /// Queued ids from least to most recently used.
    pub fn ids(&self) -> Vec<K> {
        self.order.lock().lru.iter().rev().map(|(id, _)| id.clone()).collect()
    }

    /// Number of queued ids.
    pub fn len(&self) -> usize {
        self.order.lock().lru.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.order.lock().lru.is_empty()
    }

    /// The configured maximum size.
    pub fn max_entries(&self) -> usize {
        self.max_entries.get()
    }

    /// Drop every queued id.
    pub fn clear(&self) {
        self.order.lock().lru.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::removal::SkipReason;

    /// Records every candidate and answers with a fixed outcome.
    struct Recorder {
        seen: Mutex<Vec<(String, RemovalCause)>>,
        outcome: RemovalOutcome,
    }

    impl Recorder {
        fn new(outcome: RemovalOutcome) -> Arc<Self> {
            Arc::new(Self {
                seen: Mutex::new(Vec::new()),
                outcome,
            })
        }
    }

    impl Remover<String> for Recorder {
        fn remove(&self, id: &String, cause: RemovalCause) -> Result<RemovalOutcome> {
            self.seen.lock().push((id.clone(), cause));
            Ok(self.outcome)
        }
    }

    fn queue(max: usize, remover: Arc<dyn Remover<String>>) -> (EvictionQueue<String>, Arc<StatsCounter>) {
        let stats = Arc::new(StatsCounter::new());
        let queue = EvictionQueue::new(
            NonZeroUsize::new(max).unwrap(),
            remover,
            Arc::clone(&stats),
        );
        (queue, stats)
    }

    fn id(s: &str) -> String {
        s.to_string()
    }

    #[test]
    fn test_least_recently_marked_is_evicted() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, stats) = queue(1, recorder.clone());

        assert!(queue.schedule(id("a")).is_none());
        let eviction = queue.schedule(id("b")).unwrap();

        assert_eq!(eviction.victim, "a");
        assert!(matches!(eviction.outcome, Ok(RemovalOutcome::Removed)));
        assert_eq!(*recorder.seen.lock(), vec![(id("a"), RemovalCause::Eviction)]);
        assert_eq!(queue.ids(), vec!["b"]);
        assert_eq!(stats.snapshot(0, 0).evicted, 1);
    }

    #[test]
    fn test_access_moves_to_back() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(3, recorder.clone());

        for s in ["s1", "s2", "s3"] {
            queue.schedule(id(s));
        }
        assert_eq!(queue.peek_lru(), Some(id("s1")));

        // Touch s1 so s2 becomes the victim.
        queue.schedule(id("s1"));
        assert_eq!(queue.ids(), vec!["s2", "s3", "s1"]);

        let eviction = queue.schedule(id("s4")).unwrap();
        assert_eq!(eviction.victim, "s2");
        assert!(queue.contains(&id("s1")));
        assert!(!queue.contains(&id("s2")));
        assert_eq!(queue.len(), 3);
    }

    #[test]
    fn test_rescheduling_present_id_never_evicts() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(2, recorder.clone());

        queue.schedule(id("a"));
        queue.schedule(id("b"));
        for _ in 0..5 {
            assert!(queue.schedule(id("a")).is_none());
            assert!(queue.schedule(id("b")).is_none());
        }
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_locked_victim_still_leaves_queue() {
        let recorder = Recorder::new(RemovalOutcome::Skipped(SkipReason::Locked));
        let (queue, stats) = queue(1, recorder.clone());

        queue.schedule(id("busy"));
        let eviction = queue.schedule(id("next")).unwrap();

        assert_eq!(eviction.victim, "busy");
        assert!(matches!(
            eviction.outcome,
            Ok(RemovalOutcome::Skipped(SkipReason::Locked))
        ));
        assert!(!queue.contains(&id("busy")));
        assert_eq!(stats.snapshot(0, 0).skipped_locked, 1);
    }

    #[test]
    fn test_one_eviction_per_schedule() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(2, recorder.clone());

        for s in ["a", "b", "c", "d"] {
            queue.schedule(id(s));
        }

        let seen: Vec<String> = recorder.seen.lock().iter().map(|(id, _)| id.clone()).collect();
        assert_eq!(seen, vec!["a", "b"]);
        assert_eq!(queue.ids(), vec!["c", "d"]);
    }

    #[test]
    fn test_remove_drops_without_evicting() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(2, recorder.clone());

        queue.schedule(id("a"));
        queue.schedule(id("b"));
        assert!(queue.remove(&id("a")));
        assert!(!queue.remove(&id("a")));
        assert!(queue.schedule(id("c")).is_none());
        assert!(recorder.seen.lock().is_empty());
    }

    #[test]
    fn test_batch_error_is_reported() {
        struct Offline;
        impl Remover<String> for Offline {
            fn remove(&self, _id: &String, _cause: RemovalCause) -> Result<RemovalOutcome> {
                Err(Error::Batch("offline".to_string()))
            }
        }

        let (queue, stats) = queue(1, Arc::new(Offline));
        queue.schedule(id("a"));
        let eviction = queue.schedule(id("b")).unwrap();

        assert!(matches!(eviction.outcome, Err(Error::Batch(_))));
        assert_eq!(stats.snapshot(0, 0).batch_errors, 1);
        assert!(!queue.contains(&id("a")));
    }

    #[test]
    fn test_remove_if_spares_marked_again() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(4, recorder.clone());

        queue.schedule(id("a"));
        let stale = queue.generation(&id("a")).unwrap();
        queue.schedule(id("a"));

        assert!(!queue.remove_if(&id("a"), stale));
        assert!(queue.contains(&id("a")));

        let current = queue.generation(&id("a")).unwrap();
        assert!(queue.remove_if(&id("a"), current));
        assert!(!queue.contains(&id("a")));
        assert_eq!(queue.generation(&id("a")), None);
    }

    #[test]
    fn test_admit_inspects_victim_before_removal() {
        let recorder = Recorder::new(RemovalOutcome::Removed);
        let (queue, _) = queue(1, recorder.clone());

        assert!(queue.admit(id("a"), |_| ()).is_none());
        let (victim, seen) = queue.admit(id("b"), |victim| victim.clone()).unwrap();
        assert_eq!((victim.as_str(), seen.as_str()), ("a", "a"));
        // Nothing is removed until the victim is handed back.
        assert!(recorder.seen.lock().is_empty());

        let eviction = queue.evict(victim);
        assert!(matches!(eviction.outcome, Ok(RemovalOutcome::Removed)));
        assert_eq!(*recorder.seen.lock(), vec![(id("a"), RemovalCause::Eviction)]);
    }
}
