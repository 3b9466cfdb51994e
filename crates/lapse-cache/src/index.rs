//! Deadline index for idle-timeout expiration.
//!
//! [`ExpirationIndex`] maps tracked ids to absolute deadlines. Lookup by id is
//! a hash map; ordering by deadline is a B-tree holding only ids with an
//! active deadline, so suspended ids stay tracked without being poppable.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::clock::{Clock, SystemClock, deadline_after};

/// Timing state of a tracked id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Timing {
    /// Tracked, but excluded from deadline ordering.
    Suspended,
    /// Eligible to pop once `deadline` has passed. `sequence` orders ties.
    Scheduled { deadline: Instant, sequence: u64 },
}

#[derive(Debug)]
struct Tracked {
    /// Duration of the most recent `track` call.
    duration: Duration,
    /// Sequence of the most recent `track` call; survives suspension.
    generation: u64,
    timing: Timing,
}

/// Ordered index of expiration deadlines.
///
/// Not synchronized; callers guard it with a single lock so that every
/// compound operation is atomic.
pub struct ExpirationIndex<K> {
    entries: HashMap<K, Tracked>,
    order: BTreeMap<(Instant, u64), K>,
    next_sequence: u64,
    clock: Arc<dyn Clock>,
}

impl<K> ExpirationIndex<K>
where
    K: Hash + Eq + Clone,
{
    /// Create an empty index backed by the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create an empty index backed by `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: HashMap::new(),
            order: BTreeMap::new(),
            next_sequence: 0,
            clock,
        }
    }

    /// Track `id` to expire `duration` from now.
    ///
    /// A present id is moved to its new position rather than duplicated; a
    /// suspended id is restored. Returns the new deadline.
    pub fn track(&mut self, id: K, duration: Duration) -> Instant {
        let deadline = deadline_after(self.clock.now(), duration);
        let sequence = self.next_sequence;
        self.next_sequence += 1;
        let timing = Timing::Scheduled { deadline, sequence };

        match self.entries.get_mut(&id) {
            Some(tracked) => {
                if let Timing::Scheduled { deadline, sequence } = tracked.timing {
                    self.order.remove(&(deadline, sequence));
                }
                tracked.duration = duration;
                tracked.generation = sequence;
                tracked.timing = timing;
            }
            None => {
                self.entries.insert(
                    id.clone(),
                    Tracked {
                        duration,
                        generation: sequence,
                        timing,
                    },
                );
            }
        }
        self.order.insert((deadline, sequence), id);

        trace!(tracked = self.entries.len(), "Expiration tracked");
        deadline
    }

    /// Re-track a present id with the duration it was last tracked with.
    ///
    /// Returns the new deadline, or `None` if the id is not tracked.
    pub fn retry_expiration(&mut self, id: &K) -> Option<Instant> {
        let duration = self.entries.get(id)?.duration;
        Some(self.track(id.clone(), duration))
    }

    /// Remove `id` from deadline ordering while keeping it tracked.
    pub fn suspend(&mut self, id: &K) {
        if let Some(tracked) = self.entries.get_mut(id)
            && let Timing::Scheduled { deadline, sequence } = tracked.timing
        {
            self.order.remove(&(deadline, sequence));
            tracked.timing = Timing::Suspended;
        }
    }

    /// Stop tracking `id`, whatever its state.
    pub fn forget(&mut self, id: &K) {
        if let Some(tracked) = self.entries.remove(id)
            && let Timing::Scheduled { deadline, sequence } = tracked.timing
        {
            self.order.remove(&(deadline, sequence));
        }
    }

    /// Stop tracking `id` only if it has not been tracked again since
    /// `generation` was read. Returns whether it was forgotten.
    pub fn forget_if(&mut self, id: &K, generation: u64) -> bool {
        if self.generation(id) != Some(generation) {
            return false;
        }
        self.forget(id);
        true
    }

    /// Stamp of the last `track` call for `id`, or `None` if untracked.
    pub fn generation(&self, id: &K) -> Option<u64> {
        self.entries.get(id).map(|t| t.generation)
    }

    /// Remove and return the id with the earliest deadline at or before
    /// `as_of`, ties going to whichever was tracked first.
    pub fn pop_expired(&mut self, as_of: Instant) -> Option<K> {
        let (&(deadline, _), _) = self.order.first_key_value()?;
        if deadline > as_of {
            return None;
        }
        let (_, id) = self.order.pop_first()?;
        self.entries.remove(&id);
        Some(id)
    }

    /// Pop every id due at or before `as_of`, in deadline order.
    pub fn drain_expired(&mut self, as_of: Instant) -> Vec<K> {
        let mut expired = Vec::new();
        while let Some(id) = self.pop_expired(as_of) {
            expired.push(id);
        }
        expired
    }

    /// The earliest active deadline, if any id has one.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.order.first_key_value().map(|(&(deadline, _), _)| deadline)
    }

    /// The active deadline of `id`, or `None` if absent or suspended.
    pub fn deadline(&self, id: &K) -> Option<Instant> {
        match self.entries.get(id)?.timing {
            Timing::Scheduled { deadline, .. } => Some(deadline),
            Timing::Suspended => None,
        }
    }

    /// Every tracked id, suspended ones included.
    pub fn tracked_ids(&self) -> HashSet<K> {
        self.entries.keys().cloned().collect()
    }

    /// Whether `id` is tracked.
    pub fn contains(&self, id: &K) -> bool {
        self.entries.contains_key(id)
    }

    /// Whether `id` is tracked but suspended.
    pub fn is_suspended(&self, id: &K) -> bool {
        matches!(
            self.entries.get(id).map(|t| t.timing),
            Some(Timing::Suspended)
        )
    }

    /// Number of tracked ids.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether nothing is tracked.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Forget everything.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.order.clear();
    }

    /// Panic unless the ordering holds exactly the scheduled entries.
    #[cfg(test)]
    pub(crate) fn assert_consistent(&self)
    where
        K: std::fmt::Debug,
    {
        let scheduled = self
            .entries
            .values()
            .filter(|t| matches!(t.timing, Timing::Scheduled { .. }))
            .count();
        assert_eq!(self.order.len(), scheduled, "ordering out of step with entries");
        for (&(deadline, sequence), id) in &self.order {
            let tracked = self.entries.get(id);
            assert_eq!(
                tracked.map(|t| t.timing),
                Some(Timing::Scheduled { deadline, sequence }),
                "stale ordering slot for {id:?}"
            );
        }
    }
}

impl<K> Default for ExpirationIndex<K>
where
    K: Hash + Eq + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}
