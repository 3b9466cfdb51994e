//! End-to-end scheduling over the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use lapse_cache::{
    MemoryBatcher, MemoryStore, RemovalCause, RemovalOutcome, RemovalProtocol, Scheduler,
    SchedulerConfig, SkipReason,
};
use parking_lot::Mutex;
use tokio::time::sleep;

type Removals = Arc<Mutex<Vec<(String, RemovalCause)>>>;

struct Harness {
    store: Arc<MemoryStore<String>>,
    batcher: Arc<MemoryBatcher>,
    removals: Removals,
    scheduler: Scheduler<String>,
}

impl Harness {
    fn start(config: SchedulerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let batcher = Arc::new(MemoryBatcher::new());
        let removals: Removals = Arc::new(Mutex::new(Vec::new()));

        let seen = Arc::clone(&removals);
        let protocol = RemovalProtocol::<String, _, _>::new(store.clone(), batcher.clone())
            .with_idle_timeout(config.idle_timeout)
            .with_eviction_backend(store.clone())
            .with_listener(Arc::new(move |id: &String, cause: RemovalCause| {
                seen.lock().push((id.clone(), cause));
            }));

        let scheduler = Scheduler::<String>::start(config, Arc::new(protocol)).unwrap();
        Self {
            store,
            batcher,
            removals,
            scheduler,
        }
    }

    /// Touch the store before the scheduler so the entry's own idle time
    /// never lags the scheduled deadline.
    fn access(&self, id: &str) -> Option<lapse_cache::Eviction<String>> {
        self.store.touch(id.to_string());
        self.scheduler.on_access(id.to_string())
    }

    fn removed(&self) -> Vec<(String, RemovalCause)> {
        self.removals.lock().clone()
    }
}

#[tokio::test]
async fn test_idle_entries_expire() {
    let harness = Harness::start(
        SchedulerConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .unbounded(),
    );

    harness.access("a");
    harness.access("b");
    sleep(Duration::from_millis(150)).await;

    assert!(harness.store.is_empty());
    let mut removed = harness.removed();
    removed.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        removed,
        vec![
            ("a".to_string(), RemovalCause::Expiration),
            ("b".to_string(), RemovalCause::Expiration),
        ]
    );
    assert_eq!(harness.batcher.closed(), 2);
    assert_eq!(harness.batcher.discarded(), 0);

    let stats = harness.scheduler.stats();
    assert_eq!(stats.expired, 2);
    assert_eq!(stats.tracked, 0);
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_frequent_access_keeps_entry_alive() {
    let harness = Harness::start(
        SchedulerConfig::new()
            .with_idle_timeout(Duration::from_millis(80))
            .unbounded(),
    );

    for _ in 0..6 {
        harness.access("hot");
        sleep(Duration::from_millis(20)).await;
    }
    assert!(harness.store.contains(&"hot".to_string()));
    assert!(harness.removed().is_empty());

    sleep(Duration::from_millis(250)).await;
    assert!(!harness.store.contains(&"hot".to_string()));
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_entry_in_use_is_skipped() {
    let harness = Harness::start(
        SchedulerConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .unbounded(),
    );

    harness.access("busy");
    assert!(harness.store.check_out("busy".to_string()));
    sleep(Duration::from_millis(120)).await;

    assert!(harness.store.contains(&"busy".to_string()));
    assert_eq!(harness.scheduler.stats().skipped_locked, 1);
    assert_eq!(harness.batcher.begun(), 0);

    // Released and touched again, it expires on the next countdown.
    harness.store.release(&"busy".to_string());
    harness.access("busy");
    sleep(Duration::from_millis(120)).await;
    assert!(!harness.store.contains(&"busy".to_string()));
    assert_eq!(harness.scheduler.stats().expired, 1);
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_capacity_eviction_passivates_lru() {
    let harness = Harness::start(SchedulerConfig::new().immortal().with_max_entries(2));

    harness.access("a");
    harness.access("b");
    harness.access("a");
    let eviction = harness.access("c").unwrap();

    assert_eq!(eviction.victim, "b");
    assert_eq!(eviction.outcome.unwrap(), RemovalOutcome::Removed);
    assert_eq!(harness.store.passivated(), vec!["b"]);
    assert_eq!(
        harness.removed(),
        vec![("b".to_string(), RemovalCause::Eviction)]
    );
    assert!(harness.store.contains(&"a".to_string()));
    assert!(harness.store.contains(&"c".to_string()));
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_eviction_of_checked_out_entry_is_skipped() {
    let harness = Harness::start(SchedulerConfig::new().immortal().with_max_entries(1));

    harness.access("busy");
    assert!(harness.store.check_out("busy".to_string()));
    let eviction = harness.access("next").unwrap();

    assert_eq!(
        eviction.outcome.unwrap(),
        RemovalOutcome::Skipped(SkipReason::Locked)
    );
    assert!(harness.store.contains(&"busy".to_string()));
    assert!(harness.store.passivated().is_empty());
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_unavailable_batcher_leaves_entry() {
    let harness = Harness::start(
        SchedulerConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .unbounded(),
    );
    harness.batcher.set_unavailable(true);

    harness.access("a");
    sleep(Duration::from_millis(120)).await;

    assert!(harness.store.contains(&"a".to_string()));
    assert!(harness.removed().is_empty());
    assert_eq!(harness.scheduler.stats().batch_errors, 1);
    assert!(!harness.store.is_in_use(&"a".to_string()));
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_immortal_entries_stay() {
    let harness = Harness::start(SchedulerConfig::new().immortal().unbounded());

    harness.access("a");
    sleep(Duration::from_millis(60)).await;

    assert!(harness.store.contains(&"a".to_string()));
    assert_eq!(harness.scheduler.stats().tracked, 0);
    harness.scheduler.shutdown().await;
}

#[tokio::test]
async fn test_application_removal_cancels_scheduling() {
    let harness = Harness::start(
        SchedulerConfig::new()
            .with_idle_timeout(Duration::from_millis(30))
            .with_max_entries(10),
    );

    harness.access("a");
    harness.store.discard(&"a".to_string());
    harness.scheduler.on_remove(&"a".to_string());
    assert!(!harness.scheduler.is_scheduled(&"a".to_string()));

    sleep(Duration::from_millis(100)).await;
    assert!(harness.removed().is_empty());
    assert_eq!(harness.scheduler.stats().skipped_absent, 0);
    harness.scheduler.shutdown().await;
}
