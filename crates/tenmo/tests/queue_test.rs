//! Queue behaviour under concurrency, reordering and crashed workers.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tenmo::{
    submit, Event, EventId, EventStatus, EventStore, GraphStore, LeaseReclaimer, MemoryStore,
    Outcome, ReclaimerConfig, Universe, WakeSignal, Worker, WorkerConfig,
};
use tenmo_testing::{build_scenario, EventFactory};

/// Give every event a new id in its current position, keeping the derived
/// operation and message ids stable.
fn renumber(events: &mut [Event]) {
    for (i, event) in events.iter_mut().enumerate() {
        let fresh = EventId::new(format!("shuffled-{i:04}"));
        match event {
            Event::ExecutionBegins(e) => e.event_id = fresh,
            Event::ExecutionEnds(e) => e.event_id = fresh,
            Event::Operation(e) => {
                if e.operation_id.is_none() {
                    e.operation_id = Some(e.event_id.to_string());
                }
                e.event_id = fresh;
            }
            Event::Message(e) => {
                if e.message_id.is_none() {
                    e.message_id = Some(e.event_id.to_string());
                }
                e.event_id = fresh;
            }
        }
    }
}

fn worker(store: &Arc<MemoryStore>, name: &str) -> Worker<MemoryStore> {
    Worker::new(name, store.clone(), WorkerConfig::default(), WakeSignal::new())
}

async fn drained(events: Vec<Event>) -> (Arc<MemoryStore>, Universe) {
    let store = Arc::new(MemoryStore::new());
    submit(store.as_ref(), events).await.unwrap();
    worker(&store, "w").drain().await.unwrap();
    let universe = store.load().await.unwrap();
    (store, universe)
}

fn many_executions(count: usize) -> Vec<Event> {
    let mut f = EventFactory::default();
    let mut events = Vec::new();
    for i in 0..count {
        let exec = format!("exec-{i}");
        let entity = format!("file-{i}");
        let incarnation = format!("{entity}@1");
        events.push(f.begin(&exec));
        events.push(f.write(&exec, &entity, &incarnation, None));
        events.push(f.read(&exec, &entity, &incarnation));
        events.push(f.message(&format!("bus-{i}"), &exec, "sink", "done"));
        events.push(f.end(&exec));
    }
    events
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claimers_never_share_an_event() {
    let store = Arc::new(MemoryStore::new());
    let mut f = EventFactory::default();
    let events: Vec<Event> = (0..200).map(|i| f.begin(&format!("e{i}"))).collect();
    submit(store.as_ref(), events).await.unwrap();

    let claimers = (0..16).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(c) = store.claim_one(50).await.unwrap() {
                claimed.push(c.id().clone());
                tokio::task::yield_now().await;
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    let mut total = 0;
    for claimed in join_all(claimers).await {
        for id in claimed.unwrap() {
            total += 1;
            assert!(seen.insert(id.clone()), "{id} claimed twice");
        }
    }
    assert_eq!(total, 200);
    assert_eq!(store.stats().await.unwrap().claimed, 200);
}

#[tokio::test]
async fn test_shuffled_delivery_converges() {
    let mut reference_events = build_scenario();
    renumber(&mut reference_events);
    let (_, reference) = drained(reference_events).await;

    for seed in 0..25 {
        let mut rng = fastrand::Rng::with_seed(seed);
        let mut events = build_scenario();
        // Keep derived ids from the original numbering before shuffling.
        for event in events.iter_mut() {
            match event {
                Event::Operation(e) => e.operation_id = Some(e.event_id.to_string()),
                Event::Message(e) => e.message_id = Some(e.event_id.to_string()),
                _ => {}
            }
        }
        rng.shuffle(&mut events);
        renumber(&mut events);

        let (store, universe) = drained(events).await;
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.processed, 8, "seed {seed}: {stats:?}");
        assert_eq!(stats.abandoned, 0, "seed {seed}");
        assert_eq!(universe, reference, "seed {seed}");
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_workers_match_serial_result() {
    let (_, serial) = drained(many_executions(40)).await;

    let store = Arc::new(MemoryStore::new());
    submit(store.as_ref(), many_executions(40)).await.unwrap();

    let workers = (0..4).map(|i| {
        let w = worker(&store, &format!("w{i}"));
        tokio::spawn(async move { w.drain().await })
    });
    for handled in join_all(workers).await {
        handled.unwrap().unwrap();
    }
    // Anything released after its worker stopped looking.
    worker(&store, "sweeper").drain().await.unwrap();

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processed, 200);
    assert_eq!(store.load().await.unwrap(), serial);
}

#[tokio::test]
async fn test_lease_recovery_after_worker_crash() {
    let store = Arc::new(MemoryStore::new());
    let mut f = EventFactory::default();
    let begin = f.begin("job");
    let id = begin.id().clone();
    submit(store.as_ref(), [begin]).await.unwrap();

    // A worker claims and dies without finalizing.
    let crashed = store.claim_one(50).await.unwrap().unwrap();
    assert_eq!(crashed.attempts, 1);
    assert!(worker(&store, "live").claim_one().await.unwrap().is_none());

    tokio::time::sleep(Duration::from_millis(30)).await;
    let reclaimer = LeaseReclaimer::new(
        store.clone(),
        ReclaimerConfig {
            lease_timeout: Duration::from_millis(10),
            ..ReclaimerConfig::default()
        },
    );
    assert_eq!(reclaimer.sweep().await.unwrap(), 1);

    // The crashed worker comes back and tries to finish its stale claim.
    let stale = worker(&store, "zombie");
    let result = stale.run_materializer(&crashed).await;
    assert!(matches!(result, Ok(false)));
    assert_eq!(
        stale.finalize(&crashed, &result).await.unwrap(),
        Outcome::LeaseLost
    );
    // Its graph effects were discarded with the lost lease.
    assert!(store.load().await.unwrap().executions.is_empty());
    assert_eq!(
        store.get(&id).await.unwrap().unwrap().status,
        EventStatus::Idle
    );

    let live = worker(&store, "live");
    assert_eq!(live.process_next().await.unwrap(), Some(Outcome::Processed));

    let stored = store.get(&id).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(stored.attempts, 2);
    assert_eq!(store.load().await.unwrap().executions.len(), 1);
}
