//! PostgreSQL store tests.
//!
//! Require `TEST_DATABASE_URL`; skipped otherwise. Tests share one database
//! and serialize on a lock, truncating every table first.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use sqlx::PgPool;
use tenmo::{
    submit, Assert, ConsistencyMode, EventStatus, EventStore, GraphStore, LeaseReclaimer, Outcome,
    ReclaimerConfig, WakeSignal, Worker, WorkerConfig, LEASE_EXPIRED_ERROR,
};
use tenmo_postgres::{migrations, PgStore};
use tenmo_testing::{build_scenario, EventFactory};
use tokio::sync::{watch, Mutex, MutexGuard};

static DB_LOCK: Mutex<()> = Mutex::const_new(());

macro_rules! test_store {
    () => {
        match test_store().await {
            Some(ctx) => ctx,
            None => {
                eprintln!("Skipping test: TEST_DATABASE_URL not set");
                return;
            }
        }
    };
}

async fn test_store() -> Option<(Arc<PgStore>, MutexGuard<'static, ()>)> {
    let url = std::env::var("TEST_DATABASE_URL").ok()?;
    let guard = DB_LOCK.lock().await;

    let pool = PgPool::connect(&url).await.ok()?;
    migrations::run(&pool).await.ok()?;
    sqlx::query(
        r#"
        TRUNCATE events, processes, executions, entities, incarnations, operations,
                 interactions, messages, asserts, execution_summaries
        "#,
    )
    .execute(&pool)
    .await
    .ok()?;

    Some((Arc::new(PgStore::new(pool)), guard))
}

fn worker(store: &Arc<PgStore>, mode: ConsistencyMode) -> Worker<PgStore> {
    let config = WorkerConfig {
        mode,
        ..WorkerConfig::default()
    };
    Worker::new("pg-test", store.clone(), config, WakeSignal::new())
}

#[tokio::test]
async fn test_scenario_round_trip() {
    let (store, _guard) = test_store!();

    submit(store.as_ref(), build_scenario()).await.unwrap();
    let handled = worker(&store, ConsistencyMode::Strict).drain().await.unwrap();
    assert_eq!(handled, 8);

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.processed, 8);

    let u = store.load().await.unwrap();
    assert_eq!(u.executions.len(), 2);
    assert_eq!(u.operations.len(), 3);
    assert_eq!(u.incarnations["out@1"].parent_id.as_deref(), Some("src@1"));
    assert_eq!(u.incarnations["src@1"].creator_id.as_deref(), Some("build"));
    assert_eq!(u.entities["src"].incarnations, vec!["src@1".to_string()]);
    assert_eq!(u.interactions["rpc"].messages.len(), 1);
    assert!(u.executions["compile"].end_timestamp.is_some());

    store.refresh_summaries().await.unwrap();
    let summaries = store.summaries().await.unwrap();
    let compile = summaries
        .iter()
        .find(|s| s.execution_id == "compile")
        .unwrap();
    assert_eq!((compile.reads, compile.writes), (1, 1));
    assert_eq!(compile.duration_ms, Some(4));
}

#[tokio::test]
async fn test_append_rejects_duplicate_ids() {
    let (store, _guard) = test_store!();
    let event = EventFactory::default().begin("x");

    store.append(&event).await.unwrap();
    assert!(store.append(&event).await.is_err());

    let stored = store.get(event.id()).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Idle);
    assert_eq!(stored.attempts, 0);
    assert_eq!(stored.event, event);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_are_exclusive() {
    let (store, _guard) = test_store!();
    let mut f = EventFactory::default();
    let events: Vec<_> = (0..100).map(|i| f.begin(&format!("e{i}"))).collect();
    submit(store.as_ref(), events).await.unwrap();

    let claimers = (0..8).map(|_| {
        let store = store.clone();
        tokio::spawn(async move {
            let mut claimed = Vec::new();
            while let Some(c) = store.claim_one(50).await.unwrap() {
                claimed.push(c.id().clone());
            }
            claimed
        })
    });

    let mut seen = HashSet::new();
    for claimed in join_all(claimers).await {
        for id in claimed.unwrap() {
            assert!(seen.insert(id.clone()), "{id} claimed twice");
        }
    }
    assert_eq!(seen.len(), 100);
}

#[tokio::test]
async fn test_release_is_fenced_and_bounded() {
    let (store, _guard) = test_store!();
    let event = EventFactory::default().end("ghost");
    store.append(&event).await.unwrap();

    let first = store.claim_one(2).await.unwrap().unwrap();
    // A stale attempt count is ignored.
    let stale = store.release(event.id(), 7, 2, "stale").await.unwrap();
    assert_eq!(stale, None);

    let status = store.release(event.id(), first.attempts, 2, "boom").await.unwrap();
    assert_eq!(status, Some(EventStatus::Idle));

    let second = store.claim_one(2).await.unwrap().unwrap();
    assert_eq!(second.attempts, 2);
    let status = store.release(event.id(), 2, 2, "boom again").await.unwrap();
    assert_eq!(status, Some(EventStatus::Abandoned));

    assert!(store.claim_one(2).await.unwrap().is_none());
    let stored = store.get(event.id()).await.unwrap().unwrap();
    assert_eq!(stored.last_error.as_deref(), Some("boom again"));
    assert_eq!(store.stats().await.unwrap().abandoned, 1);
}

#[tokio::test]
async fn test_fresh_events_claimed_before_retries() {
    let (store, _guard) = test_store!();
    let mut f = EventFactory::default();
    let end = f.end("late");
    let begin = f.begin("late");
    submit(store.as_ref(), [end.clone(), begin.clone()]).await.unwrap();

    let outcome = worker(&store, ConsistencyMode::Lenient)
        .process_next()
        .await
        .unwrap();
    assert_eq!(outcome, Some(Outcome::Released));

    let next = store.claim_one(50).await.unwrap().unwrap();
    assert_eq!(next.id(), begin.id());
}

#[tokio::test]
async fn test_undecodable_payload_is_abandoned_at_claim() {
    let (store, _guard) = test_store!();
    sqlx::query(
        r#"
        INSERT INTO events (event_id, created_at, event_type, payload)
        VALUES ('bad', NOW(), 'Mystery', '{"event_type": "Mystery"}')
        "#,
    )
    .execute(store.pool())
    .await
    .unwrap();
    let good = EventFactory::default().begin("ok");
    store.append(&good).await.unwrap();

    let claimed = store.claim_one(50).await.unwrap().unwrap();
    assert_eq!(claimed.id(), good.id());

    let stats = store.stats().await.unwrap();
    assert_eq!(stats.abandoned, 1);
    assert_eq!(stats.claimed, 1);
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed() {
    let (store, _guard) = test_store!();
    let event = EventFactory::default().begin("slow");
    store.append(&event).await.unwrap();
    let crashed = store.claim_one(50).await.unwrap().unwrap();

    let reclaimer = LeaseReclaimer::new(
        store.clone(),
        ReclaimerConfig {
            lease_timeout: Duration::from_millis(50),
            ..ReclaimerConfig::default()
        },
    );
    assert_eq!(reclaimer.sweep().await.unwrap(), 0);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(reclaimer.sweep().await.unwrap(), 1);

    let live = worker(&store, ConsistencyMode::Lenient);
    assert_eq!(live.process_next().await.unwrap(), Some(Outcome::Processed));

    let result = live.run_materializer(&crashed).await;
    assert!(matches!(result, Ok(false)));
    let stored = store.get(event.id()).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Processed);
    assert_eq!(stored.attempts, 2);
}

#[tokio::test]
async fn test_merge_preserves_creator_regardless_of_order() {
    let (store, _guard) = test_store!();
    let mut f = EventFactory::default();
    let events = vec![
        f.begin("reader"),
        f.begin("writer"),
        f.read("reader", "cfg", "cfg@1"),
        f.write("writer", "cfg", "cfg@1", None),
        f.read("reader", "cfg", "cfg@1"),
    ];
    submit(store.as_ref(), events).await.unwrap();
    worker(&store, ConsistencyMode::Lenient)
        .drain()
        .await
        .unwrap();

    let u = store.load().await.unwrap();
    assert_eq!(u.incarnations["cfg@1"].creator_id.as_deref(), Some("writer"));
    assert_eq!(u.entities["cfg"].incarnations, vec!["cfg@1".to_string()]);
}

#[tokio::test]
async fn test_annotate_round_trip() {
    let (store, _guard) = test_store!();
    let assert = Assert {
        source: "a".into(),
        target: "b".into(),
        comment: "same output".into(),
    };
    assert!(store.annotate(&assert).await.unwrap());
    assert!(!store.annotate(&assert).await.unwrap());
    assert!(store.load().await.unwrap().asserts.contains(&assert));
}

#[tokio::test]
async fn test_listener_wakes_on_append() {
    let (store, _guard) = test_store!();
    let wake = WakeSignal::new();
    let (_shutdown_tx, shutdown_rx) = watch::channel(false);
    store.subscribe(wake.clone(), shutdown_rx).await.unwrap();

    store
        .append(&EventFactory::default().begin("notify"))
        .await
        .unwrap();
    assert!(wake.wait(Duration::from_secs(5)).await);
}

#[tokio::test]
async fn test_listener_stops_on_shutdown() {
    let (store, _guard) = test_store!();
    let wake = WakeSignal::new();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    store.subscribe(wake.clone(), shutdown_rx).await.unwrap();

    shutdown_tx.send(true).unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    store
        .append(&EventFactory::default().begin("after-shutdown"))
        .await
        .unwrap();
    assert!(!wake.wait(Duration::from_millis(500)).await);
}

#[tokio::test]
async fn test_expired_final_attempt_records_reason() {
    let (store, _guard) = test_store!();
    let event = EventFactory::default().begin("last");
    store.append(&event).await.unwrap();
    store.claim_one(1).await.unwrap().unwrap();

    tokio::time::sleep(Duration::from_millis(100)).await;
    let reclaimed = store
        .reclaim_expired(Duration::from_millis(50), 1)
        .await
        .unwrap();
    assert_eq!(reclaimed, 1);

    let stored = store.get(event.id()).await.unwrap().unwrap();
    assert_eq!(stored.status, EventStatus::Abandoned);
    assert_eq!(stored.last_error.as_deref(), Some(LEASE_EXPIRED_ERROR));
}
