use std::sync::Arc;
use std::time::Duration;

use bkc_db::{Genesis, LedgerStore, MemoryLedgerStore, TapEvent};
use bkc_econ::{TapParams, TapReason};
use bkc_tap::{
    spawn_stream_worker, DistributedEngine, MemorySharedStore, SharedError, SharedStore,
    StreamSettings, StreamWorker, TapEngine, TapError,
};
use chrono::{DateTime, TimeZone, Utc};

fn genesis() -> Genesis {
    Genesis {
        total_supply: 1_000_000,
        admin_id: 1,
        admin_allocation_pct: 10,
        start_rate: 100,
        min_rate: 10,
        admin_energy_max: 1000.0,
    }
}

fn params() -> TapParams {
    TapParams {
        energy_max: 1000.0,
        energy_regen_per_sec: 1.0,
        daily_limit: 0,
        max_per_request: 100,
    }
}

fn settings(consumer: &str) -> StreamSettings {
    StreamSettings {
        key_prefix: "bkc".to_string(),
        stream_key: "bkc:tap_events".to_string(),
        group: "bkc-ledger".to_string(),
        consumer: consumer.to_string(),
        batch: 4,
        claim_idle: Duration::from_secs(30),
        tx_attempts: 8,
    }
}

fn at(s: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 7, 1, 10, 0, 0).unwrap() + chrono::Duration::seconds(s)
}

/// One node: an engine plus its worker over shared substrates.
async fn node(
    store: &Arc<MemoryLedgerStore>,
    shared: &Arc<MemorySharedStore>,
    consumer: &str,
) -> Arc<DistributedEngine> {
    let worker = Arc::new(StreamWorker::new(store.clone(), shared.clone(), settings(consumer)));
    worker.ensure_group().await.unwrap();
    Arc::new(DistributedEngine::new(store.clone(), shared.clone(), params(), worker))
}

async fn substrates() -> (Arc<MemoryLedgerStore>, Arc<MemorySharedStore>) {
    let store = Arc::new(MemoryLedgerStore::new());
    store.ensure_genesis(&genesis()).await.unwrap();
    (store, Arc::new(MemorySharedStore::new()))
}

#[tokio::test]
async fn redelivered_events_are_not_minted_twice() {
    let (store, shared) = substrates().await;
    let engine = node(&store, &shared, "node-a").await;

    let mut events = Vec::new();
    for (seq, s) in [(1, 0), (2, 1), (3, 2)] {
        let out = engine.tap(42, 20, at(s)).await.unwrap();
        events.push(TapEvent {
            user_id: 42,
            seq,
            requested: 20,
            granted: out.granted,
            day: at(s).date_naive(),
            energy_after: out.energy,
            at: at(s),
        });
    }

    // A consumer takes the entries, commits them, and dies before acking.
    let taken = shared
        .xreadgroup("bkc:tap_events", "bkc-ledger", "crashed", 10)
        .await
        .unwrap();
    assert_eq!(taken.len(), 3);
    let applied = store.apply_tap_events(42, &events).await.unwrap();
    assert_eq!(applied.applied, 3);
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 60);

    // The next drain re-claims them; the inbox turns them into duplicates.
    let report = engine.flush().await.unwrap();
    assert_eq!(report.events, 0);
    assert_eq!(report.duplicates, 3);

    let user = store.user(42).await.unwrap().unwrap();
    assert_eq!(user.balance, 60);
    assert_eq!(user.tap_seq, 3);
    assert_eq!(store.system().await.unwrap().reserve_supply, 900_000 - 60);
    assert!(engine.worker().stream_stats().await.unwrap().is_drained());
}

#[tokio::test]
async fn two_nodes_share_one_sequence_per_user() {
    let (store, shared) = substrates().await;
    let a = node(&store, &shared, "node-a").await;
    let b = node(&store, &shared, "node-b").await;

    let mut granted = 0;
    for s in 0..10 {
        let engine = if s % 2 == 0 { &a } else { &b };
        granted += engine.tap(42, 30, at(s)).await.unwrap().granted;
    }
    assert_eq!(granted, 300);

    // Either node sees the other's taps.
    assert_eq!(a.snapshot(42, at(10)).await.unwrap().balance, 300);
    assert_eq!(b.snapshot(42, at(10)).await.unwrap().reserve_supply, 900_000 - 300);

    b.flush().await.unwrap();
    let user = store.user(42).await.unwrap().unwrap();
    assert_eq!(user.balance, 300);
    assert_eq!(user.tap_seq, 10);
    assert_eq!(store.system().await.unwrap().reserve_supply, 900_000 - 300);
    assert!(a.flush().await.unwrap().is_empty());
}

#[tokio::test]
async fn shared_outage_fails_the_tap_cleanly() {
    let (store, shared) = substrates().await;
    let engine = node(&store, &shared, "node-a").await;
    engine.tap(42, 10, at(0)).await.unwrap();

    shared.fail_next_ops(1);
    let err = engine.tap(42, 10, at(1)).await.unwrap_err();
    assert!(matches!(err, TapError::Shared(SharedError::Unavailable(_))));
    assert!(err.is_retryable());

    let out = engine.tap(42, 10, at(2)).await.unwrap();
    assert_eq!(out.granted, 10);
    engine.flush().await.unwrap();
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 20);
    assert_eq!(store.user(42).await.unwrap().unwrap().tap_seq, 2);
}

#[tokio::test]
async fn durable_outage_leaves_events_pending_for_retry() {
    let (store, shared) = substrates().await;
    let engine = node(&store, &shared, "node-a").await;
    engine.tap(42, 10, at(0)).await.unwrap();
    engine.tap(43, 10, at(0)).await.unwrap();

    store.fail_next_writes(1);
    assert!(engine.flush().await.is_err());
    let stats = engine.stats().await;
    assert_eq!(stats.flush_failures, 1);
    assert!(stats.stream.is_some_and(|s| !s.is_drained()));

    let report = engine.flush().await.unwrap();
    assert!(report.events >= 1);
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 10);
    assert_eq!(store.user(43).await.unwrap().unwrap().balance, 10);
    assert!(engine.worker().stream_stats().await.unwrap().is_drained());
}

#[tokio::test]
async fn zero_grant_taps_still_move_energy_durably() {
    let (store, shared) = substrates().await;
    let engine = node(&store, &shared, "node-a").await;
    for _ in 0..10 {
        engine.tap(42, 100, at(0)).await.unwrap();
    }
    let out = engine.tap(42, 100, at(0)).await.unwrap();
    assert_eq!((out.granted, out.reason), (0, TapReason::NoEnergy));

    engine.flush().await.unwrap();
    let user = store.user(42).await.unwrap().unwrap();
    assert_eq!(user.balance, 1000);
    assert_eq!(user.energy, 0.0);
    assert_eq!(user.tap_seq, 11);
}

#[tokio::test]
async fn worker_task_drains_on_shutdown() {
    let (store, shared) = substrates().await;
    let engine = node(&store, &shared, "node-a").await;
    let (tx, rx) = tokio::sync::watch::channel(false);
    let handle = spawn_stream_worker(engine.worker().clone(), Duration::from_secs(3600), rx);

    engine.tap(42, 40, at(0)).await.unwrap();
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 40);
    assert!(engine.worker().stream_stats().await.unwrap().is_drained());
}
