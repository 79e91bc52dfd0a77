use std::sync::Arc;
use std::time::Duration;

use bkc_db::{Genesis, LedgerKind, LedgerStore, MemoryLedgerStore};
use bkc_econ::{TapParams, TapReason};
use bkc_tap::{spawn_flush_ticker, LocalBufferedEngine, TapEngine, TapError};
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
        daily_limit: 500,
        max_per_request: 100,
    }
}

fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, h, m, s).unwrap()
}

async fn setup(idle_evict: Duration) -> (Arc<MemoryLedgerStore>, Arc<LocalBufferedEngine>) {
    let store = Arc::new(MemoryLedgerStore::new());
    store.ensure_genesis(&genesis()).await.unwrap();
    let engine = Arc::new(LocalBufferedEngine::new(store.clone(), params(), idle_evict));
    (store, engine)
}

#[tokio::test]
async fn reads_between_flushes_come_from_the_buffer() {
    let (store, engine) = setup(Duration::from_secs(60)).await;
    let now = at(9, 0, 0);

    let out = engine.tap(42, 30, now).await.unwrap();
    assert_eq!(out.granted, 30);
    assert_eq!(out.reason, TapReason::Ok);

    let snap = engine.snapshot(42, now).await.unwrap();
    assert_eq!(snap.balance, 30);
    assert_eq!(snap.reserve_supply, 900_000 - 30);
    assert_eq!(snap.daily_tapped, 30);
    assert_eq!(snap.daily_remaining, Some(470));
    assert!(snap.pending);

    // Nothing durable yet.
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 0);
    assert_eq!(store.system().await.unwrap().reserve_supply, 900_000);

    let stats = engine.stats().await;
    assert_eq!(stats.pending_users, 1);
    assert_eq!(stats.pending_coins, 30);
}

#[tokio::test]
async fn second_flush_writes_nothing() {
    let (store, engine) = setup(Duration::from_secs(60)).await;
    for s in 0..5 {
        engine.tap(42, 10, at(9, 0, s)).await.unwrap();
    }
    engine.tap(43, 7, at(9, 0, 9)).await.unwrap();

    let first = engine.flush().await.unwrap();
    assert_eq!(first.users, 2);
    assert_eq!(first.coins, 57);

    let commits = store.commits();
    let ledger = store.ledger_len();
    let second = engine.flush().await.unwrap();
    assert!(second.is_empty());
    assert_eq!(store.commits(), commits);
    assert_eq!(store.ledger_len(), ledger);

    let user = store.user(42).await.unwrap().unwrap();
    assert_eq!(user.balance, 50);
    assert_eq!(user.taps_total, 50);
    assert_eq!(user.energy, 950.0 + 4.0, "regen between taps is persisted");
    assert_eq!(user.energy_updated_at, at(9, 0, 4));
    assert_eq!(store.system().await.unwrap().reserve_supply, 900_000 - 57);
    // One aggregated ledger row per user per flush.
    assert_eq!(store.ledger_for_user(42, 10).await.unwrap().len(), 1);
    assert_eq!(store.ledger_sum(LedgerKind::Tap).await.unwrap(), 57);
}

#[tokio::test]
async fn failed_flush_keeps_the_delta_for_the_next_one() {
    let (store, engine) = setup(Duration::from_secs(60)).await;
    engine.tap(42, 10, at(9, 0, 0)).await.unwrap();

    store.fail_next_writes(1);
    let err = engine.flush().await.unwrap_err();
    assert!(err.is_retryable());
    assert!(matches!(err, TapError::Store(_)));
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 0);

    let stats = engine.stats().await;
    assert_eq!(stats.flush_failures, 1);
    assert!(stats.last_error.is_some());
    assert_eq!(stats.pending_coins, 10);

    // Taps keep landing while the store is down.
    engine.tap(42, 5, at(9, 0, 1)).await.unwrap();
    let report = engine.flush().await.unwrap();
    assert_eq!(report.coins, 15);

    let user = store.user(42).await.unwrap().unwrap();
    assert_eq!(user.balance, 15);
    assert_eq!(store.daily(42, at(0, 0, 0).date_naive()).await.unwrap().tapped, 15);
    assert!(engine.stats().await.last_error.is_none());
}

#[tokio::test]
async fn taps_across_midnight_are_booked_on_their_own_days() {
    let (store, engine) = setup(Duration::from_secs(60)).await;
    let before = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 50).unwrap();
    let after = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 5).unwrap();

    for _ in 0..5 {
        engine.tap(42, 100, before).await.unwrap();
    }
    let capped = engine.tap(42, 100, before).await.unwrap();
    assert_eq!(capped.granted, 0);
    assert_eq!(capped.reason, TapReason::DailyLimit);

    let fresh = engine.tap(42, 100, after).await.unwrap();
    assert_eq!(fresh.granted, 100);
    assert_eq!(fresh.daily_tapped, 100);
    assert_eq!(fresh.daily_remaining, Some(400));

    engine.flush().await.unwrap();
    assert_eq!(store.daily(42, before.date_naive()).await.unwrap().tapped, 500);
    assert_eq!(store.daily(42, after.date_naive()).await.unwrap().tapped, 100);
    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 600);
}

#[tokio::test]
async fn idle_users_are_evicted_and_reload_identically() {
    let (_store, engine) = setup(Duration::ZERO).await;
    let now = at(9, 0, 0);
    engine.tap(42, 25, now).await.unwrap();
    let buffered = engine.snapshot(42, now).await.unwrap();

    engine.flush().await.unwrap();
    assert_eq!(engine.stats().await.cached_users, 0);

    let reloaded = engine.snapshot(42, now).await.unwrap();
    assert_eq!(reloaded.balance, buffered.balance);
    assert_eq!(reloaded.energy, buffered.energy);
    assert_eq!(reloaded.reserve_supply, buffered.reserve_supply);
    assert_eq!(reloaded.daily_tapped, buffered.daily_tapped);
    assert!(!reloaded.pending);
}

#[tokio::test]
async fn ticker_flushes_on_shutdown() {
    let (store, engine) = setup(Duration::from_secs(60)).await;
    let (tx, rx) = tokio::sync::watch::channel(false);
    // Long interval: only the shutdown flush can make the tap durable.
    let handle = spawn_flush_ticker(engine.clone(), Duration::from_secs(3600), rx);

    engine.tap(42, 40, Utc::now()).await.unwrap();
    tx.send(true).unwrap();
    handle.await.unwrap();

    assert_eq!(store.user(42).await.unwrap().unwrap().balance, 40);
    assert!(engine.pending_delta(42).is_none());
}
