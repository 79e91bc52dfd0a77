use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bkc_db::{Genesis, LedgerKind, LedgerStore, MemoryLedgerStore, StoreError};
use bkc_econ::{EnergyBoost, ShopParams, TapOutcome, TapParams, TapReason, UserId};
use bkc_tap::{
    ConsistencyGate, DistributedEngine, EngineMode, EngineStats, FlushReport, LocalBufferedEngine,
    MemorySharedStore, SettleGuard, StateSnapshot, StreamSettings, StreamWorker, TapEngine,
    TapError, TapResult, Treasury,
};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};

const TOTAL: i64 = 1_000_000;

fn genesis() -> Genesis {
    Genesis {
        total_supply: TOTAL,
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

fn shop() -> ShopParams {
    ShopParams {
        energy_boost_price: 500,
        energy_boost_duration_secs: 3600,
        energy_boost_regen_multiplier: 2.0,
        energy_boost_max_multiplier: 2.0,
        tap_pack_price: 300,
        tap_pack_size: 1000,
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 4, 10, 12, 0, 0).unwrap()
}

struct Rig {
    store: Arc<MemoryLedgerStore>,
    engine: Arc<dyn TapEngine>,
    treasury: Treasury,
}

async fn rig(mode: EngineMode) -> Rig {
    let store = Arc::new(MemoryLedgerStore::new());
    store.ensure_genesis(&genesis()).await.unwrap();
    let engine: Arc<dyn TapEngine> = match mode {
        EngineMode::LocalBuffered => Arc::new(LocalBufferedEngine::new(
            store.clone(),
            params(),
            Duration::from_secs(60),
        )),
        EngineMode::DistributedBuffered => {
            let shared = Arc::new(MemorySharedStore::new());
            let settings = StreamSettings {
                key_prefix: "t".to_string(),
                stream_key: "t:events".to_string(),
                group: "ledger".to_string(),
                consumer: "node-a".to_string(),
                batch: 8,
                claim_idle: Duration::from_secs(30),
                tx_attempts: 8,
            };
            let worker = Arc::new(StreamWorker::new(store.clone(), shared.clone(), settings));
            worker.ensure_group().await.unwrap();
            Arc::new(DistributedEngine::new(store.clone(), shared, params(), worker))
        }
        EngineMode::Direct => Arc::new(bkc_tap::DirectEngine::new(store.clone(), params())),
    };
    let gate = ConsistencyGate::new(engine.clone(), Duration::from_secs(5));
    let treasury = Treasury::new(store.clone(), engine.clone(), gate, shop());
    Rig {
        store,
        engine,
        treasury,
    }
}

const BUFFERED: [EngineMode; 2] = [EngineMode::LocalBuffered, EngineMode::DistributedBuffered];

async fn assert_conserved(store: &MemoryLedgerStore) {
    let sys = store.system().await.unwrap();
    assert_eq!(store.circulating_supply().await.unwrap() + sys.reserve_supply, TOTAL);
    assert!(sys.reserved_supply >= 0 && sys.reserved_supply <= sys.reserve_supply);
}

#[tokio::test]
async fn transfer_right_after_a_buffered_tap_sees_the_tap() {
    for mode in BUFFERED {
        let r = rig(mode).await;
        let out = r.engine.tap(42, 100, now()).await.unwrap();
        assert_eq!(out.granted, 100);

        // Durable balance is still 0 here; the gate flushes first.
        r.treasury.transfer(42, 1, 100).await.unwrap();

        assert_eq!(r.store.user(42).await.unwrap().unwrap().balance, 0, "{mode:?}");
        assert_eq!(r.store.user(1).await.unwrap().unwrap().balance, 100_100);
        assert_eq!(r.engine.snapshot(42, now()).await.unwrap().balance, 0);

        let err = r.treasury.transfer(42, 1, 1).await.unwrap_err();
        assert!(matches!(
            err,
            TapError::Store(StoreError::InsufficientBalance { have: 0, need: 1 })
        ));
        assert_conserved(&r.store).await;
    }
}

#[tokio::test]
async fn reserve_send_narrows_what_the_buffer_may_mint() {
    for mode in BUFFERED {
        let r = rig(mode).await;
        r.store.ensure_user(43, 1000.0, now()).await.unwrap();
        r.engine.tap(42, 10, now()).await.unwrap();

        r.treasury
            .admin_reserve_send(43, 900_000 - 10 - 5, Some("grant".to_string()))
            .await
            .unwrap();

        let later = now() + chrono::Duration::seconds(1);
        let out = r.engine.tap(42, 100, later).await.unwrap();
        assert_eq!((out.granted, out.reason), (5, TapReason::Ok), "{mode:?}");
        let out = r.engine.tap(42, 100, later).await.unwrap();
        assert_eq!((out.granted, out.reason), (0, TapReason::ReserveEmpty));

        r.engine.flush().await.unwrap();
        assert_eq!(r.store.system().await.unwrap().reserve_supply, 0);
        assert_eq!(r.store.user(42).await.unwrap().unwrap().balance, 15);
        assert_eq!(r.store.ledger_sum(LedgerKind::AdminReserveSend).await.unwrap(), 899_985);
        assert_conserved(&r.store).await;
    }
}

#[tokio::test]
async fn deposit_earmark_shows_up_in_the_cached_reserve() {
    for mode in BUFFERED {
        let r = rig(mode).await;
        r.store.ensure_user(43, 1000.0, now()).await.unwrap();
        r.engine.tap(42, 10, now()).await.unwrap();

        r.treasury.reserve_deposit(43, 1_000).await.unwrap();
        assert_eq!(r.engine.snapshot(42, now()).await.unwrap().reserved_supply, 1_000, "{mode:?}");

        r.treasury.settle_deposit(43, 1_000, false).await.unwrap();
        let snap = r.engine.snapshot(42, now()).await.unwrap();
        assert_eq!(snap.reserved_supply, 0);
        assert_eq!(snap.reserve_supply, 900_000 - 10);

        r.treasury.reserve_deposit(43, 1_000).await.unwrap();
        r.treasury.settle_deposit(43, 1_000, true).await.unwrap();
        let snap = r.engine.snapshot(42, now()).await.unwrap();
        assert_eq!(snap.reserved_supply, 0);
        assert_eq!(snap.reserve_supply, 900_000 - 10 - 1_000);
        assert_eq!(r.engine.snapshot(43, now()).await.unwrap().balance, 1_000);

        let sys = r.store.system().await.unwrap();
        assert_eq!(sys.reserve_supply, 900_000 - 10 - 1_000);
        assert_eq!(sys.reserved_supply, 0);
        assert_conserved(&r.store).await;
    }
}

#[tokio::test]
async fn boost_purchase_refills_the_cached_energy() {
    for mode in BUFFERED {
        let r = rig(mode).await;
        for _ in 0..5 {
            r.engine.tap(42, 100, now()).await.unwrap();
        }
        assert_eq!(r.engine.snapshot(42, now()).await.unwrap().energy, 500.0);

        let account = r.treasury.buy_energy_boost(42, now()).await.unwrap();
        assert_eq!(account.balance, 0);
        assert_eq!(account.energy, 2000.0);
        assert_eq!(account.boost.until, Some(now() + chrono::Duration::hours(1)));

        let snap = r.engine.snapshot(42, now()).await.unwrap();
        assert_eq!(snap.energy, 2000.0, "{mode:?}");
        assert_eq!(snap.energy_max, 2000.0);
        assert_eq!(snap.balance, 0);
        assert_eq!(snap.reserve_supply, 900_000);

        // Quota is used up, so the boost alone does not mint.
        let out = r.engine.tap(42, 100, now()).await.unwrap();
        assert_eq!(out.reason, TapReason::DailyLimit);
        assert_eq!(out.energy, 2000.0);
        assert_conserved(&r.store).await;
    }
}

#[tokio::test]
async fn tap_pack_extends_the_cached_quota() {
    for mode in BUFFERED {
        let r = rig(mode).await;
        for _ in 0..5 {
            r.engine.tap(42, 100, now()).await.unwrap();
        }
        let capped = r.engine.tap(42, 100, now()).await.unwrap();
        assert_eq!(capped.reason, TapReason::DailyLimit);

        let quota = r.treasury.buy_tap_pack(42, now()).await.unwrap();
        assert_eq!(quota.extra_quota, 1_000);
        assert_eq!(quota.tapped, 500);

        let out = r.engine.tap(42, 100, now()).await.unwrap();
        assert_eq!(out.granted, 100, "{mode:?}");
        assert_eq!(out.daily_extra_quota, 1_000);
        assert_eq!(out.daily_remaining, Some(900));

        r.engine.flush().await.unwrap();
        let user = r.store.user(42).await.unwrap().unwrap();
        assert_eq!(user.balance, 500 - 300 + 100);
        assert_eq!(r.store.daily(42, now().date_naive()).await.unwrap().tapped, 600);
        assert_conserved(&r.store).await;
    }
}

#[tokio::test]
async fn history_includes_taps_still_in_the_buffer() {
    let r = rig(EngineMode::LocalBuffered).await;
    r.engine.tap(42, 10, now()).await.unwrap();
    let rows = r.treasury.history(42, 10).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].kind, LedgerKind::Tap);
    assert_eq!(rows[0].amount, 10);
    assert!(r.treasury.history(42, 0).await.is_err());
}

/// Never finishes settling.
struct StuckEngine {
    params: TapParams,
}

#[async_trait]
impl TapEngine for StuckEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::LocalBuffered
    }
    fn params(&self) -> &TapParams {
        &self.params
    }
    async fn tap(&self, _: UserId, _: i64, _: DateTime<Utc>) -> TapResult<TapOutcome> {
        unimplemented!()
    }
    async fn snapshot(&self, _: UserId, _: DateTime<Utc>) -> TapResult<StateSnapshot> {
        unimplemented!()
    }
    async fn flush(&self) -> TapResult<FlushReport> {
        unimplemented!()
    }
    async fn settle(&self) -> TapResult<SettleGuard> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(SettleGuard::none())
    }
    async fn adjust_reserve(&self, _: i64) -> TapResult<()> {
        Ok(())
    }
    async fn adjust_reserved(&self, _: i64) -> TapResult<()> {
        Ok(())
    }
    async fn adjust_balance(&self, _: UserId, _: i64) -> TapResult<()> {
        Ok(())
    }
    async fn apply_energy_boost(&self, _: UserId, _: EnergyBoost, _: f64, _: DateTime<Utc>) -> TapResult<()> {
        Ok(())
    }
    async fn add_daily_extra_quota(&self, _: UserId, _: NaiveDate, _: i64) -> TapResult<()> {
        Ok(())
    }
    async fn stats(&self) -> EngineStats {
        EngineStats::empty(EngineMode::LocalBuffered)
    }
}

#[tokio::test(start_paused = true)]
async fn gate_gives_up_with_buffer_busy() {
    let store = Arc::new(MemoryLedgerStore::new());
    store.ensure_genesis(&genesis()).await.unwrap();
    let engine: Arc<dyn TapEngine> = Arc::new(StuckEngine { params: params() });
    let gate = ConsistencyGate::new(engine.clone(), Duration::from_millis(50));
    let treasury = Treasury::new(store.clone(), engine, gate, shop());

    let err = treasury.transfer(1, 2, 10).await.unwrap_err();
    assert!(matches!(err, TapError::BufferBusy));
    assert!(err.is_retryable());
    // Nothing moved.
    assert_eq!(store.user(1).await.unwrap().unwrap().balance, 100_000);
}
