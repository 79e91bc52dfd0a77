//! Multi-process write-behind engine.
//!
//! The live reserve and each active user's state live in the shared cache.
//! A tap is one optimistic transaction over the reserve key and the user key:
//! it rewrites the user's snapshot, decrements the cached reserve, and appends
//! one event `{user_id, seq, ...}` to the stream. The [`StreamWorker`] makes
//! events durable; `seq` is the idempotency key that makes redelivery safe.
//!
//! Taps are not held off while a gate pass is out: other nodes could not see
//! a local lock anyway. The treasury instead takes coins out of the cached
//! reserve before its durable write, so a concurrent tap can only see less.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::RwLock;

use bkc_db::{LedgerStore, SystemReserve, TapEvent};
use bkc_econ::{plan_tap, utc_day, EnergyBoost, TapInput, TapOutcome, TapParams, UserId};

use crate::codec::{
    decode_system, decode_user, encode_event, encode_quarantine, encode_system, encode_user,
    quarantine_of, LiveUser,
};
use crate::engine::{build_snapshot, SnapshotParts};
use crate::shared::{SharedOp, SharedStore};
use crate::{
    EngineMode, EngineStats, FlushReport, SettleGuard, SharedError, StateSnapshot, StreamSettings,
    StreamWorker, TapEngine, TapError, TapResult,
};

#[derive(Default)]
struct FlushStats {
    flushes: u64,
    flush_failures: u64,
    last_flush_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

pub struct DistributedEngine {
    store: Arc<dyn LedgerStore>,
    shared: Arc<dyn SharedStore>,
    params: TapParams,
    worker: Arc<StreamWorker>,
    /// Cold loads take it exclusively; `settle` holds it shared.
    loads: Arc<RwLock<()>>,
    stats: Mutex<FlushStats>,
}

impl DistributedEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        shared: Arc<dyn SharedStore>,
        params: TapParams,
        worker: Arc<StreamWorker>,
    ) -> Self {
        Self {
            store,
            shared,
            params,
            worker,
            loads: Arc::new(RwLock::new(())),
            stats: Mutex::new(FlushStats::default()),
        }
    }

    pub fn worker(&self) -> &Arc<StreamWorker> {
        &self.worker
    }

    fn settings(&self) -> &StreamSettings {
        self.worker.settings()
    }

    /// Seed missing cache keys from the durable store. Keys that already
    /// exist are left alone; they may hold taps not yet durable.
    async fn load(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<()> {
        let _loading = self.loads.write().await;
        let sys_key = self.settings().system_key();
        let user_key = self.settings().user_key(user_id);

        if self.shared.hgetall(&sys_key).await?.is_none() {
            let sys = self.store.system().await?;
            if self.shared.hset_if_absent(&sys_key, encode_system(&sys)).await? {
                tracing::info!(reserve_supply = sys.reserve_supply, "reserve cached");
            }
        }
        if self.shared.hgetall(&user_key).await?.is_none() {
            let account = self
                .store
                .ensure_user(user_id, self.params.energy_max, now)
                .await?;
            let daily = self.store.daily(user_id, utc_day(now)).await?;
            let live = LiveUser {
                account,
                day: daily.day,
                daily_tapped: daily.tapped,
                daily_extra: daily.extra_quota,
            };
            self.shared.hset_if_absent(&user_key, encode_user(&live)).await?;
        }
        Ok(())
    }

    /// Reserve and user as cached, loading them on a miss.
    async fn cached(
        &self,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> TapResult<(SystemReserve, LiveUser)> {
        let keys = [self.settings().system_key(), self.settings().user_key(user_id)];
        for _ in 0..2 {
            if let (Some(sys), Some(user)) = (
                self.shared.hgetall(&keys[0]).await?,
                self.shared.hgetall(&keys[1]).await?,
            ) {
                return Ok((decode_system(&keys[0], &sys)?, decode_user(&keys[1], &user)?));
            }
            self.load(user_id, now).await?;
        }
        Err(TapError::Contended { attempts: 2 })
    }

    /// Move `live` onto `now`'s quota day, reading that day's durable row.
    async fn roll_day(&self, live: &mut LiveUser, now: DateTime<Utc>) -> TapResult<()> {
        let today = utc_day(now);
        if today > live.day {
            let daily = self.store.daily(live.account.user_id, today).await?;
            live.day = today;
            live.daily_tapped = daily.tapped;
            live.daily_extra = daily.extra_quota;
        }
        Ok(())
    }

    /// Read-modify-write of one user key under a watch. A missing key means
    /// nothing is cached and there is nothing to adjust.
    async fn update_user<F>(&self, user_id: UserId, mut edit: F) -> TapResult<()>
    where
        F: FnMut(&mut LiveUser) -> bool + Send,
    {
        let key = self.settings().user_key(user_id);
        let attempts = self.settings().tx_attempts.max(1);
        for _ in 0..attempts {
            let (mut vals, watch) = self.shared.watch(std::slice::from_ref(&key)).await?;
            let Some(hash) = vals.pop().flatten() else {
                return Ok(());
            };
            let mut live = decode_user(&key, &hash)?;
            if !edit(&mut live) {
                return Ok(());
            }
            let ops = vec![SharedOp::HSet {
                key: key.clone(),
                fields: encode_user(&live),
            }];
            match self.shared.exec(watch, ops).await {
                Ok(()) => return Ok(()),
                Err(SharedError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TapError::Contended { attempts })
    }

    async fn incr_system(&self, field: &str, delta: i64) -> TapResult<()> {
        if delta != 0 {
            self.shared
                .hincrby_existing(&self.settings().system_key(), field, delta)
                .await?;
        }
        Ok(())
    }

    async fn drain(&self) -> TapResult<FlushReport> {
        let _serial = self.worker.drain_lock().lock_owned().await;
        self.drain_serialized().await
    }

    async fn drain_serialized(&self) -> TapResult<FlushReport> {
        let result = self.worker.drain_all_serialized().await;
        let mut st = self.stats.lock();
        match &result {
            Ok(_) => {
                st.flushes += 1;
                st.last_flush_at = Some(Utc::now());
                st.last_error = None;
            }
            Err(e) => {
                st.flush_failures += 1;
                st.last_error = Some(e.to_string());
            }
        }
        result
    }
}

#[async_trait]
impl TapEngine for DistributedEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::DistributedBuffered
    }

    fn params(&self) -> &TapParams {
        &self.params
    }

    async fn tap(&self, user_id: UserId, requested: i64, now: DateTime<Utc>) -> TapResult<TapOutcome> {
        let sys_key = self.settings().system_key();
        let user_key = self.settings().user_key(user_id);
        let keys = [sys_key.clone(), user_key.clone()];
        let attempts = self.settings().tx_attempts.max(1);

        for _ in 0..attempts {
            let (vals, watch) = self.shared.watch(&keys).await?;
            let (Some(sys_hash), Some(user_hash)) = (&vals[0], &vals[1]) else {
                self.load(user_id, now).await?;
                continue;
            };
            if let Some(reason) = quarantine_of(user_hash) {
                return Err(TapError::Quarantined { user_id, reason });
            }
            let sys = decode_system(&sys_key, sys_hash)?;
            let mut live = decode_user(&user_key, user_hash)?;
            self.roll_day(&mut live, now).await?;

            let input = TapInput {
                requested,
                now,
                reserve_supply: sys.reserve_supply,
                reserved_supply: sys.reserved_supply,
                energy: live.account.energy,
                energy_max: live.account.energy_max,
                energy_updated_at: live.account.energy_updated_at,
                boost: live.account.boost,
                daily_tapped: live.daily_tapped,
                daily_extra: live.daily_extra,
            };
            let plan = plan_tap(&self.params, &input);

            live.account.energy = plan.energy_after;
            live.account.energy_updated_at = now;
            live.account.balance += plan.granted;
            live.account.taps_total += plan.granted;
            live.account.tap_seq += 1;
            live.daily_tapped += plan.granted;

            let event = TapEvent {
                user_id,
                seq: live.account.tap_seq,
                requested,
                granted: plan.granted,
                day: live.day,
                energy_after: plan.energy_after,
                at: now,
            };
            let mut ops = vec![SharedOp::HSet {
                key: user_key.clone(),
                fields: encode_user(&live),
            }];
            if plan.granted > 0 {
                ops.push(SharedOp::HIncrBy {
                    key: sys_key.clone(),
                    field: "reserve_supply".to_string(),
                    by: -plan.granted,
                });
            }
            ops.push(SharedOp::XAdd {
                stream: self.settings().stream_key.clone(),
                fields: encode_event(&event),
            });

            match self.shared.exec(watch, ops).await {
                Ok(()) => return Ok(plan.outcome(live.daily_extra)),
                Err(SharedError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        tracing::warn!(user_id, attempts, "distributed tap gave up after repeated conflicts");
        Err(TapError::Contended { attempts })
    }

    async fn snapshot(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<StateSnapshot> {
        let (sys, mut live) = self.cached(user_id, now).await?;
        self.roll_day(&mut live, now).await?;
        let pending = !self.worker.stream_stats().await?.is_drained();
        Ok(build_snapshot(
            &self.params,
            SnapshotParts {
                sys: &sys,
                user: &live.account,
                daily_tapped: live.daily_tapped,
                daily_extra: live.daily_extra,
                pending,
            },
            now,
        ))
    }

    async fn flush(&self) -> TapResult<FlushReport> {
        self.drain().await
    }

    async fn settle(&self) -> TapResult<SettleGuard> {
        let loads = self.loads.clone().read_owned().await;
        let serial = self.worker.drain_lock().lock_owned().await;
        self.drain_serialized().await?;
        Ok(SettleGuard::held(loads, serial))
    }

    async fn adjust_reserve(&self, delta: i64) -> TapResult<()> {
        self.incr_system("reserve_supply", delta).await
    }

    async fn adjust_reserved(&self, delta: i64) -> TapResult<()> {
        self.incr_system("reserved_supply", delta).await
    }

    async fn adjust_balance(&self, user_id: UserId, delta: i64) -> TapResult<()> {
        if delta != 0 {
            self.shared
                .hincrby_existing(&self.settings().user_key(user_id), "balance", delta)
                .await?;
        }
        Ok(())
    }

    async fn apply_energy_boost(
        &self,
        user_id: UserId,
        boost: EnergyBoost,
        energy: f64,
        now: DateTime<Utc>,
    ) -> TapResult<()> {
        self.update_user(user_id, |live| {
            live.account.boost = boost;
            live.account.energy = energy;
            live.account.energy_updated_at = now;
            true
        })
        .await
    }

    async fn add_daily_extra_quota(&self, user_id: UserId, day: NaiveDate, amount: i64) -> TapResult<()> {
        self.update_user(user_id, |live| {
            if live.day != day {
                return false;
            }
            live.daily_extra += amount;
            true
        })
        .await
    }

    async fn quarantine(&self, user_id: UserId) -> TapResult<Option<String>> {
        let key = self.settings().user_key(user_id);
        Ok(self.shared.hgetall(&key).await?.as_ref().and_then(quarantine_of))
    }

    /// Drains the stream, then reseeds the user's cache entry from the
    /// durable store. Dead-lettered events stay in the dead-letter stream.
    async fn release_quarantine(&self, user_id: UserId) -> TapResult<bool> {
        let _serial = self.worker.drain_lock().lock_owned().await;
        self.drain_serialized().await?;
        let key = self.settings().user_key(user_id);
        let attempts = self.settings().tx_attempts.max(1);
        for _ in 0..attempts {
            let (mut vals, watch) = self.shared.watch(std::slice::from_ref(&key)).await?;
            let Some(reason) = vals.pop().flatten().as_ref().and_then(quarantine_of) else {
                self.worker.forget_quarantine(user_id);
                return Ok(false);
            };
            let now = Utc::now();
            let account = self
                .store
                .ensure_user(user_id, self.params.energy_max, now)
                .await?;
            let daily = self.store.daily(user_id, utc_day(now)).await?;
            let mut fields = encode_user(&LiveUser {
                account,
                day: daily.day,
                daily_tapped: daily.tapped,
                daily_extra: daily.extra_quota,
            });
            fields.extend(encode_quarantine(""));
            match self.shared.exec(watch, vec![SharedOp::HSet { key: key.clone(), fields }]).await {
                Ok(()) => {
                    self.worker.forget_quarantine(user_id);
                    tracing::info!(user_id, %reason, "quarantine released; cache reseeded");
                    return Ok(true);
                }
                Err(SharedError::Conflict) => continue,
                Err(e) => return Err(e.into()),
            }
        }
        Err(TapError::Contended { attempts })
    }

    async fn stats(&self) -> EngineStats {
        let mut stats = EngineStats::empty(EngineMode::DistributedBuffered);
        let dead = self.worker.quarantined();
        stats.quarantined_users = dead.len();
        stats.quarantined_coins = dead.values().sum();
        {
            let st = self.stats.lock();
            stats.flushes = st.flushes;
            stats.flush_failures = st.flush_failures;
            stats.last_flush_at = st.last_flush_at;
            stats.last_error = st.last_error.clone();
        }
        match self.worker.stream_stats().await {
            Ok(s) => stats.stream = Some(s),
            Err(e) => {
                stats.last_error.get_or_insert_with(|| e.to_string());
            }
        }
        stats
    }
}
