//! Single-process write-behind engine.
//!
//! Taps are planned against an in-memory view of the reserve and of each
//! active user, acknowledged immediately, and accumulated into a per-user
//! [`BufferedDelta`]. `flush` folds each delta into the durable store in one
//! transaction per user. A delta is moved to `in_flight` for the duration of
//! its transaction and put back in front of newer taps if the write fails, so
//! no acknowledged tap is lost and none is written twice.
//!
//! The batch runs on its own task that owns the flush lock, so a caller that
//! stops waiting (a gate timeout, a dropped request) never strands a delta in
//! flight. A delta the store rejects outright is quarantined: it stays in the
//! buffer, is skipped by later flushes, and the user's taps are refused until
//! an operator releases it.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::mem;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use parking_lot::Mutex;
use tokio::sync::{OwnedMutexGuard, RwLock};

use bkc_db::{DailyQuota, LedgerStore, StoreError, SystemReserve, UserAccount};
use bkc_econ::{plan_tap, utc_day, EnergyBoost, TapInput, TapOutcome, TapParams, TapPlan, UserId};

use crate::engine::{build_snapshot, SnapshotParts};
use crate::{
    BufferedDelta, EngineMode, EngineStats, FlushReport, SettleGuard, StateSnapshot, TapEngine,
    TapError, TapResult,
};

const LOAD_ATTEMPTS: u32 = 3;

struct UserSlot {
    account: UserAccount,
    /// Quota day the counters below belong to.
    day: NaiveDate,
    daily_tapped: i64,
    daily_extra: i64,
    pending: BufferedDelta,
    in_flight: Option<BufferedDelta>,
    /// Set when the store rejected this user's delta.
    quarantine: Option<String>,
    touched: Instant,
}

impl UserSlot {
    fn new(account: UserAccount, daily: DailyQuota) -> Self {
        Self {
            account,
            day: daily.day,
            daily_tapped: daily.tapped,
            daily_extra: daily.extra_quota,
            pending: BufferedDelta::default(),
            in_flight: None,
            quarantine: None,
            touched: Instant::now(),
        }
    }

    fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.in_flight.is_none()
    }

    fn roll_to(&mut self, daily: DailyQuota) {
        self.day = daily.day;
        self.daily_tapped = daily.tapped;
        self.daily_extra = daily.extra_quota;
    }

    fn tap_input(&self, sys: &SystemReserve, requested: i64, now: DateTime<Utc>) -> TapInput {
        TapInput {
            requested,
            now,
            reserve_supply: sys.reserve_supply,
            reserved_supply: sys.reserved_supply,
            energy: self.account.energy,
            energy_max: self.account.energy_max,
            energy_updated_at: self.account.energy_updated_at,
            boost: self.account.boost,
            daily_tapped: self.daily_tapped,
            daily_extra: self.daily_extra,
        }
    }

    fn apply(&mut self, plan: &TapPlan, requested: i64, now: DateTime<Utc>) {
        self.account.energy = plan.energy_after;
        self.account.energy_updated_at = now;
        self.account.balance += plan.granted;
        self.account.taps_total += plan.granted;
        self.daily_tapped += plan.granted;
        self.pending.record(plan, requested, self.day, now);
        self.touched = Instant::now();
    }

    fn unflushed_coins(&self) -> i64 {
        self.pending.gained + self.in_flight.as_ref().map_or(0, |d| d.gained)
    }

    fn oldest_pending(&self) -> Option<Duration> {
        let in_flight = self.in_flight.as_ref().and_then(BufferedDelta::age);
        in_flight.max(self.pending.age())
    }
}

#[derive(Default)]
struct Buffer {
    system: Option<SystemReserve>,
    users: HashMap<UserId, UserSlot>,
    flushes: u64,
    flush_failures: u64,
    last_flush_at: Option<DateTime<Utc>>,
    last_error: Option<String>,
}

impl Buffer {
    /// `Ok(None)` means the caller must load state first.
    fn try_tap(
        &mut self,
        params: &TapParams,
        user_id: UserId,
        requested: i64,
        now: DateTime<Utc>,
    ) -> TapResult<Option<TapOutcome>> {
        let (Some(sys), Some(slot)) = (self.system.as_mut(), self.users.get_mut(&user_id)) else {
            return Ok(None);
        };
        if let Some(reason) = &slot.quarantine {
            return Err(TapError::Quarantined {
                user_id,
                reason: reason.clone(),
            });
        }
        // A clock stepping back over midnight keeps counting on the newer day.
        if utc_day(now) > slot.day {
            return Ok(None);
        }
        let plan = plan_tap(params, &slot.tap_input(sys, requested, now));
        sys.reserve_supply -= plan.granted;
        slot.apply(&plan, requested, now);
        Ok(Some(plan.outcome(slot.daily_extra)))
    }

    fn cached_snapshot(
        &self,
        params: &TapParams,
        user_id: UserId,
        now: DateTime<Utc>,
    ) -> Option<StateSnapshot> {
        let sys = self.system.as_ref()?;
        let slot = self.users.get(&user_id)?;
        if utc_day(now) > slot.day {
            return None;
        }
        Some(build_snapshot(
            params,
            SnapshotParts {
                sys,
                user: &slot.account,
                daily_tapped: slot.daily_tapped,
                daily_extra: slot.daily_extra,
                pending: !slot.is_idle(),
            },
            now,
        ))
    }

    /// Caller holds the flush lock, so anything still in flight was left
    /// behind by a batch that did not finish and is written again.
    fn take_pending(&mut self) -> Vec<(UserId, BufferedDelta)> {
        let mut batch = Vec::new();
        for (user_id, slot) in self.users.iter_mut() {
            if let Some(stale) = slot.in_flight.take() {
                tracing::warn!(user_id, gained = stale.gained, "unfinished flush left a delta in flight; retrying it");
                let newer = mem::take(&mut slot.pending);
                slot.pending = stale.then(newer);
            }
            if slot.pending.is_empty() || slot.quarantine.is_some() {
                continue;
            }
            let delta = mem::take(&mut slot.pending);
            slot.in_flight = Some(delta.clone());
            batch.push((*user_id, delta));
        }
        batch.sort_by_key(|(user_id, _)| *user_id);
        batch
    }

    fn complete(&mut self, user_id: UserId) {
        if let Some(slot) = self.users.get_mut(&user_id) {
            slot.in_flight = None;
        }
    }

    fn restore(&mut self, user_id: UserId) {
        if let Some(slot) = self.users.get_mut(&user_id) {
            if let Some(failed) = slot.in_flight.take() {
                let newer = mem::take(&mut slot.pending);
                slot.pending = failed.then(newer);
            }
        }
    }

    fn quarantine(&mut self, user_id: UserId, reason: String) {
        self.restore(user_id);
        if let Some(slot) = self.users.get_mut(&user_id) {
            slot.quarantine = Some(reason);
        }
    }

    fn evict_idle(&mut self, idle_for: Duration) {
        self.users
            .retain(|_, slot| !(slot.is_idle() && slot.touched.elapsed() >= idle_for));
    }
}

/// Commit every pending delta, one durable transaction per user. The caller
/// holds the flush lock.
async fn flush_batch(
    store: &dyn LedgerStore,
    buffer: &Mutex<Buffer>,
    idle_evict: Duration,
) -> TapResult<FlushReport> {
    let batch = buffer.lock().take_pending();
    let mut report = FlushReport::default();
    let mut first_err: Option<StoreError> = None;
    let mut rejected: Option<String> = None;

    for (user_id, delta) in batch {
        let result = match delta.to_durable() {
            Some(durable) => store.flush_tap_delta(user_id, &durable).await,
            None => Ok(()),
        };
        let mut buf = buffer.lock();
        match result {
            Ok(()) => {
                buf.complete(user_id);
                report.users += 1;
                report.coins += delta.gained;
            }
            Err(e) if e.is_retryable() => {
                tracing::warn!(user_id, gained = delta.gained, error = %e, "buffered flush failed; delta kept");
                buf.restore(user_id);
                first_err.get_or_insert(e);
            }
            Err(e) => {
                tracing::error!(user_id, gained = delta.gained, error = %e, "store rejected buffered taps; user quarantined");
                buf.quarantine(user_id, e.to_string());
                report.quarantined += 1;
                rejected.get_or_insert_with(|| format!("user {user_id} quarantined: {e}"));
            }
        }
    }

    let mut buf = buffer.lock();
    buf.evict_idle(idle_evict);
    match first_err {
        None => {
            buf.flushes += 1;
            buf.last_flush_at = Some(Utc::now());
            buf.last_error = rejected;
            if report.users > 0 {
                tracing::debug!(flushed_users = report.users, coins = report.coins, "buffered taps flushed");
            }
            Ok(report)
        }
        Some(e) => {
            buf.flush_failures += 1;
            buf.last_error = Some(e.to_string());
            Err(TapError::Store(e))
        }
    }
}

pub struct LocalBufferedEngine {
    store: Arc<dyn LedgerStore>,
    params: TapParams,
    idle_evict: Duration,
    buffer: Arc<Mutex<Buffer>>,
    /// Taps and snapshots hold it shared; `settle` holds it exclusively.
    quiet: Arc<RwLock<()>>,
    /// Serializes cold loads.
    loading: tokio::sync::Mutex<()>,
    /// Serializes flushes.
    flushing: Arc<tokio::sync::Mutex<()>>,
}

impl LocalBufferedEngine {
    pub fn new(store: Arc<dyn LedgerStore>, params: TapParams, idle_evict: Duration) -> Self {
        Self {
            store,
            params,
            idle_evict,
            buffer: Arc::new(Mutex::new(Buffer::default())),
            quiet: Arc::new(RwLock::new(())),
            loading: tokio::sync::Mutex::new(()),
            flushing: Arc::new(tokio::sync::Mutex::new(())),
        }
    }

    /// Pending plus in-flight delta for one user, if any.
    pub fn pending_delta(&self, user_id: UserId) -> Option<BufferedDelta> {
        let buf = self.buffer.lock();
        let slot = buf.users.get(&user_id)?;
        if slot.is_idle() {
            return None;
        }
        let in_flight = slot.in_flight.clone().unwrap_or_default();
        Some(in_flight.then(slot.pending.clone()))
    }

    async fn load(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<()> {
        let _loading = self.loading.lock().await;
        let day = utc_day(now);
        let (need_system, cached_day) = {
            let buf = self.buffer.lock();
            (
                buf.system.is_none(),
                buf.users.get(&user_id).map(|s| s.day),
            )
        };

        let system = match need_system {
            true => Some(self.store.system().await?),
            false => None,
        };
        let account = match cached_day {
            None => Some(
                self.store
                    .ensure_user(user_id, self.params.energy_max, now)
                    .await?,
            ),
            Some(_) => None,
        };
        let daily = match cached_day {
            Some(d) if d >= day => None,
            _ => Some(self.store.daily(user_id, day).await?),
        };

        let mut buf = self.buffer.lock();
        if buf.system.is_none() {
            buf.system = system;
        }
        match buf.users.entry(user_id) {
            Entry::Vacant(v) => {
                if let (Some(account), Some(daily)) = (account, daily) {
                    v.insert(UserSlot::new(account, daily));
                }
            }
            Entry::Occupied(mut o) => {
                let slot = o.get_mut();
                if let Some(daily) = daily {
                    if daily.day > slot.day {
                        slot.roll_to(daily);
                    }
                }
            }
        }
        Ok(())
    }

    /// Run the batch on a detached task that owns `serial` and hand the
    /// guard back once it is done. If the caller is dropped first, the task
    /// still finishes and releases the lock.
    async fn flush_detached(
        &self,
        serial: OwnedMutexGuard<()>,
    ) -> TapResult<(FlushReport, OwnedMutexGuard<()>)> {
        let store = self.store.clone();
        let buffer = self.buffer.clone();
        let idle_evict = self.idle_evict;
        let task = tokio::spawn(async move {
            let result = flush_batch(store.as_ref(), &buffer, idle_evict).await;
            (result, serial)
        });
        match task.await {
            Ok((result, serial)) => result.map(|report| (report, serial)),
            Err(e) => {
                tracing::error!(error = %e, "flush task ended abnormally");
                Err(StoreError::Unavailable(format!("flush task ended: {e}")).into())
            }
        }
    }
}

#[async_trait]
impl TapEngine for LocalBufferedEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::LocalBuffered
    }

    fn params(&self) -> &TapParams {
        &self.params
    }

    async fn tap(&self, user_id: UserId, requested: i64, now: DateTime<Utc>) -> TapResult<TapOutcome> {
        let _quiet = self.quiet.read().await;
        for _ in 0..LOAD_ATTEMPTS {
            let hit = self
                .buffer
                .lock()
                .try_tap(&self.params, user_id, requested, now)?;
            if let Some(out) = hit {
                return Ok(out);
            }
            self.load(user_id, now).await?;
        }
        Err(TapError::Contended {
            attempts: LOAD_ATTEMPTS,
        })
    }

    async fn snapshot(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<StateSnapshot> {
        let _quiet = self.quiet.read().await;
        for _ in 0..LOAD_ATTEMPTS {
            let hit = self
                .buffer
                .lock()
                .cached_snapshot(&self.params, user_id, now);
            if let Some(snap) = hit {
                return Ok(snap);
            }
            self.load(user_id, now).await?;
        }
        Err(TapError::Contended {
            attempts: LOAD_ATTEMPTS,
        })
    }

    async fn flush(&self) -> TapResult<FlushReport> {
        let serial = self.flushing.clone().lock_owned().await;
        let (report, _serial) = self.flush_detached(serial).await?;
        Ok(report)
    }

    async fn settle(&self) -> TapResult<SettleGuard> {
        let quiet = self.quiet.clone().write_owned().await;
        let serial = self.flushing.clone().lock_owned().await;
        let (_, serial) = self.flush_detached(serial).await?;
        Ok(SettleGuard::quiesced(quiet, serial))
    }

    async fn adjust_reserve(&self, delta: i64) -> TapResult<()> {
        if let Some(sys) = self.buffer.lock().system.as_mut() {
            sys.reserve_supply += delta;
        }
        Ok(())
    }

    async fn adjust_reserved(&self, delta: i64) -> TapResult<()> {
        if let Some(sys) = self.buffer.lock().system.as_mut() {
            sys.reserved_supply += delta;
        }
        Ok(())
    }

    async fn adjust_balance(&self, user_id: UserId, delta: i64) -> TapResult<()> {
        if let Some(slot) = self.buffer.lock().users.get_mut(&user_id) {
            slot.account.balance += delta;
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
        if let Some(slot) = self.buffer.lock().users.get_mut(&user_id) {
            slot.account.boost = boost;
            slot.account.energy = energy;
            slot.account.energy_updated_at = now;
            slot.pending.override_energy(energy, now);
        }
        Ok(())
    }

    async fn add_daily_extra_quota(&self, user_id: UserId, day: NaiveDate, amount: i64) -> TapResult<()> {
        if let Some(slot) = self.buffer.lock().users.get_mut(&user_id) {
            if slot.day == day {
                slot.daily_extra += amount;
            }
        }
        Ok(())
    }

    async fn quarantine(&self, user_id: UserId) -> TapResult<Option<String>> {
        let buf = self.buffer.lock();
        Ok(buf.users.get(&user_id).and_then(|s| s.quarantine.clone()))
    }

    /// The held delta is retried on the next flush.
    async fn release_quarantine(&self, user_id: UserId) -> TapResult<bool> {
        let released = self
            .buffer
            .lock()
            .users
            .get_mut(&user_id)
            .and_then(|s| s.quarantine.take());
        if let Some(reason) = &released {
            tracing::info!(user_id, %reason, "quarantine released");
        }
        Ok(released.is_some())
    }

    async fn stats(&self) -> EngineStats {
        let buf = self.buffer.lock();
        let mut stats = EngineStats::empty(EngineMode::LocalBuffered);
        stats.cached_users = buf.users.len();
        stats.pending_users = buf.users.values().filter(|s| !s.is_idle()).count();
        stats.pending_coins = buf.users.values().map(UserSlot::unflushed_coins).sum();
        stats.oldest_pending_ms = buf
            .users
            .values()
            .filter_map(UserSlot::oldest_pending)
            .max()
            .map(|d| d.as_millis() as u64);
        let held = buf.users.values().filter(|s| s.quarantine.is_some());
        for slot in held {
            stats.quarantined_users += 1;
            stats.quarantined_coins += slot.unflushed_coins();
        }
        stats.flushes = buf.flushes;
        stats.flush_failures = buf.flush_failures;
        stats.last_flush_at = buf.last_flush_at;
        stats.last_error = buf.last_error.clone();
        stats
    }
}
