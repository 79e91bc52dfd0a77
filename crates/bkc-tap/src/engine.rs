use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio::sync::{OwnedMutexGuard, OwnedRwLockReadGuard, OwnedRwLockWriteGuard};

use bkc_db::{SystemReserve, UserAccount};
use bkc_econ::{effective_params, regen, remaining, EnergyBoost, TapOutcome, TapParams, UserId};

use crate::shared::StreamStats;
use crate::TapResult;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineMode {
    Direct,
    LocalBuffered,
    DistributedBuffered,
}

impl EngineMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineMode::Direct => "direct",
            EngineMode::LocalBuffered => "local",
            EngineMode::DistributedBuffered => "distributed",
        }
    }

    /// Whether taps can be acknowledged before they are durable.
    pub fn is_buffered(&self) -> bool {
        !matches!(self, EngineMode::Direct)
    }
}

/// User-facing state, served from the freshest view the engine has.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct StateSnapshot {
    pub user_id: UserId,
    pub balance: i64,
    pub frozen_balance: i64,
    pub taps_total: i64,
    pub energy: f64,
    pub energy_max: f64,
    pub coins_per_usd: i64,
    pub reserve_supply: i64,
    pub reserved_supply: i64,
    pub daily_limit: i64,
    pub daily_tapped: i64,
    pub daily_extra_quota: i64,
    pub daily_remaining: Option<i64>,
    /// Taps for this user are acknowledged but not yet durable.
    pub pending: bool,
}

pub(crate) struct SnapshotParts<'a> {
    pub sys: &'a SystemReserve,
    pub user: &'a UserAccount,
    pub daily_tapped: i64,
    pub daily_extra: i64,
    pub pending: bool,
}

/// Build a snapshot with energy regenerated up to `now` (read only, nothing stored).
pub(crate) fn build_snapshot(
    params: &TapParams,
    parts: SnapshotParts<'_>,
    now: DateTime<Utc>,
) -> StateSnapshot {
    let user = parts.user;
    let eff = effective_params(user.energy_max, params.energy_regen_per_sec, &user.boost, now);
    StateSnapshot {
        user_id: user.user_id,
        balance: user.balance,
        frozen_balance: user.frozen_balance,
        taps_total: user.taps_total,
        energy: regen(user.energy, eff.max, eff.regen_per_sec, user.energy_updated_at, now),
        energy_max: eff.max,
        coins_per_usd: parts.sys.coins_per_usd(),
        reserve_supply: parts.sys.reserve_supply,
        reserved_supply: parts.sys.reserved_supply,
        daily_limit: params.daily_limit,
        daily_tapped: parts.daily_tapped,
        daily_extra_quota: parts.daily_extra,
        daily_remaining: params
            .daily_limited()
            .then(|| remaining(params.daily_limit, parts.daily_extra, parts.daily_tapped)),
        pending: parts.pending,
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Users whose delta became durable.
    pub users: usize,
    pub coins: i64,
    /// Stream events applied.
    pub events: usize,
    /// Stream events skipped as already applied.
    pub duplicates: usize,
    /// Users set aside this round because the store rejected their taps.
    pub quarantined: usize,
}

impl FlushReport {
    pub fn absorb(&mut self, other: FlushReport) {
        self.users += other.users;
        self.coins += other.coins;
        self.events += other.events;
        self.duplicates += other.duplicates;
        self.quarantined += other.quarantined;
    }

    pub fn is_empty(&self) -> bool {
        *self == FlushReport::default()
    }
}

#[derive(Clone, Debug, Serialize)]
pub struct EngineStats {
    pub mode: EngineMode,
    pub cached_users: usize,
    pub pending_users: usize,
    pub pending_coins: i64,
    /// Age of the oldest acknowledged tap that is not durable yet.
    pub oldest_pending_ms: Option<u64>,
    /// Users whose taps the store rejected; they cannot tap until released.
    pub quarantined_users: usize,
    pub quarantined_coins: i64,
    pub flushes: u64,
    pub flush_failures: u64,
    pub last_flush_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub stream: Option<StreamStats>,
}

impl EngineStats {
    pub fn empty(mode: EngineMode) -> Self {
        Self {
            mode,
            cached_users: 0,
            pending_users: 0,
            pending_coins: 0,
            oldest_pending_ms: None,
            quarantined_users: 0,
            quarantined_coins: 0,
            flushes: 0,
            flush_failures: 0,
            last_flush_at: None,
            last_error: None,
            stream: None,
        }
    }
}

/// Returned by [`TapEngine::settle`]. While it is held the engine neither
/// flushes nor loads cold state from the durable store, and the local engine
/// also holds off taps. A side operation can commit its durable write and
/// then adjust the cached view without a concurrent load receiving the
/// adjustment twice or a tap planning against the pre-write reserve.
pub struct SettleGuard {
    _quiet: Option<OwnedRwLockWriteGuard<()>>,
    _loads: Option<OwnedRwLockReadGuard<()>>,
    _flush: Option<OwnedMutexGuard<()>>,
}

impl SettleGuard {
    pub fn none() -> Self {
        Self {
            _quiet: None,
            _loads: None,
            _flush: None,
        }
    }

    /// Loads and flushes are held off; taps keep running.
    pub(crate) fn held(loads: OwnedRwLockReadGuard<()>, flush: OwnedMutexGuard<()>) -> Self {
        Self {
            _quiet: None,
            _loads: Some(loads),
            _flush: Some(flush),
        }
    }

    /// Taps, loads and flushes are all held off.
    pub(crate) fn quiesced(quiet: OwnedRwLockWriteGuard<()>, flush: OwnedMutexGuard<()>) -> Self {
        Self {
            _quiet: Some(quiet),
            _loads: None,
            _flush: Some(flush),
        }
    }

    pub fn is_held(&self) -> bool {
        self._flush.is_some()
    }

    pub fn holds_taps(&self) -> bool {
        self._quiet.is_some()
    }
}

/// One tap accumulation strategy. All modes produce identical tap results for
/// identical inputs; they differ only in when results become durable.
#[async_trait]
pub trait TapEngine: Send + Sync {
    fn mode(&self) -> EngineMode;

    fn params(&self) -> &TapParams;

    /// `requested` must already be normalized by the caller.
    async fn tap(&self, user_id: UserId, requested: i64, now: DateTime<Utc>) -> TapResult<TapOutcome>;

    async fn snapshot(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<StateSnapshot>;

    /// Make every acknowledged tap durable. Safe to call concurrently and
    /// repeatedly; a no-op when nothing is pending.
    async fn flush(&self) -> TapResult<FlushReport>;

    /// Flush, then keep the engine quiet until the guard drops.
    async fn settle(&self) -> TapResult<SettleGuard>;

    // Side-channel: keep a cached view in step with a committed durable write.
    // A no-op for whatever the engine has not cached.

    async fn adjust_reserve(&self, delta: i64) -> TapResult<()>;

    async fn adjust_reserved(&self, delta: i64) -> TapResult<()>;

    async fn adjust_balance(&self, user_id: UserId, delta: i64) -> TapResult<()>;

    async fn apply_energy_boost(
        &self,
        user_id: UserId,
        boost: EnergyBoost,
        energy: f64,
        now: DateTime<Utc>,
    ) -> TapResult<()>;

    async fn add_daily_extra_quota(&self, user_id: UserId, day: NaiveDate, amount: i64) -> TapResult<()>;

    /// Why the user's taps are held back, if the store rejected them.
    async fn quarantine(&self, _user_id: UserId) -> TapResult<Option<String>> {
        Ok(None)
    }

    /// Let a quarantined user tap again. Returns whether anything was held.
    async fn release_quarantine(&self, _user_id: UserId) -> TapResult<bool> {
        Ok(false)
    }

    async fn stats(&self) -> EngineStats;
}
