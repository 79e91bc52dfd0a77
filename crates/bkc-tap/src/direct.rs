use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};

use bkc_db::LedgerStore;
use bkc_econ::{utc_day, EnergyBoost, TapOutcome, TapParams, UserId};

use crate::engine::{build_snapshot, SnapshotParts};
use crate::{EngineMode, EngineStats, FlushReport, SettleGuard, StateSnapshot, TapEngine, TapResult};

/// Every tap is its own durable transaction. Nothing is buffered, so flush
/// and the side-channel are no-ops.
pub struct DirectEngine {
    store: Arc<dyn LedgerStore>,
    params: TapParams,
}

impl DirectEngine {
    pub fn new(store: Arc<dyn LedgerStore>, params: TapParams) -> Self {
        Self { store, params }
    }
}

#[async_trait]
impl TapEngine for DirectEngine {
    fn mode(&self) -> EngineMode {
        EngineMode::Direct
    }

    fn params(&self) -> &TapParams {
        &self.params
    }

    async fn tap(&self, user_id: UserId, requested: i64, now: DateTime<Utc>) -> TapResult<TapOutcome> {
        self.store
            .ensure_user(user_id, self.params.energy_max, now)
            .await?;
        let out = self
            .store
            .apply_tap(user_id, requested, now, &self.params)
            .await?;
        tracing::debug!(user_id, granted = out.granted, reason = %out.reason, "direct tap");
        Ok(out)
    }

    async fn snapshot(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<StateSnapshot> {
        let sys = self.store.system().await?;
        let user = self
            .store
            .ensure_user(user_id, self.params.energy_max, now)
            .await?;
        let daily = self.store.daily(user_id, utc_day(now)).await?;
        Ok(build_snapshot(
            &self.params,
            SnapshotParts {
                sys: &sys,
                user: &user,
                daily_tapped: daily.tapped,
                daily_extra: daily.extra_quota,
                pending: false,
            },
            now,
        ))
    }

    async fn flush(&self) -> TapResult<FlushReport> {
        Ok(FlushReport::default())
    }

    async fn settle(&self) -> TapResult<SettleGuard> {
        Ok(SettleGuard::none())
    }

    async fn adjust_reserve(&self, _delta: i64) -> TapResult<()> {
        Ok(())
    }

    async fn adjust_reserved(&self, _delta: i64) -> TapResult<()> {
        Ok(())
    }

    async fn adjust_balance(&self, _user_id: UserId, _delta: i64) -> TapResult<()> {
        Ok(())
    }

    async fn apply_energy_boost(
        &self,
        _user_id: UserId,
        _boost: EnergyBoost,
        _energy: f64,
        _now: DateTime<Utc>,
    ) -> TapResult<()> {
        Ok(())
    }

    async fn add_daily_extra_quota(&self, _user_id: UserId, _day: NaiveDate, _amount: i64) -> TapResult<()> {
        Ok(())
    }

    async fn stats(&self) -> EngineStats {
        EngineStats::empty(EngineMode::Direct)
    }
}
