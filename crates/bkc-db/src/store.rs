use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use serde_json::Value;

use bkc_econ::{TapOutcome, TapParams, UserId};

use crate::{
    BoostPurchase, DailyQuota, EventApplyReport, Genesis, LedgerEntry, LedgerKind, StoreResult,
    SystemReserve, TapDelta, TapEvent, UserAccount,
};

/// The durable store of balances, daily counters, the system reserve, and the
/// append-only ledger.
///
/// Every write method is one atomic transaction. Locks are always taken in the
/// order system reserve, then users by ascending id, then daily rows, so
/// concurrent writers cannot deadlock each other.
#[async_trait]
pub trait LedgerStore: Send + Sync + 'static {
    /// Create the reserve row and credit the admin premine, once. Later calls
    /// return the existing row untouched.
    async fn ensure_genesis(&self, genesis: &Genesis) -> StoreResult<SystemReserve>;

    async fn system(&self) -> StoreResult<SystemReserve>;

    /// Idempotent upsert; new users start with full energy.
    async fn ensure_user(
        &self,
        user_id: UserId,
        energy_max: f64,
        now: DateTime<Utc>,
    ) -> StoreResult<UserAccount>;

    async fn user(&self, user_id: UserId) -> StoreResult<Option<UserAccount>>;

    /// Today's row, or an all-zero row if none exists yet.
    async fn daily(&self, user_id: UserId, day: NaiveDate) -> StoreResult<DailyQuota>;

    /// The direct tap: plan and apply one tap under row locks.
    async fn apply_tap(
        &self,
        user_id: UserId,
        requested: i64,
        now: DateTime<Utc>,
        params: &TapParams,
    ) -> StoreResult<TapOutcome>;

    /// Fold a buffered engine's accumulated delta for one user.
    async fn flush_tap_delta(&self, user_id: UserId, delta: &TapDelta) -> StoreResult<()>;

    /// Apply stream events for one user. Events whose `(user_id, seq)` was
    /// already applied are skipped and counted as duplicates.
    async fn apply_tap_events(
        &self,
        user_id: UserId,
        events: &[TapEvent],
    ) -> StoreResult<EventApplyReport>;

    async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> StoreResult<()>;

    /// Debit the price into the reserve and start the boost window.
    async fn buy_energy_boost(
        &self,
        user_id: UserId,
        purchase: &BoostPurchase,
    ) -> StoreResult<UserAccount>;

    /// Debit the price into the reserve and extend the day's quota.
    async fn buy_tap_pack(
        &self,
        user_id: UserId,
        price: i64,
        pack_size: i64,
        day: NaiveDate,
    ) -> StoreResult<DailyQuota>;

    /// Pay `amount` out of the unearmarked reserve to a user.
    async fn credit_from_reserve(
        &self,
        user_id: UserId,
        amount: i64,
        kind: LedgerKind,
        meta: Value,
    ) -> StoreResult<()>;

    /// Earmark reserve for a pending deposit.
    async fn reserve_for_deposit(&self, user_id: UserId, amount: i64) -> StoreResult<()>;

    /// Approve (pay the earmark to the user) or reject (release it).
    async fn settle_deposit(&self, user_id: UserId, amount: i64, approve: bool) -> StoreResult<()>;

    /// Newest first.
    async fn ledger_for_user(&self, user_id: UserId, limit: i64) -> StoreResult<Vec<LedgerEntry>>;

    async fn ledger_sum(&self, kind: LedgerKind) -> StoreResult<i64>;

    /// Sum of all balances including frozen ones.
    async fn circulating_supply(&self) -> StoreResult<i64>;
}
