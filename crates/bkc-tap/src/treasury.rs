//! Ledger-moving operations outside the tap path.
//!
//! Each one passes the [`ConsistencyGate`], commits one durable transaction,
//! then mirrors its reserve and balance movement into the engine's cached
//! view while the gate pass is still held.
//!
//! A write that shrinks the mintable reserve takes the coins out of the
//! cached view first and puts them back if the write fails. Coins the write
//! returns to the reserve are mirrored only after it commits. Either way a
//! tap running alongside, on this node or another, plans against no more
//! than the durable reserve holds.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde_json::json;

use bkc_db::{
    BoostPurchase, DailyQuota, LedgerEntry, LedgerKind, LedgerStore, StoreError, StoreResult,
    UserAccount,
};
use bkc_econ::{utc_day, EnergyBoost, ShopParams, UserId};

use crate::{ConsistencyGate, GatePass, TapEngine, TapError, TapResult};

pub struct Treasury {
    store: Arc<dyn LedgerStore>,
    engine: Arc<dyn TapEngine>,
    gate: ConsistencyGate,
    shop: ShopParams,
}

/// Log a side-channel failure. The durable write already committed, so the
/// caller still succeeds; the cached view catches up on its next load.
fn mirrored(what: &'static str, result: TapResult<()>) {
    if let Err(e) = result {
        tracing::error!(op = what, error = %e, "engine side-channel adjustment failed; cached view may drift");
    }
}

/// Movement of the cached available reserve made ahead of a durable write.
#[derive(Clone, Copy, Debug)]
enum Hold {
    /// Coins leaving the reserve.
    Reserve(i64),
    /// Coins being earmarked.
    Earmark(i64),
}

impl Treasury {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        engine: Arc<dyn TapEngine>,
        gate: ConsistencyGate,
        shop: ShopParams,
    ) -> Self {
        Self {
            store,
            engine,
            gate,
            shop,
        }
    }

    pub fn shop(&self) -> &ShopParams {
        &self.shop
    }

    /// Pass the gate, then refuse if any of `users` is quarantined.
    async fn enter(&self, users: &[UserId]) -> TapResult<GatePass> {
        let pass = self.gate.enter().await?;
        for &user_id in users {
            if let Some(reason) = self.engine.quarantine(user_id).await? {
                tracing::warn!(user_id, %reason, "refusing ledger operation for a quarantined user");
                return Err(TapError::Quarantined { user_id, reason });
            }
        }
        Ok(pass)
    }

    async fn apply_hold(&self, hold: Hold, sign: i64) -> TapResult<()> {
        match hold {
            Hold::Reserve(n) => self.engine.adjust_reserve(-sign * n).await,
            Hold::Earmark(n) => self.engine.adjust_reserved(sign * n).await,
        }
    }

    /// Apply `hold` to the cached view, run `commit`, and undo the hold if
    /// the commit fails.
    async fn held<T>(
        &self,
        what: &'static str,
        hold: Hold,
        commit: impl Future<Output = StoreResult<T>>,
    ) -> TapResult<T> {
        self.apply_hold(hold, 1).await?;
        match commit.await {
            Ok(v) => Ok(v),
            Err(e) => {
                mirrored(what, self.apply_hold(hold, -1).await);
                Err(e.into())
            }
        }
    }

    pub async fn transfer(&self, from: UserId, to: UserId, amount: i64) -> TapResult<()> {
        let _pass = self.enter(&[from, to]).await?;
        self.store.transfer(from, to, amount).await?;
        mirrored("transfer", self.engine.adjust_balance(from, -amount).await);
        mirrored("transfer", self.engine.adjust_balance(to, amount).await);
        tracing::info!(from, to, amount, "transfer");
        Ok(())
    }

    pub async fn buy_energy_boost(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<UserAccount> {
        let _pass = self.enter(&[user_id]).await?;
        let shop = &self.shop;
        let purchase = BoostPurchase {
            price: shop.energy_boost_price,
            boost: EnergyBoost {
                until: Some(now + Duration::seconds(shop.energy_boost_duration_secs)),
                regen_multiplier: shop.energy_boost_regen_multiplier,
                max_multiplier: shop.energy_boost_max_multiplier,
            },
            at: now,
        };
        let account = self.store.buy_energy_boost(user_id, &purchase).await?;
        mirrored("buy_energy_boost", self.engine.adjust_balance(user_id, -purchase.price).await);
        mirrored("buy_energy_boost", self.engine.adjust_reserve(purchase.price).await);
        mirrored(
            "buy_energy_boost",
            self.engine
                .apply_energy_boost(user_id, account.boost, account.energy, now)
                .await,
        );
        tracing::info!(user_id, price = purchase.price, until = ?purchase.boost.until, "energy boost bought");
        Ok(account)
    }

    pub async fn buy_tap_pack(&self, user_id: UserId, now: DateTime<Utc>) -> TapResult<DailyQuota> {
        let _pass = self.enter(&[user_id]).await?;
        let day = utc_day(now);
        let (price, size) = (self.shop.tap_pack_price, self.shop.tap_pack_size);
        let quota = self.store.buy_tap_pack(user_id, price, size, day).await?;
        mirrored("buy_tap_pack", self.engine.adjust_balance(user_id, -price).await);
        mirrored("buy_tap_pack", self.engine.adjust_reserve(price).await);
        mirrored("buy_tap_pack", self.engine.add_daily_extra_quota(user_id, day, size).await);
        tracing::info!(user_id, price, extra_quota = quota.extra_quota, "tap pack bought");
        Ok(quota)
    }

    /// Admin payout from the unearmarked reserve.
    pub async fn admin_reserve_send(&self, to: UserId, amount: i64, note: Option<String>) -> TapResult<()> {
        let _pass = self.enter(&[to]).await?;
        let commit = self.store.credit_from_reserve(
            to,
            amount,
            LedgerKind::AdminReserveSend,
            json!({ "note": note }),
        );
        self.held("admin_reserve_send", Hold::Reserve(amount), commit).await?;
        mirrored("admin_reserve_send", self.engine.adjust_balance(to, amount).await);
        tracing::info!(to, amount, "reserve sent");
        Ok(())
    }

    pub async fn reserve_deposit(&self, user_id: UserId, amount: i64) -> TapResult<()> {
        let _pass = self.enter(&[user_id]).await?;
        let commit = self.store.reserve_for_deposit(user_id, amount);
        self.held("reserve_deposit", Hold::Earmark(amount), commit).await?;
        tracing::info!(user_id, amount, "deposit earmarked");
        Ok(())
    }

    pub async fn settle_deposit(&self, user_id: UserId, amount: i64, approve: bool) -> TapResult<()> {
        let _pass = self.enter(&[user_id]).await?;
        let commit = self.store.settle_deposit(user_id, amount, approve);
        if approve {
            self.held("settle_deposit", Hold::Reserve(amount), commit).await?;
        } else {
            commit.await?;
        }
        // The earmark is released only after the reserve debit is durable.
        mirrored("settle_deposit", self.engine.adjust_reserved(-amount).await);
        if approve {
            mirrored("settle_deposit", self.engine.adjust_balance(user_id, amount).await);
        }
        tracing::info!(user_id, amount, approve, "deposit settled");
        Ok(())
    }

    /// Newest first, after pending taps are durable.
    pub async fn history(&self, user_id: UserId, limit: i64) -> TapResult<Vec<LedgerEntry>> {
        let _pass = self.gate.enter().await?;
        if limit <= 0 {
            return Err(StoreError::Invalid(format!("limit must be positive, got {limit}")).into());
        }
        Ok(self.store.ledger_for_user(user_id, limit.min(500)).await?)
    }
}
