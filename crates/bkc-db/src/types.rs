use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use bkc_econ::{coins_per_usd, EnergyBoost, UserId};

/// Genesis parameters for the single system reserve row.
#[derive(Debug, Clone, PartialEq)]
pub struct Genesis {
    pub total_supply: i64,
    pub admin_id: UserId,
    pub admin_allocation_pct: i64,
    pub start_rate: i64,
    pub min_rate: i64,
    pub admin_energy_max: f64,
}

impl Genesis {
    pub fn admin_allocated(&self) -> i64 {
        self.total_supply.saturating_mul(self.admin_allocation_pct) / 100
    }

    pub fn initial_reserve(&self) -> i64 {
        self.total_supply - self.admin_allocated()
    }
}

/// The system reserve row. `reserve_supply` is the mint pool;
/// `reserved_supply` is the part of it earmarked for pending deposits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemReserve {
    pub total_supply: i64,
    pub reserve_supply: i64,
    pub reserved_supply: i64,
    pub initial_reserve: i64,
    pub start_rate: i64,
    pub min_rate: i64,
}

impl SystemReserve {
    /// Mintable right now: `reserve - reserved`, floored at 0.
    pub fn available(&self) -> i64 {
        self.reserve_supply
            .saturating_sub(self.reserved_supply)
            .max(0)
    }

    pub fn coins_per_usd(&self) -> i64 {
        coins_per_usd(
            self.reserve_supply,
            self.initial_reserve,
            self.start_rate,
            self.min_rate,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAccount {
    pub user_id: UserId,
    pub balance: i64,
    pub frozen_balance: i64,
    pub taps_total: i64,
    pub energy: f64,
    /// Base cap; boosts scale it at read time.
    pub energy_max: f64,
    pub energy_updated_at: DateTime<Utc>,
    pub boost: EnergyBoost,
    /// Highest tap event sequence applied from the stream.
    pub tap_seq: i64,
}

impl UserAccount {
    pub fn new(user_id: UserId, energy_max: f64, now: DateTime<Utc>) -> Self {
        Self {
            user_id,
            balance: 0,
            frozen_balance: 0,
            taps_total: 0,
            energy: energy_max,
            energy_max,
            energy_updated_at: now,
            boost: EnergyBoost::none(),
            tap_seq: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DailyQuota {
    pub user_id: UserId,
    pub day: NaiveDate,
    pub tapped: i64,
    pub extra_quota: i64,
}

impl DailyQuota {
    pub fn empty(user_id: UserId, day: NaiveDate) -> Self {
        Self {
            user_id,
            day,
            tapped: 0,
            extra_quota: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerKind {
    GenesisAdmin,
    Tap,
    Transfer,
    AdminReserveSend,
    BuyEnergyBoost,
    BuyTapPack,
    DepositReserve,
    DepositReject,
    Deposit,
}

impl LedgerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            LedgerKind::GenesisAdmin => "genesis_admin",
            LedgerKind::Tap => "tap",
            LedgerKind::Transfer => "transfer",
            LedgerKind::AdminReserveSend => "admin_reserve_send",
            LedgerKind::BuyEnergyBoost => "buy_energy_boost",
            LedgerKind::BuyTapPack => "buy_tap_pack",
            LedgerKind::DepositReserve => "deposit_reserve",
            LedgerKind::DepositReject => "deposit_reject",
            LedgerKind::Deposit => "deposit",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "genesis_admin" => Some(LedgerKind::GenesisAdmin),
            "tap" => Some(LedgerKind::Tap),
            "transfer" => Some(LedgerKind::Transfer),
            "admin_reserve_send" => Some(LedgerKind::AdminReserveSend),
            "buy_energy_boost" => Some(LedgerKind::BuyEnergyBoost),
            "buy_tap_pack" => Some(LedgerKind::BuyTapPack),
            "deposit_reserve" => Some(LedgerKind::DepositReserve),
            "deposit_reject" => Some(LedgerKind::DepositReject),
            "deposit" => Some(LedgerKind::Deposit),
            _ => None,
        }
    }
}

/// Append-only ledger row. `from_id`/`to_id` are `None` for the reserve side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub id: i64,
    pub kind: LedgerKind,
    pub from_id: Option<UserId>,
    pub to_id: Option<UserId>,
    pub amount: i64,
    pub meta: Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewLedgerEntry {
    pub kind: LedgerKind,
    pub from_id: Option<UserId>,
    pub to_id: Option<UserId>,
    pub amount: i64,
    pub meta: Value,
}

/// A buffered engine's accumulated taps for one user, in durable form.
#[derive(Debug, Clone, PartialEq)]
pub struct TapDelta {
    pub gained: i64,
    /// Sum of requested counts, for the ledger meta.
    pub requested: i64,
    /// Number of tap calls folded in (zero-grant taps included).
    pub taps: i64,
    /// Granted coins per quota day.
    pub daily: BTreeMap<NaiveDate, i64>,
    pub energy_after: f64,
    pub energy_at: DateTime<Utc>,
}

/// One committed tap, as published on the distributed stream.
/// `(user_id, seq)` is the idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TapEvent {
    pub user_id: UserId,
    pub seq: i64,
    pub requested: i64,
    pub granted: i64,
    pub day: NaiveDate,
    pub energy_after: f64,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventApplyReport {
    pub applied: usize,
    pub duplicates: usize,
    pub gained: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BoostPurchase {
    pub price: i64,
    pub boost: EnergyBoost,
    pub at: DateTime<Utc>,
}
