//! Request and response types for the bkc-daemon HTTP endpoints.
//!
//! No business logic lives here.

use serde::{Deserialize, Serialize};

use bkc_db::{DailyQuota, LedgerEntry};
use bkc_econ::{TapOutcome, TapReason, UserId};
use bkc_tap::{EngineStats, FlushReport, StateSnapshot};

// ---------------------------------------------------------------------------
// Common
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OkResponse {
    pub ok: bool,
}

/// Body of every non-2xx response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserRequest {
    pub user_id: UserId,
}

// ---------------------------------------------------------------------------
// GET /v1/health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    pub ok: bool,
    pub service: &'static str,
    pub version: &'static str,
    pub uptime_secs: u64,
    pub storage: &'static str,
    pub engine: EngineStats,
}

// ---------------------------------------------------------------------------
// POST /v1/state
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct StateResponse {
    pub ok: bool,
    pub mode: &'static str,
    #[serde(flatten)]
    pub state: StateSnapshot,
}

// ---------------------------------------------------------------------------
// POST /v1/tap
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TapRequest {
    pub user_id: UserId,
    /// Missing or non-positive counts as one tap.
    #[serde(default)]
    pub count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TapResponse {
    pub ok: bool,
    pub mode: &'static str,
    pub granted: i64,
    pub reason: TapReason,
    /// Whole units, as a client would display them.
    pub energy: i64,
    pub energy_max: i64,
    pub daily_tapped: i64,
    pub daily_extra_quota: i64,
    pub daily_remaining: Option<i64>,
}

impl TapResponse {
    pub fn new(mode: &'static str, out: TapOutcome) -> Self {
        Self {
            ok: true,
            mode,
            granted: out.granted,
            reason: out.reason,
            energy: out.energy.floor() as i64,
            energy_max: out.energy_max.floor() as i64,
            daily_tapped: out.daily_tapped,
            daily_extra_quota: out.daily_extra_quota,
            daily_remaining: out.daily_remaining,
        }
    }
}

// ---------------------------------------------------------------------------
// POST /v1/flush
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct FlushResponse {
    pub ok: bool,
    #[serde(flatten)]
    pub report: FlushReport,
}

// ---------------------------------------------------------------------------
// POST /v1/transfer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct TransferRequest {
    pub from_id: UserId,
    pub to_id: UserId,
    pub amount: i64,
}

// ---------------------------------------------------------------------------
// POST /v1/buy
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShopItem {
    EnergyBoost,
    TapPack,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BuyRequest {
    pub user_id: UserId,
    pub item: ShopItem,
}

#[derive(Debug, Clone, Serialize)]
pub struct BuyResponse {
    pub ok: bool,
    pub item: ShopItem,
    pub price: i64,
    /// Set for tap packs.
    pub quota: Option<DailyQuota>,
    pub state: StateSnapshot,
}

// ---------------------------------------------------------------------------
// POST /v1/ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerRequest {
    pub user_id: UserId,
    #[serde(default)]
    pub limit: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LedgerResponse {
    pub ok: bool,
    pub entries: Vec<LedgerEntry>,
}

// ---------------------------------------------------------------------------
// /v1/admin/*
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Deserialize)]
pub struct AdminSendRequest {
    pub to_id: UserId,
    pub amount: i64,
    #[serde(default)]
    pub note: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositRequest {
    pub user_id: UserId,
    pub amount: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReleaseResponse {
    pub ok: bool,
    /// False when the user was not quarantined.
    pub released: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DepositSettleRequest {
    pub user_id: UserId,
    pub amount: i64,
    pub approve: bool,
}
