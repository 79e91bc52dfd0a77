use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Numeric end-user identity. Authentication happens upstream.
pub type UserId = i64;

/// Why a tap granted what it did.
///
/// Zero-grant reasons are evaluated in a fixed priority order; see
/// [`crate::plan_tap`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TapReason {
    Ok,
    DailyLimit,
    ReserveEmpty,
    NoEnergy,
    Zero,
}

impl TapReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            TapReason::Ok => "ok",
            TapReason::DailyLimit => "daily_limit",
            TapReason::ReserveEmpty => "reserve_empty",
            TapReason::NoEnergy => "no_energy",
            TapReason::Zero => "zero",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ok" => Some(TapReason::Ok),
            "daily_limit" => Some(TapReason::DailyLimit),
            "reserve_empty" => Some(TapReason::ReserveEmpty),
            "no_energy" => Some(TapReason::NoEnergy),
            "zero" => Some(TapReason::Zero),
            _ => None,
        }
    }
}

impl fmt::Display for TapReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tap-path parameters. Identical across engine modes.
#[derive(Clone, Debug, PartialEq)]
pub struct TapParams {
    /// Base energy cap assigned to new users.
    pub energy_max: f64,
    /// Base regeneration in energy units per second.
    pub energy_regen_per_sec: f64,
    /// Base per-day tap quota. `<= 0` means unlimited.
    pub daily_limit: i64,
    /// Upper bound on the requested count of a single call. `<= 0` disables the cap.
    pub max_per_request: i64,
}

impl TapParams {
    pub fn daily_limited(&self) -> bool {
        self.daily_limit > 0
    }
}

/// Energy boost window attached to a user.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct EnergyBoost {
    pub until: Option<DateTime<Utc>>,
    pub regen_multiplier: f64,
    pub max_multiplier: f64,
}

impl EnergyBoost {
    pub fn none() -> Self {
        Self {
            until: None,
            regen_multiplier: 1.0,
            max_multiplier: 1.0,
        }
    }

    /// Strictly before `until`; the boost is gone at the boundary instant.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        matches!(self.until, Some(until) if now < until)
    }
}

impl Default for EnergyBoost {
    fn default() -> Self {
        Self::none()
    }
}

/// Shop catalog prices and effects.
#[derive(Clone, Debug, PartialEq)]
pub struct ShopParams {
    pub energy_boost_price: i64,
    pub energy_boost_duration_secs: i64,
    pub energy_boost_regen_multiplier: f64,
    pub energy_boost_max_multiplier: f64,
    pub tap_pack_price: i64,
    pub tap_pack_size: i64,
}

/// Result of one tap, returned by every engine mode.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TapOutcome {
    pub granted: i64,
    pub reason: TapReason,
    pub energy: f64,
    pub energy_max: f64,
    pub daily_tapped: i64,
    pub daily_extra_quota: i64,
    /// `None` when the daily limit is disabled.
    pub daily_remaining: Option<i64>,
}
