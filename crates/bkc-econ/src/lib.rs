//! bkc-econ
//!
//! Tap economy primitives:
//! - reserve-indexed exchange rate (`coins_per_usd`)
//! - energy regeneration with boost windows
//! - daily quota accounting
//! - the tap planner shared by every engine mode
//!
//! Deterministic, pure logic. No IO and no clock reads: callers pass `now`.

mod energy;
mod planner;
mod quota;
mod rate;
mod types;

pub use energy::{effective_params, regen, EffectiveEnergy};
pub use planner::{normalize_requested, plan_tap, TapInput, TapPlan};
pub use quota::{remaining, remaining_or_unlimited, utc_day, UNLIMITED};
pub use rate::coins_per_usd;
pub use types::*;
