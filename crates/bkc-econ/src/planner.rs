use chrono::{DateTime, Utc};

use crate::energy::{effective_params, regen};
use crate::quota::{remaining, remaining_or_unlimited};
use crate::{EnergyBoost, TapOutcome, TapParams, TapReason};

/// Everything a tap needs to know about the world, as loaded by an engine.
#[derive(Clone, Debug, PartialEq)]
pub struct TapInput {
    pub requested: i64,
    pub now: DateTime<Utc>,
    pub reserve_supply: i64,
    pub reserved_supply: i64,
    pub energy: f64,
    /// The user's stored base cap, before boosts.
    pub energy_max: f64,
    pub energy_updated_at: DateTime<Utc>,
    pub boost: EnergyBoost,
    pub daily_tapped: i64,
    pub daily_extra: i64,
}

/// The state transition one tap produces.
///
/// Engines apply it verbatim: debit `granted` from the reserve, credit it to
/// the balance and the day's tapped counter, and store `energy_after` stamped
/// with the tap's `now`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct TapPlan {
    pub granted: i64,
    pub reason: TapReason,
    /// Energy after regeneration, before spending.
    pub energy_regen: f64,
    pub energy_after: f64,
    /// Effective cap at `now`.
    pub energy_max: f64,
    pub available_reserve: i64,
    pub daily_tapped_after: i64,
    pub daily_remaining_after: Option<i64>,
}

impl TapPlan {
    pub fn outcome(&self, daily_extra: i64) -> TapOutcome {
        TapOutcome {
            granted: self.granted,
            reason: self.reason,
            energy: self.energy_after,
            energy_max: self.energy_max,
            daily_tapped: self.daily_tapped_after,
            daily_extra_quota: daily_extra,
            daily_remaining: self.daily_remaining_after,
        }
    }
}

/// Clamp a raw request count: non-positive becomes 1, and anything above
/// `max_per_request` (when positive) is capped.
pub fn normalize_requested(raw: i64, max_per_request: i64) -> i64 {
    let n = if raw <= 0 { 1 } else { raw };
    if max_per_request > 0 {
        n.min(max_per_request)
    } else {
        n
    }
}

/// Compute one tap.
///
/// `granted = min(requested, floor(energy), remaining_daily, available_reserve)`,
/// floored at 0. A zero grant reports the first matching reason:
/// 1. `daily_limit`: a limit is set, today's quota is used up, energy exists.
/// 2. `reserve_empty`: nothing available, energy exists, quota remains.
/// 3. `no_energy`: less than one whole unit of energy.
/// 4. `zero`: anything else (e.g. a non-positive request).
pub fn plan_tap(params: &TapParams, input: &TapInput) -> TapPlan {
    let eff = effective_params(
        input.energy_max,
        params.energy_regen_per_sec,
        &input.boost,
        input.now,
    );
    let energy = regen(
        input.energy,
        eff.max,
        eff.regen_per_sec,
        input.energy_updated_at,
        input.now,
    );
    let mintable = (energy.floor() as i64).max(0);

    let limited = params.daily_limited();
    let remaining_daily =
        remaining_or_unlimited(params.daily_limit, input.daily_extra, input.daily_tapped);
    let available = input
        .reserve_supply
        .saturating_sub(input.reserved_supply)
        .max(0);

    let granted = input
        .requested
        .min(mintable)
        .min(remaining_daily)
        .min(available)
        .max(0);

    let reason = if granted > 0 {
        TapReason::Ok
    } else if limited && remaining_daily == 0 && mintable > 0 {
        TapReason::DailyLimit
    } else if available == 0 && mintable > 0 && remaining_daily > 0 {
        TapReason::ReserveEmpty
    } else if mintable <= 0 {
        TapReason::NoEnergy
    } else {
        TapReason::Zero
    };

    let daily_tapped_after = input.daily_tapped + granted;
    TapPlan {
        granted,
        reason,
        energy_regen: energy,
        energy_after: (energy - granted as f64).max(0.0),
        energy_max: eff.max,
        available_reserve: available,
        daily_tapped_after,
        daily_remaining_after: limited
            .then(|| remaining(params.daily_limit, input.daily_extra, daily_tapped_after)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};

    fn params(daily_limit: i64) -> TapParams {
        TapParams {
            energy_max: 1000.0,
            energy_regen_per_sec: 1.0,
            daily_limit,
            max_per_request: 50,
        }
    }

    fn input(now: DateTime<Utc>) -> TapInput {
        TapInput {
            requested: 10,
            now,
            reserve_supply: 1_000,
            reserved_supply: 0,
            energy: 500.0,
            energy_max: 1000.0,
            energy_updated_at: now,
            boost: EnergyBoost::none(),
            daily_tapped: 0,
            daily_extra: 0,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn grants_the_request_when_nothing_binds() {
        let plan = plan_tap(&params(0), &input(now()));
        assert_eq!(plan.granted, 10);
        assert_eq!(plan.reason, TapReason::Ok);
        assert_eq!(plan.energy_after, 490.0);
        assert_eq!(plan.daily_remaining_after, None);
    }

    #[test]
    fn disabled_limit_ignores_the_day_count() {
        let mut inp = input(now());
        inp.daily_tapped = 1_000_000;
        let plan = plan_tap(&params(0), &inp);
        assert_eq!(plan.granted, 10);
        assert_eq!(plan.reason, TapReason::Ok);
        assert_eq!(plan.daily_tapped_after, 1_000_010);
        assert_eq!(plan.daily_remaining_after, None);
    }

    #[test]
    fn exhausted_quota_reports_daily_limit() {
        let mut inp = input(now());
        inp.daily_tapped = 500;
        inp.energy = 10.0;
        inp.reserve_supply = 10;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 0);
        assert_eq!(plan.reason, TapReason::DailyLimit);
        assert_eq!(plan.daily_remaining_after, Some(0));
    }

    #[test]
    fn earmarked_reserve_is_not_mintable() {
        let mut inp = input(now());
        inp.reserve_supply = 100;
        inp.reserved_supply = 100;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 0);
        assert_eq!(plan.reason, TapReason::ReserveEmpty);
    }

    #[test]
    fn fractional_energy_is_no_energy() {
        let mut inp = input(now());
        inp.energy = 0.75;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 0);
        assert_eq!(plan.reason, TapReason::NoEnergy);
        assert_eq!(plan.energy_after, 0.75);
    }

    #[test]
    fn daily_limit_outranks_reserve_empty() {
        let mut inp = input(now());
        inp.reserve_supply = 0;
        inp.daily_tapped = 500;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.reason, TapReason::DailyLimit);
    }

    #[test]
    fn non_positive_request_is_zero() {
        let mut inp = input(now());
        inp.requested = 0;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 0);
        assert_eq!(plan.reason, TapReason::Zero);
    }

    #[test]
    fn partial_grant_by_quota_then_reserve() {
        let mut inp = input(now());
        inp.daily_tapped = 495;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 5);

        let mut inp = input(now());
        inp.reserve_supply = 3;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 3);
        assert_eq!(plan.available_reserve, 3);
    }

    #[test]
    fn regen_happens_before_spending() {
        let mut inp = input(now());
        inp.energy = 0.0;
        inp.energy_updated_at = now() - Duration::seconds(4);
        let plan = plan_tap(&params(0), &inp);
        assert_eq!(plan.energy_regen, 4.0);
        assert_eq!(plan.granted, 4);
        assert_eq!(plan.energy_after, 0.0);
    }

    #[test]
    fn extra_quota_extends_the_day() {
        let mut inp = input(now());
        inp.daily_tapped = 500;
        inp.daily_extra = 100;
        let plan = plan_tap(&params(500), &inp);
        assert_eq!(plan.granted, 10);
        assert_eq!(plan.daily_remaining_after, Some(90));
    }

    #[test]
    fn normalize_defaults_and_caps() {
        assert_eq!(normalize_requested(0, 50), 1);
        assert_eq!(normalize_requested(-3, 50), 1);
        assert_eq!(normalize_requested(80, 50), 50);
        assert_eq!(normalize_requested(80, 0), 80);
    }
}
