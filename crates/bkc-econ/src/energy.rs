use chrono::{DateTime, Utc};

use crate::EnergyBoost;

/// Energy cap and regen rate after applying any active boost.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct EffectiveEnergy {
    pub max: f64,
    pub regen_per_sec: f64,
}

/// Apply `boost` to the base parameters when it is active at `now`.
/// Both outputs are floored at zero.
pub fn effective_params(
    base_max: f64,
    base_regen_per_sec: f64,
    boost: &EnergyBoost,
    now: DateTime<Utc>,
) -> EffectiveEnergy {
    let (mut max, mut regen_per_sec) = (base_max, base_regen_per_sec);
    if boost.is_active(now) {
        max *= boost.max_multiplier;
        regen_per_sec *= boost.regen_multiplier;
    }
    EffectiveEnergy {
        max: max.max(0.0),
        regen_per_sec: regen_per_sec.max(0.0),
    }
}

/// Energy at `now`, regenerated linearly since `updated_at` and capped at `max`.
///
/// A non-positive `max` yields 0. A clock that moved backwards regenerates
/// nothing; the stored value is only re-capped.
pub fn regen(
    current: f64,
    max: f64,
    regen_per_sec: f64,
    updated_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> f64 {
    if !(max > 0.0) {
        return 0.0;
    }
    let current = if current.is_finite() { current.max(0.0) } else { 0.0 };
    if now <= updated_at {
        return current.min(max);
    }
    let elapsed = (now - updated_at)
        .to_std()
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0);
    (current + elapsed * regen_per_sec.max(0.0)).min(max)
}
