//! Row-level state transitions shared by every `LedgerStore` implementation.
//!
//! Callers load rows under their own locking discipline, mutate them through
//! these functions, and write them back only when every call succeeded.

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDate, Utc};
use serde_json::json;

use bkc_econ::{effective_params, EnergyBoost, TapInput, TapPlan};

use crate::{DailyQuota, StoreError, StoreResult, SystemReserve, TapDelta, TapEvent, UserAccount};

pub(crate) fn tap_input(
    sys: &SystemReserve,
    user: &UserAccount,
    daily: &DailyQuota,
    requested: i64,
    now: DateTime<Utc>,
) -> TapInput {
    TapInput {
        requested,
        now,
        reserve_supply: sys.reserve_supply,
        reserved_supply: sys.reserved_supply,
        energy: user.energy,
        energy_max: user.energy_max,
        energy_updated_at: user.energy_updated_at,
        boost: user.boost,
        daily_tapped: daily.tapped,
        daily_extra: daily.extra_quota,
    }
}

pub(crate) fn apply_tap_plan(
    sys: &mut SystemReserve,
    user: &mut UserAccount,
    daily: &mut DailyQuota,
    plan: &TapPlan,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    if plan.granted > 0 {
        mint_from_reserve(sys, plan.granted)?;
        user.balance = checked(user.balance.checked_add(plan.granted), "balance")?;
        user.taps_total += plan.granted;
        daily.tapped += plan.granted;
    }
    user.energy = plan.energy_after;
    user.energy_updated_at = now;
    Ok(())
}

/// Debit minted coins from the reserve. Unlike the planner's clamp, a mint
/// larger than the available reserve aborts.
pub(crate) fn mint_from_reserve(sys: &mut SystemReserve, amount: i64) -> StoreResult<()> {
    if amount < 0 {
        return Err(StoreError::Invariant(format!("negative mint {amount}")));
    }
    if amount > sys.available() {
        return Err(StoreError::Invariant(format!(
            "mint {amount} exceeds available reserve {}",
            sys.available()
        )));
    }
    sys.reserve_supply -= amount;
    Ok(())
}

pub(crate) fn fold_delta(
    sys: &mut SystemReserve,
    user: &mut UserAccount,
    delta: &TapDelta,
) -> StoreResult<()> {
    let per_day: i64 = delta.daily.values().sum();
    if per_day != delta.gained {
        return Err(StoreError::Invariant(format!(
            "delta for user {} grants {} but books {} across days",
            user.user_id, delta.gained, per_day
        )));
    }
    mint_from_reserve(sys, delta.gained)?;
    user.balance = checked(user.balance.checked_add(delta.gained), "balance")?;
    user.taps_total += delta.gained;
    user.energy = delta.energy_after;
    user.energy_updated_at = delta.energy_at;
    Ok(())
}

/// Aggregate of the not-yet-applied events of one batch.
#[derive(Debug, Default)]
pub(crate) struct EventFold {
    pub gained: i64,
    pub requested: i64,
    pub per_day: BTreeMap<NaiveDate, i64>,
    pub first_seq: Option<i64>,
    pub last_seq: Option<i64>,
}

/// Fold freshly inserted events into the user and system rows. Energy follows
/// the highest sequence seen so far so a redelivered old event cannot rewind it.
pub(crate) fn fold_events(
    sys: &mut SystemReserve,
    user: &mut UserAccount,
    fresh: &[TapEvent],
) -> StoreResult<EventFold> {
    let mut fold = EventFold::default();
    for ev in fresh {
        if ev.user_id != user.user_id {
            return Err(StoreError::Invalid(format!(
                "event for user {} in batch of user {}",
                ev.user_id, user.user_id
            )));
        }
        if ev.granted < 0 {
            return Err(StoreError::Invariant(format!("event seq {} grants {}", ev.seq, ev.granted)));
        }
        fold.gained += ev.granted;
        fold.requested += ev.requested;
        if ev.granted > 0 {
            *fold.per_day.entry(ev.day).or_insert(0) += ev.granted;
        }
        fold.first_seq = Some(fold.first_seq.map_or(ev.seq, |s| s.min(ev.seq)));
        fold.last_seq = Some(fold.last_seq.map_or(ev.seq, |s| s.max(ev.seq)));
        if ev.seq > user.tap_seq {
            user.tap_seq = ev.seq;
            user.energy = ev.energy_after;
            user.energy_updated_at = ev.at;
        }
    }
    mint_from_reserve(sys, fold.gained)?;
    user.balance = checked(user.balance.checked_add(fold.gained), "balance")?;
    user.taps_total += fold.gained;
    Ok(fold)
}

pub(crate) fn require_positive(amount: i64, what: &str) -> StoreResult<()> {
    if amount <= 0 {
        return Err(StoreError::Invalid(format!("{what} must be > 0, got {amount}")));
    }
    Ok(())
}

pub(crate) fn debit_balance(user: &mut UserAccount, amount: i64) -> StoreResult<()> {
    if user.balance < amount {
        return Err(StoreError::InsufficientBalance {
            have: user.balance,
            need: amount,
        });
    }
    user.balance -= amount;
    Ok(())
}

pub(crate) fn credit_balance(user: &mut UserAccount, amount: i64) -> StoreResult<()> {
    user.balance = checked(user.balance.checked_add(amount), "balance")?;
    Ok(())
}

/// Spent coins flow back into the reserve, which never exceeds its initial size.
pub(crate) fn credit_reserve(sys: &mut SystemReserve, amount: i64) -> StoreResult<()> {
    let next = checked(sys.reserve_supply.checked_add(amount), "reserve_supply")?;
    if next > sys.initial_reserve {
        return Err(StoreError::Invariant(format!(
            "reserve {next} would exceed initial reserve {}",
            sys.initial_reserve
        )));
    }
    sys.reserve_supply = next;
    Ok(())
}

/// Pay out of the unearmarked reserve.
pub(crate) fn take_from_reserve(sys: &mut SystemReserve, amount: i64) -> StoreResult<()> {
    if amount > sys.available() {
        return Err(StoreError::InsufficientReserve {
            available: sys.available(),
            need: amount,
        });
    }
    sys.reserve_supply -= amount;
    Ok(())
}

pub(crate) fn earmark(sys: &mut SystemReserve, amount: i64) -> StoreResult<()> {
    if amount > sys.available() {
        return Err(StoreError::InsufficientReserve {
            available: sys.available(),
            need: amount,
        });
    }
    sys.reserved_supply += amount;
    Ok(())
}

pub(crate) fn release_earmark(sys: &mut SystemReserve, amount: i64) -> StoreResult<()> {
    if amount > sys.reserved_supply {
        return Err(StoreError::Invariant(format!(
            "release {amount} exceeds reserved {}",
            sys.reserved_supply
        )));
    }
    sys.reserved_supply -= amount;
    Ok(())
}

/// Start a boost window and refill energy to the boosted cap.
pub(crate) fn apply_boost(user: &mut UserAccount, boost: EnergyBoost, now: DateTime<Utc>) {
    user.boost = boost;
    user.energy = effective_params(user.energy_max, 0.0, &boost, now).max;
    user.energy_updated_at = now;
}

pub(crate) fn direct_tap_meta(requested: i64) -> serde_json::Value {
    json!({ "requested": requested, "source": "direct" })
}

pub(crate) fn buffered_tap_meta(delta: &TapDelta) -> serde_json::Value {
    json!({ "requested": delta.requested, "taps": delta.taps, "source": "buffer" })
}

pub(crate) fn stream_tap_meta(fold: &EventFold, applied: usize) -> serde_json::Value {
    json!({
        "requested": fold.requested,
        "taps": applied,
        "seq_first": fold.first_seq,
        "seq_last": fold.last_seq,
        "source": "stream",
    })
}

fn checked(v: Option<i64>, what: &str) -> StoreResult<i64> {
    v.ok_or_else(|| StoreError::Invariant(format!("{what} overflow")))
}
