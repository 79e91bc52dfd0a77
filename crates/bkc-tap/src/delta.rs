use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, NaiveDate, Utc};

use bkc_db::TapDelta;
use bkc_econ::TapPlan;

/// Taps acknowledged for one user but not yet durable.
///
/// Every granted coin costs one unit of energy and one coin of reserve, so
/// `gained` is also the reserve debit and the energy spent.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct BufferedDelta {
    pub gained: i64,
    /// Granted coins per quota day.
    pub daily_tapped: BTreeMap<NaiveDate, i64>,
    pub requested: i64,
    /// Tap calls folded in, zero-grant ones included.
    pub taps: i64,
    pub energy_after: f64,
    pub energy_at: Option<DateTime<Utc>>,
    /// When the oldest tap folded in here was acknowledged.
    pub dirty_since: Option<Instant>,
}

impl BufferedDelta {
    pub fn is_empty(&self) -> bool {
        self.taps == 0
    }

    pub fn record(&mut self, plan: &TapPlan, requested: i64, day: NaiveDate, now: DateTime<Utc>) {
        self.dirty_since.get_or_insert_with(Instant::now);
        self.taps += 1;
        self.requested += requested;
        self.gained += plan.granted;
        if plan.granted > 0 {
            *self.daily_tapped.entry(day).or_insert(0) += plan.granted;
        }
        self.energy_after = plan.energy_after;
        self.energy_at = Some(now);
    }

    /// Replace the energy this delta will persist, e.g. after a boost refill.
    pub fn override_energy(&mut self, energy: f64, at: DateTime<Utc>) {
        if !self.is_empty() {
            self.energy_after = energy;
            self.energy_at = Some(at);
        }
    }

    /// Combine with a delta recorded after this one.
    pub fn then(mut self, later: BufferedDelta) -> BufferedDelta {
        if later.is_empty() {
            return self;
        }
        if self.is_empty() {
            return later;
        }
        self.gained += later.gained;
        self.requested += later.requested;
        self.taps += later.taps;
        for (day, n) in later.daily_tapped {
            *self.daily_tapped.entry(day).or_insert(0) += n;
        }
        self.energy_after = later.energy_after;
        self.energy_at = later.energy_at;
        self.dirty_since = match (self.dirty_since, later.dirty_since) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        self
    }

    /// How long the oldest acknowledged tap has waited to become durable.
    pub fn age(&self) -> Option<Duration> {
        self.dirty_since.map(|t| t.elapsed())
    }

    pub fn to_durable(&self) -> Option<TapDelta> {
        let energy_at = self.energy_at?;
        if self.is_empty() {
            return None;
        }
        Some(TapDelta {
            gained: self.gained,
            requested: self.requested,
            taps: self.taps,
            daily: self.daily_tapped.clone(),
            energy_after: self.energy_after,
            energy_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bkc_econ::TapReason;
    use chrono::TimeZone;

    fn plan(granted: i64, energy_after: f64) -> TapPlan {
        TapPlan {
            granted,
            reason: if granted > 0 { TapReason::Ok } else { TapReason::NoEnergy },
            energy_regen: energy_after + granted as f64,
            energy_after,
            energy_max: 1000.0,
            available_reserve: 1_000,
            daily_tapped_after: granted,
            daily_remaining_after: None,
        }
    }

    #[test]
    fn then_keeps_the_later_energy_and_sums_days() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 0).unwrap();
        let d1 = t.date_naive();
        let d2 = (t + chrono::Duration::minutes(2)).date_naive();

        let mut older = BufferedDelta::default();
        older.record(&plan(10, 90.0), 10, d1, t);
        let mut newer = BufferedDelta::default();
        newer.record(&plan(5, 85.0), 5, d2, t + chrono::Duration::minutes(2));
        newer.record(&plan(0, 85.0), 3, d2, t + chrono::Duration::minutes(3));

        let merged = older.then(newer);
        assert_eq!(merged.gained, 15);
        assert_eq!(merged.taps, 3);
        assert_eq!(merged.requested, 18);
        assert_eq!(merged.daily_tapped.get(&d1), Some(&10));
        assert_eq!(merged.daily_tapped.get(&d2), Some(&5));
        assert_eq!(merged.energy_after, 85.0);
        assert_eq!(merged.energy_at, Some(t + chrono::Duration::minutes(3)));
    }

    #[test]
    fn merged_delta_is_as_old_as_its_oldest_tap() {
        let t = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let mut older = BufferedDelta::default();
        older.record(&plan(1, 99.0), 1, t.date_naive(), t);
        let first = older.dirty_since;
        std::thread::sleep(Duration::from_millis(5));
        let mut newer = BufferedDelta::default();
        newer.record(&plan(1, 98.0), 1, t.date_naive(), t);

        let merged = older.then(newer);
        assert_eq!(merged.dirty_since, first);
        assert!(merged.age().unwrap() >= Duration::from_millis(5));
        assert!(BufferedDelta::default().age().is_none());
    }

    #[test]
    fn empty_delta_has_no_durable_form() {
        assert!(BufferedDelta::default().to_durable().is_none());
    }
}
