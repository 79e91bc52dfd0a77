use chrono::{DateTime, NaiveDate, Utc};

/// Stand-in for "no daily limit" inside the planner's `min` chain.
pub const UNLIMITED: i64 = 1 << 62;

/// Taps still allowed today: `limit + extra - tapped`, floored at 0.
pub fn remaining(daily_limit: i64, extra_quota: i64, tapped: i64) -> i64 {
    daily_limit
        .saturating_add(extra_quota)
        .saturating_sub(tapped)
        .max(0)
}

/// Like [`remaining`] but returns [`UNLIMITED`] when the limit is disabled.
pub fn remaining_or_unlimited(daily_limit: i64, extra_quota: i64, tapped: i64) -> i64 {
    if daily_limit <= 0 {
        UNLIMITED
    } else {
        remaining(daily_limit, extra_quota, tapped)
    }
}

/// Quota day key. Days roll over at UTC midnight.
pub fn utc_day(now: DateTime<Utc>) -> NaiveDate {
    now.date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn remaining_floors_at_zero() {
        assert_eq!(remaining(500, 0, 500), 0);
        assert_eq!(remaining(500, 0, 700), 0);
        assert_eq!(remaining(500, 100, 550), 50);
    }

    #[test]
    fn disabled_limit_is_unlimited() {
        assert_eq!(remaining_or_unlimited(0, 0, 10_000), UNLIMITED);
        assert_eq!(remaining_or_unlimited(-1, 5, 0), UNLIMITED);
    }

    #[test]
    fn day_rolls_at_utc_midnight() {
        let before = Utc.with_ymd_and_hms(2026, 3, 1, 23, 59, 59).unwrap();
        let after = Utc.with_ymd_and_hms(2026, 3, 2, 0, 0, 0).unwrap();
        assert_ne!(utc_day(before), utc_day(after));
    }
}
