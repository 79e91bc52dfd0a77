/// Reserve-indexed exchange rate in coins per USD.
///
/// Linear in the reserve: `start_rate` at a full reserve, `min_rate` at an
/// empty one. `reserve` is clamped into `[0, initial_reserve]` first, and a
/// non-positive `initial_reserve` pins the rate at `start_rate`. Integer
/// division truncates toward zero.
pub fn coins_per_usd(reserve: i64, initial_reserve: i64, start_rate: i64, min_rate: i64) -> i64 {
    if initial_reserve <= 0 {
        return start_rate;
    }
    let reserve = reserve.clamp(0, initial_reserve) as i128;
    let span = start_rate as i128 - min_rate as i128;
    let rate = min_rate as i128 + span * reserve / initial_reserve as i128;
    rate as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn half_reserve_is_midpoint() {
        assert_eq!(coins_per_usd(500, 1000, 100, 10), 55);
    }

    #[test]
    fn endpoints() {
        assert_eq!(coins_per_usd(1000, 1000, 100, 10), 100);
        assert_eq!(coins_per_usd(0, 1000, 100, 10), 10);
    }

    #[test]
    fn reserve_outside_range_is_clamped() {
        assert_eq!(coins_per_usd(-5, 1000, 100, 10), 10);
        assert_eq!(coins_per_usd(5000, 1000, 100, 10), 100);
    }

    #[test]
    fn empty_initial_reserve_pins_start_rate() {
        assert_eq!(coins_per_usd(0, 0, 100, 10), 100);
        assert_eq!(coins_per_usd(50, -1, 100, 10), 100);
    }

    #[test]
    fn no_overflow_near_i64_max() {
        let initial = i64::MAX / 2;
        let r = coins_per_usd(initial, initial, 1_000_000_000, 1);
        assert_eq!(r, 1_000_000_000);
    }

    #[test]
    fn non_increasing_as_reserve_drains() {
        let mut prev = i64::MAX;
        for reserve in (0..=1000).rev().step_by(7) {
            let r = coins_per_usd(reserve, 1000, 100, 10);
            assert!(r <= prev);
            assert!((10..=100).contains(&r));
            prev = r;
        }
    }
}
