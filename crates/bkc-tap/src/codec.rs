//! Field encoding of cached snapshots and stream events.
//!
//! Everything is stored as strings: integers and floats in their `Display`
//! form, timestamps as RFC 3339 with nanoseconds, days as `YYYY-MM-DD`.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, SecondsFormat, Utc};

use bkc_db::{SystemReserve, TapEvent, UserAccount};
use bkc_econ::EnergyBoost;

use crate::shared::Hash;
use crate::{SharedError, SharedResult};

/// A user's live state in the shared cache. `account.tap_seq` is the last
/// sequence number issued, not the last one made durable.
#[derive(Clone, Debug, PartialEq)]
pub(crate) struct LiveUser {
    pub account: UserAccount,
    pub day: NaiveDate,
    pub daily_tapped: i64,
    pub daily_extra: i64,
}

fn put(h: &mut Hash, name: &str, value: impl ToString) {
    h.insert(name.to_string(), value.to_string());
}

fn ts(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn raw<'a>(key: &str, h: &'a Hash, name: &str) -> SharedResult<&'a str> {
    h.get(name)
        .map(String::as_str)
        .ok_or_else(|| SharedError::corrupt(key, format!("missing field {name}")))
}

fn num<T: FromStr>(key: &str, h: &Hash, name: &str) -> SharedResult<T> {
    let s = raw(key, h, name)?;
    s.parse()
        .map_err(|_| SharedError::corrupt(key, format!("bad {name}: {s:?}")))
}

fn time(key: &str, h: &Hash, name: &str) -> SharedResult<DateTime<Utc>> {
    let s = raw(key, h, name)?;
    parse_time(s).ok_or_else(|| SharedError::corrupt(key, format!("bad {name}: {s:?}")))
}

fn parse_time(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

fn day(key: &str, h: &Hash, name: &str) -> SharedResult<NaiveDate> {
    let s = raw(key, h, name)?;
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| SharedError::corrupt(key, format!("bad {name}: {s:?}")))
}

pub(crate) fn encode_system(sys: &SystemReserve) -> Hash {
    let mut h = Hash::new();
    put(&mut h, "total_supply", sys.total_supply);
    put(&mut h, "reserve_supply", sys.reserve_supply);
    put(&mut h, "reserved_supply", sys.reserved_supply);
    put(&mut h, "initial_reserve", sys.initial_reserve);
    put(&mut h, "start_rate", sys.start_rate);
    put(&mut h, "min_rate", sys.min_rate);
    h
}

pub(crate) fn decode_system(key: &str, h: &Hash) -> SharedResult<SystemReserve> {
    Ok(SystemReserve {
        total_supply: num(key, h, "total_supply")?,
        reserve_supply: num(key, h, "reserve_supply")?,
        reserved_supply: num(key, h, "reserved_supply")?,
        initial_reserve: num(key, h, "initial_reserve")?,
        start_rate: num(key, h, "start_rate")?,
        min_rate: num(key, h, "min_rate")?,
    })
}

pub(crate) fn encode_user(live: &LiveUser) -> Hash {
    let a = &live.account;
    let mut h = Hash::new();
    put(&mut h, "user_id", a.user_id);
    put(&mut h, "balance", a.balance);
    put(&mut h, "frozen_balance", a.frozen_balance);
    put(&mut h, "taps_total", a.taps_total);
    put(&mut h, "energy", a.energy);
    put(&mut h, "energy_max", a.energy_max);
    put(&mut h, "energy_updated_at", ts(a.energy_updated_at));
    put(&mut h, "boost_until", a.boost.until.map(ts).unwrap_or_default());
    put(&mut h, "boost_regen", a.boost.regen_multiplier);
    put(&mut h, "boost_max", a.boost.max_multiplier);
    put(&mut h, "seq", a.tap_seq);
    put(&mut h, "day", live.day);
    put(&mut h, "daily_tapped", live.daily_tapped);
    put(&mut h, "daily_extra", live.daily_extra);
    h
}

pub(crate) fn decode_user(key: &str, h: &Hash) -> SharedResult<LiveUser> {
    let until = match raw(key, h, "boost_until")? {
        "" => None,
        s => Some(parse_time(s).ok_or_else(|| SharedError::corrupt(key, format!("bad boost_until: {s:?}")))?),
    };
    Ok(LiveUser {
        account: UserAccount {
            user_id: num(key, h, "user_id")?,
            balance: num(key, h, "balance")?,
            frozen_balance: num(key, h, "frozen_balance")?,
            taps_total: num(key, h, "taps_total")?,
            energy: num(key, h, "energy")?,
            energy_max: num(key, h, "energy_max")?,
            energy_updated_at: time(key, h, "energy_updated_at")?,
            boost: EnergyBoost {
                until,
                regen_multiplier: num(key, h, "boost_regen")?,
                max_multiplier: num(key, h, "boost_max")?,
            },
            tap_seq: num(key, h, "seq")?,
        },
        day: day(key, h, "day")?,
        daily_tapped: num(key, h, "daily_tapped")?,
        daily_extra: num(key, h, "daily_extra")?,
    })
}

/// Set on a user hash when the worker dead-letters that user's events.
/// Empty means clear.
const QUARANTINE: &str = "quarantine";

pub(crate) fn quarantine_of(h: &Hash) -> Option<String> {
    h.get(QUARANTINE).filter(|r| !r.is_empty()).cloned()
}

pub(crate) fn encode_quarantine(reason: &str) -> Hash {
    let mut h = Hash::new();
    put(&mut h, QUARANTINE, reason);
    h
}

pub(crate) fn encode_event(ev: &TapEvent) -> Hash {
    let mut h = Hash::new();
    put(&mut h, "user_id", ev.user_id);
    put(&mut h, "seq", ev.seq);
    put(&mut h, "requested", ev.requested);
    put(&mut h, "granted", ev.granted);
    put(&mut h, "day", ev.day);
    put(&mut h, "energy_after", ev.energy_after);
    put(&mut h, "at", ts(ev.at));
    h
}

pub(crate) fn decode_event(id: &str, h: &Hash) -> SharedResult<TapEvent> {
    Ok(TapEvent {
        user_id: num(id, h, "user_id")?,
        seq: num(id, h, "seq")?,
        requested: num(id, h, "requested")?,
        granted: num(id, h, "granted")?,
        day: day(id, h, "day")?,
        energy_after: num(id, h, "energy_after")?,
        at: time(id, h, "at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn user_fields_survive_encoding_exactly() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap() + chrono::Duration::nanoseconds(123_456_789);
        let mut account = UserAccount::new(7, 1000.0, t);
        account.energy = 333.333_333_333_333_3;
        account.balance = 42;
        account.tap_seq = 9;
        account.boost = EnergyBoost {
            until: Some(t + chrono::Duration::hours(1)),
            regen_multiplier: 2.0,
            max_multiplier: 1.5,
        };
        let live = LiveUser {
            account,
            day: t.date_naive(),
            daily_tapped: 10,
            daily_extra: 1000,
        };

        let back = decode_user("k", &encode_user(&live)).unwrap();
        assert_eq!(back, live);
    }

    #[test]
    fn missing_field_is_corrupt() {
        let mut h = encode_system(&SystemReserve {
            total_supply: 10,
            reserve_supply: 9,
            reserved_supply: 0,
            initial_reserve: 9,
            start_rate: 100,
            min_rate: 10,
        });
        h.remove("reserve_supply");
        let err = decode_system("bkc:sys", &h).unwrap_err();
        assert!(matches!(err, SharedError::Corrupt { ref key, .. } if key == "bkc:sys"));
    }

    #[test]
    fn garbage_event_is_rejected() {
        let mut h = Hash::new();
        h.insert("user_id".into(), "x".into());
        assert!(decode_event("1-0", &h).is_err());
    }

    #[test]
    fn quarantine_marker_rides_along_the_user_hash() {
        let t = Utc.with_ymd_and_hms(2026, 5, 4, 12, 0, 0).unwrap();
        let live = LiveUser {
            account: UserAccount::new(7, 1000.0, t),
            day: t.date_naive(),
            daily_tapped: 0,
            daily_extra: 0,
        };
        let mut h = encode_user(&live);
        assert_eq!(quarantine_of(&h), None);

        h.extend(encode_quarantine("event seq 3 grants -5"));
        assert_eq!(quarantine_of(&h).as_deref(), Some("event seq 3 grants -5"));
        assert_eq!(decode_user("k", &h).unwrap(), live);

        h.extend(encode_quarantine(""));
        assert_eq!(quarantine_of(&h), None);
    }
}
