//! Conversion between nanosecond timestamps, per-day partition keys and
//! partition directory names

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, NaiveTime, SecondsFormat, Utc};
use rand::Rng;
use std::fmt;
use std::time::Duration;

/// Number of nanoseconds in one UTC calendar day.
pub const NSECS_PER_DAY: i64 = 24 * 3600 * 1_000_000_000;

/// strftime format of partition directory names.
const PARTITION_NAME_FORMAT: &str = "%Y%m%d";

/// Returns the day key covering the given nanosecond timestamp (floor).
pub fn day_from_nsecs(timestamp: i64) -> i64 {
    timestamp.div_euclid(NSECS_PER_DAY)
}

/// Returns the smallest timestamp belonging to the given day.
pub fn day_min_timestamp(day: i64) -> i64 {
    day * NSECS_PER_DAY
}

/// Returns the biggest timestamp belonging to the given day.
pub fn day_max_timestamp(day: i64) -> i64 {
    day * NSECS_PER_DAY + (NSECS_PER_DAY - 1)
}

/// Formats a day key as a `YYYYMMDD` partition directory name (UTC).
pub fn partition_name(day: i64) -> String {
    DateTime::<Utc>::from_timestamp_nanos(day_min_timestamp(day))
        .format(PARTITION_NAME_FORMAT)
        .to_string()
}

/// Parses a partition directory name back into its day key.
///
/// The name must be exactly eight ASCII digits forming a valid UTC
/// calendar date; anything else is an error.
pub fn parse_partition_name(name: &str) -> Result<i64> {
    if name.len() != 8 || !name.bytes().all(|b| b.is_ascii_digit()) {
        bail!("partition name {name:?} must be in the form YYYYMMDD");
    }
    let date = NaiveDate::parse_from_str(name, PARTITION_NAME_FORMAT)
        .with_context(|| format!("partition name {name:?} is not a valid UTC date"))?;
    let ts = date
        .and_time(NaiveTime::MIN)
        .and_utc()
        .timestamp_nanos_opt()
        .with_context(|| format!("partition name {name:?} is out of the representable range"))?;
    Ok(day_from_nsecs(ts))
}

/// Renders a nanosecond timestamp as RFC 3339 for diagnostics.
pub struct TimestampDisplay(pub i64);

impl fmt::Display for TimestampDisplay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let t = DateTime::<Utc>::from_timestamp_nanos(self.0);
        write!(f, "{}", t.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }
}

/// Adds up to 10% of random jitter to a tick period so that periodic
/// workers of many storages do not fire in lockstep.
pub fn add_jitter(period: Duration) -> Duration {
    let max_jitter_ms = (period.as_millis() / 10) as u64;
    if max_jitter_ms == 0 {
        return period;
    }
    let jitter_ms = rand::thread_rng().gen_range(0..=max_jitter_ms);
    period + Duration::from_millis(jitter_ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn day_key_floors_mid_day_timestamps() {
        let midnight = 19_900 * NSECS_PER_DAY;
        assert_eq!(day_from_nsecs(midnight), 19_900);
        assert_eq!(day_from_nsecs(midnight + 1), 19_900);
        assert_eq!(day_from_nsecs(midnight + NSECS_PER_DAY - 1), 19_900);
        assert_eq!(day_from_nsecs(midnight + NSECS_PER_DAY), 19_901);
    }

    #[test]
    fn partition_name_round_trip() {
        let day = day_from_nsecs(
            DateTime::parse_from_rfc3339("2024-06-15T12:00:00Z")
                .unwrap()
                .timestamp_nanos_opt()
                .unwrap(),
        );
        let name = partition_name(day);
        assert_eq!(name, "20240615");
        assert_eq!(parse_partition_name(&name).unwrap(), day);
    }

    #[test]
    fn parse_rejects_malformed_names() {
        for name in ["2024061", "202406155", "2024-6-15", "20241315", "tmp.part", ""] {
            assert!(parse_partition_name(name).is_err(), "{name:?} should not parse");
        }
    }

    #[test]
    fn day_bounds_cover_the_whole_day() {
        let day = 19_889;
        assert_eq!(day_from_nsecs(day_min_timestamp(day)), day);
        assert_eq!(day_from_nsecs(day_max_timestamp(day)), day);
        assert_eq!(day_max_timestamp(day) + 1, day_min_timestamp(day + 1));
    }

    #[test]
    fn jitter_stays_within_ten_percent() {
        let period = Duration::from_secs(3600);
        for _ in 0..100 {
            let jittered = add_jitter(period);
            assert!(jittered >= period);
            assert!(jittered <= period + Duration::from_secs(360));
        }
    }

    #[test]
    fn timestamp_display_is_rfc3339() {
        let ts = DateTime::parse_from_rfc3339("2024-06-15T12:34:56.000000789Z")
            .unwrap()
            .timestamp_nanos_opt()
            .unwrap();
        assert_eq!(
            TimestampDisplay(ts).to_string(),
            "2024-06-15T12:34:56.000000789Z"
        );
    }
}
