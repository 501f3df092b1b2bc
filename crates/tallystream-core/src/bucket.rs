// Time bucket keys
//
// Maps (timestamp, unit, width) to a canonical numeric bucket key.
// Keys combine a calendar prefix with an intra-unit component aligned
// down to the bucket width, so every timestamp inside a window yields
// the same key and keys grow monotonically with time within a unit.

use chrono::{DateTime, Datelike, TimeZone, Timelike, Utc};
use serde::{Deserialize, Serialize};

/// Time-grouping granularity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BucketUnit {
    #[serde(rename = "s")]
    Second,
    #[serde(rename = "m")]
    Minute,
    #[serde(rename = "h")]
    Hour,
    #[serde(rename = "d")]
    Day,
    #[serde(rename = "W")]
    Week,
}

impl BucketUnit {
    pub fn as_str(&self) -> &'static str {
        match self {
            BucketUnit::Second => "s",
            BucketUnit::Minute => "m",
            BucketUnit::Hour => "h",
            BucketUnit::Day => "d",
            BucketUnit::Week => "W",
        }
    }
}

impl std::fmt::Display for BucketUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Compute the canonical bucket key for `time_secs` under the given
/// unit and width.
///
/// The intra-unit component is aligned with `component - component % width`,
/// so for unit=hour width=3 the hours {3,4,5} share one key and hour 6
/// starts the next bucket.
pub fn bucket_key(time_secs: i64, unit: BucketUnit, width: u32) -> i64 {
    let dt: DateTime<Utc> = Utc
        .timestamp_opt(time_secs, 0)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());

    let y = dt.year() as i64;
    let ymd = y * 10_000 + dt.month() as i64 * 100 + dt.day() as i64;

    let (prefix, component) = match unit {
        BucketUnit::Second => (
            ((ymd * 100 + dt.hour() as i64) * 100 + dt.minute() as i64) * 100,
            dt.second() as i64,
        ),
        BucketUnit::Minute => ((ymd * 100 + dt.hour() as i64) * 100, dt.minute() as i64),
        BucketUnit::Hour => (ymd * 100, dt.hour() as i64),
        // Day-of-year and week-of-year are zero based, matching the
        // stored keys of earlier deployments.
        BucketUnit::Day => (y * 1_000, dt.ordinal0() as i64),
        BucketUnit::Week => (y * 100, dt.iso_week().week0() as i64),
    };

    prefix + align(component, width)
}

fn align(component: i64, width: u32) -> i64 {
    let width = i64::from(width.max(1));
    component - component.rem_euclid(width)
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-03-05 04:20:30 UTC
    const T: i64 = 1_709_612_430;

    #[test]
    fn hour_width_alignment() {
        // Hours 4 and 5 in one width-3 bucket, hour 6 in the next.
        let h4 = bucket_key(T, BucketUnit::Hour, 3);
        let h5 = bucket_key(T + 3600, BucketUnit::Hour, 3);
        let h6 = bucket_key(T + 2 * 3600, BucketUnit::Hour, 3);
        assert_eq!(h4, h5);
        assert_eq!(h6, h4 + 3);
        assert_eq!(h4, 2024_03_05_00 + 3);
    }

    #[test]
    fn same_window_same_key() {
        let a = bucket_key(T, BucketUnit::Minute, 5);
        let b = bucket_key(T + 100, BucketUnit::Minute, 5);
        assert_eq!(a, b);
        // minute 20 aligned down to 20, prefix yyyymmddHH * 100
        assert_eq!(a, 2024_03_05_04_i64 * 100 + 20);
    }

    #[test]
    fn keys_monotonic_within_unit() {
        let mut last = i64::MIN;
        for step in 0..48 {
            let key = bucket_key(T + step * 1800, BucketUnit::Hour, 2);
            assert!(key >= last, "bucket keys must not decrease");
            last = key;
        }
    }

    #[test]
    fn day_and_week_prefixes() {
        // 2024-03-05 is day-of-year 64 (zero based), ISO week 10.
        assert_eq!(bucket_key(T, BucketUnit::Day, 1), 2024_000 + 64);
        assert_eq!(bucket_key(T, BucketUnit::Week, 1), 2024_00 + 9);
    }

    #[test]
    fn width_one_keeps_component() {
        assert_eq!(
            bucket_key(T, BucketUnit::Second, 1),
            2024_03_05_04_20_i64 * 100 + 30
        );
    }

    #[test]
    fn unit_serde_round_trip() {
        let unit: BucketUnit = serde_json::from_str("\"W\"").unwrap();
        assert_eq!(unit, BucketUnit::Week);
        assert_eq!(serde_json::to_string(&BucketUnit::Minute).unwrap(), "\"m\"");
    }
}
