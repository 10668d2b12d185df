//! Candle intervals and the (symbol, interval) series key.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const MINUTE_MS: i64 = 60_000;
const HOUR_MS: i64 = 60 * MINUTE_MS;
const DAY_MS: i64 = 24 * HOUR_MS;
const WEEK_MS: i64 = 7 * DAY_MS;

/// 1970-01-01 was a Thursday; Monday-aligned week buckets are offset by
/// three days from the epoch.
const EPOCH_TO_MONDAY_MS: i64 = 3 * DAY_MS;

/// Candle interval supported by the store and the upstream feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    Min1,
    Min5,
    Min15,
    Min30,
    Hour1,
    Hour4,
    Day1,
    Week1,
}

impl Interval {
    /// The feed-facing interval string ("1m", "4h", ...). Doubles as the
    /// file-name component.
    pub fn as_str(&self) -> &'static str {
        match self {
            Interval::Min1 => "1m",
            Interval::Min5 => "5m",
            Interval::Min15 => "15m",
            Interval::Min30 => "30m",
            Interval::Hour1 => "1h",
            Interval::Hour4 => "4h",
            Interval::Day1 => "1d",
            Interval::Week1 => "1w",
        }
    }

    /// Duration of one interval unit in milliseconds.
    pub fn unit_ms(&self) -> i64 {
        match self {
            Interval::Min1 => MINUTE_MS,
            Interval::Min5 => 5 * MINUTE_MS,
            Interval::Min15 => 15 * MINUTE_MS,
            Interval::Min30 => 30 * MINUTE_MS,
            Interval::Hour1 => HOUR_MS,
            Interval::Hour4 => 4 * HOUR_MS,
            Interval::Day1 => DAY_MS,
            Interval::Week1 => WEEK_MS,
        }
    }

    /// Floor a UTC epoch-ms timestamp to the open of the bucket containing
    /// it. Weekly buckets open Monday 00:00 UTC (exchange convention).
    pub fn floor_ms(&self, timestamp_ms: i64) -> i64 {
        match self {
            Interval::Week1 => {
                let shifted = timestamp_ms + EPOCH_TO_MONDAY_MS;
                shifted.div_euclid(WEEK_MS) * WEEK_MS - EPOCH_TO_MONDAY_MS
            }
            _ => {
                let unit = self.unit_ms();
                timestamp_ms.div_euclid(unit) * unit
            }
        }
    }

    /// All supported intervals, finest first.
    pub fn all() -> [Interval; 8] {
        [
            Interval::Min1,
            Interval::Min5,
            Interval::Min15,
            Interval::Min30,
            Interval::Hour1,
            Interval::Hour4,
            Interval::Day1,
            Interval::Week1,
        ]
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown interval '{0}' (expected one of 1m, 5m, 15m, 30m, 1h, 4h, 1d, 1w)")]
pub struct ParseIntervalError(String);

impl FromStr for Interval {
    type Err = ParseIntervalError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1m" => Ok(Interval::Min1),
            "5m" => Ok(Interval::Min5),
            "15m" => Ok(Interval::Min15),
            "30m" => Ok(Interval::Min30),
            "1h" => Ok(Interval::Hour1),
            "4h" => Ok(Interval::Hour4),
            "1d" => Ok(Interval::Day1),
            "1w" => Ok(Interval::Week1),
            other => Err(ParseIntervalError(other.to_string())),
        }
    }
}

/// Identifies one persisted series: one physical file per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SeriesKey {
    pub symbol: String,
    pub interval: Interval,
}

impl SeriesKey {
    pub fn new(symbol: impl Into<String>, interval: Interval) -> Self {
        Self {
            symbol: symbol.into(),
            interval,
        }
    }

    /// On-disk file name: `{symbol}_{interval}.parquet`.
    pub fn file_name(&self) -> String {
        format!("{}_{}.parquet", self.symbol, self.interval)
    }
}

impl fmt::Display for SeriesKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.symbol, self.interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interval_string_roundtrip() {
        for interval in Interval::all() {
            assert_eq!(interval.as_str().parse::<Interval>().unwrap(), interval);
        }
    }

    #[test]
    fn unknown_interval_is_rejected() {
        assert!("3m".parse::<Interval>().is_err());
        assert!("".parse::<Interval>().is_err());
    }

    #[test]
    fn floor_aligns_to_bucket_open() {
        // 2023-11-14 22:13:20 UTC
        let ts = 1_700_000_000_000;
        assert_eq!(Interval::Min1.floor_ms(ts), 1_699_999_980_000);
        assert_eq!(Interval::Hour1.floor_ms(ts), 1_699_999_200_000);
        // midnight of the same day
        assert_eq!(Interval::Day1.floor_ms(ts) % DAY_MS, 0);
    }

    #[test]
    fn week_floor_lands_on_monday() {
        // 2023-11-14 was a Tuesday; the containing week opened Monday
        // 2023-11-13 00:00 UTC.
        let ts = 1_700_000_000_000;
        let floored = Interval::Week1.floor_ms(ts);
        assert_eq!(floored, 1_699_833_600_000);
        let weekday = chrono::DateTime::from_timestamp_millis(floored)
            .unwrap()
            .format("%A")
            .to_string();
        assert_eq!(weekday, "Monday");
    }

    #[test]
    fn bucket_open_is_a_fixed_point() {
        for interval in Interval::all() {
            let floored = interval.floor_ms(1_700_000_000_000);
            assert_eq!(interval.floor_ms(floored), floored);
        }
    }

    #[test]
    fn series_key_file_name() {
        let key = SeriesKey::new("BTC", Interval::Day1);
        assert_eq!(key.file_name(), "BTC_1d.parquet");
    }
}
