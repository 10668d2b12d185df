//! Candle — the fundamental market data unit.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One OHLCV candle for a single (symbol, interval) bucket.
///
/// The timestamp is the bucket open time in epoch milliseconds UTC and is the
/// natural key within a series. Numeric fields are stored at f32 precision —
/// a deliberate, bounded trade-off that halves on-disk size.
///
/// `quote_volume` is reported by some feeds (volume denominated in the quote
/// asset) and absent from others, so it is an explicit optional.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp_ms: i64,
    pub open: f32,
    pub high: f32,
    pub low: f32,
    pub close: f32,
    pub volume: f32,
    pub quote_volume: Option<f32>,
}

impl Candle {
    /// Basic OHLCV sanity check: finite fields, high >= low, OHLC within
    /// the high/low envelope, positive prices, non-negative volume.
    pub fn is_sane(&self) -> bool {
        let finite = self.open.is_finite()
            && self.high.is_finite()
            && self.low.is_finite()
            && self.close.is_finite()
            && self.volume.is_finite();
        finite
            && self.timestamp_ms > 0
            && self.high >= self.low
            && self.high >= self.open
            && self.high >= self.close
            && self.low <= self.open
            && self.low <= self.close
            && self.open > 0.0
            && self.close > 0.0
            && self.volume >= 0.0
    }

    /// Bucket open time as a chrono UTC datetime (for display).
    pub fn open_time(&self) -> Option<DateTime<Utc>> {
        DateTime::from_timestamp_millis(self.timestamp_ms)
    }
}
