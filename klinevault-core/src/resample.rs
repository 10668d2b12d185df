//! Read-time resampling of a fine-grained series into coarser buckets.
//!
//! This is a stateless derivation, never persisted: the same input series
//! and target interval always produce the same output. Buckets with no
//! contributing records are dropped, not interpolated.

use crate::domain::{Candle, Interval};

/// Aggregate a sorted series into `target`-interval buckets:
/// open = first, high = max, low = min, close = last, volume = sum.
///
/// `quote_volume` sums the values that are present and stays `None` for a
/// bucket where no contributor carries one. Sums accumulate in f64 and are
/// cast back to storage precision at the bucket boundary.
pub fn resample(series: &[Candle], target: Interval) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::new();
    let mut current: Option<BucketAccumulator> = None;

    for candle in series {
        let bucket_open = target.floor_ms(candle.timestamp_ms);
        match current.as_mut() {
            Some(acc) if acc.bucket_open == bucket_open => acc.push(candle),
            _ => {
                if let Some(acc) = current.take() {
                    out.push(acc.finish());
                }
                current = Some(BucketAccumulator::start(bucket_open, candle));
            }
        }
    }
    if let Some(acc) = current {
        out.push(acc.finish());
    }

    out
}

struct BucketAccumulator {
    bucket_open: i64,
    open: f32,
    high: f32,
    low: f32,
    close: f32,
    volume: f64,
    quote_volume: Option<f64>,
}

impl BucketAccumulator {
    fn start(bucket_open: i64, candle: &Candle) -> Self {
        Self {
            bucket_open,
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume as f64,
            quote_volume: candle.quote_volume.map(|v| v as f64),
        }
    }

    fn push(&mut self, candle: &Candle) {
        self.high = self.high.max(candle.high);
        self.low = self.low.min(candle.low);
        self.close = candle.close;
        self.volume += candle.volume as f64;
        if let Some(qv) = candle.quote_volume {
            *self.quote_volume.get_or_insert(0.0) += qv as f64;
        }
    }

    fn finish(self) -> Candle {
        Candle {
            timestamp_ms: self.bucket_open,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume as f32,
            quote_volume: self.quote_volume.map(|v| v as f32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: i64 = 60_000;
    const HOUR: i64 = 60 * MIN;
    /// 2023-11-15 00:00:00 UTC — aligned to every supported interval's
    /// bucket grid except the weekly one.
    const T0: i64 = 1_700_006_400_000;

    fn minute_series(start_ms: i64, count: usize) -> Vec<Candle> {
        (0..count as i64)
            .map(|i| Candle {
                timestamp_ms: start_ms + i * MIN,
                open: 100.0 + i as f32,
                high: 110.0 + i as f32,
                low: 90.0 + i as f32,
                close: 105.0 + i as f32,
                volume: 2.0,
                quote_volume: Some(10.0),
            })
            .collect()
    }

    #[test]
    fn sixty_minutes_collapse_to_one_hour() {
        let series = minute_series(T0, 60);
        let hourly = resample(&series, Interval::Hour1);

        assert_eq!(hourly.len(), 1);
        let bar = hourly[0];
        assert_eq!(bar.timestamp_ms, T0);
        assert_eq!(bar.open, series[0].open);
        assert_eq!(bar.close, series[59].close);
        assert_eq!(bar.high, 110.0 + 59.0);
        assert_eq!(bar.low, 90.0);
        assert_eq!(bar.volume, 120.0);
        assert_eq!(bar.quote_volume, Some(600.0));
    }

    #[test]
    fn partial_hours_form_separate_buckets() {
        // 90 minutes spanning two hour buckets: 60 + 30.
        let series = minute_series(T0, 90);
        let hourly = resample(&series, Interval::Hour1);

        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].timestamp_ms, T0);
        assert_eq!(hourly[1].timestamp_ms, T0 + HOUR);
        assert_eq!(hourly[1].open, series[60].open);
        assert_eq!(hourly[1].close, series[89].close);
        assert_eq!(hourly[1].volume, 60.0);
    }

    #[test]
    fn gaps_produce_no_empty_buckets() {
        // One candle in hour 0, nothing in hours 1-2, one candle in hour 3.
        let mut series = minute_series(T0, 1);
        series.extend(minute_series(T0 + 3 * HOUR, 1));

        let hourly = resample(&series, Interval::Hour1);
        assert_eq!(hourly.len(), 2);
        assert_eq!(hourly[0].timestamp_ms, T0);
        assert_eq!(hourly[1].timestamp_ms, T0 + 3 * HOUR);
    }

    #[test]
    fn resampling_is_deterministic() {
        let series = minute_series(T0, 240);
        assert_eq!(
            resample(&series, Interval::Hour4),
            resample(&series, Interval::Hour4)
        );
    }

    #[test]
    fn empty_series_resamples_to_empty() {
        assert!(resample(&[], Interval::Day1).is_empty());
    }

    #[test]
    fn missing_quote_volume_stays_missing() {
        let mut series = minute_series(T0, 2);
        series[0].quote_volume = None;
        series[1].quote_volume = None;

        let hourly = resample(&series, Interval::Hour1);
        assert_eq!(hourly[0].quote_volume, None);

        // A single contributor is enough to produce a sum.
        series[1].quote_volume = Some(7.0);
        let hourly = resample(&series, Interval::Hour1);
        assert_eq!(hourly[0].quote_volume, Some(7.0));
    }

    #[test]
    fn daily_candles_roll_up_into_the_monday_week() {
        // 2023-11-13 (Monday) through 2023-11-19 (Sunday).
        let monday = 1_699_833_600_000;
        let days: Vec<Candle> = (0..7)
            .map(|i| Candle {
                timestamp_ms: monday + i * 86_400_000,
                open: 10.0 + i as f32,
                high: 20.0 + i as f32,
                low: 5.0 + i as f32,
                close: 15.0 + i as f32,
                volume: 1.0,
                quote_volume: None,
            })
            .collect();

        let weekly = resample(&days, Interval::Week1);
        assert_eq!(weekly.len(), 1);
        assert_eq!(weekly[0].timestamp_ms, monday);
        assert_eq!(weekly[0].open, 10.0);
        assert_eq!(weekly[0].close, 21.0);
        assert_eq!(weekly[0].volume, 7.0);
    }
}
