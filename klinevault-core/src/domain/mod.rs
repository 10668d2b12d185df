//! Domain types: candles, intervals, series keys.

pub mod candle;
pub mod interval;

pub use candle::Candle;
pub use interval::{Interval, ParseIntervalError, SeriesKey};
