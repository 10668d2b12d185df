//! KlineVault Core — incremental OHLCV series persistence.
//!
//! This crate contains the heart of the price store:
//! - Domain types (candles, intervals, series keys)
//! - Durable Parquet-backed series store with atomic read-merge-verify-replace
//! - Upstream feed trait plus the Binance klines implementation
//! - Incremental sync driver (cold-start backfill and catch-up paging)
//! - Read-time resampling into coarser intervals

pub mod binance;
pub mod breaker;
pub mod domain;
pub mod feed;
pub mod resample;
pub mod store;
pub mod sync;

pub use binance::BinanceFeed;
pub use breaker::CircuitBreaker;
pub use domain::{Candle, Interval, SeriesKey};
pub use feed::{FeedError, KlineFeed, SilentProgress, StdoutProgress, SyncProgress};
pub use resample::resample;
pub use store::{PriceSeriesStore, SeriesInfo, StoreError, WriteSummary};
pub use sync::{sync_batch, sync_series, BatchSummary, SyncError, SyncOptions, SyncSummary};
