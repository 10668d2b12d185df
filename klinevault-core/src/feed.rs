//! Upstream feed trait and structured error types.
//!
//! The KlineFeed trait abstracts over candle sources (Binance REST, fakes in
//! tests) so the sync driver can be exercised without a network.

use crate::domain::{Candle, Interval, SeriesKey};
use thiserror::Error;

/// Structured error types for feed operations.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error("network unreachable: {0}")]
    NetworkUnreachable(String),

    #[error("request timed out: {0}")]
    Timeout(String),

    #[error("rate limited by feed (retry after {retry_after_secs}s)")]
    RateLimited { retry_after_secs: u64 },

    #[error("hard stop: feed has blocked requests (circuit breaker open)")]
    Blocked,

    #[error("symbol not found on feed: {pair}")]
    SymbolNotFound { pair: String },

    #[error("malformed feed response: {0}")]
    MalformedResponse(String),

    #[error("feed returned HTTP {status}: {body}")]
    HttpStatus { status: u16, body: String },
}

/// Trait for candle feeds.
///
/// Implementations are expected to return candles sorted ascending by
/// timestamp with no duplicate timestamps within one response, as the
/// upstream klines endpoints do.
pub trait KlineFeed {
    /// Human-readable name of this feed.
    fn name(&self) -> &str;

    /// Maximum number of candles one request may return.
    fn page_limit(&self) -> usize;

    /// Fetch up to `limit` candles for `symbol` at `interval`, starting at
    /// `start_ms` (bucket open time, inclusive) when given.
    fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError>;

    /// Whether the feed is currently willing to serve requests (not banned,
    /// breaker not open).
    fn is_available(&self) -> bool {
        true
    }
}

/// Progress callback for multi-series sync runs.
pub trait SyncProgress {
    /// Called when the sync of one series starts.
    fn on_start(&self, key: &SeriesKey, index: usize, total: usize);

    /// Called after each durably appended page.
    fn on_page(&self, key: &SeriesKey, rows_added: usize, total_rows_fetched: usize);

    /// Called when the sync of one series finishes.
    fn on_complete(&self, key: &SeriesKey, index: usize, total: usize, result: &Result<(), String>);

    /// Called when the whole batch is done.
    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize);
}

/// Simple progress reporter that prints to stdout.
pub struct StdoutProgress;

impl SyncProgress for StdoutProgress {
    fn on_start(&self, key: &SeriesKey, index: usize, total: usize) {
        println!("[{}/{}] Syncing {key}...", index + 1, total);
    }

    fn on_page(&self, key: &SeriesKey, rows_added: usize, total_rows_fetched: usize) {
        println!("  {key}: +{rows_added} rows ({total_rows_fetched} fetched so far)");
    }

    fn on_complete(
        &self,
        key: &SeriesKey,
        _index: usize,
        _total: usize,
        result: &Result<(), String>,
    ) {
        match result {
            Ok(()) => println!("  OK: {key}"),
            Err(e) => println!("  FAIL: {key}: {e}"),
        }
    }

    fn on_batch_complete(&self, succeeded: usize, failed: usize, total: usize) {
        println!("\nSync complete: {succeeded}/{total} succeeded, {failed} failed");
    }
}

/// No-op progress sink for embedding and tests.
pub struct SilentProgress;

impl SyncProgress for SilentProgress {
    fn on_start(&self, _key: &SeriesKey, _index: usize, _total: usize) {}
    fn on_page(&self, _key: &SeriesKey, _rows_added: usize, _total_rows_fetched: usize) {}
    fn on_complete(
        &self,
        _key: &SeriesKey,
        _index: usize,
        _total: usize,
        _result: &Result<(), String>,
    ) {
    }
    fn on_batch_complete(&self, _succeeded: usize, _failed: usize, _total: usize) {}
}
