//! Incremental sync driver.
//!
//! Brings one series from its current on-disk state up to "now" by paging
//! through the upstream feed. Progress is defined entirely by what is
//! durably in the store — every page is appended (and atomically committed)
//! before the cursor advances, so a crash or feed failure mid-run costs
//! nothing: the next run derives its cursor from the store and resumes after
//! the last durable row.

use crate::domain::SeriesKey;
use crate::feed::{FeedError, KlineFeed, SyncProgress};
use crate::store::{PriceSeriesStore, StoreError};
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Tuning knobs for a sync run.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// How far back to backfill a series that has no stored data yet.
    pub cold_start_lookback: chrono::Duration,
    /// Pause between consecutive feed pages (upstream rate-limit courtesy).
    pub page_delay: Duration,
    /// Pause between series in a batch run.
    pub symbol_delay: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            cold_start_lookback: chrono::Duration::days(30),
            page_delay: Duration::from_millis(500),
            symbol_delay: Duration::from_secs(1),
        }
    }
}

/// Errors from syncing a single series.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    #[error("feed error while syncing {key}: {source}")]
    Feed {
        key: SeriesKey,
        #[source]
        source: FeedError,
    },

    #[error("store error while syncing {key}: {source}")]
    Store {
        key: SeriesKey,
        #[source]
        source: StoreError,
    },
}

impl SyncError {
    pub fn key(&self) -> &SeriesKey {
        match self {
            SyncError::Feed { key, .. } | SyncError::Store { key, .. } => key,
        }
    }
}

/// Outcome of syncing a single series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncSummary {
    /// Feed pages fetched.
    pub pages: usize,
    /// Rows returned by the feed across all pages.
    pub rows_fetched: usize,
    /// Net-new rows durably added to the store.
    pub rows_added: usize,
    /// Whether this run started from the cold-start lookback window.
    pub cold_start: bool,
    /// Whether the run stopped early on the cancellation signal.
    pub cancelled: bool,
}

/// Outcome of a batch sync over several series.
#[derive(Debug)]
pub struct BatchSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub results: Vec<(SeriesKey, SyncSummary)>,
    pub errors: Vec<SyncError>,
    pub cancelled: bool,
}

impl BatchSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn rows_added(&self) -> usize {
        self.results.iter().map(|(_, s)| s.rows_added).sum()
    }
}

/// Sync one series up to `now`.
///
/// The cursor starts one interval after the last stored timestamp, or at
/// `now - cold_start_lookback` when the series does not exist yet. Each page
/// is appended to the store before the cursor advances; a short page means
/// the feed has nothing newer and the run is caught up. The cancellation
/// flag is only consulted between pages, never mid-append, so an in-flight
/// write always completes fully.
pub fn sync_series(
    store: &PriceSeriesStore,
    feed: &dyn KlineFeed,
    key: &SeriesKey,
    opts: &SyncOptions,
    now: DateTime<Utc>,
    cancel: &AtomicBool,
    progress: &dyn SyncProgress,
) -> Result<SyncSummary, SyncError> {
    let unit = key.interval.unit_ms();
    let now_ms = now.timestamp_millis();

    let latest = store.latest_timestamp(key).map_err(|source| SyncError::Store {
        key: key.clone(),
        source,
    })?;
    let cold_start = latest.is_none();
    let mut cursor = match latest {
        Some(last) => last + unit,
        None => now_ms - opts.cold_start_lookback.num_milliseconds(),
    };

    let page_limit = feed.page_limit();
    let mut summary = SyncSummary {
        pages: 0,
        rows_fetched: 0,
        rows_added: 0,
        cold_start,
        cancelled: false,
    };

    while cursor <= now_ms {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }

        let page = feed
            .fetch_klines(
                &key.symbol,
                key.interval,
                Some(cursor),
                Some(now_ms),
                page_limit,
            )
            .map_err(|source| SyncError::Feed {
                key: key.clone(),
                source,
            })?;
        if page.is_empty() {
            break;
        }

        summary.pages += 1;
        let page_rows = page.len();
        summary.rows_fetched += page_rows;
        let page_last = page.last().unwrap().timestamp_ms;

        let written = store.append(key, page).map_err(|source| SyncError::Store {
            key: key.clone(),
            source,
        })?;
        summary.rows_added += written.rows_added;
        progress.on_page(key, written.rows_added, summary.rows_fetched);

        cursor = page_last + unit;

        // A short page means the feed has nothing newer yet.
        if page_rows < page_limit {
            break;
        }
        std::thread::sleep(opts.page_delay);
    }

    Ok(summary)
}

/// Sync several series, isolating failures per key.
///
/// One bad symbol never aborts the rest; a feed that reports itself
/// unavailable (circuit breaker open) does, since every remaining request
/// would be refused anyway.
pub fn sync_batch(
    store: &PriceSeriesStore,
    feed: &dyn KlineFeed,
    keys: &[SeriesKey],
    opts: &SyncOptions,
    now: DateTime<Utc>,
    cancel: &AtomicBool,
    progress: &dyn SyncProgress,
) -> BatchSummary {
    let total = keys.len();
    let mut summary = BatchSummary {
        total,
        succeeded: 0,
        failed: 0,
        results: Vec::new(),
        errors: Vec::new(),
        cancelled: false,
    };

    for (i, key) in keys.iter().enumerate() {
        if cancel.load(Ordering::Relaxed) {
            summary.cancelled = true;
            break;
        }

        progress.on_start(key, i, total);
        let result = sync_series(store, feed, key, opts, now, cancel, progress);
        progress.on_complete(
            key,
            i,
            total,
            &result.as_ref().map(|_| ()).map_err(|e| e.to_string()),
        );

        match result {
            Ok(series_summary) => {
                summary.cancelled |= series_summary.cancelled;
                summary.succeeded += 1;
                summary.results.push((key.clone(), series_summary));
            }
            Err(e) => {
                summary.failed += 1;
                summary.errors.push(e);
            }
        }

        // Bail out early once the feed refuses further requests.
        if !feed.is_available() {
            for remaining in &keys[(i + 1)..] {
                summary.errors.push(SyncError::Feed {
                    key: remaining.clone(),
                    source: FeedError::Blocked,
                });
                summary.failed += 1;
            }
            break;
        }

        if i + 1 < total {
            std::thread::sleep(opts.symbol_delay);
        }
    }

    progress.on_batch_complete(summary.succeeded, summary.failed, total);
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Candle, Interval};
    use crate::feed::SilentProgress;
    use std::collections::{HashMap, VecDeque};
    use std::path::PathBuf;
    use std::sync::atomic::AtomicU64;
    use std::sync::{Arc, Mutex};

    static TEST_COUNTER: AtomicU64 = AtomicU64::new(0);

    const MIN: i64 = 60_000;

    fn temp_store() -> (PriceSeriesStore, PathBuf) {
        let id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let dir = std::env::temp_dir().join(format!(
            "klinevault_sync_test_{}_{id}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&dir);
        (PriceSeriesStore::open(&dir).unwrap(), dir)
    }

    fn minute_candles(start_ms: i64, count: usize) -> Vec<Candle> {
        (0..count as i64)
            .map(|i| Candle {
                timestamp_ms: start_ms + i * MIN,
                open: 100.0,
                high: 101.0,
                low: 99.0,
                close: 100.5,
                volume: 1.0,
                quote_volume: None,
            })
            .collect()
    }

    fn quick_opts() -> SyncOptions {
        SyncOptions {
            cold_start_lookback: chrono::Duration::days(1),
            page_delay: Duration::ZERO,
            symbol_delay: Duration::ZERO,
        }
    }

    fn btc() -> SeriesKey {
        SeriesKey::new("BTC", Interval::Min1)
    }

    /// Feed that serves a scripted queue of responses per symbol and records
    /// every requested start cursor.
    struct ScriptedFeed {
        pages: Mutex<HashMap<String, VecDeque<Result<Vec<Candle>, FeedError>>>>,
        requests: Mutex<Vec<(String, Option<i64>)>>,
        page_limit: usize,
        available: std::sync::atomic::AtomicBool,
    }

    impl ScriptedFeed {
        fn new(page_limit: usize) -> Self {
            Self {
                pages: Mutex::new(HashMap::new()),
                requests: Mutex::new(Vec::new()),
                page_limit,
                available: std::sync::atomic::AtomicBool::new(true),
            }
        }

        fn script(&self, symbol: &str, responses: Vec<Result<Vec<Candle>, FeedError>>) {
            self.pages
                .lock()
                .unwrap()
                .insert(symbol.to_string(), responses.into());
        }

        fn calls(&self) -> usize {
            self.requests.lock().unwrap().len()
        }

        fn first_start(&self) -> Option<i64> {
            self.requests.lock().unwrap().first().and_then(|(_, s)| *s)
        }
    }

    impl KlineFeed for ScriptedFeed {
        fn name(&self) -> &str {
            "scripted"
        }

        fn page_limit(&self) -> usize {
            self.page_limit
        }

        fn fetch_klines(
            &self,
            symbol: &str,
            _interval: Interval,
            start_ms: Option<i64>,
            _end_ms: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<Candle>, FeedError> {
            self.requests
                .lock()
                .unwrap()
                .push((symbol.to_string(), start_ms));
            let response = self
                .pages
                .lock()
                .unwrap()
                .get_mut(symbol)
                .and_then(|q| q.pop_front())
                .unwrap_or(Ok(Vec::new()));
            if matches!(response, Err(FeedError::Blocked)) {
                self.available.store(false, Ordering::SeqCst);
            }
            response
        }

        fn is_available(&self) -> bool {
            self.available.load(Ordering::SeqCst)
        }
    }

    fn now_at(ms: i64) -> DateTime<Utc> {
        DateTime::from_timestamp_millis(ms).unwrap()
    }

    #[test]
    fn cold_start_begins_at_lookback_window() {
        let (store, dir) = temp_store();
        let feed = ScriptedFeed::new(1000);
        let now_ms = 1_700_000_040_000;
        feed.script("BTC", vec![Ok(minute_candles(now_ms - MIN, 1))]);

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(now_ms),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap();

        assert!(summary.cold_start);
        let lookback_ms = chrono::Duration::days(1).num_milliseconds();
        assert_eq!(feed.first_start(), Some(now_ms - lookback_ms));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn incremental_resumes_one_interval_after_stored_tail() {
        let (store, dir) = temp_store();
        let t0 = 1_700_000_040_000;
        store.append(&btc(), minute_candles(t0, 3)).unwrap();

        let feed = ScriptedFeed::new(1000);
        feed.script("BTC", vec![Ok(minute_candles(t0 + 3 * MIN, 2))]);

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(t0 + 10 * MIN),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap();

        assert!(!summary.cold_start);
        assert_eq!(feed.first_start(), Some(t0 + 3 * MIN));
        assert_eq!(summary.rows_added, 2);
        assert_eq!(store.latest_timestamp(&btc()).unwrap(), Some(t0 + 4 * MIN));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn full_pages_then_short_page_stops_after_exactly_n_plus_one_calls() {
        let (store, dir) = temp_store();
        let limit = 5;
        let feed = ScriptedFeed::new(limit);
        let now_ms = 1_700_000_040_000;
        let start = now_ms - chrono::Duration::days(1).num_milliseconds();

        // N = 3 full pages, then one short page.
        feed.script(
            "BTC",
            vec![
                Ok(minute_candles(start, limit)),
                Ok(minute_candles(start + 5 * MIN, limit)),
                Ok(minute_candles(start + 10 * MIN, limit)),
                Ok(minute_candles(start + 15 * MIN, 2)),
            ],
        );

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(now_ms),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap();

        assert_eq!(feed.calls(), 4);
        assert_eq!(summary.pages, 4);
        assert_eq!(summary.rows_fetched, 17);
        assert_eq!(summary.rows_added, 17);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn empty_first_page_means_nothing_available() {
        let (store, dir) = temp_store();
        let feed = ScriptedFeed::new(1000);
        feed.script("BTC", vec![Ok(Vec::new())]);

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(1_700_000_040_000),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap();

        assert_eq!(summary.pages, 0);
        assert_eq!(summary.rows_added, 0);
        assert_eq!(store.latest_timestamp(&btc()).unwrap(), None);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn feed_failure_keeps_durable_pages_and_resumes_later() {
        let (store, dir) = temp_store();
        let limit = 5;
        let feed = ScriptedFeed::new(limit);
        let now_ms = 1_700_000_040_000;
        let start = now_ms - chrono::Duration::days(1).num_milliseconds();

        feed.script(
            "BTC",
            vec![
                Ok(minute_candles(start, limit)),
                Err(FeedError::NetworkUnreachable("connection reset".into())),
            ],
        );

        let err = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(now_ms),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Feed { .. }));

        // The first page was committed before the failure.
        let tail = start + (limit as i64 - 1) * MIN;
        assert_eq!(store.latest_timestamp(&btc()).unwrap(), Some(tail));

        // A later run resumes after the durable tail, not from scratch.
        feed.script("BTC", vec![Ok(minute_candles(tail + MIN, 2))]);
        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(now_ms),
            &AtomicBool::new(false),
            &SilentProgress,
        )
        .unwrap();
        assert!(!summary.cold_start);
        assert_eq!(
            feed.requests.lock().unwrap().last().unwrap().1,
            Some(tail + MIN)
        );
        assert_eq!(summary.rows_added, 2);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn pre_set_cancellation_stops_before_any_fetch() {
        let (store, dir) = temp_store();
        let feed = ScriptedFeed::new(1000);
        feed.script("BTC", vec![Ok(minute_candles(1_700_000_040_000, 1))]);

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(1_700_000_040_000),
            &AtomicBool::new(true),
            &SilentProgress,
        )
        .unwrap();

        assert!(summary.cancelled);
        assert_eq!(feed.calls(), 0);

        let _ = std::fs::remove_dir_all(&dir);
    }

    /// Feed that requests cancellation while serving its first page; the
    /// driver must still append that page before stopping.
    struct CancellingFeed {
        cancel: Arc<AtomicBool>,
        calls: std::sync::atomic::AtomicUsize,
        page: Vec<Candle>,
    }

    impl KlineFeed for CancellingFeed {
        fn name(&self) -> &str {
            "cancelling"
        }

        fn page_limit(&self) -> usize {
            self.page.len() // every page is "full" so the loop would continue
        }

        fn fetch_klines(
            &self,
            _symbol: &str,
            _interval: Interval,
            _start_ms: Option<i64>,
            _end_ms: Option<i64>,
            _limit: usize,
        ) -> Result<Vec<Candle>, FeedError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.cancel.store(true, Ordering::SeqCst);
            Ok(self.page.clone())
        }
    }

    #[test]
    fn cancellation_takes_effect_between_pages_only() {
        let (store, dir) = temp_store();
        let cancel = Arc::new(AtomicBool::new(false));
        let feed = CancellingFeed {
            cancel: cancel.clone(),
            calls: std::sync::atomic::AtomicUsize::new(0),
            page: minute_candles(1_700_000_040_000 - 10 * MIN, 5),
        };

        let summary = sync_series(
            &store,
            &feed,
            &btc(),
            &quick_opts(),
            now_at(1_700_000_040_000),
            &cancel,
            &SilentProgress,
        )
        .unwrap();

        // The in-flight page completed its append; no further page was fetched.
        assert!(summary.cancelled);
        assert_eq!(feed.calls.load(Ordering::SeqCst), 1);
        assert_eq!(summary.rows_added, 5);
        assert_eq!(store.load(&btc(), None, None).unwrap().len(), 5);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn batch_isolates_per_key_failures() {
        let (store, dir) = temp_store();
        let feed = ScriptedFeed::new(1000);
        let now_ms = 1_700_000_040_000;
        feed.script(
            "BAD",
            vec![Err(FeedError::SymbolNotFound {
                pair: "BADUSDT".into(),
            })],
        );
        feed.script("ETH", vec![Ok(minute_candles(now_ms - 5 * MIN, 3))]);

        let keys = vec![
            SeriesKey::new("BAD", Interval::Min1),
            SeriesKey::new("ETH", Interval::Min1),
        ];
        let batch = sync_batch(
            &store,
            &feed,
            &keys,
            &quick_opts(),
            now_at(now_ms),
            &AtomicBool::new(false),
            &SilentProgress,
        );

        assert_eq!(batch.total, 2);
        assert_eq!(batch.failed, 1);
        assert_eq!(batch.succeeded, 1);
        assert_eq!(batch.errors[0].key().symbol, "BAD");
        assert_eq!(batch.rows_added(), 3);
        assert_eq!(
            store
                .load(&SeriesKey::new("ETH", Interval::Min1), None, None)
                .unwrap()
                .len(),
            3
        );

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn batch_bails_out_once_feed_is_blocked() {
        let (store, dir) = temp_store();
        let feed = ScriptedFeed::new(1000);
        feed.script("BTC", vec![Err(FeedError::Blocked)]);
        // ETH and SOL never get a chance.

        let keys = vec![
            SeriesKey::new("BTC", Interval::Min1),
            SeriesKey::new("ETH", Interval::Min1),
            SeriesKey::new("SOL", Interval::Min1),
        ];
        let batch = sync_batch(
            &store,
            &feed,
            &keys,
            &quick_opts(),
            now_at(1_700_000_040_000),
            &AtomicBool::new(false),
            &SilentProgress,
        );

        assert_eq!(batch.failed, 3);
        assert_eq!(batch.succeeded, 0);
        assert_eq!(feed.calls(), 1);

        let _ = std::fs::remove_dir_all(&dir);
    }
}
