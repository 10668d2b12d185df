//! Durable per-series candle persistence.
//!
//! Layout: `{data_dir}/{symbol}_{interval}.parquet`
//!
//! Features:
//! - Atomic writes (write to temp file, verify, rename into place)
//! - Merge with dedup on append; incoming values win on timestamp collision
//! - Read-back verification before any replacement of the target file
//! - Quarantine for corrupt files (`{name}.corrupt-{unix_ms}` alongside)
//! - Per-key append serialization; reads never block

use crate::domain::{Candle, SeriesKey};
use polars::prelude::*;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

const REPLACE_ATTEMPTS: u32 = 4;
const REPLACE_BACKOFF: Duration = Duration::from_millis(100);

/// Columns of the on-disk record batch, in file order.
const SERIES_COLUMNS: [&str; 7] = [
    "timestamp",
    "open",
    "close",
    "high",
    "low",
    "volume",
    "quote_volume",
];

/// Errors from series persistence.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("parquet error at {path}: {message}")]
    Parquet { path: PathBuf, message: String },

    #[error("could not quarantine corrupt series file {path}: {source}")]
    Quarantine {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "post-write verification failed for {path}: wrote {expected} rows, read back {actual} — target file untouched"
    )]
    Verification {
        path: PathBuf,
        expected: usize,
        actual: usize,
    },

    #[error(
        "could not replace {path} after {attempts} attempts: {message}; verified temp file kept at {temp_path}"
    )]
    Replace {
        path: PathBuf,
        temp_path: PathBuf,
        attempts: u32,
        message: String,
    },
}

/// Outcome of a successful append.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WriteSummary {
    /// Rows in the series after the append.
    pub rows_total: usize,
    /// Net-new timestamps added to the series.
    pub rows_added: usize,
    /// Incoming rows that collided with a stored or in-batch timestamp and
    /// replaced the earlier value.
    pub rows_replaced: usize,
    /// Incoming rows discarded as malformed during normalization.
    pub rows_dropped: usize,
}

/// Per-series statistics for operational visibility.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SeriesInfo {
    pub key: SeriesKey,
    pub rows: usize,
    pub size_bytes: u64,
    pub first_timestamp_ms: i64,
    pub last_timestamp_ms: i64,
}

/// Durable, atomic, deduplicating store: one Parquet file per series.
///
/// Construct one handle with [`PriceSeriesStore::open`] and pass it by
/// reference to every collaborator. Appends to the same key are serialized
/// internally; appends to different keys are independent. Reads may run
/// concurrently with a write to the same key — promotion is a single rename,
/// so a reader observes either the complete old file or the complete new one.
pub struct PriceSeriesStore {
    data_dir: PathBuf,
    append_locks: Mutex<HashMap<SeriesKey, Arc<Mutex<()>>>>,
    #[cfg(test)]
    simulate_verify_mismatch: std::sync::atomic::AtomicBool,
}

impl PriceSeriesStore {
    /// Open a store rooted at `data_dir`, creating the directory if needed.
    pub fn open(data_dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let data_dir = data_dir.into();
        fs::create_dir_all(&data_dir).map_err(|source| StoreError::Io {
            path: data_dir.clone(),
            source,
        })?;
        Ok(Self {
            data_dir,
            append_locks: Mutex::new(HashMap::new()),
            #[cfg(test)]
            simulate_verify_mismatch: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Root directory of the store.
    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn series_path(&self, key: &SeriesKey) -> PathBuf {
        self.data_dir.join(key.file_name())
    }

    fn key_lock(&self, key: &SeriesKey) -> Arc<Mutex<()>> {
        let mut locks = self.append_locks.lock().unwrap();
        locks.entry(key.clone()).or_default().clone()
    }

    /// Merge `incoming` into the series for `key` and durably replace the
    /// series file. `incoming` need not be sorted or deduplicated.
    ///
    /// On a timestamp collision the incoming value replaces the stored one
    /// (last-write-wins, matching upstream feeds that re-send a corrected
    /// final candle for the most recent bucket; pending product confirmation
    /// this policy is kept rather than silently inverted).
    ///
    /// The target file is only ever mutated by a single rename after the new
    /// contents have been written to a temp file and read back successfully,
    /// so a failure at any step leaves the prior version intact.
    pub fn append(
        &self,
        key: &SeriesKey,
        incoming: Vec<Candle>,
    ) -> Result<WriteSummary, StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap();

        let path = self.series_path(key);
        let existing = self.read_or_quarantine(&path)?;
        let rows_before = existing.len();

        let (normalized, rows_written, rows_dropped) = normalize(incoming);
        if normalized.is_empty() {
            return Ok(WriteSummary {
                rows_total: rows_before,
                rows_added: 0,
                rows_replaced: 0,
                rows_dropped,
            });
        }

        let merged = merge_series(existing, normalized);
        let rows_total = merged.len();
        let rows_added = rows_total - rows_before;

        // Write the merged series to a uniquely named temp file in the same
        // directory, then verify the bytes on disk parse back to the exact
        // row count before touching the target path.
        let temp_path = self.temp_path(key);
        let df = candles_to_dataframe(&merged, &temp_path)?;
        write_parquet(&df, &temp_path)?;

        let mut expected = rows_total;
        #[cfg(test)]
        {
            if self
                .simulate_verify_mismatch
                .load(std::sync::atomic::Ordering::SeqCst)
            {
                expected += 1;
            }
        }
        let actual = read_row_count(&temp_path)?;
        if actual != expected {
            let _ = fs::remove_file(&temp_path);
            return Err(StoreError::Verification {
                path,
                expected,
                actual,
            });
        }

        promote_with_retry(&temp_path, &path)?;

        Ok(WriteSummary {
            rows_total,
            rows_added,
            rows_replaced: rows_written - rows_added,
            rows_dropped,
        })
    }

    /// Last stored timestamp for `key`, or `None` when no series exists yet.
    pub fn latest_timestamp(&self, key: &SeriesKey) -> Result<Option<i64>, StoreError> {
        let path = self.series_path(key);
        let series = self.read_or_quarantine(&path)?;
        Ok(series.last().map(|c| c.timestamp_ms))
    }

    /// Load the series for `key`, optionally restricted to the inclusive
    /// `[start_ms, end_ms]` range. Returns an empty vec when no file exists.
    pub fn load(
        &self,
        key: &SeriesKey,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
    ) -> Result<Vec<Candle>, StoreError> {
        let path = self.series_path(key);
        let mut series = self.read_or_quarantine(&path)?;
        if let Some(start) = start_ms {
            series.retain(|c| c.timestamp_ms >= start);
        }
        if let Some(end) = end_ms {
            series.retain(|c| c.timestamp_ms <= end);
        }
        Ok(series)
    }

    /// Statistics for every stored series, sorted by file name.
    ///
    /// Unreadable files are quarantined and skipped; files that are not
    /// series files (temp, quarantined, foreign) are ignored.
    pub fn info(&self) -> Result<Vec<SeriesInfo>, StoreError> {
        let entries = fs::read_dir(&self.data_dir).map_err(|source| StoreError::Io {
            path: self.data_dir.clone(),
            source,
        })?;

        let mut infos = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|source| StoreError::Io {
                path: self.data_dir.clone(),
                source,
            })?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("parquet") {
                continue;
            }
            let Some(key) = key_from_file_name(&path) else {
                continue;
            };

            let series = self.read_or_quarantine(&path)?;
            let (Some(first), Some(last)) = (series.first(), series.last()) else {
                continue; // just quarantined
            };
            let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);
            infos.push(SeriesInfo {
                key,
                rows: series.len(),
                size_bytes,
                first_timestamp_ms: first.timestamp_ms,
                last_timestamp_ms: last.timestamp_ms,
            });
        }

        infos.sort_by(|a, b| a.key.file_name().cmp(&b.key.file_name()));
        Ok(infos)
    }

    /// Destroy the series for `key`. Returns whether a file existed.
    ///
    /// This is the only path that removes a series; nothing destroys one
    /// implicitly.
    pub fn delete(&self, key: &SeriesKey) -> Result<bool, StoreError> {
        let lock = self.key_lock(key);
        let _guard = lock.lock().unwrap();

        let path = self.series_path(key);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| StoreError::Io { path, source })?;
        Ok(true)
    }

    /// Read a series file, treating absence as empty. An unreadable file is
    /// renamed aside with a loud warning (historical data is preserved for
    /// diagnosis, never merged with or silently overwritten) and the series
    /// proceeds as empty.
    fn read_or_quarantine(&self, path: &Path) -> Result<Vec<Candle>, StoreError> {
        if !path.exists() {
            return Ok(Vec::new());
        }
        match read_series_parquet(path) {
            Ok(series) => Ok(series),
            Err(e) => {
                let quarantine = quarantine_path(path);
                eprintln!(
                    "WARNING: quarantining corrupt series file {} -> {}: {e}",
                    path.display(),
                    quarantine.display()
                );
                if let Err(source) = fs::rename(path, &quarantine) {
                    // Another reader may have quarantined it concurrently; if
                    // the file is still there we must not proceed on top of
                    // unreadable bytes.
                    if path.exists() {
                        return Err(StoreError::Quarantine {
                            path: path.to_path_buf(),
                            source,
                        });
                    }
                }
                Ok(Vec::new())
            }
        }
    }

    fn temp_path(&self, key: &SeriesKey) -> PathBuf {
        self.data_dir.join(format!(
            "{}_{}.{}.tmp",
            key.symbol,
            key.interval,
            unix_millis()
        ))
    }

    #[cfg(test)]
    fn force_verification_mismatch(&self, on: bool) {
        self.simulate_verify_mismatch
            .store(on, std::sync::atomic::Ordering::SeqCst);
    }
}

// ── Normalization and merge ─────────────────────────────────────────

/// Timestamps below this are taken to be seconds and scaled to ms.
/// (1e11 ms is March 1973, far earlier than any feed data.)
const SECONDS_CUTOFF_MS: i64 = 100_000_000_000;

fn coerce_to_millis(timestamp: i64) -> i64 {
    if timestamp > 0 && timestamp < SECONDS_CUTOFF_MS {
        timestamp * 1000
    } else {
        timestamp
    }
}

/// Coerce timestamp units, drop malformed records, sort, and collapse
/// in-batch duplicates keeping the last-supplied value. Returns the
/// normalized batch, the count of accepted records (before the collapse,
/// so duplicate accounting sees them), and the count of dropped records.
fn normalize(incoming: Vec<Candle>) -> (Vec<Candle>, usize, usize) {
    let mut rows_dropped = 0;
    let mut out: Vec<Candle> = Vec::with_capacity(incoming.len());
    for mut candle in incoming {
        candle.timestamp_ms = coerce_to_millis(candle.timestamp_ms);
        if candle.is_sane() {
            out.push(candle);
        } else {
            rows_dropped += 1;
        }
    }
    let rows_accepted = out.len();
    // Stable sort keeps later-supplied records after earlier ones within a
    // timestamp, so the keep-last collapse resolves in-batch collisions in
    // favor of the record supplied last.
    out.sort_by_key(|c| c.timestamp_ms);
    (collapse_keep_last(out), rows_accepted, rows_dropped)
}

/// Merge a normalized incoming batch into an existing sorted series.
///
/// When every incoming record is strictly newer than the stored tail (the
/// common incremental case) this is a plain append and the dedup scan is
/// skipped — an optimization that cannot change the result. Otherwise the
/// full concatenate-sort-collapse runs and incoming values win collisions.
fn merge_series(mut existing: Vec<Candle>, incoming: Vec<Candle>) -> Vec<Candle> {
    match (existing.last(), incoming.first()) {
        (Some(tail), Some(head)) if head.timestamp_ms > tail.timestamp_ms => {
            existing.extend(incoming);
            existing
        }
        (None, _) => incoming,
        _ => {
            existing.extend(incoming);
            existing.sort_by_key(|c| c.timestamp_ms);
            collapse_keep_last(existing)
        }
    }
}

/// Collapse duplicate timestamps in a sorted run, keeping the last value.
fn collapse_keep_last(sorted: Vec<Candle>) -> Vec<Candle> {
    let mut out: Vec<Candle> = Vec::with_capacity(sorted.len());
    for candle in sorted {
        match out.last_mut() {
            Some(last) if last.timestamp_ms == candle.timestamp_ms => *last = candle,
            _ => out.push(candle),
        }
    }
    out
}

// ── Parquet I/O helpers ─────────────────────────────────────────────

fn parquet_err(path: &Path, message: impl Into<String>) -> StoreError {
    StoreError::Parquet {
        path: path.to_path_buf(),
        message: message.into(),
    }
}

/// Convert candles to the on-disk record batch. The timestamp column is a
/// millisecond datetime; numeric columns are f32.
fn candles_to_dataframe(candles: &[Candle], path: &Path) -> Result<DataFrame, StoreError> {
    let timestamps: Vec<i64> = candles.iter().map(|c| c.timestamp_ms).collect();
    let opens: Vec<f32> = candles.iter().map(|c| c.open).collect();
    let closes: Vec<f32> = candles.iter().map(|c| c.close).collect();
    let highs: Vec<f32> = candles.iter().map(|c| c.high).collect();
    let lows: Vec<f32> = candles.iter().map(|c| c.low).collect();
    let volumes: Vec<f32> = candles.iter().map(|c| c.volume).collect();
    let quote_volumes: Vec<Option<f32>> = candles.iter().map(|c| c.quote_volume).collect();

    DataFrame::new(vec![
        Column::new("timestamp".into(), timestamps)
            .cast(&DataType::Datetime(TimeUnit::Milliseconds, None))
            .map_err(|e| parquet_err(path, format!("timestamp cast: {e}")))?,
        Column::new("open".into(), opens),
        Column::new("close".into(), closes),
        Column::new("high".into(), highs),
        Column::new("low".into(), lows),
        Column::new("volume".into(), volumes),
        Column::new("quote_volume".into(), quote_volumes),
    ])
    .map_err(|e| parquet_err(path, format!("dataframe creation: {e}")))
}

fn write_parquet(df: &DataFrame, path: &Path) -> Result<(), StoreError> {
    let file = fs::File::create(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ParquetWriter::new(file)
        .with_compression(ParquetCompression::Zstd(None))
        .finish(&mut df.clone())
        .map_err(|e| parquet_err(path, format!("write parquet: {e}")))?;
    Ok(())
}

fn open_dataframe(path: &Path) -> Result<DataFrame, StoreError> {
    let file = fs::File::open(path).map_err(|source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ParquetReader::new(file)
        .finish()
        .map_err(|e| parquet_err(path, format!("read parquet: {e}")))
}

fn read_row_count(path: &Path) -> Result<usize, StoreError> {
    Ok(open_dataframe(path)?.height())
}

/// Read and validate a series file. Any failure here means the file is not a
/// well-formed series batch and the caller quarantines it.
fn read_series_parquet(path: &Path) -> Result<Vec<Candle>, StoreError> {
    let df = open_dataframe(path)?;

    if df.height() == 0 {
        return Err(parquet_err(path, "empty series file"));
    }
    for col_name in &SERIES_COLUMNS {
        if df.column(col_name).is_err() {
            return Err(parquet_err(path, format!("missing column '{col_name}'")));
        }
    }

    dataframe_to_candles(&df, path)
}

fn dataframe_to_candles(df: &DataFrame, path: &Path) -> Result<Vec<Candle>, StoreError> {
    let timestamps = df
        .column("timestamp")
        .map_err(|e| parquet_err(path, format!("column read: {e}")))?
        .cast(&DataType::Int64)
        .map_err(|e| parquet_err(path, format!("timestamp column type: {e}")))?;
    let ts_ca = timestamps
        .i64()
        .map_err(|e| parquet_err(path, format!("timestamp column type: {e}")))?;

    let f32_col = |name: &str| -> Result<Float32Chunked, StoreError> {
        Ok(df
            .column(name)
            .map_err(|e| parquet_err(path, format!("column read: {e}")))?
            .f32()
            .map_err(|e| parquet_err(path, format!("{name} column type: {e}")))?
            .clone())
    };
    let open_ca = f32_col("open")?;
    let close_ca = f32_col("close")?;
    let high_ca = f32_col("high")?;
    let low_ca = f32_col("low")?;
    let volume_ca = f32_col("volume")?;
    let quote_volume_ca = f32_col("quote_volume")?;

    let n = df.height();
    let mut candles = Vec::with_capacity(n);
    for i in 0..n {
        let required = |value: Option<f32>, name: &str| {
            value.ok_or_else(|| parquet_err(path, format!("null {name} at row {i}")))
        };
        candles.push(Candle {
            timestamp_ms: ts_ca
                .get(i)
                .ok_or_else(|| parquet_err(path, format!("null timestamp at row {i}")))?,
            open: required(open_ca.get(i), "open")?,
            close: required(close_ca.get(i), "close")?,
            high: required(high_ca.get(i), "high")?,
            low: required(low_ca.get(i), "low")?,
            volume: required(volume_ca.get(i), "volume")?,
            quote_volume: quote_volume_ca.get(i),
        });
    }

    Ok(candles)
}

// ── Promotion and quarantine ────────────────────────────────────────

fn unix_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

fn quarantine_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!("{name}.corrupt-{}", unix_millis()))
}

/// Atomically promote the verified temp file to the target path.
///
/// A plain rename replaces the target atomically on POSIX; on platforms (or
/// filesystems) where an existing target blocks the rename, the destination
/// is removed with a short bounded backoff to ride out transient lock
/// contention, then the rename is retried. On final failure the temp file is
/// left in place as evidence.
fn promote_with_retry(temp_path: &Path, target: &Path) -> Result<(), StoreError> {
    let mut last_error: Option<std::io::Error> = None;
    for attempt in 0..REPLACE_ATTEMPTS {
        if attempt > 0 {
            std::thread::sleep(REPLACE_BACKOFF);
        }
        match fs::rename(temp_path, target) {
            Ok(()) => return Ok(()),
            Err(e) => {
                if target.exists() {
                    let _ = fs::remove_file(target);
                }
                last_error = Some(e);
            }
        }
    }
    Err(StoreError::Replace {
        path: target.to_path_buf(),
        temp_path: temp_path.to_path_buf(),
        attempts: REPLACE_ATTEMPTS,
        message: last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "unknown".into()),
    })
}

fn key_from_file_name(path: &Path) -> Option<SeriesKey> {
    let stem = path.file_stem()?.to_str()?;
    let (symbol, interval) = stem.rsplit_once('_')?;
    if symbol.is_empty() {
        return None;
    }
    let interval = interval.parse().ok()?;
    Some(SeriesKey::new(symbol, interval))
}
