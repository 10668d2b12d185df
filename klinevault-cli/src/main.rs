//! KlineVault CLI — incremental candle collection and store management.
//!
//! Commands:
//! - `pull` — fetch missing candles from Binance into the local store
//!   (cold start vs incremental is auto-detected per series)
//! - `status` — report stored series, row counts, sizes, date ranges
//! - `show` — print a window of a stored series, optionally resampled
//! - `delete` — destroy a series (dry run unless `--confirm`)

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::{Parser, Subcommand};
use klinevault_core::{
    resample, sync_batch, BinanceFeed, Candle, CircuitBreaker, Interval, PriceSeriesStore,
    SeriesKey, StdoutProgress, SyncOptions,
};
use std::path::PathBuf;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

#[derive(Parser)]
#[command(
    name = "klinevault",
    about = "KlineVault CLI — durable incremental OHLCV price store"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Fetch missing candles from Binance and store them durably.
    Pull {
        /// Symbols, comma-separated (e.g. BTC,ETH,SOL).
        #[arg(long, default_value = "BTC,ETH,SOL")]
        symbols: String,

        /// Intervals, comma-separated (e.g. 1m,1h,1d).
        #[arg(long, default_value = "1m")]
        intervals: String,

        /// Backfill window in days for series with no stored data yet.
        /// Series that already have data resume after their last row.
        #[arg(long, default_value_t = 30)]
        lookback_days: i64,

        /// Quote asset used to form trading pairs (BTC -> BTCUSDT).
        #[arg(long, default_value = "USDT")]
        quote: String,

        /// Store directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Report stored series, row counts, sizes, and date ranges.
    Status {
        /// Store directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Print the tail of a stored series, optionally resampled.
    Show {
        /// Symbol (e.g. BTC).
        symbol: String,

        /// Stored interval to load.
        #[arg(long, default_value = "1m")]
        interval: String,

        /// Start date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD), inclusive.
        #[arg(long)]
        end: Option<String>,

        /// Resample into this coarser interval before printing.
        #[arg(long)]
        resample: Option<String>,

        /// Number of rows to print from the end.
        #[arg(long, default_value_t = 10)]
        tail: usize,

        /// Store directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
    /// Destroy one stored series. Dry run unless --confirm is passed.
    Delete {
        /// Symbol (e.g. BTC).
        symbol: String,

        /// Interval of the series to delete.
        #[arg(long)]
        interval: String,

        /// Actually delete (without this flag, only previews).
        #[arg(long, default_value_t = false)]
        confirm: bool,

        /// Store directory. Defaults to ./data.
        #[arg(long, default_value = "data")]
        data_dir: PathBuf,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Pull {
            symbols,
            intervals,
            lookback_days,
            quote,
            data_dir,
        } => run_pull(&symbols, &intervals, lookback_days, &quote, data_dir),
        Commands::Status { data_dir } => run_status(data_dir),
        Commands::Show {
            symbol,
            interval,
            start,
            end,
            resample,
            tail,
            data_dir,
        } => run_show(&symbol, &interval, start, end, resample, tail, data_dir),
        Commands::Delete {
            symbol,
            interval,
            confirm,
            data_dir,
        } => run_delete(&symbol, &interval, confirm, data_dir),
    }
}

fn parse_interval(s: &str) -> Result<Interval> {
    s.parse::<Interval>().map_err(anyhow::Error::from)
}

fn parse_list(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty())
        .collect()
}

fn run_pull(
    symbols: &str,
    intervals: &str,
    lookback_days: i64,
    quote: &str,
    data_dir: PathBuf,
) -> Result<()> {
    let symbols = parse_list(symbols);
    if symbols.is_empty() {
        bail!("no symbols given");
    }
    let intervals: Vec<Interval> = intervals
        .split(',')
        .map(|s| parse_interval(s.trim()))
        .collect::<Result<_>>()?;
    if intervals.is_empty() {
        bail!("no intervals given");
    }

    let keys: Vec<SeriesKey> = symbols
        .iter()
        .flat_map(|sym| intervals.iter().map(|iv| SeriesKey::new(sym.clone(), *iv)))
        .collect();

    let store = PriceSeriesStore::open(&data_dir)?;
    let circuit_breaker = Arc::new(CircuitBreaker::default_feed());
    let feed = BinanceFeed::with_quote_asset(circuit_breaker, quote);
    let opts = SyncOptions {
        cold_start_lookback: chrono::Duration::days(lookback_days),
        ..SyncOptions::default()
    };

    let summary = sync_batch(
        &store,
        &feed,
        &keys,
        &opts,
        Utc::now(),
        &AtomicBool::new(false),
        &StdoutProgress,
    );

    println!(
        "Rows added: {} across {} series",
        summary.rows_added(),
        summary.succeeded
    );

    if !summary.all_succeeded() {
        for err in &summary.errors {
            eprintln!("Error for {}: {err}", err.key());
        }
        std::process::exit(1);
    }

    Ok(())
}

fn run_status(data_dir: PathBuf) -> Result<()> {
    if !data_dir.exists() {
        println!("Store directory does not exist: {}", data_dir.display());
        return Ok(());
    }

    let store = PriceSeriesStore::open(&data_dir)?;
    let infos = store.info()?;

    if infos.is_empty() {
        println!("Store is empty: {}", data_dir.display());
        return Ok(());
    }

    let total_rows: usize = infos.iter().map(|i| i.rows).sum();
    let total_size: u64 = infos.iter().map(|i| i.size_bytes).sum();

    println!("Store: {}", data_dir.display());
    println!("Series: {}", infos.len());
    println!("Total rows: {total_rows}");
    println!("Total size: {}", format_size(total_size));
    println!();
    println!(
        "{:<10} {:<9} {:>10} {:<33} {:>10}",
        "Symbol", "Interval", "Rows", "Range", "Size"
    );
    println!("{}", "-".repeat(76));
    for info in &infos {
        let range = format!(
            "{} to {}",
            format_ts(info.first_timestamp_ms),
            format_ts(info.last_timestamp_ms)
        );
        println!(
            "{:<10} {:<9} {:>10} {:<33} {:>10}",
            info.key.symbol,
            info.key.interval.to_string(),
            info.rows,
            range,
            format_size(info.size_bytes)
        );
    }

    Ok(())
}

fn run_show(
    symbol: &str,
    interval: &str,
    start: Option<String>,
    end: Option<String>,
    resample_to: Option<String>,
    tail: usize,
    data_dir: PathBuf,
) -> Result<()> {
    let key = SeriesKey::new(symbol.to_uppercase(), parse_interval(interval)?);
    let store = PriceSeriesStore::open(&data_dir)?;

    let start_ms = start.as_deref().map(day_start_ms).transpose()?;
    let end_ms = end.as_deref().map(day_end_ms).transpose()?;

    let mut series = store.load(&key, start_ms, end_ms)?;
    if series.is_empty() {
        println!("No data for {key} — run `klinevault pull --symbols {symbol}` first.");
        return Ok(());
    }

    let mut shown_interval = key.interval;
    if let Some(target) = resample_to {
        let target = parse_interval(&target)?;
        if target.unit_ms() < key.interval.unit_ms() {
            bail!(
                "cannot resample {} data into the finer interval {}",
                key.interval,
                target
            );
        }
        series = resample(&series, target);
        shown_interval = target;
    }

    println!(
        "{} {} — {} rows ({} to {})",
        key.symbol,
        shown_interval,
        series.len(),
        format_ts(series[0].timestamp_ms),
        format_ts(series[series.len() - 1].timestamp_ms)
    );
    println!();
    println!(
        "{:<17} {:>12} {:>12} {:>12} {:>12} {:>14}",
        "Time (UTC)", "Open", "High", "Low", "Close", "Volume"
    );
    println!("{}", "-".repeat(82));
    let from = series.len().saturating_sub(tail);
    for candle in &series[from..] {
        print_row(candle);
    }

    Ok(())
}

fn print_row(candle: &Candle) {
    println!(
        "{:<17} {:>12.4} {:>12.4} {:>12.4} {:>12.4} {:>14.3}",
        format_ts(candle.timestamp_ms),
        candle.open,
        candle.high,
        candle.low,
        candle.close,
        candle.volume
    );
}

fn run_delete(symbol: &str, interval: &str, confirm: bool, data_dir: PathBuf) -> Result<()> {
    let key = SeriesKey::new(symbol.to_uppercase(), parse_interval(interval)?);
    let store = PriceSeriesStore::open(&data_dir)?;

    let info = store.info()?.into_iter().find(|i| i.key == key);
    let Some(info) = info else {
        println!("No stored series for {key}.");
        return Ok(());
    };

    println!(
        "{key}: {} rows, {} ({} to {})",
        info.rows,
        format_size(info.size_bytes),
        format_ts(info.first_timestamp_ms),
        format_ts(info.last_timestamp_ms)
    );

    if !confirm {
        println!();
        println!("Dry run — pass --confirm to actually delete.");
        return Ok(());
    }

    if store.delete(&key)? {
        println!("Removed: {key}");
    }
    Ok(())
}

fn parse_date(s: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").with_context(|| format!("invalid date '{s}'"))
}

fn day_start_ms(s: &str) -> Result<i64> {
    Ok(parse_date(s)?
        .and_hms_opt(0, 0, 0)
        .unwrap()
        .and_utc()
        .timestamp_millis())
}

fn day_end_ms(s: &str) -> Result<i64> {
    Ok(parse_date(s)?
        .and_hms_milli_opt(23, 59, 59, 999)
        .unwrap()
        .and_utc()
        .timestamp_millis())
}

fn format_ts(timestamp_ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(timestamp_ms)
        .map(|dt| dt.format("%Y-%m-%d %H:%M").to_string())
        .unwrap_or_else(|| timestamp_ms.to_string())
}

fn format_size(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{bytes} B")
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
