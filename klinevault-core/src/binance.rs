//! Binance klines feed.
//!
//! Fetches OHLCV candles from the public `/api/v3/klines` endpoint (no
//! authentication). Handles rate limiting, retries with exponential backoff,
//! positional-array response parsing, and the circuit breaker. Binance
//! answers over-limit traffic with HTTP 429 and escalates to an HTTP 418 IP
//! ban, so a tripped breaker must stop the whole run.

use crate::breaker::CircuitBreaker;
use crate::domain::{Candle, Interval};
use crate::feed::{FeedError, KlineFeed};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;

const BASE_URL: &str = "https://api.binance.com/api/v3";

/// Hard cap on `limit` documented by the klines endpoint.
pub const PAGE_LIMIT: usize = 1000;

/// Binance REST feed for klines.
pub struct BinanceFeed {
    client: reqwest::blocking::Client,
    circuit_breaker: Arc<CircuitBreaker>,
    /// Quote asset appended to symbols to form a trading pair (BTC → BTCUSDT).
    quote_asset: String,
    max_retries: u32,
    base_delay: Duration,
}

impl BinanceFeed {
    pub fn new(circuit_breaker: Arc<CircuitBreaker>) -> Self {
        Self::with_quote_asset(circuit_breaker, "USDT")
    }

    pub fn with_quote_asset(circuit_breaker: Arc<CircuitBreaker>, quote_asset: &str) -> Self {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("klinevault/", env!("CARGO_PKG_VERSION")))
            .build()
            .expect("failed to build HTTP client");

        Self {
            client,
            circuit_breaker,
            quote_asset: quote_asset.to_uppercase(),
            max_retries: 3,
            base_delay: Duration::from_millis(500),
        }
    }

    /// Trading pair for a bare symbol: `BTC` → `BTCUSDT`.
    fn pair(&self, symbol: &str) -> String {
        format!("{}{}", symbol.to_uppercase(), self.quote_asset)
    }

    /// Execute a single klines request with retry and circuit breaker logic.
    fn fetch_with_retry(
        &self,
        pair: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        if !self.circuit_breaker.is_allowed() {
            return Err(FeedError::Blocked);
        }

        let url = format!("{BASE_URL}/klines");
        let mut params: Vec<(&str, String)> = vec![
            ("symbol", pair.to_string()),
            ("interval", interval.as_str().to_string()),
            ("limit", limit.min(PAGE_LIMIT).to_string()),
        ];
        if let Some(start) = start_ms {
            params.push(("startTime", start.to_string()));
        }
        if let Some(end) = end_ms {
            params.push(("endTime", end.to_string()));
        }

        let mut last_error = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.pow(attempt - 1);
                std::thread::sleep(delay);
            }

            if !self.circuit_breaker.is_allowed() {
                return Err(FeedError::Blocked);
            }

            match self.client.get(&url).query(&params).send() {
                Ok(resp) => {
                    let status = resp.status();

                    if status.as_u16() == 418 || status == reqwest::StatusCode::FORBIDDEN {
                        // IP ban — immediately trip the circuit breaker
                        self.circuit_breaker.trip();
                        return Err(FeedError::Blocked);
                    }

                    if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
                        self.circuit_breaker.record_failure();
                        let retry_after = resp
                            .headers()
                            .get("retry-after")
                            .and_then(|v| v.to_str().ok())
                            .and_then(|v| v.parse::<u64>().ok())
                            .unwrap_or(60);
                        last_error = Some(FeedError::RateLimited {
                            retry_after_secs: retry_after,
                        });
                        continue;
                    }

                    if status == reqwest::StatusCode::BAD_REQUEST {
                        // Binance reports unknown pairs as 400 {"code":-1121,...}
                        let body = resp.text().unwrap_or_default();
                        if body.contains("-1121") || body.contains("Invalid symbol") {
                            return Err(FeedError::SymbolNotFound {
                                pair: pair.to_string(),
                            });
                        }
                        return Err(FeedError::HttpStatus {
                            status: status.as_u16(),
                            body,
                        });
                    }

                    if !status.is_success() {
                        self.circuit_breaker.record_failure();
                        last_error = Some(FeedError::HttpStatus {
                            status: status.as_u16(),
                            body: resp.text().unwrap_or_default(),
                        });
                        continue;
                    }

                    let rows: Vec<Vec<Value>> = resp.json().map_err(|e| {
                        FeedError::MalformedResponse(format!(
                            "failed to parse klines for {pair}: {e}"
                        ))
                    })?;

                    let candles = parse_kline_rows(&rows)?;
                    self.circuit_breaker.record_success();
                    return Ok(candles);
                }
                Err(e) => {
                    if e.is_timeout() {
                        last_error = Some(FeedError::Timeout(e.to_string()));
                        continue;
                    }
                    if e.is_connect() {
                        last_error = Some(FeedError::NetworkUnreachable(e.to_string()));
                        continue;
                    }
                    return Err(FeedError::NetworkUnreachable(e.to_string()));
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| FeedError::NetworkUnreachable("max retries exceeded".into())))
    }
}

impl KlineFeed for BinanceFeed {
    fn name(&self) -> &str {
        "binance"
    }

    fn page_limit(&self) -> usize {
        PAGE_LIMIT
    }

    fn fetch_klines(
        &self,
        symbol: &str,
        interval: Interval,
        start_ms: Option<i64>,
        end_ms: Option<i64>,
        limit: usize,
    ) -> Result<Vec<Candle>, FeedError> {
        let pair = self.pair(symbol);
        self.fetch_with_retry(&pair, interval, start_ms, end_ms, limit)
    }

    fn is_available(&self) -> bool {
        self.circuit_breaker.is_allowed()
    }
}

// ── Response parsing ────────────────────────────────────────────────

/// Parse the positional kline arrays the endpoint returns:
/// `[openTime, open, high, low, close, volume, closeTime, quoteVolume, ...]`
/// with prices and volumes as decimal strings.
fn parse_kline_rows(rows: &[Vec<Value>]) -> Result<Vec<Candle>, FeedError> {
    rows.iter().map(|row| parse_kline_row(row)).collect()
}

fn parse_kline_row(row: &[Value]) -> Result<Candle, FeedError> {
    if row.len() < 8 {
        return Err(FeedError::MalformedResponse(format!(
            "kline row has {} fields, expected at least 8",
            row.len()
        )));
    }

    let timestamp_ms = row[0].as_i64().ok_or_else(|| {
        FeedError::MalformedResponse(format!("kline open time is not an integer: {}", row[0]))
    })?;

    Ok(Candle {
        timestamp_ms,
        open: field_f32(&row[1], "open")?,
        high: field_f32(&row[2], "high")?,
        low: field_f32(&row[3], "low")?,
        close: field_f32(&row[4], "close")?,
        volume: field_f32(&row[5], "volume")?,
        quote_volume: field_f32(&row[7], "quote volume").ok(),
    })
}

/// Klines carry numbers as decimal strings ("0.01634790"); tolerate plain
/// JSON numbers as well.
fn field_f32(value: &Value, name: &str) -> Result<f32, FeedError> {
    let parsed = match value {
        Value::String(s) => s.parse::<f64>().ok(),
        Value::Number(n) => n.as_f64(),
        _ => None,
    };
    parsed.map(|v| v as f32).ok_or_else(|| {
        FeedError::MalformedResponse(format!("kline {name} is not numeric: {value}"))
    })
}
