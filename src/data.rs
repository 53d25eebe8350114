//! Data loading and management
//!
//! Historical klines from the Binance REST API, CSV caching of downloaded
//! candles, and basic consistency checks.

use anyhow::{Context, Result};
use serde_json::Value;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration as StdDuration;
use tracing::{debug, info, warn};

use crate::config::DEFAULT_API_URL;
use crate::error::{BacktestError, CoreResult};
use crate::oos::CandleSource;
use crate::Candle;

// =============================================================================
// Constants
// =============================================================================

const KLINES_PATH: &str = "/api/v3/klines";
/// Maximum rows per klines request
pub const KLINES_LIMIT: usize = 1000;
const REQUEST_DELAY_MS: u64 = 300;

/// Kline intervals accepted by Binance
pub const INTERVALS: &[&str] = &[
    "1s", "1m", "3m", "5m", "15m", "30m", "1h", "2h", "4h", "6h", "8h", "12h", "1d", "3d", "1w",
    "1M",
];

pub const CSV_HEADER: &str = "open_time,open,high,low,close,volume";

// =============================================================================
// CSV Data Loading
// =============================================================================

/// Load OHLCV data from a CSV file written by [`save_to_csv`]
pub fn load_csv(path: impl AsRef<Path>) -> Result<Vec<Candle>> {
    let path = path.as_ref();
    let mut reader = csv::Reader::from_path(path)
        .with_context(|| format!("Failed to open CSV file {}", path.display()))?;

    let mut candles = Vec::new();

    for (row_idx, result) in reader.records().enumerate() {
        let row = row_idx + 1;
        let record = result.with_context(|| format!("Failed to read row {}", row))?;

        candles.push(Candle::new_unchecked(
            parse_field(&record, 0, "open_time", row)?,
            parse_field(&record, 1, "open", row)?,
            parse_field(&record, 2, "high", row)?,
            parse_field(&record, 3, "low", row)?,
            parse_field(&record, 4, "close", row)?,
            parse_field(&record, 5, "volume", row)?,
        ));
    }

    info!("Loaded {} candles from {}", candles.len(), path.display());
    Ok(candles)
}

fn parse_field<T>(record: &csv::StringRecord, idx: usize, name: &str, row: usize) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    record
        .get(idx)
        .with_context(|| format!("Row {}: missing {} column", row, name))?
        .trim()
        .parse()
        .with_context(|| format!("Row {}: failed to parse {}", row, name))
}

/// Save candles to CSV
pub fn save_to_csv(candles: &[Candle], path: impl AsRef<Path>) -> Result<PathBuf> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory {}", parent.display()))?;
        }
    }
    let mut file = File::create(path)
        .with_context(|| format!("Failed to create output file {}", path.display()))?;

    writeln!(file, "{}", CSV_HEADER)?;
    for candle in candles {
        writeln!(
            file,
            "{},{},{},{},{},{}",
            candle.open_time, candle.open, candle.high, candle.low, candle.close, candle.volume
        )?;
    }

    info!("Saved {} rows to {}", candles.len(), path.display());
    Ok(path.to_path_buf())
}

/// Default cache file name: `BTCUSDT_1m_2024-01-01_2024-01-31.csv`
pub fn cache_file_name(symbol: &str, interval: &str, start_date: &str, end_date: &str) -> String {
    format!("{}_{}_{}_{}.csv", symbol, interval, start_date, end_date)
}

// =============================================================================
// Binance Data Fetcher
// =============================================================================

/// Fetch historical klines from the Binance public REST API
pub struct BinanceDataFetcher {
    client: reqwest::blocking::Client,
    base_url: String,
    request_delay: StdDuration,
}

impl BinanceDataFetcher {
    /// Create a new data fetcher
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(StdDuration::from_secs(30))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            request_delay: StdDuration::from_millis(REQUEST_DELAY_MS),
        })
    }

    /// Fetcher pointed at `BINANCE_API_URL` (after loading `.env`), or the public endpoint
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();
        let url = std::env::var(crate::config::API_URL_ENV)
            .unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        Self::new(url)
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Fetch one page of at most [`KLINES_LIMIT`] klines starting at `start_ms`
    pub fn fetch_page(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        let url = format!("{}{}", self.base_url, KLINES_PATH);
        let response = self
            .client
            .get(&url)
            .query(&[
                ("symbol", symbol.to_string()),
                ("interval", interval.to_string()),
                ("startTime", start_ms.to_string()),
                ("endTime", end_ms.to_string()),
                ("limit", KLINES_LIMIT.to_string()),
            ])
            .send()
            .context("Failed to send klines request")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().unwrap_or_default();
            anyhow::bail!("API returned status {}: {}", status, body);
        }

        let rows: Vec<Value> = response.json().context("Failed to parse klines response")?;
        rows.iter()
            .enumerate()
            .map(|(i, row)| parse_kline(row).with_context(|| format!("Malformed kline at row {}", i)))
            .collect()
    }

    /// Fetch every kline in `[start_ms, end_ms]`, paging forward
    pub fn fetch_range(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<Candle>> {
        info!(
            "Fetching {} {} klines from {} to {}",
            symbol,
            interval,
            crate::types::millis_to_datetime(start_ms),
            crate::types::millis_to_datetime(end_ms)
        );

        let mut all_candles: Vec<Candle> = Vec::new();
        let mut current_start = start_ms;

        while current_start < end_ms {
            let page = self.fetch_page(symbol, interval, current_start, end_ms)?;
            let Some(last) = page.last() else {
                break;
            };

            current_start = last.open_time + 1;
            let page_len = page.len();
            debug!(
                "  Received {} klines, last open time {}",
                page_len,
                last.datetime().format("%Y-%m-%d %H:%M")
            );
            all_candles.extend(page);

            // Rate limiting
            sleep(self.request_delay);

            if page_len < KLINES_LIMIT {
                break;
            }
        }

        info!("Total klines fetched for {}: {}", symbol, all_candles.len());
        Ok(all_candles)
    }
}

impl CandleSource for BinanceDataFetcher {
    fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        self.fetch_range(symbol, interval, start_ms, end_ms)
            .map_err(|e| BacktestError::DataFetch(format!("{:#}", e)))
    }
}

/// Parse a raw kline row: `[openTime, "open", "high", "low", "close", "volume", ...]`
fn parse_kline(row: &Value) -> Result<Candle> {
    let fields = row.as_array().context("kline is not an array")?;
    if fields.len() < 6 {
        anyhow::bail!("kline has {} fields, expected at least 6", fields.len());
    }

    let open_time = fields[0].as_i64().context("open time is not an integer")?;
    let number = |idx: usize| -> Result<f64> {
        match &fields[idx] {
            Value::String(s) => s
                .parse::<f64>()
                .with_context(|| format!("field {} is not a number: {}", idx, s)),
            Value::Number(n) => n
                .as_f64()
                .with_context(|| format!("field {} is not a float", idx)),
            other => anyhow::bail!("field {} has unexpected type: {}", idx, other),
        }
    };

    Ok(Candle::new_unchecked(
        open_time,
        number(1)?,
        number(2)?,
        number(3)?,
        number(4)?,
        number(5)?,
    ))
}

// =============================================================================
// In-memory source
// =============================================================================

/// Candle source over an already loaded series (CSV cache, tests)
#[derive(Debug, Clone, Default)]
pub struct MemoryCandleSource {
    candles: Vec<Candle>,
}

impl MemoryCandleSource {
    pub fn new(candles: Vec<Candle>) -> Self {
        Self { candles }
    }

    pub fn from_csv(path: impl AsRef<Path>) -> Result<Self> {
        Ok(Self::new(load_csv(path)?))
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }
}

impl CandleSource for MemoryCandleSource {
    fn fetch_candles(
        &self,
        _symbol: &str,
        _interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        Ok(self
            .candles
            .iter()
            .filter(|c| c.open_time >= start_ms && c.open_time <= end_ms)
            .copied()
            .collect())
    }
}

// =============================================================================
// Data Validation
// =============================================================================

/// Validate candle data for consistency
pub fn validate_candles(candles: &[Candle]) -> ValidationResult {
    let mut errors = Vec::new();
    let mut warnings = Vec::new();

    if candles.is_empty() {
        errors.push("No candles provided".to_string());
        return ValidationResult { errors, warnings };
    }

    let mut gaps = 0usize;
    let expected_step = candles
        .windows(2)
        .map(|w| w[1].open_time - w[0].open_time)
        .filter(|d| *d > 0)
        .min();

    for (i, candle) in candles.iter().enumerate() {
        if let Err(e) = candle.validate() {
            errors.push(format!("Candle {}: {}", i, e));
        }
        if i > 0 {
            let delta = candle.open_time - candles[i - 1].open_time;
            if delta <= 0 {
                errors.push(format!("Candle {}: not chronological", i));
            } else if expected_step.is_some_and(|step| delta > step) {
                gaps += 1;
            }
        }
    }

    if gaps > 0 {
        warnings.push(format!("{} gaps in the candle series", gaps));
    }

    ValidationResult { errors, warnings }
}

/// Result of data validation
#[derive(Debug)]
pub struct ValidationResult {
    pub errors: Vec<String>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Log warnings and errors
    pub fn log(&self) {
        for w in &self.warnings {
            warn!("{}", w);
        }
        for e in &self.errors {
            warn!("Invalid data: {}", e);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle::new_unchecked(open_time, close, close + 1.0, close - 1.0, close, 10.0)
    }

    #[test]
    fn test_parse_kline() {
        let row = json!([
            1_700_000_000_000_i64,
            "100.5",
            "101.0",
            "99.5",
            "100.0",
            "12.34",
            1_700_000_059_999_i64,
            "1234.5",
            42,
            "6.0",
            "600.0",
            "0"
        ]);
        let c = parse_kline(&row).unwrap();
        assert_eq!(c.open_time, 1_700_000_000_000);
        assert_eq!(c.open, 100.5);
        assert_eq!(c.low, 99.5);
        assert_eq!(c.volume, 12.34);

        assert!(parse_kline(&json!([1, "2"])).is_err());
        assert!(parse_kline(&json!({"open": 1})).is_err());
    }

    #[test]
    fn test_csv_round_trip_keeps_values() {
        let dir = std::env::temp_dir().join(format!("phobos_csv_{}", std::process::id()));
        let path = dir.join("candles.csv");
        let candles = vec![candle(0, 100.0), candle(60_000, 101.25)];

        save_to_csv(&candles, &path).unwrap();
        let loaded = load_csv(&path).unwrap();
        assert_eq!(loaded, candles);

        fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn test_memory_source_filters_range() {
        let source = MemoryCandleSource::new((0..10).map(|i| candle(i * 60_000, 100.0)).collect());
        let window = source
            .fetch_candles("BTCUSDT", "1m", 120_000, 300_000)
            .unwrap();
        assert_eq!(window.len(), 4);
        assert_eq!(window[0].open_time, 120_000);
    }

    #[test]
    fn test_validate_candles() {
        let candles = vec![candle(0, 100.0), candle(60_000, 100.0), candle(180_000, 100.0)];
        let result = validate_candles(&candles);
        assert!(result.is_valid());
        assert_eq!(result.warnings.len(), 1);

        let candles = vec![candle(60_000, 100.0), candle(0, 100.0)];
        assert!(!validate_candles(&candles).is_valid());
        assert!(!validate_candles(&[]).is_valid());
    }

    #[test]
    fn test_cache_file_name() {
        assert_eq!(
            cache_file_name("BTCUSDT", "1m", "2024-01-01", "2024-01-31"),
            "BTCUSDT_1m_2024-01-01_2024-01-31.csv"
        );
    }
}
