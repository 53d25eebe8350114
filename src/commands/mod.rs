//! CLI subcommands

pub mod backtest;
pub mod download;
pub mod oos;
pub mod optimize;

use anyhow::{Context, Result};
use phobos_engine::data::{self, BinanceDataFetcher};
use phobos_engine::{BacktestConfig, Candle, CandleSource};
use tracing::info;

/// Candles for the configured period, from `data_file` when given, else from Binance
pub(crate) fn load_candles(config: &BacktestConfig, data_file: Option<&str>) -> Result<Vec<Candle>> {
    let (start_ms, end_ms) = config.time_range()?;

    let candles = match data_file {
        Some(path) => {
            info!("Loading candles from: {}", path);
            data::MemoryCandleSource::from_csv(path)?.fetch_candles(
                &config.symbol,
                &config.interval,
                start_ms,
                end_ms,
            )?
        }
        None => {
            let fetcher = BinanceDataFetcher::new(&config.api_url)?;
            fetcher
                .fetch_range(&config.symbol, &config.interval, start_ms, end_ms)
                .with_context(|| format!("Failed to fetch {} klines", config.symbol))?
        }
    };

    let validation = data::validate_candles(&candles);
    validation.log();
    if candles.is_empty() {
        anyhow::bail!(
            "No candles for {} between {} and {}",
            config.symbol,
            config.start_date,
            config.end_date
        );
    }

    info!("Loaded {} candles", candles.len());
    Ok(candles)
}
