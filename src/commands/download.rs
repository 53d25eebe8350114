//! Download command - fetch historical klines from Binance into a CSV cache

use anyhow::Result;
use phobos_engine::config::{parse_end_date, parse_start_date};
use phobos_engine::data::{self, BinanceDataFetcher};
use std::path::PathBuf;
use tracing::info;

pub fn run(symbol: String, interval: String, start: String, end: String, output: String) -> Result<()> {
    info!("Starting data download");

    let symbol = symbol.trim().to_uppercase();
    if !data::INTERVALS.contains(&interval.as_str()) {
        anyhow::bail!(
            "Unknown interval: {}. Available intervals: {}",
            interval,
            data::INTERVALS.join(", ")
        );
    }

    let start_ms = parse_start_date(&start)?;
    let end_ms = parse_end_date(&end)?;
    if start_ms >= end_ms {
        anyhow::bail!("Start date {} must be before end date {}", start, end);
    }

    let fetcher = BinanceDataFetcher::from_env()?;

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOADING HISTORICAL DATA FROM BINANCE");
    println!("{}", "=".repeat(60));
    println!("  Endpoint:   {}", fetcher.base_url());
    println!("  Symbol:     {}", symbol);
    println!("  Interval:   {}", interval);
    println!("  Period:     {} to {}", start, end);
    println!("  Output:     {}", output);
    println!("{}\n", "=".repeat(60));

    let candles = fetcher.fetch_range(&symbol, &interval, start_ms, end_ms)?;
    let validation = data::validate_candles(&candles);
    validation.log();

    let path = PathBuf::from(&output).join(data::cache_file_name(&symbol, &interval, &start, &end));
    let written = data::save_to_csv(&candles, &path)?;

    println!("\n{}", "=".repeat(60));
    println!("DOWNLOAD COMPLETE");
    println!("{}", "=".repeat(60));
    println!("  Candles:    {}", candles.len());
    println!("  Warnings:   {}", validation.warnings.len());
    println!("  File:       {}", written.display());
    println!("{}", "=".repeat(60));

    Ok(())
}
