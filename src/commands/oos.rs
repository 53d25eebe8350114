//! Out-of-sample command: optimize on one window, validate on the next

use anyhow::{Context, Result};
use phobos_engine::data::{BinanceDataFetcher, MemoryCandleSource};
use phobos_engine::oos::{OosReport, OosTester};
use phobos_engine::{BacktestConfig, CandleSource, OosConfig};
use std::fs;
use tracing::info;

pub struct OosArgs {
    pub config_path: String,
    pub data_file: Option<String>,
    pub is_start: String,
    pub is_end: String,
    pub oos_start: String,
    pub oos_end: String,
    pub symbol: Option<String>,
    pub output: Option<String>,
}

pub fn run(args: OosArgs) -> Result<()> {
    info!("Starting out-of-sample test");

    let config = BacktestConfig::from_file(&args.config_path)?;
    info!("Loaded configuration from: {}", args.config_path);
    config.log_summary();

    let oos_config = OosConfig {
        symbol: args.symbol.unwrap_or_else(|| config.symbol.clone()),
        is_start_date: args.is_start,
        is_end_date: args.is_end,
        oos_start_date: args.oos_start,
        oos_end_date: args.oos_end,
    };
    oos_config.windows()?;

    let report = match args.data_file {
        Some(path) => {
            info!("Loading candles from: {}", path);
            let source = MemoryCandleSource::from_csv(&path)?;
            run_with_source(source, &config, &oos_config)?
        }
        None => {
            let source = BinanceDataFetcher::new(&config.api_url)?;
            run_with_source(source, &config, &oos_config)?
        }
    };

    let json = serde_json::to_string_pretty(&report).context("Failed to serialize OOS report")?;

    println!("\n{}", "=".repeat(60));
    println!("OUT-OF-SAMPLE TEST: {}", report.symbol);
    println!("{}", "=".repeat(60));
    println!("In-sample:          {} ({} candles)", report.in_sample_period, report.in_sample_candles);
    println!(
        "Out-of-sample:      {} ({} candles)",
        report.out_of_sample_period, report.out_of_sample_candles
    );
    println!("In-sample best:     {}", report.in_sample_metric);
    println!("{}", "-".repeat(60));
    println!("{}", json);
    println!("{}", "=".repeat(60));

    if let Some(output) = args.output {
        fs::write(&output, &json).with_context(|| format!("Failed to write {}", output))?;
        info!("Report written to: {}", output);
    }

    info!("Out-of-sample test completed successfully");

    Ok(())
}

fn run_with_source<S: CandleSource>(
    source: S,
    config: &BacktestConfig,
    oos_config: &OosConfig,
) -> Result<OosReport> {
    let report = OosTester::new(source, config.strategy.clone(), config.initial_capital)
        .with_interval(config.interval.clone())
        .with_settings(config.oos_or_default())
        .run(oos_config)?;
    Ok(report)
}
