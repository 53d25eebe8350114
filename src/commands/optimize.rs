//! Optimize command implementation with progress tracking

use anyhow::{Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use phobos_engine::optimizer::{self, OptimizationResult};
use phobos_engine::{BacktestConfig, OptimizationMetric, Optimizer, SortOrder};
use tracing::info;

pub fn run(
    config_path: String,
    data_file: Option<String>,
    metric_override: Option<String>,
    order_override: Option<String>,
    top_override: Option<usize>,
    sequential: bool,
) -> Result<()> {
    info!("Starting optimization");

    // Load base configuration
    let config = BacktestConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);
    config.log_summary();

    let mut settings = config.optimization_or_default();
    if let Some(metric) = metric_override {
        settings.target_metric = metric.parse::<OptimizationMetric>()?;
    }
    if let Some(order) = order_override {
        settings.sort_order = order.parse::<SortOrder>()?;
    }
    if let Some(top) = top_override {
        settings.top = top;
    }
    settings.validate()?;

    let total = optimizer::count_combinations(&settings.param_ranges)?;
    info!("Parameter combinations: {}", total);

    let candles = super::load_candles(&config, data_file.as_deref())?;

    // Print summary
    println!("\n{}", "=".repeat(70));
    println!("OPTIMIZATION SUMMARY");
    println!("{}", "=".repeat(70));
    println!("  Symbol:        {} {}", config.symbol, config.interval);
    println!("  Period:        {} to {}", config.start_date, config.end_date);
    println!("  Candles:       {}", candles.len());
    for (param, range) in &settings.param_ranges {
        println!(
            "  {:<24} {} to {} step {}",
            format!("{}:", param),
            range.start,
            range.end,
            range.step
        );
    }
    println!("  Combinations:  {}", total);
    println!(
        "  Target:        {} ({})",
        settings.target_metric, settings.sort_order
    );
    println!(
        "  Mode:          {}",
        if sequential { "sequential" } else { "parallel" }
    );
    println!("{}\n", "=".repeat(70));

    // Single progress bar (tqdm style)
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "⚡ {percent:>3}%|{bar:40}| {pos}/{len} [{elapsed}<{eta}, {per_sec}] ✓ {msg}",
            )
            .context("Invalid progress bar template")?
            .progress_chars("█░ "),
    );
    pb.set_message("starting...");
    pb.tick();

    let outcome = Optimizer::new(
        settings.search_base(&config.strategy),
        config.initial_capital,
    )
    .with_target(settings.target_metric, settings.sort_order)
    .sequential(sequential)
    .run_with_progress(&candles, &settings.param_ranges, Some(&pb));

    let outcome = match outcome {
        Ok(outcome) => outcome,
        Err(e) => {
            pb.abandon_with_message("failed");
            return Err(e.into());
        }
    };

    pb.finish_with_message(format!("{} valid", outcome.valid_count()));
    println!();

    info!(
        "Total results: {}, valid: {}, sorted by: {} {}",
        outcome.results.len(),
        outcome.valid_count(),
        outcome.metric,
        outcome.order
    );

    // Display top results
    let display_count = settings.top.min(outcome.results.len());
    println!("\n{}", "=".repeat(120));
    println!(
        "TOP {} OPTIMIZATION RESULTS (sorted by {} {})",
        display_count, outcome.metric, outcome.order
    );
    println!("{}", "=".repeat(120));
    println!(
        "{:<4} {:>12} {:>12} {:>10} {:>8} {:>8} {:>6} | Parameters",
        "Rank", "Metric", "NetProfit", "PF", "WinR%", "MaxDD%", "Trades"
    );
    println!("{}", "-".repeat(120));

    for (i, result) in outcome.results.iter().take(display_count).enumerate() {
        println!(
            "{:<4} {:>12} {:>12.2} {:>10} {:>8.2} {:>8.2} {:>6} | {}",
            i + 1,
            result.metric_value.to_string(),
            result.net_profit,
            result.profit_factor.to_string(),
            result.win_rate,
            result.max_drawdown_percent,
            result.total_trades,
            format_params(result)
        );
    }
    println!("{}", "=".repeat(120));

    println!("\nBest parameters:");
    println!("{}", serde_json::to_string_pretty(&outcome.best_params)?);

    info!("Optimization completed successfully");

    Ok(())
}

fn format_params(result: &OptimizationResult) -> String {
    result
        .params
        .iter()
        .map(|(param, value)| format!("{}={}", param, value))
        .collect::<Vec<_>>()
        .join(" ")
}
