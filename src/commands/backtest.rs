//! Backtest command implementation

use anyhow::Result;
use phobos_engine::{metrics, BacktestConfig, Backtester};
use tracing::info;

pub fn run(
    config_path: String,
    data_file: Option<String>,
    capital_override: Option<f64>,
    start_override: Option<String>,
    end_override: Option<String>,
    show_trades: bool,
) -> Result<()> {
    info!("Starting backtest");

    // Load configuration
    let mut config = BacktestConfig::from_file(&config_path)?;
    info!("Loaded configuration from: {}", config_path);

    // Apply overrides
    if let Some(capital) = capital_override {
        info!("Overriding initial capital to: ${:.2}", capital);
        config.initial_capital = capital;
    }

    if let Some(start) = start_override {
        info!("Overriding start date to: {}", start);
        config.start_date = start;
    }

    if let Some(end) = end_override {
        info!("Overriding end date to: {}", end);
        config.end_date = end;
    }

    config.validate()?;
    config.log_summary();

    let candles = super::load_candles(&config, data_file.as_deref())?;

    info!("Running backtest...");
    let backtester = Backtester::new(config.strategy.clone(), config.initial_capital);
    let result = backtester.run(&candles)?;
    let m = metrics::calculate(&result.trades, config.initial_capital);

    if show_trades && !result.trades.is_empty() {
        println!("\n{}", "=".repeat(100));
        println!("TRADES");
        println!("{}", "=".repeat(100));
        println!(
            "{:<17} {:>12} {:<17} {:>12} {:>12} {:>10}  Reason",
            "Entry", "Price", "Exit", "Price", "Quantity", "Profit"
        );
        println!("{}", "-".repeat(100));
        for trade in &result.trades {
            println!(
                "{:<17} {:>12.4} {:<17} {:>12.4} {:>12.6} {:>10.2}  {}",
                phobos_engine::millis_to_datetime(trade.entry_time).format("%Y-%m-%d %H:%M").to_string(),
                trade.entry_price,
                phobos_engine::millis_to_datetime(trade.exit_time).format("%Y-%m-%d %H:%M").to_string(),
                trade.exit_price,
                trade.quantity,
                trade.profit,
                trade.exit_reason
            );
        }
        println!("{}", "=".repeat(100));
    }

    // Print results
    println!("\n{}", "=".repeat(60));
    println!("BACKTEST RESULTS: {} {}", config.symbol, config.interval);
    println!("{}", "=".repeat(60));
    println!("Period:             {} to {}", config.start_date, config.end_date);
    println!("Candles:            {}", candles.len());
    println!("Initial Capital:    ${:.2}", config.initial_capital);
    println!("Final Balance:      ${:.2}", result.final_balance);
    println!(
        "Net Profit:         ${:.2} ({:.2}%)",
        m.net_profit, m.net_profit_percent
    );
    println!("Profit Factor:      {}", m.profit_factor);
    println!("Win Rate:           {:.2}%", m.win_rate);
    println!("Max Drawdown:       ${:.2} ({:.2}%)", m.max_drawdown, m.max_drawdown_percent);
    println!("Total Trades:       {}", m.total_trades);
    println!("Winning Trades:     {}", m.wins);
    println!("Losing Trades:      {}", m.losses);
    println!("Average Win:        ${:.2}", m.avg_win);
    println!("Average Loss:       ${:.2}", m.avg_loss);
    println!("Payoff Ratio:       {}", m.payoff_ratio);
    println!("Expectancy:         ${:.2}", m.expectancy);
    println!("Largest Win:        ${:.2}", m.largest_win);
    println!("Largest Loss:       ${:.2}", m.largest_loss);
    if result.final_state.is_open {
        println!(
            "Open Position:      {:.6} @ {:.4} (marked to market)",
            result.final_state.position_quantity, result.final_state.entry_price
        );
    }
    println!("{}", "=".repeat(60));

    info!("Backtest completed successfully");

    Ok(())
}
