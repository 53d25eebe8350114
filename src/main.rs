//! Phobos engine - main entry point
//!
//! This binary provides four subcommands:
//! - backtest: Run a single strategy backtest
//! - optimize: Grid-search strategy parameters
//! - oos: In-sample optimization followed by an out-of-sample backtest
//! - download: Download historical klines from Binance to CSV

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

mod commands;

const DEFAULT_CONFIG: &str = "configs/backtest_config.json";

#[derive(Parser, Debug)]
#[command(name = "phobos-engine")]
#[command(about = "RSI mean-reversion backtesting, optimization and out-of-sample validation", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run strategy backtest
    Backtest {
        /// Path to configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// CSV file with candles (skips the download)
        #[arg(short, long)]
        data_file: Option<String>,

        /// Initial capital
        #[arg(long)]
        capital: Option<f64>,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: Option<String>,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: Option<String>,

        /// Print every trade
        #[arg(long)]
        trades: bool,
    },

    /// Optimize strategy parameters
    Optimize {
        /// Path to base configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// CSV file with candles (skips the download)
        #[arg(short, long)]
        data_file: Option<String>,

        /// Metric to rank by (profitFactor, netProfit, winRate, maxDrawdownPercent, ...)
        #[arg(short, long)]
        metric: Option<String>,

        /// Sort order (asc or desc)
        #[arg(short, long)]
        order: Option<String>,

        /// Number of top results to show
        #[arg(short, long)]
        top: Option<usize>,

        /// Run sequentially instead of parallel
        #[arg(long)]
        sequential: bool,
    },

    /// Optimize in-sample, then validate out-of-sample
    Oos {
        /// Path to base configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG)]
        config: String,

        /// CSV file covering both windows (skips the download)
        #[arg(short, long)]
        data_file: Option<String>,

        /// In-sample start date (YYYY-MM-DD)
        #[arg(long)]
        is_start: String,

        /// In-sample end date (YYYY-MM-DD)
        #[arg(long)]
        is_end: String,

        /// Out-of-sample start date (YYYY-MM-DD)
        #[arg(long)]
        oos_start: String,

        /// Out-of-sample end date (YYYY-MM-DD)
        #[arg(long)]
        oos_end: String,

        /// Symbol (overrides config file)
        #[arg(short, long)]
        symbol: Option<String>,

        /// Write the JSON report to this file
        #[arg(long)]
        output: Option<String>,
    },

    /// Download historical klines from Binance
    Download {
        /// Symbol, e.g. BTCUSDT
        #[arg(short, long, default_value = "BTCUSDT")]
        symbol: String,

        /// Kline interval, e.g. 1m, 5m, 1h
        #[arg(short, long, default_value = "1m")]
        interval: String,

        /// Start date (YYYY-MM-DD)
        #[arg(long)]
        start: String,

        /// End date (YYYY-MM-DD)
        #[arg(long)]
        end: String,

        /// Output directory
        #[arg(short, long, default_value = "data")]
        output: String,
    },
}

fn setup_logging(verbose: bool, command_name: &str, file_only: bool) -> Result<()> {
    std::fs::create_dir_all("logs")?;

    // {command}_{date}.log
    let log_filename = format!(
        "{}_{}.log",
        command_name,
        chrono::Local::now().format("%Y-%m-%d_%H-%M-%S")
    );
    let log_path = PathBuf::from("logs").join(&log_filename);

    // Filter out noisy HTTP crates
    let level = if verbose { "debug" } else { "info" };
    let filter_str = format!(
        "{},hyper=warn,hyper_util=warn,reqwest=warn,rustls=warn,h2=warn",
        level
    );
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&filter_str));

    let file_appender = tracing_appender::rolling::never("logs", &log_filename);

    if file_only {
        // Optimizer: file only, the console belongs to the progress bar
        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    } else {
        let console_layer = tracing_subscriber::fmt::layer()
            .with_target(true)
            .with_thread_ids(false)
            .with_thread_names(false)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(true);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_writer(file_appender)
            .with_target(true)
            .with_line_number(true)
            .with_file(true)
            .with_ansi(false);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        info!("Logging initialized");
        info!("Log file: {}", log_path.display());
    }

    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let (command_name, file_only) = match &cli.command {
        Commands::Backtest { .. } => ("backtest", false),
        Commands::Optimize { .. } => ("optimize", true),
        Commands::Oos { .. } => ("oos", false),
        Commands::Download { .. } => ("download", false),
    };

    setup_logging(cli.verbose, command_name, file_only)?;

    match cli.command {
        Commands::Backtest {
            config,
            data_file,
            capital,
            start,
            end,
            trades,
        } => commands::backtest::run(config, data_file, capital, start, end, trades),

        Commands::Optimize {
            config,
            data_file,
            metric,
            order,
            top,
            sequential,
        } => commands::optimize::run(config, data_file, metric, order, top, sequential),

        Commands::Oos {
            config,
            data_file,
            is_start,
            is_end,
            oos_start,
            oos_end,
            symbol,
            output,
        } => commands::oos::run(commands::oos::OosArgs {
            config_path: config,
            data_file,
            is_start,
            is_end,
            oos_start,
            oos_end,
            symbol,
            output,
        }),

        Commands::Download {
            symbol,
            interval,
            start,
            end,
            output,
        } => commands::download::run(symbol, interval, start, end, output),
    }
}
