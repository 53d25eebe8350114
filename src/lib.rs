//! Phobos Engine
//!
//! RSI mean-reversion backtester for spot crypto markets: a single-position
//! simulation engine, trade-log metrics, a parallel parameter grid search,
//! and in-sample / out-of-sample validation over Binance klines.

pub mod backtest;
pub mod config;
pub mod data;
pub mod error;
pub mod indicators;
pub mod metrics;
pub mod oos;
pub mod optimizer;
pub mod session;
pub mod strategy;
pub mod types;

pub use backtest::{run_backtest, BacktestResult, Backtester, PortfolioState};
pub use config::BacktestConfig;
pub use error::{BacktestError, CoreResult};
pub use metrics::{PerformanceMetrics, Ratio};
pub use oos::{perform_oos_test, CandleSource, OosConfig, OosReport};
pub use optimizer::{run_optimization, OptimizationMetric, Optimizer, ParamRange, SortOrder};
pub use strategy::{StrategyParam, StrategyParams};
pub use types::*;
