//! Configuration management
//!
//! Handles loading and parsing of the JSON backtest configuration, with
//! environment variable support (via `.env`) for the market-data endpoint.

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::error::{BacktestError, CoreResult};
use crate::oos::OosSettings;
use crate::optimizer::{OptimizationMetric, ParamRange, ParamRanges, SortOrder};
use crate::strategy::{StrategyParam, StrategyParams};

pub const DEFAULT_API_URL: &str = "https://api.binance.com";
pub const API_URL_ENV: &str = "BINANCE_API_URL";
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Main configuration structure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestConfig {
    pub symbol: String,
    /// Kline interval, e.g. `1m`
    #[serde(default = "default_interval")]
    pub interval: String,
    /// First day, `YYYY-MM-DD` (UTC midnight)
    pub start_date: String,
    /// Last day, `YYYY-MM-DD` (until 23:59:59.999 UTC)
    pub end_date: String,
    pub initial_capital: f64,
    /// Fee rate per fill as a fraction (not applied by the engine)
    #[serde(default)]
    pub fee_rate: f64,
    /// Slippage as a fraction (not applied by the engine)
    #[serde(default)]
    pub slippage_percent: f64,
    /// Fixed quote amount per trade (not applied by the engine)
    #[serde(default, rename = "fixedTradeAmountUSD")]
    pub fixed_trade_amount_usd: f64,
    #[serde(default)]
    pub strategy: StrategyParams,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub optimization: Option<OptimizationConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub oos: Option<OosSettings>,
    /// Market-data base URL, `BINANCE_API_URL` takes precedence
    #[serde(default = "default_api_url")]
    pub api_url: String,
}

fn default_interval() -> String {
    "1m".to_string()
}

fn default_api_url() -> String {
    DEFAULT_API_URL.to_string()
}

impl Default for BacktestConfig {
    fn default() -> Self {
        BacktestConfig {
            symbol: "BTCUSDT".to_string(),
            interval: default_interval(),
            start_date: "2024-01-01".to_string(),
            end_date: "2024-01-31".to_string(),
            initial_capital: 1000.0,
            fee_rate: 0.001,
            slippage_percent: 0.0005,
            fixed_trade_amount_usd: 100.0,
            strategy: StrategyParams::default(),
            optimization: None,
            oos: None,
            api_url: default_api_url(),
        }
    }
}

impl BacktestConfig {
    /// Load configuration from JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let mut config: BacktestConfig =
            serde_json::from_str(&contents).context("Failed to parse config JSON")?;

        // .env is optional
        dotenv::dotenv().ok();
        if let Ok(url) = std::env::var(API_URL_ENV) {
            config.api_url = url;
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject invalid configuration before any data is fetched
    pub fn validate(&self) -> CoreResult<()> {
        if self.symbol.trim().is_empty() {
            return Err(BacktestError::config("symbol is required"));
        }
        if self.interval.trim().is_empty() {
            return Err(BacktestError::config("interval must not be empty"));
        }
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(BacktestError::config(format!(
                "initialCapital must be positive (got {})",
                self.initial_capital
            )));
        }
        for (name, value) in [
            ("feeRate", self.fee_rate),
            ("slippagePercent", self.slippage_percent),
            ("fixedTradeAmountUSD", self.fixed_trade_amount_usd),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(BacktestError::config(format!(
                    "{} must be non-negative (got {})",
                    name, value
                )));
            }
        }
        self.strategy.validate()?;
        self.time_range()?;
        if let Some(optimization) = &self.optimization {
            optimization.validate()?;
        }
        Ok(())
    }

    /// `(start_ms, end_ms)` of the configured period
    pub fn time_range(&self) -> CoreResult<(i64, i64)> {
        let start = parse_start_date(&self.start_date)?;
        let end = parse_end_date(&self.end_date)?;
        if start >= end {
            return Err(BacktestError::config(format!(
                "startDate {} must be before endDate {}",
                self.start_date, self.end_date
            )));
        }
        Ok((start, end))
    }

    /// Log the run settings, including the ones the engine does not apply
    pub fn log_summary(&self) {
        info!(
            "Config: {} {} from {} to {}, capital ${:.2}",
            self.symbol, self.interval, self.start_date, self.end_date, self.initial_capital
        );
        if self.fee_rate > 0.0 || self.slippage_percent > 0.0 || self.fixed_trade_amount_usd > 0.0 {
            warn!(
                "feeRate={}, slippagePercent={}, fixedTradeAmountUSD={} are not applied by the simulation",
                self.fee_rate, self.slippage_percent, self.fixed_trade_amount_usd
            );
        }
    }

    pub fn optimization_or_default(&self) -> OptimizationConfig {
        self.optimization.clone().unwrap_or_default()
    }

    pub fn oos_or_default(&self) -> OosSettings {
        self.oos.clone().unwrap_or_default()
    }
}

/// Grid search configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OptimizationConfig {
    pub param_ranges: ParamRanges,
    pub target_metric: OptimizationMetric,
    pub sort_order: SortOrder,
    /// Rows printed from the ranked table
    pub top: usize,
    /// Turn the trailing stop and MA exit off so only the ranged parameters vary
    pub fixed_exits_only: bool,
}

impl Default for OptimizationConfig {
    fn default() -> Self {
        let mut param_ranges = ParamRanges::new();
        param_ranges.insert(StrategyParam::RsiOversold, ParamRange::new(20.0, 40.0, 2.0));
        param_ranges.insert(
            StrategyParam::StopLossPercentage,
            ParamRange::new(1.0, 5.0, 0.5),
        );
        OptimizationConfig {
            param_ranges,
            target_metric: OptimizationMetric::NetProfit,
            sort_order: SortOrder::Desc,
            top: 10,
            fixed_exits_only: true,
        }
    }
}

impl OptimizationConfig {
    pub fn validate(&self) -> CoreResult<()> {
        if self.param_ranges.is_empty() {
            return Err(BacktestError::config("optimization.paramRanges must not be empty"));
        }
        for (param, range) in &self.param_ranges {
            range
                .values()
                .map_err(|e| BacktestError::config(format!("{}: {}", param, e)))?;
        }
        Ok(())
    }

    /// Base parameters for the search
    pub fn search_base(&self, strategy: &StrategyParams) -> StrategyParams {
        if self.fixed_exits_only {
            StrategyParams {
                use_trailing_stop: false,
                use_ma_exit_filter: false,
                ..strategy.clone()
            }
        } else {
            strategy.clone()
        }
    }
}

fn parse_date(date: &str) -> CoreResult<NaiveDate> {
    NaiveDate::parse_from_str(date.trim(), DATE_FORMAT).map_err(|e| {
        BacktestError::config(format!("invalid date '{}' (expected YYYY-MM-DD): {}", date, e))
    })
}

/// `YYYY-MM-DD` to epoch milliseconds at 00:00:00.000 UTC
pub fn parse_start_date(date: &str) -> CoreResult<i64> {
    Ok(parse_date(date)?.and_time(NaiveTime::MIN).and_utc().timestamp_millis())
}

/// `YYYY-MM-DD` to epoch milliseconds at 23:59:59.999 UTC
pub fn parse_end_date(date: &str) -> CoreResult<i64> {
    let end_of_day = NaiveTime::from_hms_milli_opt(23, 59, 59, 999)
        .ok_or_else(|| BacktestError::config("invalid end-of-day time"))?;
    Ok(parse_date(date)?.and_time(end_of_day).and_utc().timestamp_millis())
}
