//! Out-of-sample validation
//!
//! Optimizes on an in-sample window, then backtests the winning parameters
//! once on a later out-of-sample window. Candles come from a [`CandleSource`],
//! fetched once per window before any simulation starts.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::backtest::Backtester;
use crate::config::{parse_end_date, parse_start_date};
use crate::error::{BacktestError, CoreResult};
use crate::metrics::{self, PerformanceMetrics, Ratio};
use crate::optimizer::{
    OptimizationMetric, Optimizer, ParamRange, ParamRanges, ParamSet, RankValue, SortOrder,
};
use crate::strategy::{StrategyParam, StrategyParams};
use crate::Candle;

/// Supplier of ordered historical candles
pub trait CandleSource {
    /// Candles with `start_ms <= open_time <= end_ms`, ascending
    fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> CoreResult<Vec<Candle>>;
}

impl<T: CandleSource + ?Sized> CandleSource for &T {
    fn fetch_candles(
        &self,
        symbol: &str,
        interval: &str,
        start_ms: i64,
        end_ms: i64,
    ) -> CoreResult<Vec<Candle>> {
        (**self).fetch_candles(symbol, interval, start_ms, end_ms)
    }
}

/// Windows for one OOS run, dates as `YYYY-MM-DD`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OosConfig {
    pub symbol: String,
    pub is_start_date: String,
    pub is_end_date: String,
    pub oos_start_date: String,
    pub oos_end_date: String,
}

/// Parsed window bounds in epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OosWindows {
    pub is_start: i64,
    pub is_end: i64,
    pub oos_start: i64,
    pub oos_end: i64,
}

impl OosConfig {
    /// Parse and check both windows
    ///
    /// Overlapping windows are allowed and only logged.
    pub fn windows(&self) -> CoreResult<OosWindows> {
        let windows = OosWindows {
            is_start: parse_start_date(&self.is_start_date)?,
            is_end: parse_end_date(&self.is_end_date)?,
            oos_start: parse_start_date(&self.oos_start_date)?,
            oos_end: parse_end_date(&self.oos_end_date)?,
        };

        if windows.is_start >= windows.is_end {
            return Err(BacktestError::config(format!(
                "in-sample start {} must be before end {}",
                self.is_start_date, self.is_end_date
            )));
        }
        if windows.oos_start >= windows.oos_end {
            return Err(BacktestError::config(format!(
                "out-of-sample start {} must be before end {}",
                self.oos_start_date, self.oos_end_date
            )));
        }
        if windows.is_end >= windows.oos_start {
            warn!(
                "In-sample window (ends {}) overlaps or ends after the out-of-sample start ({})",
                self.is_end_date, self.oos_start_date
            );
        }

        Ok(windows)
    }
}

/// In-sample search settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OosSettings {
    pub param_ranges: ParamRanges,
    pub target_metric: OptimizationMetric,
    pub sort_order: SortOrder,
}

impl Default for OosSettings {
    fn default() -> Self {
        let mut param_ranges = ParamRanges::new();
        param_ranges.insert(StrategyParam::RsiOversold, ParamRange::new(29.0, 40.0, 2.0));
        param_ranges.insert(
            StrategyParam::StopLossPercentage,
            ParamRange::new(1.0, 5.0, 0.5),
        );
        OosSettings {
            param_ranges,
            target_metric: OptimizationMetric::ProfitFactor,
            sort_order: SortOrder::Desc,
        }
    }
}

/// OOS metrics formatted for reporting
///
/// Non-finite numbers print as zero; unbounded ratios print as `Infinity`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OosMetricsSummary {
    pub net_profit: String,
    pub net_profit_percent: String,
    pub total_trades: usize,
    pub win_rate: String,
    pub profit_factor: String,
    pub expectancy: String,
    pub max_drawdown: String,
    pub max_drawdown_percent: String,
    pub avg_win: String,
    pub avg_loss: String,
    pub payoff_ratio: String,
}

impl From<&PerformanceMetrics> for OosMetricsSummary {
    fn from(m: &PerformanceMetrics) -> Self {
        OosMetricsSummary {
            net_profit: fixed(m.net_profit, 2),
            net_profit_percent: fixed(m.net_profit_percent, 2),
            total_trades: m.total_trades,
            win_rate: fixed(m.win_rate, 1),
            profit_factor: ratio(m.profit_factor),
            expectancy: fixed(m.expectancy, 2),
            max_drawdown: fixed(m.max_drawdown, 2),
            max_drawdown_percent: fixed(m.max_drawdown_percent, 2),
            avg_win: fixed(m.avg_win, 2),
            avg_loss: fixed(m.avg_loss, 2),
            payoff_ratio: ratio(m.payoff_ratio),
        }
    }
}

fn fixed(value: f64, decimals: usize) -> String {
    let value = if value.is_finite() { value } else { 0.0 };
    format!("{:.*}", decimals, value)
}

fn ratio(value: Ratio) -> String {
    match value {
        Ratio::Infinite => "Infinity".to_string(),
        Ratio::Finite(v) => fixed(v, 2),
    }
}

/// Result of one OOS run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OosReport {
    pub symbol: String,
    pub in_sample_period: String,
    pub out_of_sample_period: String,
    /// Winning values of the ranged parameters
    pub optimized_params: ParamSet,
    /// e.g. `profitFactor = 1.85`
    pub in_sample_metric: String,
    pub in_sample_candles: usize,
    pub out_of_sample_candles: usize,
    pub oos_metrics: OosMetricsSummary,
    #[serde(skip)]
    pub best_params: StrategyParams,
    #[serde(skip)]
    pub in_sample_metric_value: RankValue,
    #[serde(skip)]
    pub oos_performance: PerformanceMetrics,
}

/// Walk-forward style in-sample / out-of-sample tester
pub struct OosTester<S> {
    source: S,
    base_params: StrategyParams,
    initial_capital: f64,
    interval: String,
    settings: OosSettings,
}

impl<S: CandleSource> OosTester<S> {
    pub fn new(source: S, base_params: StrategyParams, initial_capital: f64) -> Self {
        OosTester {
            source,
            base_params,
            initial_capital,
            interval: "1m".to_string(),
            settings: OosSettings::default(),
        }
    }

    pub fn with_interval(mut self, interval: impl Into<String>) -> Self {
        self.interval = interval.into();
        self
    }

    pub fn with_settings(mut self, settings: OosSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn run(&self, config: &OosConfig) -> CoreResult<OosReport> {
        info!("Starting out-of-sample test for {}", config.symbol);
        let windows = config.windows()?;
        if self.settings.param_ranges.is_empty() {
            return Err(BacktestError::config("OOS test needs at least one parameter range"));
        }

        info!(
            "Fetching in-sample candles for {} from {} to {}",
            config.symbol, config.is_start_date, config.is_end_date
        );
        let is_candles = self.fetch(&config.symbol, windows.is_start, windows.is_end, "in-sample")?;

        // Isolate the ranged parameters from the trailing stop and MA exit
        let search_base = StrategyParams {
            use_trailing_stop: false,
            use_ma_exit_filter: false,
            ..self.base_params.clone()
        };

        let outcome = Optimizer::new(search_base, self.initial_capital)
            .with_target(self.settings.target_metric, self.settings.sort_order)
            .run(&is_candles, &self.settings.param_ranges)?;

        let best = &outcome.results[0];
        let best_params = outcome.best_params.clone();
        let in_sample_metric = format!(
            "{} = {}",
            self.settings.target_metric,
            match outcome.best_metric_value {
                RankValue::PositiveInfinity => "Infinity".to_string(),
                other => other.to_string(),
            }
        );
        info!("In-sample winner: {:?} ({})", best.params, in_sample_metric);

        info!(
            "Fetching out-of-sample candles for {} from {} to {}",
            config.symbol, config.oos_start_date, config.oos_end_date
        );
        let oos_candles = self.fetch(
            &config.symbol,
            windows.oos_start,
            windows.oos_end,
            "out-of-sample",
        )?;

        info!("Running out-of-sample backtest with the in-sample parameters");
        let oos_result = Backtester::new(best_params.clone(), self.initial_capital).run(&oos_candles)?;
        let oos_performance = metrics::calculate(&oos_result.trades, self.initial_capital);

        info!(
            "Out-of-sample test complete: {} trades, net profit {:.2}, profit factor {}",
            oos_performance.total_trades, oos_performance.net_profit, oos_performance.profit_factor
        );

        Ok(OosReport {
            symbol: config.symbol.clone(),
            in_sample_period: format!("{} to {}", config.is_start_date, config.is_end_date),
            out_of_sample_period: format!("{} to {}", config.oos_start_date, config.oos_end_date),
            optimized_params: best.params.clone(),
            in_sample_metric,
            in_sample_candles: is_candles.len(),
            out_of_sample_candles: oos_candles.len(),
            oos_metrics: OosMetricsSummary::from(&oos_performance),
            best_params,
            in_sample_metric_value: outcome.best_metric_value,
            oos_performance,
        })
    }

    fn fetch(&self, symbol: &str, start: i64, end: i64, window: &str) -> CoreResult<Vec<Candle>> {
        let candles = self
            .source
            .fetch_candles(symbol, &self.interval, start, end)?;
        if candles.is_empty() {
            return Err(BacktestError::DataUnavailable {
                symbol: symbol.to_string(),
                window: window.to_string(),
            });
        }
        info!("Received {} {} candles", candles.len(), window);
        Ok(candles)
    }
}

/// Run an OOS test with the default in-sample search
pub fn perform_oos_test<S: CandleSource>(
    source: S,
    config: &OosConfig,
    base_params: &StrategyParams,
    initial_capital: f64,
) -> CoreResult<OosReport> {
    OosTester::new(source, base_params.clone(), initial_capital).run(config)
}
