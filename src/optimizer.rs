//! Parameter grid-search optimizer
//!
//! Expands parameter ranges into a Cartesian grid, backtests every
//! combination (in parallel with rayon), and ranks the combinations by a
//! target metric. Results are collected in generation order before a stable
//! sort, so equal metric values keep generation order: lexicographic by
//! parameter value in `StrategyParam` declaration order.

use indicatif::ProgressBar;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize, Serializer};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering as AtomicOrdering};
use tracing::info;

use crate::backtest::{check_candles, Backtester};
use crate::error::{BacktestError, CoreResult};
use crate::metrics::{self, PerformanceMetrics, Ratio};
use crate::strategy::{StrategyParam, StrategyParams};
use crate::Candle;

/// Decimal places kept for generated grid values
const GRID_PRECISION: u32 = 2;

/// Inclusive range `start..=end` stepped by `step`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamRange {
    pub start: f64,
    pub end: f64,
    pub step: f64,
}

impl ParamRange {
    pub fn new(start: f64, end: f64, step: f64) -> Self {
        ParamRange { start, end, step }
    }

    /// Expand to concrete values
    ///
    /// Stepping happens in decimal arithmetic and each value is rounded to
    /// two places, halves away from zero, so `{1, 5, 0.5}` yields exactly
    /// nine values and `{1, 1.25, 0.125}` yields `[1, 1.13, 1.25]`. Steps finer
    /// than the precision collapse to distinct values. `start > end` yields an
    /// empty list.
    pub fn values(&self) -> CoreResult<Vec<f64>> {
        if !(self.step > 0.0) {
            return Err(BacktestError::config(format!(
                "range step must be positive (got {})",
                self.step
            )));
        }
        let start = to_decimal(self.start)?;
        let end = to_decimal(self.end)?;
        let step = to_decimal(self.step)?;

        let mut values = Vec::new();
        let mut i = Decimal::ZERO;
        loop {
            let value = start + step * i;
            if value > end {
                break;
            }
            let rounded = value
                .round_dp_with_strategy(GRID_PRECISION, RoundingStrategy::MidpointAwayFromZero)
                .to_f64()
                .ok_or_else(|| BacktestError::config(format!("range value {} out of f64 range", value)))?;
            values.push(rounded);
            i += Decimal::ONE;
        }
        values.dedup();
        Ok(values)
    }
}

fn to_decimal(value: f64) -> CoreResult<Decimal> {
    if !value.is_finite() {
        return Err(BacktestError::config(format!(
            "range bounds must be finite (got {})",
            value
        )));
    }
    // Display gives the shortest round-trip form, so 0.1 parses as exactly 0.1
    Decimal::from_str(&value.to_string())
        .map_err(|e| BacktestError::config(format!("invalid range value {}: {}", value, e)))
}

/// Ranged parameters keyed by name; iteration order is the grid nesting order
pub type ParamRanges = BTreeMap<StrategyParam, ParamRange>;

/// One grid point: a value for every ranged parameter
pub type ParamSet = BTreeMap<StrategyParam, f64>;

/// Expand ranges into the full Cartesian grid, first parameter outermost
pub fn generate_grid(ranges: &ParamRanges) -> CoreResult<Vec<ParamSet>> {
    if ranges.is_empty() {
        return Err(BacktestError::config("no parameter ranges to optimize"));
    }

    let mut axes = Vec::with_capacity(ranges.len());
    for (&param, range) in ranges {
        let values = axis_values(param, range)?;
        if values.is_empty() {
            return Ok(Vec::new());
        }
        axes.push((param, values));
    }

    let grid = axes
        .iter()
        .map(|(_, values)| values.iter().copied())
        .multi_cartesian_product()
        .map(|point| {
            axes.iter()
                .map(|(param, _)| *param)
                .zip(point)
                .collect::<ParamSet>()
        })
        .collect();

    Ok(grid)
}

/// Values tested for one parameter; periods are rounded to whole candles
fn axis_values(param: StrategyParam, range: &ParamRange) -> CoreResult<Vec<f64>> {
    let mut values = range
        .values()
        .map_err(|e| BacktestError::config(format!("{}: {}", param, e)))?;
    if param.is_integer() {
        for value in values.iter_mut() {
            *value = value.round();
        }
        values.dedup();
    }
    Ok(values)
}

/// Number of grid points without materialising the grid
pub fn count_combinations(ranges: &ParamRanges) -> CoreResult<usize> {
    let mut total = 1usize;
    for (&param, range) in ranges {
        total = total.saturating_mul(axis_values(param, range)?.len());
    }
    Ok(if ranges.is_empty() { 0 } else { total })
}

/// Merge a grid point over the base parameters, field by field
pub fn apply_params(base: &StrategyParams, set: &ParamSet) -> StrategyParams {
    set.iter()
        .fold(base.clone(), |params, (&param, &value)| params.with_param(param, value))
}

/// Metric used to rank combinations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OptimizationMetric {
    ProfitFactor,
    NetProfit,
    NetProfitPercent,
    WinRate,
    MaxDrawdown,
    MaxDrawdownPercent,
    Expectancy,
    PayoffRatio,
    TotalTrades,
}

impl OptimizationMetric {
    pub const ALL: [OptimizationMetric; 9] = [
        OptimizationMetric::ProfitFactor,
        OptimizationMetric::NetProfit,
        OptimizationMetric::NetProfitPercent,
        OptimizationMetric::WinRate,
        OptimizationMetric::MaxDrawdown,
        OptimizationMetric::MaxDrawdownPercent,
        OptimizationMetric::Expectancy,
        OptimizationMetric::PayoffRatio,
        OptimizationMetric::TotalTrades,
    ];

    pub fn name(self) -> &'static str {
        match self {
            OptimizationMetric::ProfitFactor => "profitFactor",
            OptimizationMetric::NetProfit => "netProfit",
            OptimizationMetric::NetProfitPercent => "netProfitPercent",
            OptimizationMetric::WinRate => "winRate",
            OptimizationMetric::MaxDrawdown => "maxDrawdown",
            OptimizationMetric::MaxDrawdownPercent => "maxDrawdownPercent",
            OptimizationMetric::Expectancy => "expectancy",
            OptimizationMetric::PayoffRatio => "payoffRatio",
            OptimizationMetric::TotalTrades => "totalTrades",
        }
    }

    /// Rankable value of this metric; runs without trades are invalid
    pub fn rank_value(self, metrics: &PerformanceMetrics) -> RankValue {
        if metrics.total_trades == 0 {
            return RankValue::Invalid;
        }
        match self {
            OptimizationMetric::ProfitFactor => metrics.profit_factor.into(),
            OptimizationMetric::PayoffRatio => metrics.payoff_ratio.into(),
            OptimizationMetric::NetProfit => RankValue::from_f64(metrics.net_profit),
            OptimizationMetric::NetProfitPercent => RankValue::from_f64(metrics.net_profit_percent),
            OptimizationMetric::WinRate => RankValue::from_f64(metrics.win_rate),
            OptimizationMetric::MaxDrawdown => RankValue::from_f64(metrics.max_drawdown),
            OptimizationMetric::MaxDrawdownPercent => {
                RankValue::from_f64(metrics.max_drawdown_percent)
            }
            OptimizationMetric::Expectancy => RankValue::from_f64(metrics.expectancy),
            OptimizationMetric::TotalTrades => RankValue::from_f64(metrics.total_trades as f64),
        }
    }
}

impl fmt::Display for OptimizationMetric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptimizationMetric {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptimizationMetric::ALL
            .iter()
            .copied()
            .find(|m| m.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                BacktestError::config(format!(
                    "unknown optimization metric '{}' (expected one of: {})",
                    s,
                    OptimizationMetric::ALL.iter().map(|m| m.name()).join(", ")
                ))
            })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl fmt::Display for SortOrder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SortOrder::Asc => f.write_str("asc"),
            SortOrder::Desc => f.write_str("desc"),
        }
    }
}

impl FromStr for SortOrder {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortOrder::Asc),
            "desc" | "descending" => Ok(SortOrder::Desc),
            other => Err(BacktestError::config(format!(
                "unknown sort order '{}' (expected asc or desc)",
                other
            ))),
        }
    }
}

/// Metric value prepared for ranking
///
/// `Invalid` always ranks last, whichever way the sort goes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RankValue {
    Finite(f64),
    PositiveInfinity,
    Invalid,
}

impl RankValue {
    pub fn from_f64(value: f64) -> Self {
        if value.is_nan() || value == f64::NEG_INFINITY {
            RankValue::Invalid
        } else if value == f64::INFINITY {
            RankValue::PositiveInfinity
        } else {
            RankValue::Finite(value)
        }
    }

    pub fn is_valid(self) -> bool {
        !matches!(self, RankValue::Invalid)
    }

    /// Numeric value for display, `+∞` for the unbounded case
    pub fn value(self) -> Option<f64> {
        match self {
            RankValue::Finite(v) => Some(v),
            RankValue::PositiveInfinity => Some(f64::INFINITY),
            RankValue::Invalid => None,
        }
    }

    fn key(self) -> Option<OrderedFloat<f64>> {
        self.value().map(OrderedFloat)
    }

    /// Ordering where `Less` means ranked higher
    pub fn rank_cmp(&self, other: &RankValue, order: SortOrder) -> Ordering {
        match (self.key(), other.key()) {
            (None, None) => Ordering::Equal,
            (None, Some(_)) => Ordering::Greater,
            (Some(_), None) => Ordering::Less,
            (Some(a), Some(b)) => match order {
                SortOrder::Asc => a.cmp(&b),
                SortOrder::Desc => b.cmp(&a),
            },
        }
    }
}

impl From<Ratio> for RankValue {
    fn from(ratio: Ratio) -> Self {
        match ratio {
            Ratio::Infinite => RankValue::PositiveInfinity,
            Ratio::Finite(v) => RankValue::from_f64(v),
        }
    }
}

impl fmt::Display for RankValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RankValue::Finite(v) => write!(f, "{:.2}", v),
            RankValue::PositiveInfinity => f.write_str("∞"),
            RankValue::Invalid => f.write_str("n/a"),
        }
    }
}

impl Serialize for RankValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            RankValue::Finite(v) => serializer.serialize_f64(*v),
            RankValue::PositiveInfinity => serializer.serialize_str("Infinity"),
            RankValue::Invalid => serializer.serialize_none(),
        }
    }
}

/// Outcome of one grid point
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationResult {
    pub params: ParamSet,
    #[serde(skip)]
    pub strategy: StrategyParams,
    pub metric_value: RankValue,
    pub net_profit: f64,
    pub final_balance: f64,
    pub profit_factor: Ratio,
    pub win_rate: f64,
    pub max_drawdown_percent: f64,
    pub total_trades: usize,
}

/// Ranked optimization output
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizationOutcome {
    pub metric: OptimizationMetric,
    pub order: SortOrder,
    pub best_params: StrategyParams,
    pub best_metric_value: RankValue,
    /// Every combination, best first
    pub results: Vec<OptimizationResult>,
}

impl OptimizationOutcome {
    pub fn valid_count(&self) -> usize {
        self.results
            .iter()
            .filter(|r| r.metric_value.is_valid())
            .count()
    }
}

/// Grid-search optimizer over one candle series
#[derive(Debug, Clone)]
pub struct Optimizer {
    base_params: StrategyParams,
    initial_capital: f64,
    metric: OptimizationMetric,
    order: SortOrder,
    parallel: bool,
}

impl Optimizer {
    pub fn new(base_params: StrategyParams, initial_capital: f64) -> Self {
        Optimizer {
            base_params,
            initial_capital,
            metric: OptimizationMetric::ProfitFactor,
            order: SortOrder::Desc,
            parallel: true,
        }
    }

    pub fn with_target(mut self, metric: OptimizationMetric, order: SortOrder) -> Self {
        self.metric = metric;
        self.order = order;
        self
    }

    /// Evaluate combinations one at a time (for debugging)
    pub fn sequential(mut self, sequential: bool) -> Self {
        self.parallel = !sequential;
        self
    }

    pub fn run(&self, candles: &[Candle], ranges: &ParamRanges) -> CoreResult<OptimizationOutcome> {
        self.run_with_progress(candles, ranges, None)
    }

    /// Run the grid search, ticking `progress_bar` once per combination
    pub fn run_with_progress(
        &self,
        candles: &[Candle],
        ranges: &ParamRanges,
        progress_bar: Option<&ProgressBar>,
    ) -> CoreResult<OptimizationOutcome> {
        let grid = generate_grid(ranges)?;
        if grid.is_empty() {
            return Err(BacktestError::NoCombinations);
        }
        check_candles(candles)?;

        let combinations = grid
            .into_iter()
            .map(|set| {
                let params = apply_params(&self.base_params, &set);
                params
                    .validate()
                    .map_err(|e| BacktestError::config(format!("combination {:?}: {}", set, e)))?;
                Ok((set, params))
            })
            .collect::<CoreResult<Vec<_>>>()?;

        let total = combinations.len();
        info!(
            "Testing {} parameter combinations on {} candles (metric: {}, order: {})",
            total,
            candles.len(),
            self.metric,
            self.order
        );

        let completed = AtomicUsize::new(0);
        let report_every = (total / 20).max(1);
        let evaluate = |(set, params): &(ParamSet, StrategyParams)| {
            let result = self.evaluate(candles, set, params);
            let done = completed.fetch_add(1, AtomicOrdering::Relaxed) + 1;
            if let Some(pb) = progress_bar {
                pb.inc(1);
            }
            if done % report_every == 0 || done == total {
                info!(
                    "Optimization progress: {}/{} ({:.0}%)",
                    done,
                    total,
                    done as f64 / total as f64 * 100.0
                );
            }
            result
        };

        let mut results = if self.parallel {
            combinations
                .par_iter()
                .map(evaluate)
                .collect::<CoreResult<Vec<_>>>()?
        } else {
            combinations
                .iter()
                .map(evaluate)
                .collect::<CoreResult<Vec<_>>>()?
        };

        results.sort_by(|a, b| a.metric_value.rank_cmp(&b.metric_value, self.order));

        let best = &results[0];
        if !best.metric_value.is_valid() {
            return Err(BacktestError::OptimizationExhausted);
        }

        info!(
            "Best {} = {} with {:?} ({} trades)",
            self.metric, best.metric_value, best.params, best.total_trades
        );

        Ok(OptimizationOutcome {
            metric: self.metric,
            order: self.order,
            best_params: best.strategy.clone(),
            best_metric_value: best.metric_value,
            results,
        })
    }

    fn evaluate(
        &self,
        candles: &[Candle],
        set: &ParamSet,
        params: &StrategyParams,
    ) -> CoreResult<OptimizationResult> {
        let backtest = Backtester::new(params.clone(), self.initial_capital).run(candles)?;
        let metrics = metrics::calculate(&backtest.trades, self.initial_capital);

        Ok(OptimizationResult {
            params: set.clone(),
            strategy: params.clone(),
            metric_value: self.metric.rank_value(&metrics),
            net_profit: metrics.net_profit,
            final_balance: backtest.final_balance,
            profit_factor: metrics.profit_factor,
            win_rate: metrics.win_rate,
            max_drawdown_percent: metrics.max_drawdown_percent,
            total_trades: metrics.total_trades,
        })
    }
}

/// Run a grid search with default (parallel) settings
pub fn run_optimization(
    candles: &[Candle],
    initial_capital: f64,
    base_params: &StrategyParams,
    ranges: &ParamRanges,
    metric: OptimizationMetric,
    order: SortOrder,
) -> CoreResult<OptimizationOutcome> {
    Optimizer::new(base_params.clone(), initial_capital)
        .with_target(metric, order)
        .run(candles, ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ranges(entries: &[(StrategyParam, f64, f64, f64)]) -> ParamRanges {
        entries
            .iter()
            .map(|&(p, s, e, st)| (p, ParamRange::new(s, e, st)))
            .collect()
    }

    #[test]
    fn test_range_values_do_not_drift() {
        let values = ParamRange::new(0.1, 0.5, 0.1).values().unwrap();
        assert_eq!(values, vec![0.1, 0.2, 0.3, 0.4, 0.5]);

        let values = ParamRange::new(1.0, 5.0, 0.5).values().unwrap();
        assert_eq!(values.len(), 9);
        assert_eq!(values[8], 5.0);
        assert_eq!(to_decimal(values[3]).unwrap(), dec!(2.5));
    }

    #[test]
    fn test_range_rounds_half_away_from_zero() {
        let values = ParamRange::new(1.0, 1.25, 0.125).values().unwrap();
        assert_eq!(values, vec![1.0, 1.13, 1.25]);

        // steps finer than two places collapse instead of repeating
        let values = ParamRange::new(0.0, 0.02, 0.005).values().unwrap();
        assert_eq!(values, vec![0.0, 0.01, 0.02]);
    }

    #[test]
    fn test_period_axis_has_whole_distinct_values() {
        let r = ranges(&[(StrategyParam::RsiPeriod, 10.0, 12.0, 0.5)]);
        let grid = generate_grid(&r).unwrap();
        let periods: Vec<f64> = grid.iter().map(|set| set[&StrategyParam::RsiPeriod]).collect();
        assert_eq!(periods, vec![10.0, 11.0, 12.0]);
        assert_eq!(count_combinations(&r).unwrap(), 3);
    }

    #[test]
    fn test_range_rejects_non_positive_step() {
        assert!(ParamRange::new(1.0, 5.0, 0.0).values().is_err());
        assert!(ParamRange::new(1.0, 5.0, -1.0).values().is_err());
    }

    #[test]
    fn test_grid_size() {
        let r = ranges(&[
            (StrategyParam::RsiOversold, 20.0, 40.0, 2.0),
            (StrategyParam::StopLossPercentage, 1.0, 5.0, 0.5),
        ]);
        assert_eq!(generate_grid(&r).unwrap().len(), 99);
        assert_eq!(count_combinations(&r).unwrap(), 99);
    }

    #[test]
    fn test_grid_order_first_param_outermost() {
        let r = ranges(&[
            (StrategyParam::StopLossPercentage, 1.0, 2.0, 1.0),
            (StrategyParam::RsiOversold, 30.0, 32.0, 2.0),
        ]);
        let grid = generate_grid(&r).unwrap();
        let points: Vec<(f64, f64)> = grid
            .iter()
            .map(|s| {
                (
                    s[&StrategyParam::RsiOversold],
                    s[&StrategyParam::StopLossPercentage],
                )
            })
            .collect();
        assert_eq!(points, vec![(30.0, 1.0), (30.0, 2.0), (32.0, 1.0), (32.0, 2.0)]);
    }

    #[test]
    fn test_empty_range_gives_empty_grid() {
        let r = ranges(&[
            (StrategyParam::RsiOversold, 40.0, 20.0, 2.0),
            (StrategyParam::StopLossPercentage, 1.0, 5.0, 0.5),
        ]);
        assert!(generate_grid(&r).unwrap().is_empty());

        let err = run_optimization(
            &[],
            1000.0,
            &StrategyParams::default(),
            &r,
            OptimizationMetric::ProfitFactor,
            SortOrder::Desc,
        )
        .unwrap_err();
        assert!(matches!(err, BacktestError::NoCombinations));
    }

    #[test]
    fn test_apply_params_rounds_periods() {
        let mut set = ParamSet::new();
        set.insert(StrategyParam::RsiPeriod, 13.6);
        set.insert(StrategyParam::StopLossPercentage, 2.5);
        let params = apply_params(&StrategyParams::default(), &set);
        assert_eq!(params.rsi_period, 14);
        assert_eq!(params.stop_loss_percentage, 2.5);
    }

    #[test]
    fn test_rank_ordering_descending() {
        let mut values = vec![
            RankValue::Invalid,
            RankValue::Finite(1.5),
            RankValue::PositiveInfinity,
            RankValue::Finite(3.0),
        ];
        values.sort_by(|a, b| a.rank_cmp(b, SortOrder::Desc));
        assert_eq!(
            values,
            vec![
                RankValue::PositiveInfinity,
                RankValue::Finite(3.0),
                RankValue::Finite(1.5),
                RankValue::Invalid,
            ]
        );
    }

    #[test]
    fn test_rank_ordering_ascending() {
        let mut values = vec![
            RankValue::Invalid,
            RankValue::PositiveInfinity,
            RankValue::Finite(3.0),
            RankValue::Finite(-1.0),
        ];
        values.sort_by(|a, b| a.rank_cmp(b, SortOrder::Asc));
        assert_eq!(
            values,
            vec![
                RankValue::Finite(-1.0),
                RankValue::Finite(3.0),
                RankValue::PositiveInfinity,
                RankValue::Invalid,
            ]
        );
    }

    #[test]
    fn test_rank_value_conversion() {
        assert_eq!(RankValue::from_f64(f64::NAN), RankValue::Invalid);
        assert_eq!(RankValue::from_f64(f64::INFINITY), RankValue::PositiveInfinity);
        assert_eq!(RankValue::from(Ratio::Infinite), RankValue::PositiveInfinity);
        assert_eq!(RankValue::PositiveInfinity.value(), Some(f64::INFINITY));

        let empty = metrics::calculate(&[], 1000.0);
        assert_eq!(
            OptimizationMetric::NetProfit.rank_value(&empty),
            RankValue::Invalid
        );
    }

    #[test]
    fn test_metric_and_order_parsing() {
        assert_eq!(
            "profitFactor".parse::<OptimizationMetric>().unwrap(),
            OptimizationMetric::ProfitFactor
        );
        assert_eq!(
            "maxdrawdownpercent".parse::<OptimizationMetric>().unwrap(),
            OptimizationMetric::MaxDrawdownPercent
        );
        assert!("sharpe".parse::<OptimizationMetric>().is_err());
        assert_eq!("DESC".parse::<SortOrder>().unwrap(), SortOrder::Desc);
        assert!("up".parse::<SortOrder>().is_err());
    }
}
