//! RSI mean-reversion strategy parameters and trading rules
//!
//! ## Entry
//! RSI at or below the oversold threshold, and (when the MA filter is on)
//! the close above the simple moving average.
//!
//! ## Exit (checked in priority order, at most one fires per candle)
//! 1. Stop: trailing stop off the peak price when enabled, otherwise a fixed
//!    stop loss off the entry price. Triggered by the candle low.
//! 2. Take profit off the entry price (fixed-stop mode only). Triggered by the candle high.
//! 3. MA exit: close below the moving average (backtest-only rule).
//!
//! The rules are pure functions of the parameters and the current bar, so the
//! backtest engine and the paper session share them.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{BacktestError, CoreResult};
use crate::{Candle, ExitReason};

/// Strategy parameters, immutable for the duration of a simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StrategyParams {
    /// RSI lookback period (>= 2)
    pub rsi_period: usize,
    /// RSI entry threshold, 0-100
    pub rsi_oversold: f64,
    /// SMA period used by the entry filter and the MA exit (>= 2)
    pub ma_period: usize,
    /// Require close > SMA for entries
    pub use_ma_filter: bool,
    /// Take profit distance from entry, percent
    pub take_profit_percentage: f64,
    /// Fixed stop distance from entry, percent
    pub stop_loss_percentage: f64,
    /// Replace the fixed stop and take profit with a trailing stop
    pub use_trailing_stop: bool,
    /// Trailing stop distance from the peak, percent
    pub trailing_stop_percentage: f64,
    /// Exit when the close drops below the SMA
    pub use_ma_exit_filter: bool,
}

impl Default for StrategyParams {
    fn default() -> Self {
        StrategyParams {
            rsi_period: 14,
            rsi_oversold: 30.0,
            ma_period: 50,
            use_ma_filter: true,
            take_profit_percentage: 1.5,
            stop_loss_percentage: 1.0,
            use_trailing_stop: false,
            trailing_stop_percentage: 0.5,
            use_ma_exit_filter: false,
        }
    }
}

impl StrategyParams {
    /// Number of leading candles needed before the first decision
    pub fn lookback(&self) -> usize {
        self.rsi_period.max(self.ma_period)
    }

    pub fn validate(&self) -> CoreResult<()> {
        if self.rsi_period < 2 {
            return Err(BacktestError::config(format!(
                "rsiPeriod must be >= 2 (got {})",
                self.rsi_period
            )));
        }
        if self.ma_period < 2 {
            return Err(BacktestError::config(format!(
                "maPeriod must be >= 2 (got {})",
                self.ma_period
            )));
        }
        if !(0.0..=100.0).contains(&self.rsi_oversold) {
            return Err(BacktestError::config(format!(
                "rsiOversold must be within 0-100 (got {})",
                self.rsi_oversold
            )));
        }
        if !(self.take_profit_percentage > 0.0) {
            return Err(BacktestError::config(format!(
                "takeProfitPercentage must be positive (got {})",
                self.take_profit_percentage
            )));
        }
        if !(self.stop_loss_percentage > 0.0) {
            return Err(BacktestError::config(format!(
                "stopLossPercentage must be positive (got {})",
                self.stop_loss_percentage
            )));
        }
        if self.use_trailing_stop && !(self.trailing_stop_percentage > 0.0) {
            return Err(BacktestError::config(format!(
                "trailingStopPercentage must be positive when the trailing stop is enabled (got {})",
                self.trailing_stop_percentage
            )));
        }
        Ok(())
    }

    /// Read a rangeable parameter as f64
    pub fn get(&self, param: StrategyParam) -> f64 {
        match param {
            StrategyParam::RsiPeriod => self.rsi_period as f64,
            StrategyParam::RsiOversold => self.rsi_oversold,
            StrategyParam::MaPeriod => self.ma_period as f64,
            StrategyParam::TakeProfitPercentage => self.take_profit_percentage,
            StrategyParam::StopLossPercentage => self.stop_loss_percentage,
            StrategyParam::TrailingStopPercentage => self.trailing_stop_percentage,
        }
    }

    /// Copy of these parameters with one field overridden
    ///
    /// Period parameters are rounded to the nearest integer.
    pub fn with_param(&self, param: StrategyParam, value: f64) -> Self {
        let mut params = self.clone();
        match param {
            StrategyParam::RsiPeriod => params.rsi_period = value.round().max(0.0) as usize,
            StrategyParam::RsiOversold => params.rsi_oversold = value,
            StrategyParam::MaPeriod => params.ma_period = value.round().max(0.0) as usize,
            StrategyParam::TakeProfitPercentage => params.take_profit_percentage = value,
            StrategyParam::StopLossPercentage => params.stop_loss_percentage = value,
            StrategyParam::TrailingStopPercentage => params.trailing_stop_percentage = value,
        }
        params
    }

    // =========================================================================
    // Trading rules
    // =========================================================================

    /// Entry condition on the current bar
    pub fn entry_signal(&self, rsi: f64, sma: f64, close: f64) -> bool {
        let rsi_condition = rsi <= self.rsi_oversold;
        let ma_condition = !self.use_ma_filter || close > sma;
        rsi_condition && ma_condition
    }

    /// Active stop level: trailing off the peak, or fixed off the entry
    pub fn stop_price(&self, entry_price: f64, peak_price: f64) -> f64 {
        if self.use_trailing_stop {
            peak_price * (1.0 - self.trailing_stop_percentage / 100.0)
        } else {
            entry_price * (1.0 - self.stop_loss_percentage / 100.0)
        }
    }

    pub fn take_profit_price(&self, entry_price: f64) -> f64 {
        entry_price * (1.0 + self.take_profit_percentage / 100.0)
    }

    /// Evaluate exits for an open position on the current bar
    ///
    /// `peak_price` must already include this bar's high when the trailing
    /// stop is enabled. Pass `sma = None` to disable the MA exit.
    pub fn evaluate_exit(
        &self,
        entry_price: f64,
        peak_price: f64,
        candle: &Candle,
        sma: Option<f64>,
    ) -> Option<ExitSignal> {
        let stop_price = self.stop_price(entry_price, peak_price);
        if candle.low <= stop_price {
            let reason = if self.use_trailing_stop {
                ExitReason::TrailingStop
            } else {
                ExitReason::StopLoss
            };
            return Some(ExitSignal {
                price: stop_price,
                reason,
            });
        }

        if !self.use_trailing_stop {
            let take_profit = self.take_profit_price(entry_price);
            if candle.high >= take_profit {
                return Some(ExitSignal {
                    price: take_profit,
                    reason: ExitReason::TakeProfit,
                });
            }
        }

        if self.use_ma_exit_filter {
            if let Some(sma) = sma {
                if candle.close < sma {
                    return Some(ExitSignal {
                        price: candle.close,
                        reason: ExitReason::MaExit,
                    });
                }
            }
        }

        None
    }
}

/// Exit decision: fill price and reason
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExitSignal {
    pub price: f64,
    pub reason: ExitReason,
}

/// Strategy parameters that can be ranged by the optimizer
///
/// Declaration order is the grid nesting order (first = outermost loop).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum StrategyParam {
    RsiPeriod,
    RsiOversold,
    MaPeriod,
    TakeProfitPercentage,
    StopLossPercentage,
    TrailingStopPercentage,
}

impl StrategyParam {
    pub const ALL: [StrategyParam; 6] = [
        StrategyParam::RsiPeriod,
        StrategyParam::RsiOversold,
        StrategyParam::MaPeriod,
        StrategyParam::TakeProfitPercentage,
        StrategyParam::StopLossPercentage,
        StrategyParam::TrailingStopPercentage,
    ];

    pub fn name(self) -> &'static str {
        match self {
            StrategyParam::RsiPeriod => "rsiPeriod",
            StrategyParam::RsiOversold => "rsiOversold",
            StrategyParam::MaPeriod => "maPeriod",
            StrategyParam::TakeProfitPercentage => "takeProfitPercentage",
            StrategyParam::StopLossPercentage => "stopLossPercentage",
            StrategyParam::TrailingStopPercentage => "trailingStopPercentage",
        }
    }

    pub fn is_integer(self) -> bool {
        matches!(self, StrategyParam::RsiPeriod | StrategyParam::MaPeriod)
    }
}

impl fmt::Display for StrategyParam {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for StrategyParam {
    type Err = BacktestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        StrategyParam::ALL
            .iter()
            .copied()
            .find(|p| p.name().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                BacktestError::config(format!(
                    "unknown strategy parameter '{}' (expected one of: {})",
                    s,
                    StrategyParam::ALL
                        .iter()
                        .map(|p| p.name())
                        .collect::<Vec<_>>()
                        .join(", ")
                ))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bar(high: f64, low: f64, close: f64) -> Candle {
        Candle::new_unchecked(0, close, high, low, close, 1.0)
    }

    #[test]
    fn test_default_params_are_valid() {
        assert!(StrategyParams::default().validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let params = StrategyParams {
            rsi_period: 1,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = StrategyParams {
            rsi_oversold: 120.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());

        let params = StrategyParams {
            use_trailing_stop: true,
            trailing_stop_percentage: 0.0,
            ..Default::default()
        };
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_entry_signal() {
        let params = StrategyParams {
            rsi_oversold: 30.0,
            use_ma_filter: true,
            ..Default::default()
        };
        assert!(params.entry_signal(25.0, 99.0, 100.0));
        assert!(params.entry_signal(30.0, 99.0, 100.0));
        assert!(!params.entry_signal(31.0, 99.0, 100.0));
        assert!(!params.entry_signal(25.0, 101.0, 100.0));

        let no_filter = StrategyParams {
            use_ma_filter: false,
            ..params
        };
        assert!(no_filter.entry_signal(25.0, 101.0, 100.0));
    }

    #[test]
    fn test_exit_priority_stop_before_take_profit() {
        let params = StrategyParams {
            take_profit_percentage: 2.0,
            stop_loss_percentage: 1.0,
            use_ma_exit_filter: true,
            ..Default::default()
        };
        // Bar spans both the stop (99) and the target (102)
        let exit = params
            .evaluate_exit(100.0, 100.0, &bar(103.0, 98.0, 100.0), Some(200.0))
            .unwrap();
        assert_eq!(exit.reason, ExitReason::StopLoss);
        assert!((exit.price - 99.0).abs() < 1e-9);

        let exit = params
            .evaluate_exit(100.0, 100.0, &bar(103.0, 99.5, 100.0), Some(200.0))
            .unwrap();
        assert_eq!(exit.reason, ExitReason::TakeProfit);
        assert!((exit.price - 102.0).abs() < 1e-9);

        let exit = params
            .evaluate_exit(100.0, 100.0, &bar(101.0, 99.5, 100.0), Some(200.0))
            .unwrap();
        assert_eq!(exit.reason, ExitReason::MaExit);
        assert_eq!(exit.price, 100.0);

        assert!(params
            .evaluate_exit(100.0, 100.0, &bar(101.0, 99.5, 100.0), None)
            .is_none());
    }

    #[test]
    fn test_trailing_mode_skips_take_profit() {
        let params = StrategyParams {
            use_trailing_stop: true,
            trailing_stop_percentage: 1.0,
            take_profit_percentage: 1.0,
            ..Default::default()
        };
        assert!(params
            .evaluate_exit(100.0, 110.0, &bar(110.0, 109.5, 110.0), None)
            .is_none());

        let exit = params
            .evaluate_exit(100.0, 110.0, &bar(110.0, 108.0, 108.5), None)
            .unwrap();
        assert_eq!(exit.reason, ExitReason::TrailingStop);
        assert!((exit.price - 108.9).abs() < 1e-9);
    }

    #[test]
    fn test_with_param_overrides_single_field() {
        let base = StrategyParams::default();
        let merged = base
            .with_param(StrategyParam::RsiOversold, 34.0)
            .with_param(StrategyParam::MaPeriod, 20.4);
        assert_eq!(merged.rsi_oversold, 34.0);
        assert_eq!(merged.ma_period, 20);
        assert_eq!(merged.stop_loss_percentage, base.stop_loss_percentage);
        assert_eq!(merged.get(StrategyParam::MaPeriod), 20.0);
    }

    #[test]
    fn test_param_names_round_trip() {
        for param in StrategyParam::ALL {
            assert_eq!(param.name().parse::<StrategyParam>().unwrap(), param);
        }
        assert!("atrPeriod".parse::<StrategyParam>().is_err());
    }
}
