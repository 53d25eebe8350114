//! Backtesting engine
//!
//! Replays an ordered candle sequence through a single-position long-only
//! state machine. Exits are checked before entries on every candle, so a
//! position closed on a bar can be replaced by a new one on that same bar.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BacktestError, CoreResult};
use crate::indicators;
use crate::strategy::StrategyParams;
use crate::{Candle, ExitReason, Trade};

/// Mutable portfolio owned by a single simulation run
///
/// `is_open == (position_quantity > 0)` and `cash == 0` while a position is
/// open: every entry commits the whole cash balance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortfolioState {
    pub cash: f64,
    pub position_quantity: f64,
    pub is_open: bool,
    pub entry_price: f64,
    pub entry_time: i64,
    /// High-water mark since entry, only tracked with the trailing stop
    pub peak_price: f64,
}

impl PortfolioState {
    pub fn new(initial_capital: f64) -> Self {
        Self {
            cash: initial_capital,
            position_quantity: 0.0,
            is_open: false,
            entry_price: 0.0,
            entry_time: 0,
            peak_price: 0.0,
        }
    }

    /// Buy with all available cash
    pub fn open(&mut self, price: f64, time: i64) {
        self.position_quantity = self.cash / price;
        self.is_open = true;
        self.entry_price = price;
        self.entry_time = time;
        self.peak_price = price;
        self.cash = 0.0;
    }

    /// Sell the whole position and record the round trip
    pub fn close(&mut self, price: f64, time: i64, reason: ExitReason) -> Trade {
        let trade = Trade::new(
            self.entry_time,
            self.entry_price,
            time,
            price,
            self.position_quantity,
            reason,
        );
        self.cash += self.position_quantity * price;
        self.position_quantity = 0.0;
        self.is_open = false;
        self.entry_price = 0.0;
        self.entry_time = 0;
        self.peak_price = 0.0;
        trade
    }

    /// Raise the high-water mark; never lowers it
    pub fn update_peak(&mut self, high: f64) {
        if high > self.peak_price {
            self.peak_price = high;
        }
    }

    /// Cash plus the open position marked at `price`
    pub fn equity(&self, price: f64) -> f64 {
        if self.is_open {
            self.cash + self.position_quantity * price
        } else {
            self.cash
        }
    }
}

/// Outcome of one simulation run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BacktestResult {
    pub trades: Vec<Trade>,
    /// Cash, plus the open position marked at the last close
    pub final_balance: f64,
    /// Portfolio after the last candle (may hold an open position)
    pub final_state: PortfolioState,
}

impl BacktestResult {
    fn untouched(initial_capital: f64) -> Self {
        Self {
            trades: Vec::new(),
            final_balance: initial_capital,
            final_state: PortfolioState::new(initial_capital),
        }
    }

    pub fn ended_in_position(&self) -> bool {
        self.final_state.is_open
    }
}

/// Backtest engine for one parameter set
#[derive(Debug, Clone)]
pub struct Backtester {
    params: StrategyParams,
    initial_capital: f64,
}

impl Backtester {
    pub fn new(params: StrategyParams, initial_capital: f64) -> Self {
        Backtester {
            params,
            initial_capital,
        }
    }

    /// Run the simulation
    ///
    /// Fewer candles than `lookback + 1` is not an error: the result has no
    /// trades and the balance is unchanged.
    pub fn run(&self, candles: &[Candle]) -> CoreResult<BacktestResult> {
        self.params.validate()?;
        if !(self.initial_capital.is_finite() && self.initial_capital > 0.0) {
            return Err(BacktestError::config(format!(
                "initial capital must be positive (got {})",
                self.initial_capital
            )));
        }
        check_candles(candles)?;

        let lookback = self.params.lookback();
        if candles.len() <= lookback {
            debug!(
                candles = candles.len(),
                lookback, "Not enough candles for the indicator lookback, skipping simulation"
            );
            return Ok(BacktestResult::untouched(self.initial_capital));
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi_series = indicators::rsi(&closes, self.params.rsi_period);
        let sma_series = indicators::sma(&closes, self.params.ma_period);

        let mut state = PortfolioState::new(self.initial_capital);
        let mut trades = Vec::new();

        for i in lookback..candles.len() {
            let candle = &candles[i];
            let (Some(rsi), Some(sma)) = (rsi_series[i], sma_series[i]) else {
                continue;
            };

            if state.is_open {
                if self.params.use_trailing_stop {
                    state.update_peak(candle.high);
                }

                if let Some(exit) = self.params.evaluate_exit(
                    state.entry_price,
                    state.peak_price,
                    candle,
                    Some(sma),
                ) {
                    let trade = state.close(exit.price, candle.open_time, exit.reason);
                    debug!(
                        time = %candle.datetime(),
                        price = exit.price,
                        profit = trade.profit,
                        reason = %exit.reason,
                        "SELL"
                    );
                    trades.push(trade);
                }
            }

            if !state.is_open && self.params.entry_signal(rsi, sma, candle.close) {
                state.open(candle.close, candle.open_time);
                debug!(
                    time = %candle.datetime(),
                    price = candle.close,
                    quantity = state.position_quantity,
                    rsi,
                    sma,
                    "BUY"
                );
            }
        }

        let last_close = candles[candles.len() - 1].close;
        let final_balance = state.equity(last_close);

        debug!(
            trades = trades.len(),
            final_balance,
            open_position = state.is_open,
            "Backtest complete"
        );

        Ok(BacktestResult {
            trades,
            final_balance,
            final_state: state,
        })
    }
}

/// Run a single backtest
pub fn run_backtest(
    candles: &[Candle],
    params: &StrategyParams,
    initial_capital: f64,
) -> CoreResult<BacktestResult> {
    Backtester::new(params.clone(), initial_capital).run(candles)
}

/// Reject malformed sequences: invalid prices or open times that do not strictly increase
pub fn check_candles(candles: &[Candle]) -> CoreResult<()> {
    for (index, candle) in candles.iter().enumerate() {
        candle
            .validate()
            .map_err(|source| BacktestError::InvalidCandles { index, source })?;

        if index > 0 {
            let previous = candles[index - 1].open_time;
            if candle.open_time <= previous {
                return Err(BacktestError::InvalidCandles {
                    index,
                    source: crate::CandleValidationError::NotChronological {
                        previous,
                        current: candle.open_time,
                    },
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    const MINUTE: i64 = 60_000;

    fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        closes
            .iter()
            .enumerate()
            .map(|(i, &c)| Candle::new_unchecked(i as i64 * MINUTE, c, c, c, c, 1.0))
            .collect()
    }

    fn params() -> StrategyParams {
        StrategyParams {
            rsi_period: 2,
            rsi_oversold: 40.0,
            ma_period: 2,
            use_ma_filter: false,
            take_profit_percentage: 5.0,
            stop_loss_percentage: 5.0,
            use_trailing_stop: false,
            trailing_stop_percentage: 1.0,
            use_ma_exit_filter: false,
        }
    }

    #[test]
    fn test_short_input_is_a_no_op() {
        let result = run_backtest(&[], &params(), 1000.0).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.final_balance, 1000.0);

        let result = run_backtest(&candles_from_closes(&[100.0, 99.0]), &params(), 1000.0).unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.final_balance, 1000.0);
        assert!(!result.ended_in_position());
    }

    #[test]
    fn test_take_profit_closes_at_target_price() {
        // RSI(2) at index 2 is 0 after two down moves, entry at 98
        let mut candles = candles_from_closes(&[100.0, 99.0, 98.0, 98.5]);
        candles.push(Candle::new_unchecked(4 * MINUTE, 99.0, 104.0, 98.9, 103.0, 1.0));

        let result = run_backtest(&candles, &params(), 980.0).unwrap();
        assert_eq!(result.trades.len(), 1);

        let trade = &result.trades[0];
        assert_eq!(trade.exit_reason, ExitReason::TakeProfit);
        assert_eq!(trade.entry_price, 98.0);
        assert_relative_eq!(trade.exit_price, 98.0 * 1.05, epsilon = 1e-9);
        assert_relative_eq!(trade.quantity, 10.0, epsilon = 1e-9);
        assert_relative_eq!(result.final_balance, 980.0 + trade.profit, epsilon = 1e-9);
    }

    #[test]
    fn test_open_position_is_marked_to_market() {
        let candles = candles_from_closes(&[100.0, 99.0, 98.0, 97.5]);
        let result = run_backtest(&candles, &params(), 980.0).unwrap();

        assert!(result.trades.is_empty());
        assert!(result.ended_in_position());
        assert_relative_eq!(result.final_balance, 10.0 * 97.5, epsilon = 1e-9);
        assert_eq!(result.final_state.cash, 0.0);
    }

    #[test]
    fn test_ma_exit_filter() {
        let p = StrategyParams {
            use_ma_exit_filter: true,
            ..params()
        };
        // close 97.9 sits below SMA(2) = 97.95 but above the 5% stop
        let candles = candles_from_closes(&[100.0, 99.0, 98.0, 97.9]);
        let result = run_backtest(&candles, &p, 1000.0).unwrap();

        assert_eq!(result.trades.len(), 1);
        assert_eq!(result.trades[0].exit_reason, ExitReason::MaExit);
        assert_eq!(result.trades[0].exit_price, 97.9);
    }

    #[test]
    fn test_rejects_non_monotonic_times() {
        let mut candles = candles_from_closes(&[100.0, 99.0, 98.0]);
        candles[2].open_time = candles[1].open_time;

        let err = run_backtest(&candles, &params(), 1000.0).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidCandles { index: 2, .. }));
    }

    #[test]
    fn test_rejects_invalid_prices() {
        let mut candles = candles_from_closes(&[100.0, 99.0, 98.0]);
        candles[1].high = 50.0;

        let err = run_backtest(&candles, &params(), 1000.0).unwrap_err();
        assert!(matches!(err, BacktestError::InvalidCandles { index: 1, .. }));
    }

    #[test]
    fn test_rejects_invalid_capital() {
        let candles = candles_from_closes(&[100.0, 99.0, 98.0]);
        assert!(matches!(
            run_backtest(&candles, &params(), 0.0),
            Err(BacktestError::Configuration(_))
        ));
    }

    #[test]
    fn test_portfolio_state_invariants() {
        let mut state = PortfolioState::new(500.0);
        state.open(50.0, 0);
        assert!(state.is_open);
        assert_eq!(state.cash, 0.0);
        assert_eq!(state.position_quantity, 10.0);

        state.update_peak(55.0);
        state.update_peak(52.0);
        assert_eq!(state.peak_price, 55.0);

        let trade = state.close(54.0, MINUTE, ExitReason::TrailingStop);
        assert_eq!(trade.profit, 40.0);
        assert!(!state.is_open);
        assert_eq!(state.position_quantity, 0.0);
        assert_eq!(state.cash, 540.0);
    }
}
