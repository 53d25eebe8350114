//! Performance metrics calculation
//!
//! Metrics are always recomputed from a trade log and the initial capital.
//! Division by zero never yields a NaN: ratios use [`Ratio::Infinite`] when
//! there are gains and no losses, and zero when there is nothing at all.

use serde::{Serialize, Serializer};
use std::fmt;

use crate::Trade;

/// Ratio that may be unbounded (gains with zero losses)
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Ratio {
    Finite(f64),
    Infinite,
}

impl Ratio {
    /// `numerator / denominator`, `Infinite` for x/0 with x > 0, zero for 0/0
    pub fn of(numerator: f64, denominator: f64) -> Self {
        if denominator > 0.0 {
            Ratio::Finite(numerator / denominator)
        } else if numerator > 0.0 {
            Ratio::Infinite
        } else {
            Ratio::Finite(0.0)
        }
    }

    /// Numeric value, `f64::INFINITY` for the unbounded case
    pub fn value(self) -> f64 {
        match self {
            Ratio::Finite(v) => v,
            Ratio::Infinite => f64::INFINITY,
        }
    }

    pub fn is_infinite(self) -> bool {
        matches!(self, Ratio::Infinite)
    }
}

impl Default for Ratio {
    fn default() -> Self {
        Ratio::Finite(0.0)
    }
}

impl fmt::Display for Ratio {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ratio::Finite(v) => write!(f, "{:.2}", v),
            Ratio::Infinite => f.write_str("∞"),
        }
    }
}

impl Serialize for Ratio {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            Ratio::Finite(v) => serializer.serialize_f64(*v),
            Ratio::Infinite => serializer.serialize_str("Infinity"),
        }
    }
}

/// Performance metrics for one trade log
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PerformanceMetrics {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    /// Percent of trades with profit > 0
    pub win_rate: f64,
    /// Sum of winning trade profits
    pub total_profit: f64,
    /// Sum of losing trade profits, absolute
    pub total_loss: f64,
    pub net_profit: f64,
    pub net_profit_percent: f64,
    pub profit_factor: Ratio,
    pub avg_win: f64,
    /// Average losing trade, absolute
    pub avg_loss: f64,
    pub payoff_ratio: Ratio,
    pub expectancy: f64,
    pub largest_win: f64,
    pub largest_loss: f64,
    /// Largest peak-to-trough decline of the trade equity curve, in quote currency
    pub max_drawdown: f64,
    /// `max_drawdown` relative to the peak it was measured from
    pub max_drawdown_percent: f64,
    /// Initial capital followed by the equity after each trade
    pub equity_curve: Vec<f64>,
}

/// Calculate metrics from a trade log
pub fn calculate(trades: &[Trade], initial_capital: f64) -> PerformanceMetrics {
    if trades.is_empty() {
        return PerformanceMetrics {
            equity_curve: vec![initial_capital],
            ..Default::default()
        };
    }

    let mut wins = 0usize;
    let mut losses = 0usize;
    let mut total_profit = 0.0;
    let mut total_loss = 0.0;
    let mut largest_win = 0.0_f64;
    let mut largest_loss = 0.0_f64;

    let mut equity_curve = Vec::with_capacity(trades.len() + 1);
    equity_curve.push(initial_capital);
    let mut equity = initial_capital;
    let mut peak = initial_capital;
    let mut max_drawdown = 0.0;
    let mut peak_at_max_drawdown = initial_capital;

    for trade in trades {
        if trade.is_win() {
            wins += 1;
            total_profit += trade.profit;
            largest_win = largest_win.max(trade.profit);
        } else {
            losses += 1;
            total_loss += trade.profit.abs();
            largest_loss = largest_loss.min(trade.profit);
        }

        equity += trade.profit;
        equity_curve.push(equity);

        if equity > peak {
            peak = equity;
        }
        let drawdown = peak - equity;
        if drawdown > max_drawdown {
            max_drawdown = drawdown;
            peak_at_max_drawdown = peak;
        }
    }

    let total_trades = trades.len();
    let win_rate = wins as f64 / total_trades as f64 * 100.0;
    let loss_rate = losses as f64 / total_trades as f64 * 100.0;

    let avg_win = if wins > 0 { total_profit / wins as f64 } else { 0.0 };
    let avg_loss = if losses > 0 { total_loss / losses as f64 } else { 0.0 };

    let net_profit: f64 = trades.iter().map(|t| t.profit).sum();
    let net_profit_percent = if initial_capital > 0.0 {
        net_profit / initial_capital * 100.0
    } else {
        0.0
    };

    let max_drawdown_percent = if max_drawdown > 0.0 && peak_at_max_drawdown > 0.0 {
        max_drawdown / peak_at_max_drawdown * 100.0
    } else {
        0.0
    };

    PerformanceMetrics {
        total_trades,
        wins,
        losses,
        win_rate,
        total_profit,
        total_loss,
        net_profit,
        net_profit_percent,
        profit_factor: Ratio::of(total_profit, total_loss),
        avg_win,
        avg_loss,
        payoff_ratio: Ratio::of(avg_win, avg_loss),
        expectancy: win_rate / 100.0 * avg_win - loss_rate / 100.0 * avg_loss,
        largest_win,
        largest_loss,
        max_drawdown,
        max_drawdown_percent,
        equity_curve,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ExitReason;
    use approx::assert_relative_eq;

    fn trade(profit: f64) -> Trade {
        // quantity 1 so profit == exit - entry
        Trade::new(0, 100.0, 60_000, 100.0 + profit, 1.0, ExitReason::Manual)
    }

    #[test]
    fn test_empty_trade_log() {
        let m = calculate(&[], 1000.0);
        assert_eq!(m.total_trades, 0);
        assert_eq!(m.profit_factor, Ratio::Finite(0.0));
        assert_eq!(m.max_drawdown, 0.0);
        assert_eq!(m.equity_curve, vec![1000.0]);
    }

    #[test]
    fn test_basic_metrics() {
        let trades = vec![trade(30.0), trade(-10.0), trade(20.0), trade(-20.0)];
        let m = calculate(&trades, 1000.0);

        assert_eq!(m.total_trades, 4);
        assert_eq!(m.wins, 2);
        assert_eq!(m.losses, 2);
        assert_relative_eq!(m.win_rate, 50.0);
        assert_relative_eq!(m.total_profit, 50.0);
        assert_relative_eq!(m.total_loss, 30.0);
        assert_relative_eq!(m.profit_factor.value(), 50.0 / 30.0);
        assert_relative_eq!(m.net_profit, 20.0);
        assert_relative_eq!(m.net_profit_percent, 2.0);
        assert_relative_eq!(m.avg_win, 25.0);
        assert_relative_eq!(m.avg_loss, 15.0);
        assert_relative_eq!(m.expectancy, 5.0);
        assert_relative_eq!(m.largest_win, 30.0);
        assert_relative_eq!(m.largest_loss, -20.0);
        assert_eq!(m.equity_curve.len(), 5);
    }

    #[test]
    fn test_zero_profit_counts_as_loss() {
        let m = calculate(&[trade(0.0)], 1000.0);
        assert_eq!(m.wins, 0);
        assert_eq!(m.losses, 1);
        assert_eq!(m.profit_factor, Ratio::Finite(0.0));
    }

    #[test]
    fn test_infinite_profit_factor() {
        let m = calculate(&[trade(10.0), trade(5.0)], 1000.0);
        assert!(m.profit_factor.is_infinite());
        assert!(m.payoff_ratio.is_infinite());
        assert_eq!(m.profit_factor.to_string(), "∞");
        assert_eq!(
            serde_json::to_value(m.profit_factor).unwrap(),
            serde_json::json!("Infinity")
        );
    }

    #[test]
    fn test_drawdown_percent_uses_peak_of_max_drawdown() {
        // equity: 1000 -> 1100 -> 1000 -> 2000 -> 1850
        let trades = vec![trade(100.0), trade(-100.0), trade(1000.0), trade(-150.0)];
        let m = calculate(&trades, 1000.0);
        assert_relative_eq!(m.max_drawdown, 150.0);
        assert_relative_eq!(m.max_drawdown_percent, 7.5);

        // equity: 1000 -> 1500 -> 1200 -> 3000 -> 2900
        // max drop is 300 from 1500, even though the global peak is 3000
        let trades = vec![trade(500.0), trade(-300.0), trade(1800.0), trade(-100.0)];
        let m = calculate(&trades, 1000.0);
        assert_relative_eq!(m.max_drawdown, 300.0);
        assert_relative_eq!(m.max_drawdown_percent, 20.0);
    }

    #[test]
    fn test_calculate_is_idempotent() {
        let trades = vec![trade(12.5), trade(-3.25), trade(7.0)];
        let a = calculate(&trades, 500.0);
        let b = calculate(&trades, 500.0);
        assert_eq!(a, b);
    }
}
