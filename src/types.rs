//! Core data types used across the backtesting system

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Validation errors for candle data
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CandleValidationError {
    #[error("high ({high}) must be >= low ({low})")]
    HighLessThanLow { high: f64, low: f64 },

    #[error("volume ({0}) must be >= 0")]
    NegativeVolume(f64),

    #[error("close ({close}) must be between low ({low}) and high ({high})")]
    CloseOutOfRange { close: f64, low: f64, high: f64 },

    #[error("prices must be positive and finite: open={open}, high={high}, low={low}, close={close}")]
    NonPositivePrice {
        open: f64,
        high: f64,
        low: f64,
        close: f64,
    },

    #[error("open time {current} is not after previous open time {previous}")]
    NotChronological { previous: i64, current: i64 },
}

/// OHLCV candlestick (kline) data
///
/// `open_time` is the bar's open time in epoch milliseconds (UTC), the same
/// representation the exchange uses for klines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Create a new candle with validation
    pub fn new(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Result<Self, CandleValidationError> {
        let candle = Self::new_unchecked(open_time, open, high, low, close, volume);
        candle.validate()?;
        Ok(candle)
    }

    /// Create a candle without validation (for trusted sources or when validation is done separately)
    pub fn new_unchecked(
        open_time: i64,
        open: f64,
        high: f64,
        low: f64,
        close: f64,
        volume: f64,
    ) -> Self {
        Self {
            open_time,
            open,
            high,
            low,
            close,
            volume,
        }
    }

    /// Validate the fields the simulation reads (high, low, close)
    ///
    /// `open` only has to be a positive finite number: exchanges occasionally
    /// report an open outside the bar range after a gap, and nothing in the
    /// simulation reads it.
    pub fn validate(&self) -> Result<(), CandleValidationError> {
        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p <= 0.0) {
            return Err(CandleValidationError::NonPositivePrice {
                open: self.open,
                high: self.high,
                low: self.low,
                close: self.close,
            });
        }

        if self.high < self.low {
            return Err(CandleValidationError::HighLessThanLow {
                high: self.high,
                low: self.low,
            });
        }

        if self.volume < 0.0 {
            return Err(CandleValidationError::NegativeVolume(self.volume));
        }

        if self.close < self.low || self.close > self.high {
            return Err(CandleValidationError::CloseOutOfRange {
                close: self.close,
                low: self.low,
                high: self.high,
            });
        }

        Ok(())
    }

    /// Open time as a UTC datetime
    pub fn datetime(&self) -> DateTime<Utc> {
        millis_to_datetime(self.open_time)
    }
}

/// Convert epoch milliseconds to a UTC datetime, clamping unrepresentable values to the epoch
pub fn millis_to_datetime(millis: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(millis).unwrap_or(DateTime::UNIX_EPOCH)
}

/// Why a position was closed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExitReason {
    TakeProfit,
    StopLoss,
    TrailingStop,
    MaExit,
    Manual,
}

impl fmt::Display for ExitReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            ExitReason::TakeProfit => "TAKE_PROFIT",
            ExitReason::StopLoss => "STOP_LOSS",
            ExitReason::TrailingStop => "TRAILING_STOP",
            ExitReason::MaExit => "MA_EXIT",
            ExitReason::Manual => "MANUAL",
        };
        f.write_str(label)
    }
}

/// Completed round-trip trade
///
/// Created once when a position is closed and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Trade {
    pub entry_time: i64,
    pub entry_price: f64,
    pub exit_time: i64,
    pub exit_price: f64,
    pub quantity: f64,
    pub profit: f64,
    pub exit_reason: ExitReason,
}

impl Trade {
    /// Record a closed long position; profit is `(exit - entry) * quantity`
    pub fn new(
        entry_time: i64,
        entry_price: f64,
        exit_time: i64,
        exit_price: f64,
        quantity: f64,
        exit_reason: ExitReason,
    ) -> Self {
        Self {
            entry_time,
            entry_price,
            exit_time,
            exit_price,
            quantity,
            profit: (exit_price - entry_price) * quantity,
            exit_reason,
        }
    }

    /// Calculate return percentage
    pub fn return_pct(&self) -> f64 {
        if self.entry_price == 0.0 {
            return 0.0;
        }
        (self.exit_price - self.entry_price) / self.entry_price * 100.0
    }

    pub fn is_win(&self) -> bool {
        self.profit > 0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_candle_validation() {
        assert!(Candle::new(0, 100.0, 105.0, 95.0, 102.0, 10.0).is_ok());

        let err = Candle::new(0, 100.0, 95.0, 105.0, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, CandleValidationError::HighLessThanLow { .. }));

        let err = Candle::new(0, 100.0, 105.0, 95.0, 110.0, 10.0).unwrap_err();
        assert!(matches!(err, CandleValidationError::CloseOutOfRange { .. }));

        let err = Candle::new(0, 100.0, 105.0, f64::NAN, 100.0, 10.0).unwrap_err();
        assert!(matches!(err, CandleValidationError::NonPositivePrice { .. }));
    }

    #[test]
    fn test_trade_profit() {
        let trade = Trade::new(0, 100.0, 60_000, 110.0, 2.0, ExitReason::TakeProfit);
        assert_eq!(trade.profit, 20.0);
        assert!(trade.is_win());
        assert!((trade.return_pct() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_exit_reason_serde() {
        let json = serde_json::to_string(&ExitReason::TrailingStop).unwrap();
        assert_eq!(json, "\"TRAILING_STOP\"");
        assert_eq!(ExitReason::MaExit.to_string(), "MA_EXIT");
    }

    #[test]
    fn test_candle_datetime() {
        let candle = Candle::new_unchecked(1_700_000_000_000, 1.0, 1.0, 1.0, 1.0, 0.0);
        assert_eq!(candle.datetime().timestamp_millis(), 1_700_000_000_000);
    }
}
