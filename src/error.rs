//! Error taxonomy for the simulation core
//!
//! Insufficient lookback and degenerate metrics are not errors: the engine
//! returns a no-op result and the metrics use explicit sentinels instead.

use thiserror::Error;

use crate::types::CandleValidationError;

#[derive(Debug, Error)]
pub enum BacktestError {
    /// Invalid or missing configuration, rejected before any data fetch
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Candle sequence failed the engine's precondition check
    #[error("invalid candle at index {index}: {source}")]
    InvalidCandles {
        index: usize,
        #[source]
        source: CandleValidationError,
    },

    /// The data supplier returned zero candles for a requested window
    #[error("no {window} candles available for {symbol}")]
    DataUnavailable { symbol: String, window: String },

    /// The data supplier itself failed
    #[error("failed to fetch candles: {0}")]
    DataFetch(String),

    /// The parameter ranges produced an empty grid
    #[error("parameter ranges produced no combinations")]
    NoCombinations,

    /// Every combination was rejected during ranking
    #[error("optimization found no valid parameter combination (every run was invalid or had zero trades)")]
    OptimizationExhausted,
}

pub type CoreResult<T> = Result<T, BacktestError>;

impl BacktestError {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}
