//! Technical indicators
//!
//! Both indicators return a series aligned with the input (`None` during the
//! warm-up). Every value at index `i` depends only on `values[..=i]`, so
//! computing a series once and reading index `i` gives the same number as
//! recomputing over the prefix and reading its last element.

use ta::indicators::SimpleMovingAverage;
use ta::Next;

/// Calculate Simple Moving Average
///
/// First defined value is at index `period - 1`.
pub fn sma(values: &[f64], period: usize) -> Vec<Option<f64>> {
    if values.is_empty() || period == 0 {
        return vec![];
    }

    let mut indicator = match SimpleMovingAverage::new(period) {
        Ok(i) => i,
        Err(_) => return vec![None; values.len()],
    };

    let mut result = Vec::with_capacity(values.len());

    for (i, &value) in values.iter().enumerate() {
        let sma_val = indicator.next(value);
        if i + 1 >= period {
            result.push(Some(sma_val));
        } else {
            result.push(None);
        }
    }

    result
}

/// Calculate RSI (Relative Strength Index) with Wilder smoothing
///
/// The first average gain/loss is the plain mean of the first `period`
/// price changes; later averages use `(prev * (period - 1) + x) / period`.
/// First defined value is at index `period`. Values are rounded to two
/// decimals, and oversold thresholds compare against the rounded value.
/// (The `ta` crate's RSI smooths with an EMA, which gives different numbers.)
pub fn rsi(values: &[f64], period: usize) -> Vec<Option<f64>> {
    let mut result = vec![None; values.len()];
    if period == 0 || values.len() <= period {
        return result;
    }

    let p = period as f64;
    let mut avg_gain = 0.0;
    let mut avg_loss = 0.0;

    for i in 1..=period {
        let change = values[i] - values[i - 1];
        if change > 0.0 {
            avg_gain += change;
        } else {
            avg_loss -= change;
        }
    }
    avg_gain /= p;
    avg_loss /= p;
    result[period] = Some(rsi_from_averages(avg_gain, avg_loss));

    for i in (period + 1)..values.len() {
        let change = values[i] - values[i - 1];
        let gain = if change > 0.0 { change } else { 0.0 };
        let loss = if change < 0.0 { -change } else { 0.0 };
        avg_gain = (avg_gain * (p - 1.0) + gain) / p;
        avg_loss = (avg_loss * (p - 1.0) + loss) / p;
        result[i] = Some(rsi_from_averages(avg_gain, avg_loss));
    }

    result
}

fn rsi_from_averages(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        round2(100.0 - 100.0 / (1.0 + rs))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Last defined value of a series
pub fn last_value(series: &[Option<f64>]) -> Option<f64> {
    series.last().copied().flatten()
}
