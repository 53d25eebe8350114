//! Paper-trading session
//!
//! Explicit session object for a polling live driver: the caller owns the
//! session, feeds it the latest closed candles and its quote balance on every
//! poll, and persists it however it likes (it is serde-serializable). Fills
//! are simulated at the latest close; no orders are sent anywhere.

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::CoreResult;
use crate::indicators::{self, last_value};
use crate::strategy::StrategyParams;
use crate::{Candle, ExitReason, Trade};

/// Share of the quote balance committed per buy, leaving room for fees
pub const BUY_BALANCE_FRACTION: f64 = 0.995;

/// Exchange order filters for the traded symbol
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TradeFilters {
    pub min_notional: f64,
    pub min_qty: f64,
    /// Quantity decimals; quantities are floored to this precision
    pub precision: u32,
}

impl Default for TradeFilters {
    fn default() -> Self {
        TradeFilters {
            min_notional: 5.0,
            min_qty: 0.00001,
            precision: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSettings {
    pub symbol: String,
    pub strategy: StrategyParams,
    #[serde(default)]
    pub filters: TradeFilters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LivePortfolio {
    pub crypto_balance: f64,
    pub is_opened: bool,
    pub last_buy_price: f64,
    pub last_buy_time: i64,
    pub total_profit_usdt: f64,
    pub peak_price: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionStats {
    pub total_trades: usize,
    pub wins: usize,
    pub losses: usize,
    pub total_profit: f64,
    pub total_loss: f64,
}

impl SessionStats {
    fn record(&mut self, profit: f64) {
        self.total_trades += 1;
        if profit > 0.0 {
            self.wins += 1;
            self.total_profit += profit;
        } else {
            self.losses += 1;
            self.total_loss += profit.abs();
        }
    }
}

/// What one poll did
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Monitoring is stopped
    Inactive,
    /// Not enough candles for the indicators
    Warmup { candles: usize, needed: usize },
    /// Flat and no entry signal
    AwaitingEntry { rsi: f64, sma: f64 },
    /// Entry signal, but the order would violate the filters
    OrderRejected { reason: String },
    Bought { price: f64, quantity: f64 },
    /// In position, no exit triggered
    Holding { unrealized_profit: f64, stop_price: f64 },
    Sold(Trade),
    /// Exit triggered on a position worth less than the minimum notional;
    /// the portfolio was reset without a trade
    PositionReset { position_value: f64 },
}

/// Caller-owned live session state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LiveSession {
    pub settings: SessionSettings,
    pub portfolio: LivePortfolio,
    pub stats: SessionStats,
    pub is_monitoring_active: bool,
    #[serde(default)]
    pub trades: Vec<Trade>,
}

impl LiveSession {
    /// Fresh session with an empty portfolio, monitoring active
    pub fn start(settings: SessionSettings) -> CoreResult<Self> {
        settings.strategy.validate()?;
        info!("Session started for {}", settings.symbol);
        Ok(LiveSession {
            settings,
            portfolio: LivePortfolio::default(),
            stats: SessionStats::default(),
            is_monitoring_active: true,
            trades: Vec::new(),
        })
    }

    /// Resume a restored session
    pub fn resume(&mut self) {
        self.is_monitoring_active = true;
        info!(
            "Session resumed for {} (in position: {})",
            self.settings.symbol, self.portfolio.is_opened
        );
    }

    pub fn stop(&mut self) {
        self.is_monitoring_active = false;
        info!("Session stopped for {}", self.settings.symbol);
    }

    /// One-line human readable status
    pub fn status(&self) -> String {
        if !self.is_monitoring_active {
            "Monitoring is stopped.".to_string()
        } else if self.portfolio.is_opened {
            format!(
                "In position on {}: bought at {:.2}, quantity {:.8}",
                self.settings.symbol, self.portfolio.last_buy_price, self.portfolio.crypto_balance
            )
        } else {
            format!("Waiting for an entry on {}", self.settings.symbol)
        }
    }

    /// Evaluate the latest closed candle
    ///
    /// Buys are sized from `quote_balance`; exits are judged on the latest
    /// close only (the live driver sees a price, not a bar).
    pub fn on_candles(&mut self, candles: &[Candle], quote_balance: f64) -> SessionEvent {
        if !self.is_monitoring_active {
            return SessionEvent::Inactive;
        }

        let params = &self.settings.strategy;
        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let rsi = last_value(&indicators::rsi(&closes, params.rsi_period));
        let sma = last_value(&indicators::sma(&closes, params.ma_period));
        let (Some(rsi), Some(sma), Some(last)) = (rsi, sma, candles.last()) else {
            return SessionEvent::Warmup {
                candles: candles.len(),
                needed: params.lookback() + 1,
            };
        };
        let price = last.close;

        if !self.portfolio.is_opened {
            if params.entry_signal(rsi, sma, price) {
                return self.buy(price, last.open_time, quote_balance);
            }
            debug!(rsi, sma, price, "Awaiting entry");
            return SessionEvent::AwaitingEntry { rsi, sma };
        }

        if params.use_trailing_stop && price > self.portfolio.peak_price {
            self.portfolio.peak_price = price;
        }

        let tick = Candle::new_unchecked(last.open_time, price, price, price, price, 0.0);
        match params.evaluate_exit(
            self.portfolio.last_buy_price,
            self.portfolio.peak_price,
            &tick,
            None,
        ) {
            Some(exit) => {
                info!("Exit condition {} reached at {:.2}", exit.reason, price);
                let position_value = price * self.portfolio.crypto_balance;
                match self.liquidate(exit.reason, price, last.open_time) {
                    Some(trade) => SessionEvent::Sold(trade),
                    None => SessionEvent::PositionReset { position_value },
                }
            }
            None => {
                let unrealized_profit =
                    (price - self.portfolio.last_buy_price) * self.portfolio.crypto_balance;
                let stop_price =
                    params.stop_price(self.portfolio.last_buy_price, self.portfolio.peak_price);
                debug!(unrealized_profit, stop_price, "Holding position");
                SessionEvent::Holding {
                    unrealized_profit,
                    stop_price,
                }
            }
        }
    }

    fn buy(&mut self, price: f64, time: i64, quote_balance: f64) -> SessionEvent {
        let filters = &self.settings.filters;
        if quote_balance < filters.min_notional {
            let reason = format!(
                "quote balance {:.2} below minimum notional {}",
                quote_balance, filters.min_notional
            );
            warn!("{}", reason);
            return SessionEvent::OrderRejected { reason };
        }

        let quantity = floor_to_decimals(quote_balance * BUY_BALANCE_FRACTION / price, filters.precision);
        if price * quantity < filters.min_notional || quantity < filters.min_qty {
            let reason = format!(
                "order too small: quantity {} at {:.2} (min notional {}, min qty {})",
                quantity, price, filters.min_notional, filters.min_qty
            );
            warn!("{}", reason);
            return SessionEvent::OrderRejected { reason };
        }

        self.portfolio.is_opened = true;
        self.portfolio.crypto_balance = quantity;
        self.portfolio.last_buy_price = price;
        self.portfolio.last_buy_time = time;
        self.portfolio.peak_price = price;
        info!("BUY {} {} at {:.2}", quantity, self.settings.symbol, price);

        SessionEvent::Bought { price, quantity }
    }

    /// Close the open position at `price`
    ///
    /// `None` when flat, or when the position is worth less than the minimum
    /// notional: such a position cannot be sold, so the portfolio is reset
    /// and no trade is recorded.
    pub fn liquidate(&mut self, reason: ExitReason, price: f64, time: i64) -> Option<Trade> {
        if !self.portfolio.is_opened {
            return None;
        }

        let position_value = price * self.portfolio.crypto_balance;
        if position_value < self.settings.filters.min_notional {
            warn!(
                "Position on {} worth {:.2} is below minimum notional {}, resetting without a sale",
                self.settings.symbol, position_value, self.settings.filters.min_notional
            );
            self.reset_position();
            return None;
        }

        let trade = Trade::new(
            self.portfolio.last_buy_time,
            self.portfolio.last_buy_price,
            time,
            price,
            self.portfolio.crypto_balance,
            reason,
        );
        self.portfolio.total_profit_usdt += trade.profit;
        self.stats.record(trade.profit);

        self.reset_position();
        info!(
            "SELL {} at {:.2} ({}), profit {:.2}",
            self.settings.symbol, price, reason, trade.profit
        );

        self.trades.push(trade.clone());
        Some(trade)
    }

    fn reset_position(&mut self) {
        self.portfolio.is_opened = false;
        self.portfolio.crypto_balance = 0.0;
        self.portfolio.last_buy_price = 0.0;
        self.portfolio.peak_price = 0.0;
    }
}

fn floor_to_decimals(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).floor() / factor
}
