use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The authoritative link between a human-facing ticker and one upstream
/// instrument. At most one active mapping exists per symbol; the resolver
/// owns the originals and hands out copies.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstrumentMapping {
    pub symbol: String,
    /// Canonical upstream id, e.g. "official-trump".
    pub instrument_id: String,
    /// Venue alias for the exchange-style upstream, e.g. "TRUMPUSDT".
    pub exchange_pair: String,
    pub market_cap_rank: Option<u32>,
    pub resolved_at: DateTime<Utc>,
}

/// One instrument as listed by the resolution upstream, before the
/// collision policy has picked a winner.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstrumentMeta {
    pub instrument_id: String,
    pub symbol: String,
    pub name: String,
    pub market_cap_rank: Option<u32>,
    pub market_cap: Option<f64>,
    pub volume_24h: Option<f64>,
    pub price_change_24h_pct: Option<f64>,
    pub price: Option<f64>,
}

/// Current market snapshot for one instrument.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Ticker {
    pub price: f64,
    pub volume_24h: f64,
    pub market_cap: Option<f64>,
    pub price_change_24h_pct: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// OHLCV candlestick.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CandleInterval {
    OneMinute,
    FiveMinutes,
    OneHour,
    OneDay,
}

impl CandleInterval {
    /// Exchange-style interval token ("1m", "5m", "1h", "1d").
    pub fn as_str(&self) -> &'static str {
        match self {
            CandleInterval::OneMinute => "1m",
            CandleInterval::FiveMinutes => "5m",
            CandleInterval::OneHour => "1h",
            CandleInterval::OneDay => "1d",
        }
    }
}

/// One price level of an order book ladder.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BookLevel {
    pub price: f64,
    pub quantity: f64,
}

/// Bid/ask ladder, best levels first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<BookLevel>,
    pub asks: Vec<BookLevel>,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseReason {
    StopLoss,
    TakeProfit,
    Manual,
    RiskLimit,
}

/// A simulated position. Stop and take-profit are fixed at open time;
/// `status` transitions Open -> Closed exactly once, and the three close
/// fields are only ever set together.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub instrument_id: String,
    pub exchange_pair: String,
    pub side: Side,
    pub entry_price: f64,
    pub quantity: f64,
    pub stop_loss_price: f64,
    pub take_profit_price: f64,
    pub opened_at: DateTime<Utc>,
    pub status: PositionStatus,
    pub close_reason: Option<CloseReason>,
    pub closed_at: Option<DateTime<Utc>>,
    pub close_price: Option<f64>,
}

impl Position {
    /// Cost basis locked up by this position while open.
    pub fn cost_basis(&self) -> f64 {
        self.entry_price * self.quantity
    }

    /// Sign-adjusted realized P&L at the given close price.
    pub fn pnl_at(&self, close_price: f64) -> f64 {
        match self.side {
            Side::Long => (close_price - self.entry_price) * self.quantity,
            Side::Short => (self.entry_price - close_price) * self.quantity,
        }
    }

    /// Side-aware protection check against a fresh price.
    pub fn triggered_exit(&self, price: f64) -> Option<CloseReason> {
        match self.side {
            Side::Long => {
                if price <= self.stop_loss_price {
                    Some(CloseReason::StopLoss)
                } else if price >= self.take_profit_price {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
            Side::Short => {
                if price >= self.stop_loss_price {
                    Some(CloseReason::StopLoss)
                } else if price <= self.take_profit_price {
                    Some(CloseReason::TakeProfit)
                } else {
                    None
                }
            }
        }
    }
}

/// Read-only snapshot of the portfolio, as exposed to the dashboard layer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioState {
    pub cash_balance: f64,
    pub open_positions: Vec<Position>,
    pub realized_pnl: f64,
    pub daily_pnl: f64,
    pub daily_reset_at: DateTime<Utc>,
    pub trading_suspended: bool,
}
