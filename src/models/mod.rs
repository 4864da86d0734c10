use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// OHLCV candlestick data
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Absolute distance between open and close
    pub fn body(&self) -> f64 {
        (self.close - self.open).abs()
    }

    pub fn range(&self) -> f64 {
        self.high - self.low
    }

    pub fn is_bullish(&self) -> bool {
        self.close > self.open
    }

    pub fn is_bearish(&self) -> bool {
        self.close < self.open
    }
}

/// Identifier of a configured strategy instance (e.g. "trend-4h", "ema-15m")
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StrategyId(pub String);

impl StrategyId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StrategyId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Trade direction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Direction {
    Buy,
    Sell,
}

impl Direction {
    /// +1 for long, -1 for short
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Buy => 1.0,
            Direction::Sell => -1.0,
        }
    }

    pub fn opposite(&self) -> Direction {
        match self {
            Direction::Buy => Direction::Sell,
            Direction::Sell => Direction::Buy,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Buy => write!(f, "BUY"),
            Direction::Sell => write!(f, "SELL"),
        }
    }
}

/// Why a signal fired, with the indicator values that triggered it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SignalReason {
    /// Close broke above a descending resistance line while above the MA
    TrendlineBreakout { ma: f64, line_value: f64, slope: f64 },
    /// Close broke below an ascending support line while below the MA
    TrendlineBreakdown { ma: f64, line_value: f64, slope: f64 },
    EmaCrossover { fast: f64, slow: f64 },
    Pullback {
        fast: f64,
        slow: f64,
        swing_level: f64,
        body_ratio: f64,
    },
}

/// A trade proposal produced by a signal engine. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeSignal {
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    /// Proposed order quantity
    pub size: f64,
    pub reason: SignalReason,
    pub leverage: Option<u32>,
    pub generated_at: DateTime<Utc>,
}

impl TradeSignal {
    /// Stop and target sit on the loss and profit side of entry respectively
    pub fn has_valid_levels(&self) -> bool {
        levels_are_valid(
            self.direction,
            self.entry_price,
            self.stop_loss,
            self.take_profit,
        )
    }
}

/// BUY: stop < entry < target. SELL: target < entry < stop.
pub fn levels_are_valid(direction: Direction, entry: f64, stop_loss: f64, take_profit: f64) -> bool {
    if !(entry.is_finite() && stop_loss.is_finite() && take_profit.is_finite()) {
        return false;
    }
    match direction {
        Direction::Buy => stop_loss < entry && entry < take_profit,
        Direction::Sell => take_profit < entry && entry < stop_loss,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionStatus {
    Open,
    Closed,
}

impl PositionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PositionStatus::Open => "Open",
            PositionStatus::Closed => "Closed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    Manual,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "StopLoss",
            ExitReason::TakeProfit => "TakeProfit",
            ExitReason::Manual => "Manual",
        }
    }
}

/// Position held for one (symbol, strategy) pair
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub id: Uuid,
    pub symbol: String,
    pub strategy_id: StrategyId,
    pub direction: Direction,
    pub entry_price: f64,
    pub stop_loss: f64,
    pub take_profit: f64,
    pub quantity: f64,
    pub leverage: Option<u32>,
    pub status: PositionStatus,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_price: Option<f64>,
    pub pnl: Option<f64>,
    pub exit_reason: Option<ExitReason>,
}

impl Position {
    pub fn is_open(&self) -> bool {
        self.status == PositionStatus::Open
    }

    /// P&L if the position were closed at `price`
    pub fn pnl_at(&self, price: f64) -> f64 {
        (price - self.entry_price) * self.quantity * self.direction.sign()
    }
}
