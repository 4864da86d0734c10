// Signal detection engines
pub mod ema_crossover;
pub mod trend_breakout;

pub use ema_crossover::{EmaCrossoverConfig, EmaCrossoverEngine};
pub use trend_breakout::{TrendBreakoutConfig, TrendBreakoutEngine};

use crate::models::{Candle, StrategyId, TradeSignal};

/// Capability shared by every strategy: turn a candle history into signals
pub trait SignalEngine: Send + Sync {
    /// Identifier used for ledger keys and events
    fn id(&self) -> &StrategyId;

    /// Human-readable engine name
    fn name(&self) -> &str;

    /// Minimum candles required before any signal can be produced
    fn min_candles_required(&self) -> usize;

    /// Zero or more signals for the latest candle.
    ///
    /// Insufficient history is a normal outcome and yields an empty list.
    fn detect(&self, symbol: &str, candles: &[Candle]) -> Vec<TradeSignal>;
}

#[cfg(test)]
pub(crate) mod test_support {
    use crate::models::Candle;
    use chrono::{Duration, TimeZone, Utc};

    /// Candles one minute apart from a list of (open, high, low, close)
    pub fn candles_from_ohlc(bars: &[(f64, f64, f64, f64)]) -> Vec<Candle> {
        let start = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        bars.iter()
            .enumerate()
            .map(|(i, &(open, high, low, close))| Candle {
                timestamp: start + Duration::minutes(i as i64),
                open,
                high,
                low,
                close,
                volume: 1_000.0,
            })
            .collect()
    }

    /// Candles with a tight range around each close
    pub fn candles_from_closes(closes: &[f64]) -> Vec<Candle> {
        let bars: Vec<_> = closes
            .iter()
            .map(|&c| (c - 0.01, c + 0.05, c - 0.05, c))
            .collect();
        candles_from_ohlc(&bars)
    }
}
