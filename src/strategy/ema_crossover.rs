use super::SignalEngine;
use crate::indicators::calculate_ema_series;
use crate::models::{levels_are_valid, Candle, Direction, SignalReason, StrategyId, TradeSignal};
use crate::risk::{project_take_profit, RiskSizing};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Configuration for the EMA crossover / pullback strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmaCrossoverConfig {
    pub fast_period: usize,
    pub slow_period: usize,
    /// Market is ranging while |fast - slow| / slow is below this (0.001 = 0.1%)
    pub ranging_threshold_pct: f64,
    /// Crossover stop sits this far beyond the slow EMA (0.02 = 2%)
    pub crossover_stop_buffer_pct: f64,
    /// Crossover stop is never further than this from entry (0.03 = 3%)
    pub crossover_max_stop_pct: f64,
    /// Target distance as a multiple of the stop distance
    pub reward_ratio: f64,
    /// Pullback only when close is within this distance of the fast EMA
    pub pullback_proximity_pct: f64,
    /// Minimum body / range for a confirmation candle
    pub min_body_ratio: f64,
    /// Candles before the signal candle searched for the pullback stop
    pub swing_lookback: usize,
    /// Pullback stop sits this far beyond the swing extreme (0.002 = 0.2%)
    pub swing_buffer_pct: f64,
    /// Account risk settings for pullback sizing
    pub sizing: RiskSizing,
    /// Fixed quantity for crossover entries
    pub order_size: f64,
    pub leverage: Option<u32>,
    pub enable_crossover: bool,
    pub enable_pullback: bool,
}

impl Default for EmaCrossoverConfig {
    fn default() -> Self {
        Self {
            fast_period: 9,
            slow_period: 20,
            ranging_threshold_pct: 0.001,
            crossover_stop_buffer_pct: 0.02,
            crossover_max_stop_pct: 0.03,
            reward_ratio: 3.0,
            pullback_proximity_pct: 0.005,
            min_body_ratio: 0.5,
            swing_lookback: 5,
            swing_buffer_pct: 0.002,
            sizing: RiskSizing::default(),
            order_size: 1.0,
            leverage: None,
            enable_crossover: true,
            enable_pullback: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trend {
    Bullish,
    Bearish,
    Neutral,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarketCondition {
    Trending,
    Ranging,
}

/// Fast and slow EMA values at one step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaPair {
    pub fast: f64,
    pub slow: f64,
}

impl EmaPair {
    pub fn new(fast: f64, slow: f64) -> Self {
        Self { fast, slow }
    }

    pub fn trend(&self) -> Trend {
        if self.fast > self.slow {
            Trend::Bullish
        } else if self.fast < self.slow {
            Trend::Bearish
        } else {
            Trend::Neutral
        }
    }

    /// Relative gap between the averages
    pub fn spread(&self) -> f64 {
        (self.fast - self.slow).abs() / self.slow
    }
}

/// EMA state at the latest candle and the one before it
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EmaState {
    pub previous: EmaPair,
    pub current: EmaPair,
    pub trend: Trend,
    pub market: MarketCondition,
}

impl EmaState {
    pub fn new(previous: EmaPair, current: EmaPair, ranging_threshold_pct: f64) -> Self {
        let market = if current.spread() < ranging_threshold_pct {
            MarketCondition::Ranging
        } else {
            MarketCondition::Trending
        };
        Self {
            previous,
            current,
            trend: current.trend(),
            market,
        }
    }
}

/// Direction of a fast/slow cross between two consecutive steps
pub fn detect_crossover(previous: EmaPair, current: EmaPair) -> Option<Direction> {
    if previous.fast <= previous.slow && current.fast > current.slow {
        Some(Direction::Buy)
    } else if previous.fast >= previous.slow && current.fast < current.slow {
        Some(Direction::Sell)
    } else {
        None
    }
}

/// Body at least `min_body_ratio` of the range and pointing in `direction`
pub fn is_strong_candle(candle: &Candle, direction: Direction, min_body_ratio: f64) -> bool {
    let range = candle.range();
    if range <= 0.0 {
        return false;
    }
    let in_direction = match direction {
        Direction::Buy => candle.is_bullish(),
        Direction::Sell => candle.is_bearish(),
    };
    in_direction && candle.body() / range >= min_body_ratio
}

/// EMA 9/20 crossover and trend pullback strategy
///
/// Two detectors share the same EMA state and may both fire on one candle:
/// - Crossover: fast EMA crosses the slow EMA. Stop is buffered beyond the
///   slow EMA and capped relative to entry.
/// - Pullback: in an established trend, price returns to the fast EMA and a
///   strong candle confirms. Stop goes beyond the recent swing extreme and
///   size comes from account risk.
///
/// Nothing fires while the averages are too close together (ranging).
#[derive(Debug, Clone)]
pub struct EmaCrossoverEngine {
    id: StrategyId,
    config: EmaCrossoverConfig,
}

impl EmaCrossoverEngine {
    pub fn new(id: StrategyId, config: EmaCrossoverConfig) -> Self {
        Self { id, config }
    }

    pub fn config(&self) -> &EmaCrossoverConfig {
        &self.config
    }

    /// EMA state at the latest candle, None without enough history
    pub fn analyze(&self, candles: &[Candle]) -> Option<EmaState> {
        if candles.len() < self.min_candles_required() {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let fast = calculate_ema_series(&closes, self.config.fast_period);
        let slow = calculate_ema_series(&closes, self.config.slow_period);

        // Both series end at the latest candle
        let current = EmaPair::new(*fast.last()?, *slow.last()?);
        let previous = EmaPair::new(
            *fast.get(fast.len().checked_sub(2)?)?,
            *slow.get(slow.len().checked_sub(2)?)?,
        );

        Some(EmaState::new(
            previous,
            current,
            self.config.ranging_threshold_pct,
        ))
    }

    /// Signal for a fresh crossover at `entry`, if the state shows one
    pub fn crossover_signal(&self, symbol: &str, entry: f64, state: &EmaState) -> Option<TradeSignal> {
        if state.market == MarketCondition::Ranging {
            return None;
        }
        let direction = detect_crossover(state.previous, state.current)?;
        let sign = direction.sign();

        let buffered = state.current.slow * (1.0 - sign * self.config.crossover_stop_buffer_pct);
        let capped = entry * (1.0 - sign * self.config.crossover_max_stop_pct);
        let stop_loss = match direction {
            Direction::Buy => buffered.max(capped),
            Direction::Sell => buffered.min(capped),
        };
        let take_profit = project_take_profit(direction, entry, stop_loss, self.config.reward_ratio);

        if !levels_are_valid(direction, entry, stop_loss, take_profit) {
            tracing::warn!(
                symbol = %symbol,
                "Discarding {} crossover: stop {:.4} on wrong side of entry {:.4}",
                direction,
                stop_loss,
                entry
            );
            return None;
        }

        tracing::info!(
            symbol = %symbol,
            "{} crossover: EMA{}={:.4} EMA{}={:.4}",
            direction,
            self.config.fast_period,
            state.current.fast,
            self.config.slow_period,
            state.current.slow
        );

        Some(TradeSignal {
            symbol: symbol.to_string(),
            strategy_id: self.id.clone(),
            direction,
            entry_price: entry,
            stop_loss,
            take_profit,
            size: self.config.order_size,
            reason: SignalReason::EmaCrossover {
                fast: state.current.fast,
                slow: state.current.slow,
            },
            leverage: self.config.leverage,
            generated_at: Utc::now(),
        })
    }

    /// Signal for a confirmed pullback to the fast EMA on the latest candle
    pub fn pullback_signal(&self, symbol: &str, candles: &[Candle], state: &EmaState) -> Option<TradeSignal> {
        if state.market == MarketCondition::Ranging {
            return None;
        }
        let direction = match state.trend {
            Trend::Bullish => Direction::Buy,
            Trend::Bearish => Direction::Sell,
            Trend::Neutral => return None,
        };

        let (signal_candle, history) = candles.split_last()?;
        let entry = signal_candle.close;
        let fast = state.current.fast;

        if (entry - fast).abs() / fast > self.config.pullback_proximity_pct {
            return None;
        }

        let on_trend_side = match direction {
            Direction::Buy => entry > fast,
            Direction::Sell => entry < fast,
        };
        if !on_trend_side || !is_strong_candle(signal_candle, direction, self.config.min_body_ratio) {
            return None;
        }

        let lookback = self.config.swing_lookback.min(history.len());
        if lookback == 0 {
            return None;
        }
        let recent = &history[history.len() - lookback..];
        let swing_level = match direction {
            Direction::Buy => recent.iter().map(|c| c.low).fold(f64::INFINITY, f64::min),
            Direction::Sell => recent.iter().map(|c| c.high).fold(f64::NEG_INFINITY, f64::max),
        };

        let stop_loss = swing_level * (1.0 - direction.sign() * self.config.swing_buffer_pct);
        let take_profit = project_take_profit(direction, entry, stop_loss, self.config.reward_ratio);

        if !levels_are_valid(direction, entry, stop_loss, take_profit) {
            tracing::warn!(
                symbol = %symbol,
                "Discarding {} pullback: stop {:.4} on wrong side of entry {:.4}",
                direction,
                stop_loss,
                entry
            );
            return None;
        }

        let size = self.config.sizing.position_size(entry, stop_loss)?;
        let body_ratio = signal_candle.body() / signal_candle.range();

        tracing::info!(
            symbol = %symbol,
            "{} pullback to EMA{} {:.4}: swing {:.4}, size {:.4}",
            direction,
            self.config.fast_period,
            fast,
            swing_level,
            size
        );

        Some(TradeSignal {
            symbol: symbol.to_string(),
            strategy_id: self.id.clone(),
            direction,
            entry_price: entry,
            stop_loss,
            take_profit,
            size,
            reason: SignalReason::Pullback {
                fast,
                slow: state.current.slow,
                swing_level,
                body_ratio,
            },
            leverage: self.config.leverage,
            generated_at: Utc::now(),
        })
    }
}

impl SignalEngine for EmaCrossoverEngine {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn name(&self) -> &str {
        "EmaCrossover"
    }

    fn min_candles_required(&self) -> usize {
        (self.config.slow_period + 1)
            .max(self.config.swing_lookback + self.config.slow_period)
            .max(self.config.fast_period + 1)
    }

    fn detect(&self, symbol: &str, candles: &[Candle]) -> Vec<TradeSignal> {
        let Some(state) = self.analyze(candles) else {
            tracing::debug!(
                symbol = %symbol,
                "Collecting data... ({}/{} candles)",
                candles.len(),
                self.min_candles_required()
            );
            return Vec::new();
        };

        if state.market == MarketCondition::Ranging {
            tracing::debug!(
                symbol = %symbol,
                "Ranging market (spread {:.4}%), signals suppressed",
                state.current.spread() * 100.0
            );
            return Vec::new();
        }

        let mut signals = Vec::new();

        if self.config.enable_crossover {
            if let Some(entry) = candles.last().map(|c| c.close) {
                signals.extend(self.crossover_signal(symbol, entry, &state));
            }
        }

        if self.config.enable_pullback {
            signals.extend(self.pullback_signal(symbol, candles, &state));
        }

        signals
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::strategy::test_support::{candles_from_closes, candles_from_ohlc};

    fn engine() -> EmaCrossoverEngine {
        EmaCrossoverEngine::new(StrategyId::new("ema"), EmaCrossoverConfig::default())
    }

    /// Uptrend, three-candle dip, then a strong bullish candle closing just
    /// above EMA9.
    pub(crate) fn pullback_bars() -> Vec<(f64, f64, f64, f64)> {
        let mut bars = Vec::new();
        for i in 0..30 {
            let c = 100.0 + 0.5 * i as f64;
            bars.push((c - 0.3, c + 0.4, c - 0.6, c));
        }
        for c in [113.6, 113.0, 112.6] {
            bars.push((c + 0.5, c + 0.7, c - 0.2, c));
        }
        bars.push((112.5, 113.3, 112.4, 113.2));
        bars
    }

    /// Slow drift down then a jump that lifts EMA9 over EMA20 on the last candle
    pub(crate) fn crossover_closes() -> Vec<f64> {
        let mut closes: Vec<f64> = (0..30).map(|i| 100.0 - 0.02 * i as f64).collect();
        closes.push(102.42);
        closes
    }

    #[test]
    fn test_min_candles_required() {
        assert_eq!(engine().min_candles_required(), 25);
    }

    #[test]
    fn test_detect_crossover() {
        let below = EmaPair::new(99.8, 100.0);
        let above = EmaPair::new(100.5, 100.0);
        let touching = EmaPair::new(100.0, 100.0);

        assert_eq!(detect_crossover(below, above), Some(Direction::Buy));
        assert_eq!(detect_crossover(above, below), Some(Direction::Sell));
        assert_eq!(detect_crossover(touching, above), Some(Direction::Buy));
        assert_eq!(detect_crossover(above, above), None);
        assert_eq!(detect_crossover(below, below), None);
    }

    #[test]
    fn test_bearish_crossover_state_emits_sell() {
        // EMA9 100.5 over EMA20 100.0, then 99.8 under it
        let state = EmaState::new(EmaPair::new(100.5, 100.0), EmaPair::new(99.8, 100.0), 0.001);
        assert_eq!(state.market, MarketCondition::Trending);
        assert_eq!(state.trend, Trend::Bearish);

        let signal = engine().crossover_signal("BTCUSD", 99.8, &state).unwrap();
        assert_eq!(signal.direction, Direction::Sell);
        // Stop 2% above EMA20 (2.2 away, inside the 3% cap)
        assert!((signal.stop_loss - 102.0).abs() < 1e-9);
        assert!((signal.take_profit - 93.2).abs() < 1e-9);
        assert!(matches!(signal.reason, SignalReason::EmaCrossover { .. }));
    }

    #[test]
    fn test_bullish_crossover_state_emits_buy() {
        let state = EmaState::new(EmaPair::new(99.8, 100.0), EmaPair::new(100.5, 100.0), 0.001);
        let signal = engine().crossover_signal("BTCUSD", 100.6, &state).unwrap();

        assert_eq!(signal.direction, Direction::Buy);
        assert!((signal.stop_loss - 98.0).abs() < 1e-9);
        assert!(signal.has_valid_levels());
    }

    #[test]
    fn test_crossover_stop_is_capped() {
        let state = EmaState::new(EmaPair::new(99.8, 100.0), EmaPair::new(100.5, 100.0), 0.001);
        // EMA20 buffer would put the stop 7% away; the cap pulls it to 3%
        let signal = engine().crossover_signal("BTCUSD", 105.0, &state).unwrap();

        assert!((signal.stop_loss - 101.85).abs() < 1e-9);
        assert!((signal.take_profit - (105.0 + 3.15 * 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_crossover_with_stop_on_wrong_side_is_discarded() {
        // Entry under the buffered EMA20 stop for a BUY
        let state = EmaState::new(EmaPair::new(99.8, 100.0), EmaPair::new(100.5, 100.0), 0.001);
        assert!(engine().crossover_signal("BTCUSD", 97.0, &state).is_none());
    }

    #[test]
    fn test_ranging_suppresses_crossover() {
        let state = EmaState::new(
            EmaPair::new(99.99, 100.0),
            EmaPair::new(100.05, 100.0),
            0.001,
        );
        assert_eq!(state.market, MarketCondition::Ranging);
        assert!(engine().crossover_signal("BTCUSD", 100.05, &state).is_none());
    }

    #[test]
    fn test_detect_crossover_from_candles() {
        let candles = candles_from_closes(&crossover_closes());
        let state = engine().analyze(&candles).unwrap();
        assert_eq!(state.trend, Trend::Bullish);
        assert_eq!(state.market, MarketCondition::Trending);

        let signals = engine().detect("BTCUSD", &candles);
        assert_eq!(signals.len(), 1);

        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.entry_price, 102.42);
        // EMA20 buffer (~97.88) is more than 3% away, so the cap applies
        assert!((signal.stop_loss - 102.42 * 0.97).abs() < 1e-9);
        assert_eq!(signal.size, 1.0);
    }

    #[test]
    fn test_pullback_emits_risk_sized_buy() {
        let candles = candles_from_ohlc(&pullback_bars());
        let signals = engine().detect("ETHUSD", &candles);

        assert_eq!(signals.len(), 1);
        let signal = &signals[0];
        assert_eq!(signal.direction, Direction::Buy);
        assert_eq!(signal.entry_price, 113.2);

        // Lowest low of the 5 prior candles is 112.4, minus 0.2%
        assert!((signal.stop_loss - 112.4 * 0.998).abs() < 1e-9);
        let risk = 113.2 - 112.4 * 0.998;
        assert!((signal.take_profit - (113.2 + 3.0 * risk)).abs() < 1e-9);
        assert!((signal.size - 100.0 / risk).abs() < 1e-9);
        assert!(matches!(
            signal.reason,
            SignalReason::Pullback { swing_level, .. } if (swing_level - 112.4).abs() < 1e-9
        ));
    }

    #[test]
    fn test_pullback_requires_strong_candle() {
        let mut bars = pullback_bars();
        if let Some(last) = bars.last_mut() {
            // Same close, but a long-wicked small body
            *last = (113.0, 114.0, 112.0, 113.2);
        }
        let candles = candles_from_ohlc(&bars);
        assert!(engine().detect("ETHUSD", &candles).is_empty());
    }

    #[test]
    fn test_pullback_requires_proximity() {
        let mut bars = pullback_bars();
        if let Some(last) = bars.last_mut() {
            // Strong candle but far above EMA9
            *last = (112.5, 116.2, 112.4, 116.0);
        }
        let candles = candles_from_ohlc(&bars);
        assert!(engine().detect("ETHUSD", &candles).is_empty());
    }

    #[test]
    fn test_strong_candle() {
        let bars = candles_from_ohlc(&[
            (100.0, 101.0, 99.9, 100.9),
            (100.9, 101.0, 99.9, 100.0),
            (100.0, 102.0, 99.0, 100.5),
            (100.0, 100.0, 100.0, 100.0),
        ]);

        assert!(is_strong_candle(&bars[0], Direction::Buy, 0.5));
        assert!(!is_strong_candle(&bars[0], Direction::Sell, 0.5));
        assert!(is_strong_candle(&bars[1], Direction::Sell, 0.5));
        assert!(!is_strong_candle(&bars[2], Direction::Buy, 0.5));
        assert!(!is_strong_candle(&bars[3], Direction::Buy, 0.5));
    }

    #[test]
    fn test_insufficient_data() {
        let candles = candles_from_closes(&[100.0; 24]);
        assert!(engine().analyze(&candles).is_none());
        assert!(engine().detect("BTCUSD", &candles).is_empty());
    }

    #[test]
    fn test_flat_market_is_ranging() {
        let candles = candles_from_closes(&[100.0; 40]);
        let state = engine().analyze(&candles).unwrap();

        assert_eq!(state.market, MarketCondition::Ranging);
        assert!(engine().detect("BTCUSD", &candles).is_empty());
    }

    #[test]
    fn test_every_signal_has_valid_levels() {
        let engine = engine();
        let series = [
            candles_from_ohlc(&pullback_bars()),
            candles_from_closes(&crossover_closes()),
        ];
        for candles in series.iter() {
            for end in engine.min_candles_required()..=candles.len() {
                for signal in engine.detect("BTCUSD", &candles[..end]) {
                    assert!(signal.has_valid_levels(), "{:?}", signal);
                }
            }
        }
    }
}
