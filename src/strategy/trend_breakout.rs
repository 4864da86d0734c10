use super::SignalEngine;
use crate::indicators::{calculate_sma, find_swing_highs, find_swing_lows, SwingPoint, TrendLine};
use crate::models::{levels_are_valid, Candle, Direction, SignalReason, StrategyId, TradeSignal};
use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Configuration for the trendline breakout strategy
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrendBreakoutConfig {
    /// Baseline moving average period
    pub ma_period: usize,
    /// Window (in candles) in which swing points may be used for trendlines
    pub lookback: usize,
    /// Candles required on each side of a swing point
    pub swing_strength: usize,
    /// Most recent swing points fitted per trendline
    pub max_swing_points: usize,
    /// Stop distance as a fraction of entry (0.005 = 0.5%)
    pub stop_loss_pct: f64,
    /// Target distance as a fraction of entry (0.01 = 1%)
    pub take_profit_pct: f64,
    pub order_size: f64,
    pub leverage: Option<u32>,
}

impl Default for TrendBreakoutConfig {
    fn default() -> Self {
        Self {
            ma_period: 200,
            lookback: 50,
            swing_strength: 5,
            max_swing_points: 3,
            stop_loss_pct: 0.005,
            take_profit_pct: 0.01,
            order_size: 1.0,
            leverage: None,
        }
    }
}

/// Indicator state at the latest candle
#[derive(Debug, Clone, PartialEq)]
pub struct TrendSnapshot {
    pub index: usize,
    pub price: f64,
    pub ma: f64,
    /// Line through recent swing highs
    pub resistance: Option<TrendLine>,
    /// Line through recent swing lows
    pub support: Option<TrendLine>,
}

/// Trendline breakout strategy
///
/// Buys when price is above the long moving average and closes above a
/// descending resistance line; sells when price is below the moving average
/// and closes below an ascending support line. Stops and targets are fixed
/// percentage bands around entry.
#[derive(Debug, Clone)]
pub struct TrendBreakoutEngine {
    id: StrategyId,
    config: TrendBreakoutConfig,
}

impl TrendBreakoutEngine {
    pub fn new(id: StrategyId, config: TrendBreakoutConfig) -> Self {
        Self { id, config }
    }

    pub fn config(&self) -> &TrendBreakoutConfig {
        &self.config
    }

    /// Compute MA and trendlines at the latest candle.
    ///
    /// None when there is not enough history.
    pub fn analyze(&self, candles: &[Candle]) -> Option<TrendSnapshot> {
        if candles.len() < self.min_candles_required() {
            return None;
        }

        let closes: Vec<f64> = candles.iter().map(|c| c.close).collect();
        let ma = calculate_sma(&closes, self.config.ma_period)?;

        let index = candles.len() - 1;
        let window_start = candles.len() - self.config.lookback;
        let k = self.config.swing_strength;

        let resistance = self.fit_recent(find_swing_highs(candles, k), window_start);
        let support = self.fit_recent(find_swing_lows(candles, k), window_start);

        Some(TrendSnapshot {
            index,
            price: candles[index].close,
            ma,
            resistance,
            support,
        })
    }

    fn fit_recent(&self, swings: Vec<SwingPoint>, window_start: usize) -> Option<TrendLine> {
        let in_window: Vec<SwingPoint> = swings
            .into_iter()
            .filter(|s| s.index >= window_start)
            .collect();
        let skip = in_window.len().saturating_sub(self.config.max_swing_points);
        TrendLine::fit(&in_window[skip..])
    }

    fn build_signal(
        &self,
        symbol: &str,
        direction: Direction,
        entry: f64,
        reason: SignalReason,
    ) -> Option<TradeSignal> {
        let sign = direction.sign();
        let stop_loss = entry * (1.0 - sign * self.config.stop_loss_pct);
        let take_profit = entry * (1.0 + sign * self.config.take_profit_pct);

        if !levels_are_valid(direction, entry, stop_loss, take_profit) {
            tracing::warn!(
                symbol = %symbol,
                "Discarding {} breakout: invalid levels (entry {:.4}, SL {:.4}, TP {:.4})",
                direction,
                entry,
                stop_loss,
                take_profit
            );
            return None;
        }

        Some(TradeSignal {
            symbol: symbol.to_string(),
            strategy_id: self.id.clone(),
            direction,
            entry_price: entry,
            stop_loss,
            take_profit,
            size: self.config.order_size,
            reason,
            leverage: self.config.leverage,
            generated_at: Utc::now(),
        })
    }
}

impl SignalEngine for TrendBreakoutEngine {
    fn id(&self) -> &StrategyId {
        &self.id
    }

    fn name(&self) -> &str {
        "TrendBreakout"
    }

    fn min_candles_required(&self) -> usize {
        self.config.ma_period + self.config.lookback
    }

    fn detect(&self, symbol: &str, candles: &[Candle]) -> Vec<TradeSignal> {
        let Some(snapshot) = self.analyze(candles) else {
            tracing::debug!(
                symbol = %symbol,
                "Collecting data... ({}/{} candles)",
                candles.len(),
                self.min_candles_required()
            );
            return Vec::new();
        };

        let TrendSnapshot {
            index,
            price,
            ma,
            resistance,
            support,
        } = snapshot;

        tracing::debug!(
            symbol = %symbol,
            "Price={:.4}, MA{}={:.4}, resistance={:?}, support={:?}",
            price,
            self.config.ma_period,
            ma,
            resistance.map(|l| l.value_at(index)),
            support.map(|l| l.value_at(index))
        );

        let mut signals = Vec::new();

        if let Some(line) = resistance {
            let line_value = line.value_at(index);
            if price > ma && line.is_descending() && price > line_value {
                tracing::info!(
                    symbol = %symbol,
                    "BUY: close {:.4} broke descending resistance {:.4} above MA {:.4}",
                    price,
                    line_value,
                    ma
                );
                let reason = SignalReason::TrendlineBreakout {
                    ma,
                    line_value,
                    slope: line.slope,
                };
                signals.extend(self.build_signal(symbol, Direction::Buy, price, reason));
            }
        }

        if let Some(line) = support {
            let line_value = line.value_at(index);
            if price < ma && line.is_ascending() && price < line_value {
                tracing::info!(
                    symbol = %symbol,
                    "SELL: close {:.4} broke ascending support {:.4} below MA {:.4}",
                    price,
                    line_value,
                    ma
                );
                let reason = SignalReason::TrendlineBreakdown {
                    ma,
                    line_value,
                    slope: line.slope,
                };
                signals.extend(self.build_signal(symbol, Direction::Sell, price, reason));
            }
        }

        signals
    }
}
