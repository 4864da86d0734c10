/// Swing point detection
///
/// A candle at index `i` is a swing high when its high is strictly greater
/// than the high of each of the `k` candles on either side. Swing lows are the
/// mirror image on candle lows. Candles without `k` full neighbors on both
/// sides (the first and last `k`) can never be swings.

use crate::models::Candle;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SwingKind {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SwingPoint {
    pub index: usize,
    pub price: f64,
    pub kind: SwingKind,
}

/// All swing highs, oldest first
pub fn find_swing_highs(candles: &[Candle], k: usize) -> Vec<SwingPoint> {
    find_swings(candles, k, SwingKind::High)
}

/// All swing lows, oldest first
pub fn find_swing_lows(candles: &[Candle], k: usize) -> Vec<SwingPoint> {
    find_swings(candles, k, SwingKind::Low)
}

fn find_swings(candles: &[Candle], k: usize, kind: SwingKind) -> Vec<SwingPoint> {
    if k == 0 || candles.len() < 2 * k + 1 {
        return Vec::new();
    }

    let value = |c: &Candle| match kind {
        SwingKind::High => c.high,
        SwingKind::Low => c.low,
    };
    let dominates = |center: f64, other: f64| match kind {
        SwingKind::High => center > other,
        SwingKind::Low => center < other,
    };

    let mut swings = Vec::new();
    for i in k..candles.len() - k {
        let center = value(&candles[i]);
        let is_swing = candles[i - k..=i + k]
            .iter()
            .enumerate()
            .filter(|(offset, _)| *offset != k)
            .all(|(_, c)| dominates(center, value(c)));

        if is_swing {
            swings.push(SwingPoint {
                index: i,
                price: center,
                kind,
            });
        }
    }

    swings
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candles_from_highs_lows(points: &[(f64, f64)]) -> Vec<Candle> {
        points
            .iter()
            .map(|&(high, low)| Candle {
                timestamp: Utc::now(),
                open: (high + low) / 2.0,
                high,
                low,
                close: (high + low) / 2.0,
                volume: 1.0,
            })
            .collect()
    }

    fn flat_with_spike(len: usize, at: usize, high: f64, low: f64) -> Vec<Candle> {
        let mut points = vec![(101.0, 99.0); len];
        points[at] = (high, low);
        candles_from_highs_lows(&points)
    }

    #[test]
    fn test_single_swing_high() {
        let candles = flat_with_spike(11, 5, 110.0, 99.0);
        let highs = find_swing_highs(&candles, 5);

        assert_eq!(highs.len(), 1);
        assert_eq!(highs[0].index, 5);
        assert_eq!(highs[0].price, 110.0);
        assert_eq!(highs[0].kind, SwingKind::High);
    }

    #[test]
    fn test_single_swing_low() {
        let candles = flat_with_spike(11, 5, 101.0, 90.0);
        let lows = find_swing_lows(&candles, 5);

        assert_eq!(lows.len(), 1);
        assert_eq!(lows[0].price, 90.0);
    }

    #[test]
    fn test_equal_neighbor_is_not_swing() {
        let mut points = vec![(101.0, 99.0); 11];
        points[5] = (110.0, 99.0);
        points[8] = (110.0, 99.0);
        let candles = candles_from_highs_lows(&points);

        assert!(find_swing_highs(&candles, 5).is_empty());
    }

    #[test]
    fn test_edges_are_excluded() {
        // Spike inside the first k candles has no full left window
        let candles = flat_with_spike(20, 3, 150.0, 99.0);
        assert!(find_swing_highs(&candles, 5).is_empty());

        let candles = flat_with_spike(20, 17, 150.0, 99.0);
        assert!(find_swing_highs(&candles, 5).is_empty());
    }

    #[test]
    fn test_monotonic_series_has_no_swings() {
        let points: Vec<(f64, f64)> = (0..60)
            .map(|i| (101.0 + i as f64, 99.0 + i as f64))
            .collect();
        let candles = candles_from_highs_lows(&points);

        assert!(find_swing_highs(&candles, 5).is_empty());
        assert!(find_swing_lows(&candles, 5).is_empty());
    }

    #[test]
    fn test_swing_high_iff_no_neighbor_at_or_above() {
        let points: Vec<(f64, f64)> = (0..80)
            .map(|i| {
                let x = i as f64;
                let h = 100.0 + (x * 0.37).sin() * 4.0 + (x * 1.3).cos();
                (h, h - 2.0)
            })
            .collect();
        let candles = candles_from_highs_lows(&points);
        let k = 5;
        let highs = find_swing_highs(&candles, k);

        for i in k..candles.len() - k {
            let brute = (i - k..=i + k)
                .filter(|&j| j != i)
                .all(|j| candles[i].high > candles[j].high);
            let found = highs.iter().any(|s| s.index == i);
            assert_eq!(brute, found, "mismatch at index {}", i);
        }
    }

    #[test]
    fn test_too_short_input() {
        let candles = flat_with_spike(5, 2, 110.0, 99.0);
        assert!(find_swing_highs(&candles, 5).is_empty());
    }
}
