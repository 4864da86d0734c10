use super::swing::SwingPoint;
use serde::{Deserialize, Serialize};

/// Straight line `price = slope * index + intercept` fitted through swing points
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrendLine {
    pub slope: f64,
    pub intercept: f64,
}

impl TrendLine {
    /// Least-squares fit of price on candle index.
    ///
    /// Returns None for fewer than two points or when every point shares the
    /// same index.
    pub fn fit(points: &[SwingPoint]) -> Option<Self> {
        if points.len() < 2 {
            return None;
        }

        let n = points.len() as f64;
        let mean_x = points.iter().map(|p| p.index as f64).sum::<f64>() / n;
        let mean_y = points.iter().map(|p| p.price).sum::<f64>() / n;

        let mut sxx = 0.0;
        let mut sxy = 0.0;
        for p in points {
            let dx = p.index as f64 - mean_x;
            sxx += dx * dx;
            sxy += dx * (p.price - mean_y);
        }

        if sxx == 0.0 {
            return None;
        }

        let slope = sxy / sxx;
        Some(Self {
            slope,
            intercept: mean_y - slope * mean_x,
        })
    }

    /// Extrapolated line value at a candle index
    pub fn value_at(&self, index: usize) -> f64 {
        self.slope * index as f64 + self.intercept
    }

    pub fn is_descending(&self) -> bool {
        self.slope < 0.0
    }

    pub fn is_ascending(&self) -> bool {
        self.slope > 0.0
    }
}
