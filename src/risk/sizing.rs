use crate::models::Direction;
use serde::{Deserialize, Serialize};

/// Fixed-fractional sizing: risk a set share of a nominal account per trade
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskSizing {
    pub account_size: f64,
    /// Fraction of the account put at risk per trade (0.01 = 1%)
    pub risk_pct: f64,
}

impl Default for RiskSizing {
    fn default() -> Self {
        Self {
            account_size: 10_000.0,
            risk_pct: 0.01,
        }
    }
}

impl RiskSizing {
    /// Amount of account currency at risk per trade
    pub fn risk_amount(&self) -> f64 {
        self.account_size * self.risk_pct
    }

    /// Quantity such that hitting the stop loses exactly `risk_amount`.
    ///
    /// None when the stop distance is zero or not finite.
    pub fn position_size(&self, entry: f64, stop_loss: f64) -> Option<f64> {
        let risk_per_unit = (entry - stop_loss).abs();
        if !risk_per_unit.is_finite() || risk_per_unit <= 0.0 {
            return None;
        }
        Some(self.risk_amount() / risk_per_unit)
    }
}

/// Target `reward_ratio` times the stop distance away from entry
pub fn project_take_profit(
    direction: Direction,
    entry: f64,
    stop_loss: f64,
    reward_ratio: f64,
) -> f64 {
    let risk = (entry - stop_loss).abs();
    entry + direction.sign() * risk * reward_ratio
}
