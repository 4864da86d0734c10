// Risk management module
pub mod sizing;

pub use sizing::{project_take_profit, RiskSizing};
