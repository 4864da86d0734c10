// Technical indicators module
// Moving averages, swing points and trendlines

pub mod moving_average;
pub mod swing;
pub mod trendline;

pub use moving_average::{calculate_ema, calculate_ema_series, calculate_sma};
pub use swing::{find_swing_highs, find_swing_lows, SwingKind, SwingPoint};
pub use trendline::TrendLine;
