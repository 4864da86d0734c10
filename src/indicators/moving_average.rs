/// Calculate Simple Moving Average (SMA) over the trailing `period` prices
pub fn calculate_sma(prices: &[f64], period: usize) -> Option<f64> {
    if period == 0 || prices.len() < period {
        return None;
    }

    let sum: f64 = prices.iter().rev().take(period).sum();
    Some(sum / period as f64)
}

/// Calculate the latest Exponential Moving Average (EMA) value
pub fn calculate_ema(prices: &[f64], period: usize) -> Option<f64> {
    calculate_ema_series(prices, period).last().copied()
}

/// Full EMA series.
///
/// Seeded with the SMA of the first `period` prices, then
/// `ema[i] = (price[i] - ema[i-1]) * α + ema[i-1]` with `α = 2 / (period + 1)`.
/// Element `j` of the result lines up with `prices[period - 1 + j]`, so the
/// last element always belongs to the last price. Empty when there are fewer
/// than `period` prices.
pub fn calculate_ema_series(prices: &[f64], period: usize) -> Vec<f64> {
    if period == 0 || prices.len() < period {
        return Vec::new();
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let seed = prices[..period].iter().sum::<f64>() / period as f64;

    let mut series = Vec::with_capacity(prices.len() - period + 1);
    series.push(seed);

    let mut ema = seed;
    for price in &prices[period..] {
        ema = (price - ema) * multiplier + ema;
        series.push(ema);
    }

    series
}
