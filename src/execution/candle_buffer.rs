use crate::models::Candle;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

/// Thread-safe in-memory candle history
///
/// Maintains a rolling window of candles for each symbol, ordered by
/// timestamp. Readers get an owned snapshot, so a detection cycle works on a
/// series that cannot change underneath it.
#[derive(Clone)]
pub struct CandleBuffer {
    data: Arc<RwLock<HashMap<String, VecDeque<Candle>>>>,
    max_candles: usize,
}

impl CandleBuffer {
    /// Create a new candle buffer
    ///
    /// # Arguments
    /// * `max_candles` - Maximum number of candles to keep per symbol
    pub fn new(max_candles: usize) -> Self {
        Self {
            data: Arc::new(RwLock::new(HashMap::new())),
            max_candles,
        }
    }

    /// Merge freshly fetched candles (oldest first) into the history.
    ///
    /// Candles newer than the latest stored one are appended. A candle with
    /// the same timestamp as the latest one replaces it (the bar was still
    /// forming). Anything older is ignored. Returns the number of candles
    /// appended.
    pub fn merge(&self, symbol: &str, candles: &[Candle]) -> Result<usize, String> {
        let mut data = self.data.write().map_err(|e| e.to_string())?;
        let series = data.entry(symbol.to_string()).or_default();

        let mut appended = 0;
        for candle in candles {
            match series.back() {
                Some(last) if candle.timestamp < last.timestamp => continue,
                Some(last) if candle.timestamp == last.timestamp => {
                    if let Some(last) = series.back_mut() {
                        *last = candle.clone();
                    }
                }
                _ => {
                    series.push_back(candle.clone());
                    appended += 1;
                }
            }
        }

        // Remove oldest if exceeds max
        while series.len() > self.max_candles {
            series.pop_front();
        }

        Ok(appended)
    }

    /// Snapshot of all candles for a symbol
    pub fn get_candles(&self, symbol: &str) -> Result<Vec<Candle>, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;

        Ok(data
            .get(symbol)
            .map(|deque| deque.iter().cloned().collect())
            .unwrap_or_default())
    }

    /// Get count of candles for a symbol
    pub fn candle_count(&self, symbol: &str) -> Result<usize, String> {
        let data = self.data.read().map_err(|e| e.to_string())?;
        Ok(data.get(symbol).map(|d| d.len()).unwrap_or(0))
    }
}
