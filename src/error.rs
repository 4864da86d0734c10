use thiserror::Error;
use uuid::Uuid;

/// Outcomes the engine handles locally (skip, reject, block)
#[derive(Debug, Error)]
pub enum EngineError {
    /// Not enough candles for an indicator window
    #[error("insufficient data: {have} candles, need {need}")]
    DataInsufficient { have: usize, need: usize },

    /// Price, candle or remote-position fetch failed or timed out
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Duplicate open, levels on the wrong side of entry, double close
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Entry price outside the sanity band even after correction
    #[error("validation failure: {0}")]
    ValidationFailure(String),

    #[error("remote position already open for {symbol}")]
    RemotePositionExists { symbol: String },

    #[error("position {0} not found")]
    PositionNotFound(Uuid),

    #[error("position store error: {0}")]
    Storage(String),
}

impl EngineError {
    /// True for rejections that a later cycle may not repeat
    /// (remote state unknown or busy)
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::UpstreamUnavailable(_)
                | EngineError::RemotePositionExists { .. }
                | EngineError::Storage(_)
        )
    }
}
