// Exchange-facing collaborators
//
// The engine only talks to the venue through these traits. `delta` is the REST
// implementation, `paper` an in-memory venue for paper trading and tests.
pub mod delta;
pub mod paper;

pub use delta::DeltaClient;
pub use paper::PaperExchange;

use crate::models::{Candle, Direction};
use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Historical candles, oldest first
#[async_trait]
pub trait CandleFeed: Send + Sync {
    /// May return fewer candles than requested; "no data" is an empty list,
    /// not an error.
    async fn fetch_candles(&self, symbol: &str, resolution: &str, count: usize) -> Result<Vec<Candle>>;
}

/// Latest mark/mid price
#[async_trait]
pub trait PriceSource: Send + Sync {
    /// `Ok(None)` when the venue has no price for the symbol
    async fn current_price(&self, symbol: &str) -> Result<Option<f64>>;
}

/// Venue-reported position for one underlying asset
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemotePosition {
    pub exists: bool,
    pub side: Option<Direction>,
    pub size: f64,
    pub entry_price: Option<f64>,
}

impl RemotePosition {
    pub fn flat() -> Self {
        Self {
            exists: false,
            side: None,
            size: 0.0,
            entry_price: None,
        }
    }
}

/// Source of truth for what the venue thinks we hold
#[async_trait]
pub trait RemotePositionSource: Send + Sync {
    /// Positions are looked up by underlying asset (BTC), not contract (BTCUSD)
    async fn remote_position(&self, underlying: &str) -> Result<RemotePosition>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum OrderAck {
    Accepted { order_id: String },
    Rejected { reason: String },
}

/// Order placement, including leverage setup
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place_order(
        &self,
        symbol: &str,
        side: Direction,
        size: f64,
        leverage: Option<u32>,
    ) -> Result<OrderAck>;
}
