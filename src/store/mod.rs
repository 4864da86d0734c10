// Position storage
//
// The ledger owns positions through a `PositionStore`. Implementations must
// make `insert_if_absent` and `close_if_open` atomic so that two writers can
// never both succeed.
pub mod memory;

pub use memory::MemoryStore;

use crate::models::{ExitReason, Position, PositionStatus, StrategyId};
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// Exit details written when a position closes
#[derive(Debug, Clone, PartialEq)]
pub struct CloseUpdate {
    pub exit_price: f64,
    pub exit_time: DateTime<Utc>,
    pub pnl: f64,
    pub reason: ExitReason,
}

/// Filter for position queries; `None` fields match anything
#[derive(Debug, Clone, Default)]
pub struct PositionQuery {
    pub symbol: Option<String>,
    pub strategy_id: Option<StrategyId>,
    pub status: Option<PositionStatus>,
}

impl PositionQuery {
    pub fn open() -> Self {
        Self {
            status: Some(PositionStatus::Open),
            ..Default::default()
        }
    }

    pub fn open_for(symbol: &str, strategy_id: &StrategyId) -> Self {
        Self {
            symbol: Some(symbol.to_string()),
            strategy_id: Some(strategy_id.clone()),
            status: Some(PositionStatus::Open),
        }
    }

    pub fn matches(&self, position: &Position) -> bool {
        self.symbol.as_deref().map_or(true, |s| s == position.symbol)
            && self
                .strategy_id
                .as_ref()
                .map_or(true, |id| *id == position.strategy_id)
            && self.status.map_or(true, |s| s == position.status)
    }
}

/// Keyed position storage with atomic conditional writes
#[async_trait]
pub trait PositionStore: Send + Sync {
    /// Insert an OPEN position unless one is already open for the same
    /// (symbol, strategy). Returns false when the insert was refused.
    async fn insert_if_absent(&self, position: &Position) -> Result<bool>;

    /// Mark an OPEN position CLOSED. Returns the closed position, or None if
    /// it was not open (already closed or unknown).
    async fn close_if_open(&self, id: Uuid, update: &CloseUpdate) -> Result<Option<Position>>;

    async fn get(&self, id: Uuid) -> Result<Option<Position>>;

    /// Matching positions ordered by entry time
    async fn query(&self, query: &PositionQuery) -> Result<Vec<Position>>;
}
