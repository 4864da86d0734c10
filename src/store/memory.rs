use super::{CloseUpdate, PositionQuery, PositionStore};
use crate::models::{Position, PositionStatus};
use crate::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::RwLock;
use uuid::Uuid;

/// In-process position store
///
/// Every write happens under one write lock, which makes the conditional
/// insert and close atomic.
#[derive(Default)]
pub struct MemoryStore {
    positions: RwLock<HashMap<Uuid, Position>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store seeded with previously persisted positions
    pub fn with_positions(positions: Vec<Position>) -> Self {
        Self {
            positions: RwLock::new(positions.into_iter().map(|p| (p.id, p)).collect()),
        }
    }
}

#[async_trait]
impl PositionStore for MemoryStore {
    async fn insert_if_absent(&self, position: &Position) -> Result<bool> {
        let mut positions = self.positions.write().map_err(|e| e.to_string())?;

        let conflict = positions.values().any(|p| {
            p.status == PositionStatus::Open
                && p.symbol == position.symbol
                && p.strategy_id == position.strategy_id
        });
        if conflict || positions.contains_key(&position.id) {
            return Ok(false);
        }

        positions.insert(position.id, position.clone());
        Ok(true)
    }

    async fn close_if_open(&self, id: Uuid, update: &CloseUpdate) -> Result<Option<Position>> {
        let mut positions = self.positions.write().map_err(|e| e.to_string())?;

        match positions.get_mut(&id) {
            Some(position) if position.status == PositionStatus::Open => {
                position.status = PositionStatus::Closed;
                position.exit_price = Some(update.exit_price);
                position.exit_time = Some(update.exit_time);
                position.pnl = Some(update.pnl);
                position.exit_reason = Some(update.reason);
                Ok(Some(position.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn get(&self, id: Uuid) -> Result<Option<Position>> {
        let positions = self.positions.read().map_err(|e| e.to_string())?;
        Ok(positions.get(&id).cloned())
    }

    async fn query(&self, query: &PositionQuery) -> Result<Vec<Position>> {
        let positions = self.positions.read().map_err(|e| e.to_string())?;
        let mut matching: Vec<Position> = positions
            .values()
            .filter(|p| query.matches(p))
            .cloned()
            .collect();
        matching.sort_by_key(|p| p.entry_time);
        Ok(matching)
    }
}
