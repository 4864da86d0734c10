use super::{OrderAck, OrderGateway, PriceSource, RemotePosition, RemotePositionSource};
use crate::execution::reconciler::AssetMap;
use crate::models::Direction;
use crate::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Mutex;

/// Order recorded by the paper venue
#[derive(Debug, Clone, PartialEq)]
pub struct PaperOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Direction,
    pub size: f64,
    pub leverage: Option<u32>,
    pub fill_price: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

#[derive(Default)]
struct PaperState {
    /// Signed net size per underlying asset (+long / -short)
    net: HashMap<String, (f64, Option<f64>)>,
    orders: Vec<PaperOrder>,
    prices: HashMap<String, f64>,
    next_id: u64,
}

/// In-memory venue: fills every order at the last set price and nets
/// positions per underlying asset, the way a one-way-mode perpetual account
/// does.
pub struct PaperExchange {
    state: Mutex<PaperState>,
    asset_map: AssetMap,
}

impl PaperExchange {
    pub fn new(asset_map: AssetMap) -> Self {
        Self {
            state: Mutex::new(PaperState::default()),
            asset_map,
        }
    }

    /// Set the price used for fills and `current_price`
    pub fn set_price(&self, symbol: &str, price: f64) -> Result<()> {
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        state.prices.insert(symbol.to_string(), price);
        Ok(())
    }

    /// All orders placed so far
    pub fn orders(&self) -> Result<Vec<PaperOrder>> {
        let state = self.state.lock().map_err(|e| e.to_string())?;
        Ok(state.orders.clone())
    }
}

#[async_trait]
impl OrderGateway for PaperExchange {
    async fn place_order(
        &self,
        symbol: &str,
        side: Direction,
        size: f64,
        leverage: Option<u32>,
    ) -> Result<OrderAck> {
        if !size.is_finite() || size <= 0.0 {
            return Ok(OrderAck::Rejected {
                reason: format!("invalid size {}", size),
            });
        }

        let underlying = self.asset_map.underlying(symbol);
        let mut state = self.state.lock().map_err(|e| e.to_string())?;
        let fill_price = state.prices.get(symbol).copied();

        state.next_id += 1;
        let order_id = format!("paper-{}", state.next_id);

        let (net, entry) = state.net.get(&underlying).copied().unwrap_or((0.0, None));
        let updated = net + side.sign() * size;
        if updated.abs() < 1e-12 {
            state.net.remove(&underlying);
        } else {
            let entry = if net == 0.0 || net.signum() != updated.signum() {
                fill_price
            } else {
                entry
            };
            state.net.insert(underlying, (updated, entry));
        }

        state.orders.push(PaperOrder {
            order_id: order_id.clone(),
            symbol: symbol.to_string(),
            side,
            size,
            leverage,
            fill_price,
            timestamp: Utc::now(),
        });

        tracing::info!(
            "[PAPER] {} {:.4} {} filled @ {:?} ({})",
            side,
            size,
            symbol,
            fill_price,
            order_id
        );

        Ok(OrderAck::Accepted { order_id })
    }
}

#[async_trait]
impl RemotePositionSource for PaperExchange {
    async fn remote_position(&self, underlying: &str) -> Result<RemotePosition> {
        let state = self.state.lock().map_err(|e| e.to_string())?;
        Ok(match state.net.get(underlying) {
            Some(&(net, entry_price)) => RemotePosition {
                exists: true,
                side: Some(if net > 0.0 { Direction::Buy } else { Direction::Sell }),
                size: net.abs(),
                entry_price,
            },
            None => RemotePosition::flat(),
        })
    }
}

#[async_trait]
impl PriceSource for PaperExchange {
    async fn current_price(&self, symbol: &str) -> Result<Option<f64>> {
        let state = self.state.lock().map_err(|e| e.to_string())?;
        Ok(state.prices.get(symbol).copied())
    }
}
