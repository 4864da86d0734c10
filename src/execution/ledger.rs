use super::reconciler::{ExchangeReconciler, RemoteCheck};
use crate::api::PriceSource;
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::models::{levels_are_valid, ExitReason, Position, PositionStatus, StrategyId, TradeSignal};
use crate::store::{CloseUpdate, PositionQuery, PositionStore};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};
use uuid::Uuid;

type LedgerResult<T> = std::result::Result<T, EngineError>;
type PositionKey = (String, StrategyId);

/// Sanity band for entry prices of one asset
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct PriceBand {
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
}

impl PriceBand {
    pub fn contains(&self, price: f64) -> bool {
        price.is_finite()
            && price > 0.0
            && self.min.map_or(true, |min| price >= min)
            && self.max.map_or(true, |max| price <= max)
    }
}

#[derive(Debug, Clone)]
pub struct LedgerSettings {
    /// Bands keyed by upper-case contract symbol or underlying asset
    pub price_bands: HashMap<String, PriceBand>,
    /// Used when a signal carries no leverage of its own
    pub default_leverage: Option<u32>,
    /// Bound on the price lookup used for entry correction
    pub price_timeout: Duration,
}

impl Default for LedgerSettings {
    fn default() -> Self {
        Self {
            price_bands: HashMap::new(),
            default_leverage: None,
            price_timeout: Duration::from_secs(5),
        }
    }
}

/// Authoritative local record of positions.
///
/// At most one OPEN position exists per (symbol, strategy). `open` holds a
/// per-key async lock across the whole check-then-insert sequence, and the
/// store's conditional insert refuses a second OPEN row regardless.
pub struct PositionLedger {
    store: Arc<dyn PositionStore>,
    reconciler: Arc<ExchangeReconciler>,
    prices: Arc<dyn PriceSource>,
    events: Arc<dyn EventSink>,
    settings: LedgerSettings,
    locks: std::sync::Mutex<HashMap<PositionKey, Arc<Mutex<()>>>>,
}

impl PositionLedger {
    pub fn new(
        store: Arc<dyn PositionStore>,
        reconciler: Arc<ExchangeReconciler>,
        prices: Arc<dyn PriceSource>,
        events: Arc<dyn EventSink>,
        settings: LedgerSettings,
    ) -> Self {
        Self {
            store,
            reconciler,
            prices,
            events,
            settings,
            locks: std::sync::Mutex::new(HashMap::new()),
        }
    }

    fn key_lock(&self, symbol: &str, strategy_id: &StrategyId) -> LedgerResult<Arc<Mutex<()>>> {
        let mut locks = self
            .locks
            .lock()
            .map_err(|e| EngineError::Storage(format!("ledger lock poisoned: {}", e)))?;
        Ok(locks
            .entry((symbol.to_string(), strategy_id.clone()))
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone())
    }

    fn band_for(&self, symbol: &str) -> Option<PriceBand> {
        self.settings
            .price_bands
            .get(&symbol.to_uppercase())
            .or_else(|| {
                let underlying = self.reconciler.asset_map().underlying(symbol);
                self.settings.price_bands.get(&underlying)
            })
            .copied()
    }

    pub async fn has_open_position(&self, symbol: &str, strategy_id: &StrategyId) -> LedgerResult<bool> {
        let open = self
            .store
            .query(&PositionQuery::open_for(symbol, strategy_id))
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        Ok(!open.is_empty())
    }

    /// Open a position for `signal`, or reject it without side effects
    pub async fn open(&self, signal: &TradeSignal) -> LedgerResult<Position> {
        let result = self.try_open(signal).await;

        match &result {
            Ok(position) => {
                tracing::info!(
                    symbol = %position.symbol,
                    strategy = %position.strategy_id,
                    "📈 Opened {} {:.4} {} @ {:.4} (SL {:.4}, TP {:.4})",
                    position.direction,
                    position.quantity,
                    position.symbol,
                    position.entry_price,
                    position.stop_loss,
                    position.take_profit
                );
                self.events.emit(DomainEvent::PositionOpened {
                    position: position.clone(),
                });
            }
            Err(e) => {
                tracing::warn!(
                    symbol = %signal.symbol,
                    strategy = %signal.strategy_id,
                    "Rejected {} signal: {}",
                    signal.direction,
                    e
                );
                self.events.emit(DomainEvent::SignalRejected {
                    signal: signal.clone(),
                    reason: e.to_string(),
                });
            }
        }

        result
    }

    async fn try_open(&self, signal: &TradeSignal) -> LedgerResult<Position> {
        if !signal.has_valid_levels() {
            return Err(EngineError::InvariantViolation(format!(
                "{} levels out of order: entry {}, stop {}, target {}",
                signal.direction, signal.entry_price, signal.stop_loss, signal.take_profit
            )));
        }
        if !signal.size.is_finite() || signal.size <= 0.0 {
            return Err(EngineError::InvariantViolation(format!(
                "invalid size {}",
                signal.size
            )));
        }

        let lock = self.key_lock(&signal.symbol, &signal.strategy_id)?;
        let _guard = lock.lock().await;

        if self.has_open_position(&signal.symbol, &signal.strategy_id).await? {
            return Err(EngineError::InvariantViolation(format!(
                "{} already has an open position for {}",
                signal.strategy_id, signal.symbol
            )));
        }

        match self.reconciler.check(&signal.symbol).await {
            RemoteCheck::Clear => {}
            RemoteCheck::Occupied(_) => {
                return Err(EngineError::RemotePositionExists {
                    symbol: signal.symbol.clone(),
                })
            }
            RemoteCheck::Unverified(reason) => {
                return Err(EngineError::UpstreamUnavailable(format!(
                    "remote position check for {}: {}",
                    signal.symbol, reason
                )))
            }
        }

        let (entry_price, stop_loss, take_profit) = self.validated_levels(signal).await?;

        let position = Position {
            id: Uuid::new_v4(),
            symbol: signal.symbol.clone(),
            strategy_id: signal.strategy_id.clone(),
            direction: signal.direction,
            entry_price,
            stop_loss,
            take_profit,
            quantity: signal.size,
            leverage: signal.leverage.or(self.settings.default_leverage),
            status: PositionStatus::Open,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            exit_reason: None,
        };

        let inserted = self
            .store
            .insert_if_absent(&position)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?;
        if !inserted {
            return Err(EngineError::InvariantViolation(format!(
                "store refused a second open position for {} / {}",
                signal.symbol, signal.strategy_id
            )));
        }

        Ok(position)
    }

    /// Entry/stop/target after the sanity band check. An entry outside the
    /// band is replaced by the current external price and the stop and
    /// target are scaled by the same factor.
    async fn validated_levels(&self, signal: &TradeSignal) -> LedgerResult<(f64, f64, f64)> {
        let levels = (signal.entry_price, signal.stop_loss, signal.take_profit);
        let band = match self.band_for(&signal.symbol) {
            Some(band) => band,
            None => return Ok(levels),
        };
        if band.contains(signal.entry_price) {
            return Ok(levels);
        }

        let corrected = match timeout(self.settings.price_timeout, self.prices.current_price(&signal.symbol)).await {
            Ok(Ok(Some(price))) => price,
            Ok(Ok(None)) => {
                return Err(EngineError::ValidationFailure(format!(
                    "entry {} for {} outside {:?} and no current price",
                    signal.entry_price, signal.symbol, band
                )))
            }
            Ok(Err(e)) => {
                return Err(EngineError::ValidationFailure(format!(
                    "entry {} for {} outside {:?}; price lookup failed: {}",
                    signal.entry_price, signal.symbol, band, e
                )))
            }
            Err(_) => {
                return Err(EngineError::ValidationFailure(format!(
                    "entry {} for {} outside {:?}; price lookup timed out",
                    signal.entry_price, signal.symbol, band
                )))
            }
        };

        if !band.contains(corrected) {
            return Err(EngineError::ValidationFailure(format!(
                "entry {} for {} outside {:?} even after correction to {}",
                signal.entry_price, signal.symbol, band, corrected
            )));
        }

        let factor = corrected / signal.entry_price;
        let stop_loss = signal.stop_loss * factor;
        let take_profit = signal.take_profit * factor;
        if !levels_are_valid(signal.direction, corrected, stop_loss, take_profit) {
            return Err(EngineError::ValidationFailure(format!(
                "corrected levels invalid for {}: entry {}, stop {}, target {}",
                signal.symbol, corrected, stop_loss, take_profit
            )));
        }

        tracing::warn!(
            symbol = %signal.symbol,
            "Corrected entry {:.4} -> {:.4} (x{:.6})",
            signal.entry_price,
            corrected,
            factor
        );
        Ok((corrected, stop_loss, take_profit))
    }

    /// Close an OPEN position. Fails if it is unknown or already closed.
    pub async fn close(&self, id: Uuid, exit_price: f64, reason: ExitReason) -> LedgerResult<Position> {
        let position = self
            .store
            .get(id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or(EngineError::PositionNotFound(id))?;

        if !position.is_open() {
            return Err(EngineError::InvariantViolation(format!(
                "position {} already closed",
                id
            )));
        }

        let update = CloseUpdate {
            exit_price,
            exit_time: Utc::now(),
            pnl: position.pnl_at(exit_price),
            reason,
        };

        let closed = self
            .store
            .close_if_open(id, &update)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))?
            .ok_or_else(|| EngineError::InvariantViolation(format!("position {} already closed", id)))?;

        tracing::info!(
            symbol = %closed.symbol,
            strategy = %closed.strategy_id,
            "📉 Closed {} {} @ {:.4} ({}): P&L {:.4}",
            closed.direction,
            closed.symbol,
            exit_price,
            reason.as_str(),
            update.pnl
        );
        self.events.emit(DomainEvent::PositionClosed {
            position: closed.clone(),
        });

        Ok(closed)
    }

    pub async fn get(&self, id: Uuid) -> LedgerResult<Option<Position>> {
        self.store
            .get(id)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    pub async fn open_positions(&self) -> LedgerResult<Vec<Position>> {
        self.positions_for(&PositionQuery::open()).await
    }

    pub async fn positions_for(&self, query: &PositionQuery) -> LedgerResult<Vec<Position>> {
        self.store
            .query(query)
            .await
            .map_err(|e| EngineError::Storage(e.to_string()))
    }

    /// Log what the store already holds on start-up; returns the open count
    pub async fn restore(&self) -> LedgerResult<usize> {
        let all = self.positions_for(&PositionQuery::default()).await?;
        let open = all.iter().filter(|p| p.is_open()).count();
        let realized: f64 = all.iter().filter_map(|p| p.pnl).sum();

        tracing::info!(
            "Restored {} positions ({} open, realized P&L {:.4})",
            all.len(),
            open,
            realized
        );
        for position in all.iter().filter(|p| p.is_open()) {
            tracing::info!(
                "  {} {} {} @ {:.4} (SL {:.4}, TP {:.4})",
                position.strategy_id,
                position.direction,
                position.symbol,
                position.entry_price,
                position.stop_loss,
                position.take_profit
            );
        }
        Ok(open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{OrderGateway, PaperExchange, RemotePosition, RemotePositionSource};
    use crate::events::RecordingSink;
    use crate::execution::reconciler::AssetMap;
    use crate::models::{Direction, SignalReason};
    use crate::store::MemoryStore;
    use async_trait::async_trait;

    struct FailingRemote;

    #[async_trait]
    impl RemotePositionSource for FailingRemote {
        async fn remote_position(&self, _underlying: &str) -> crate::Result<RemotePosition> {
            Err("connection refused".into())
        }
    }

    struct Harness {
        ledger: PositionLedger,
        venue: Arc<PaperExchange>,
        events: Arc<RecordingSink>,
    }

    fn harness(settings: LedgerSettings) -> Harness {
        let venue = Arc::new(PaperExchange::new(AssetMap::default()));
        let events = Arc::new(RecordingSink::new());
        let reconciler = Arc::new(ExchangeReconciler::new(
            venue.clone(),
            AssetMap::default(),
            Duration::from_millis(100),
        ));
        let ledger = PositionLedger::new(
            Arc::new(MemoryStore::new()),
            reconciler,
            venue.clone(),
            events.clone(),
            settings,
        );
        Harness { ledger, venue, events }
    }

    fn buy_signal(symbol: &str, entry: f64) -> TradeSignal {
        TradeSignal {
            symbol: symbol.to_string(),
            strategy_id: StrategyId::new("trend"),
            direction: Direction::Buy,
            entry_price: entry,
            stop_loss: entry * 0.99,
            take_profit: entry * 1.03,
            size: 2.0,
            reason: SignalReason::EmaCrossover {
                fast: entry,
                slow: entry,
            },
            leverage: None,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_open_then_duplicate_rejected() {
        let h = harness(LedgerSettings::default());
        let signal = buy_signal("BTCUSD", 100.0);

        let position = h.ledger.open(&signal).await.unwrap();
        assert_eq!(position.status, PositionStatus::Open);
        assert_eq!(position.quantity, 2.0);

        let err = h.ledger.open(&signal).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert_eq!(h.ledger.open_positions().await.unwrap().len(), 1);
        assert_eq!(h.events.kinds(), vec!["POSITION_OPENED", "SIGNAL_REJECTED"]);
    }

    #[tokio::test]
    async fn test_invalid_levels_rejected() {
        let h = harness(LedgerSettings::default());
        let mut signal = buy_signal("BTCUSD", 100.0);
        signal.stop_loss = 101.0;

        let err = h.ledger.open(&signal).await.unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));
        assert!(h.ledger.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_remote_position_blocks() {
        let h = harness(LedgerSettings::default());
        h.venue
            .place_order("BTCUSD", Direction::Sell, 1.0, None)
            .await
            .unwrap();

        let err = h.ledger.open(&buy_signal("BTCUSD", 100.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::RemotePositionExists { .. }));
    }

    #[tokio::test]
    async fn test_remote_error_blocks() {
        let ledger = PositionLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ExchangeReconciler::new(
                Arc::new(FailingRemote),
                AssetMap::default(),
                Duration::from_millis(100),
            )),
            Arc::new(PaperExchange::new(AssetMap::default())),
            Arc::new(RecordingSink::new()),
            LedgerSettings::default(),
        );

        let err = ledger.open(&buy_signal("BTCUSD", 100.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::UpstreamUnavailable(_)));
        assert!(ledger.open_positions().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_entry_corrected_into_band() {
        let mut settings = LedgerSettings::default();
        settings.price_bands.insert(
            "BTC".to_string(),
            PriceBand {
                min: Some(10_000.0),
                max: None,
            },
        );
        let h = harness(settings);
        h.venue.set_price("BTCUSD", 50_000.0).unwrap();

        // Entry quoted in the wrong unit
        let position = h.ledger.open(&buy_signal("BTCUSD", 50.0)).await.unwrap();
        assert_eq!(position.entry_price, 50_000.0);
        assert!((position.stop_loss - 49_500.0).abs() < 1e-6);
        assert!((position.take_profit - 51_500.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_entry_outside_band_after_correction_fails() {
        let mut settings = LedgerSettings::default();
        settings.price_bands.insert(
            "BTCUSD".to_string(),
            PriceBand {
                min: Some(10_000.0),
                max: Some(200_000.0),
            },
        );
        let h = harness(settings);
        h.venue.set_price("BTCUSD", 5.0).unwrap();

        let err = h.ledger.open(&buy_signal("BTCUSD", 50.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure(_)));

        // No price at all
        let h = harness(LedgerSettings {
            price_bands: [("ETH".to_string(), PriceBand { min: Some(100.0), max: None })].into(),
            ..Default::default()
        });
        let err = h.ledger.open(&buy_signal("ETHUSD", 1.0)).await.unwrap_err();
        assert!(matches!(err, EngineError::ValidationFailure(_)));
    }

    #[tokio::test]
    async fn test_close_computes_pnl_once() {
        let h = harness(LedgerSettings::default());
        let position = h.ledger.open(&buy_signal("BTCUSD", 100.0)).await.unwrap();

        let closed = h
            .ledger
            .close(position.id, 103.0, ExitReason::TakeProfit)
            .await
            .unwrap();
        assert_eq!(closed.status, PositionStatus::Closed);
        assert!((closed.pnl.unwrap() - 6.0).abs() < 1e-9);
        assert_eq!(closed.exit_reason, Some(ExitReason::TakeProfit));
        assert!(closed.exit_time.is_some());

        let err = h
            .ledger
            .close(position.id, 90.0, ExitReason::StopLoss)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::InvariantViolation(_)));

        let stored = h.ledger.get(position.id).await.unwrap().unwrap();
        assert_eq!(stored.exit_price, Some(103.0));
    }

    #[tokio::test]
    async fn test_close_unknown_position() {
        let h = harness(LedgerSettings::default());
        let err = h
            .ledger
            .close(Uuid::new_v4(), 1.0, ExitReason::Manual)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::PositionNotFound(_)));
    }

    #[tokio::test]
    async fn test_default_leverage_applied() {
        let h = harness(LedgerSettings {
            default_leverage: Some(5),
            ..Default::default()
        });
        let position = h.ledger.open(&buy_signal("BTCUSD", 100.0)).await.unwrap();
        assert_eq!(position.leverage, Some(5));
    }

    #[tokio::test]
    async fn test_restore_counts_open() {
        let h = harness(LedgerSettings::default());
        let a = h.ledger.open(&buy_signal("BTCUSD", 100.0)).await.unwrap();
        h.ledger.open(&buy_signal("ETHUSD", 10.0)).await.unwrap();
        h.ledger.close(a.id, 101.0, ExitReason::Manual).await.unwrap();

        assert_eq!(h.ledger.restore().await.unwrap(), 1);
    }
}
