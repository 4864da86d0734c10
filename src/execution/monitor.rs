use super::ledger::PositionLedger;
use crate::api::{OrderAck, OrderGateway, PriceSource};
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::models::{Direction, ExitReason, Position};
use crate::scheduler::Job;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub interval: Duration,
    /// Distance (fraction of the level) that counts as "near" SL/TP
    pub proximity_pct: f64,
    pub price_timeout: Duration,
    /// Bound on the flattening order; elapsed counts as a failed order
    pub order_timeout: Duration,
    /// Send an opposite order after a local SL/TP close
    pub flatten_on_exit: bool,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(15),
            proximity_pct: 0.01,
            price_timeout: Duration::from_secs(5),
            order_timeout: Duration::from_secs(10),
            flatten_on_exit: true,
        }
    }
}

/// What the current price means for one open position
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Evaluation {
    Watching,
    /// Within the proximity band of a level; informational only
    Near(ExitReason),
    Hit(ExitReason),
}

/// Compare `price` against the position's levels. The stop wins if both
/// conditions hold.
pub fn evaluate(position: &Position, price: f64, proximity_pct: f64) -> Evaluation {
    let (sl_hit, tp_hit) = match position.direction {
        Direction::Buy => (price <= position.stop_loss, price >= position.take_profit),
        Direction::Sell => (price >= position.stop_loss, price <= position.take_profit),
    };

    if sl_hit {
        return Evaluation::Hit(ExitReason::StopLoss);
    }
    if tp_hit {
        return Evaluation::Hit(ExitReason::TakeProfit);
    }

    let near = |level: f64| level != 0.0 && ((price - level) / level).abs() <= proximity_pct;
    if near(position.stop_loss) {
        Evaluation::Near(ExitReason::StopLoss)
    } else if near(position.take_profit) {
        Evaluation::Near(ExitReason::TakeProfit)
    } else {
        Evaluation::Watching
    }
}

/// Counts from one monitor tick
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickSummary {
    pub checked: usize,
    pub closed: usize,
    pub skipped_symbols: usize,
}

/// Polls prices for open positions and closes them at SL/TP
pub struct SltpMonitor {
    ledger: Arc<PositionLedger>,
    prices: Arc<dyn PriceSource>,
    gateway: Arc<dyn OrderGateway>,
    events: Arc<dyn EventSink>,
    settings: MonitorSettings,
}

impl SltpMonitor {
    pub fn new(
        ledger: Arc<PositionLedger>,
        prices: Arc<dyn PriceSource>,
        gateway: Arc<dyn OrderGateway>,
        events: Arc<dyn EventSink>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            ledger,
            prices,
            gateway,
            events,
            settings,
        }
    }

    /// Apply `price` to one position. Returns the closed position on a hit;
    /// a position that is already closed is a no-op.
    pub async fn check_position(&self, position: &Position, price: f64) -> Result<Option<Position>, EngineError> {
        if !position.is_open() {
            return Ok(None);
        }

        let reason = match evaluate(position, price, self.settings.proximity_pct) {
            Evaluation::Watching => return Ok(None),
            Evaluation::Near(level) => {
                tracing::info!(
                    symbol = %position.symbol,
                    "⚠️  {} {} near {} ({:.4} vs SL {:.4} / TP {:.4})",
                    position.strategy_id,
                    position.symbol,
                    level.as_str(),
                    price,
                    position.stop_loss,
                    position.take_profit
                );
                return Ok(None);
            }
            Evaluation::Hit(reason) => reason,
        };

        let closed = match self.ledger.close(position.id, price, reason).await {
            Ok(closed) => closed,
            Err(EngineError::InvariantViolation(msg)) => {
                tracing::debug!("Skipping {}: {}", position.id, msg);
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        tracing::info!(
            symbol = %closed.symbol,
            "🎯 {} hit for {} {} @ {:.4}",
            reason.as_str(),
            closed.direction,
            closed.symbol,
            price
        );
        if let Some(event) = DomainEvent::exit_hit(reason, closed.clone(), price) {
            self.events.emit(event);
        }

        if self.settings.flatten_on_exit {
            self.flatten(&closed).await;
        }

        Ok(Some(closed))
    }

    async fn flatten(&self, closed: &Position) {
        let side = closed.direction.opposite();
        let result = timeout(
            self.settings.order_timeout,
            self.gateway
                .place_order(&closed.symbol, side, closed.quantity, closed.leverage),
        )
        .await;

        let failure = match result {
            Ok(Ok(OrderAck::Accepted { order_id })) => {
                tracing::info!("Flattened {} with {} order {}", closed.symbol, side, order_id);
                return;
            }
            Ok(Ok(OrderAck::Rejected { reason })) => reason,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response within {:?}", self.settings.order_timeout),
        };

        tracing::error!(
            symbol = %closed.symbol,
            "Flattening order for {} failed: {}",
            closed.symbol,
            failure
        );
        self.events.emit(DomainEvent::OrderFailed {
            symbol: closed.symbol.clone(),
            reason: format!("flatten after {}: {}", closed.exit_reason.map_or("exit", |r| r.as_str()), failure),
            at: Utc::now(),
        });
    }

    async fn fetch_price(&self, symbol: &str) -> Option<f64> {
        match timeout(self.settings.price_timeout, self.prices.current_price(symbol)).await {
            Ok(Ok(Some(price))) if price.is_finite() && price > 0.0 => Some(price),
            Ok(Ok(Some(price))) => {
                tracing::warn!("Ignoring bad price {} for {}", price, symbol);
                None
            }
            Ok(Ok(None)) => {
                tracing::debug!("No price for {}", symbol);
                None
            }
            Ok(Err(e)) => {
                tracing::warn!("Price fetch failed for {}: {}", symbol, e);
                None
            }
            Err(_) => {
                tracing::warn!("Price fetch for {} timed out", symbol);
                None
            }
        }
    }

    /// One pass over every open position. Symbols without a price are
    /// skipped until the next tick.
    pub async fn tick(&self) -> Result<TickSummary, EngineError> {
        let open = self.ledger.open_positions().await?;
        let mut summary = TickSummary::default();

        let mut by_symbol: BTreeMap<&str, Vec<&Position>> = BTreeMap::new();
        for position in &open {
            by_symbol.entry(position.symbol.as_str()).or_default().push(position);
        }

        for (symbol, positions) in by_symbol {
            let price = match self.fetch_price(symbol).await {
                Some(price) => price,
                None => {
                    summary.skipped_symbols += 1;
                    continue;
                }
            };

            for position in positions {
                summary.checked += 1;
                match self.check_position(position, price).await {
                    Ok(Some(_)) => summary.closed += 1,
                    Ok(None) => {}
                    Err(e) => tracing::warn!("SL/TP check failed for {}: {}", position.id, e),
                }
            }
        }

        Ok(summary)
    }
}

#[async_trait]
impl Job for SltpMonitor {
    fn name(&self) -> &str {
        "sltp-monitor"
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        let summary = self.tick().await?;
        if summary.checked > 0 || summary.skipped_symbols > 0 {
            tracing::debug!(
                "[SL/TP] checked {}, closed {}, skipped {} symbols",
                summary.checked,
                summary.closed,
                summary.skipped_symbols
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::PaperExchange;
    use crate::events::RecordingSink;
    use crate::execution::ledger::LedgerSettings;
    use crate::execution::reconciler::{AssetMap, ExchangeReconciler};
    use crate::models::{PositionStatus, SignalReason, StrategyId, TradeSignal};
    use crate::store::MemoryStore;

    fn position(direction: Direction, entry: f64, sl: f64, tp: f64) -> Position {
        Position {
            id: uuid::Uuid::new_v4(),
            symbol: "BTCUSD".to_string(),
            strategy_id: StrategyId::new("trend"),
            direction,
            entry_price: entry,
            stop_loss: sl,
            take_profit: tp,
            quantity: 1.0,
            leverage: None,
            status: PositionStatus::Open,
            entry_time: Utc::now(),
            exit_time: None,
            exit_price: None,
            pnl: None,
            exit_reason: None,
        }
    }

    #[test]
    fn test_evaluate_buy() {
        let p = position(Direction::Buy, 100.0, 99.0, 103.0);
        assert_eq!(evaluate(&p, 98.9, 0.01), Evaluation::Hit(ExitReason::StopLoss));
        assert_eq!(evaluate(&p, 99.0, 0.01), Evaluation::Hit(ExitReason::StopLoss));
        assert_eq!(evaluate(&p, 103.5, 0.01), Evaluation::Hit(ExitReason::TakeProfit));
        assert_eq!(evaluate(&p, 99.5, 0.01), Evaluation::Near(ExitReason::StopLoss));
        assert_eq!(evaluate(&p, 102.5, 0.01), Evaluation::Near(ExitReason::TakeProfit));
        assert_eq!(evaluate(&p, 101.0, 0.01), Evaluation::Watching);
    }

    #[test]
    fn test_evaluate_sell() {
        let p = position(Direction::Sell, 100.0, 101.0, 97.0);
        assert_eq!(evaluate(&p, 101.2, 0.01), Evaluation::Hit(ExitReason::StopLoss));
        assert_eq!(evaluate(&p, 96.0, 0.01), Evaluation::Hit(ExitReason::TakeProfit));
        assert_eq!(evaluate(&p, 99.0, 0.001), Evaluation::Watching);
    }

    #[test]
    fn test_stop_wins_over_target() {
        // Degenerate levels where both conditions hold
        let p = position(Direction::Buy, 100.0, 102.0, 101.0);
        assert_eq!(evaluate(&p, 101.5, 0.01), Evaluation::Hit(ExitReason::StopLoss));
    }

    struct Harness {
        monitor: SltpMonitor,
        ledger: Arc<PositionLedger>,
        venue: Arc<PaperExchange>,
        events: Arc<RecordingSink>,
    }

    fn harness() -> Harness {
        let venue = Arc::new(PaperExchange::new(AssetMap::default()));
        let events = Arc::new(RecordingSink::new());
        let reconciler = Arc::new(ExchangeReconciler::new(
            venue.clone(),
            AssetMap::default(),
            Duration::from_millis(100),
        ));
        let ledger = Arc::new(PositionLedger::new(
            Arc::new(MemoryStore::new()),
            reconciler,
            venue.clone(),
            events.clone(),
            LedgerSettings::default(),
        ));
        let monitor = SltpMonitor::new(
            ledger.clone(),
            venue.clone(),
            venue.clone(),
            events.clone(),
            MonitorSettings::default(),
        );
        Harness {
            monitor,
            ledger,
            venue,
            events,
        }
    }

    fn signal(symbol: &str) -> TradeSignal {
        TradeSignal {
            symbol: symbol.to_string(),
            strategy_id: StrategyId::new("trend"),
            direction: Direction::Buy,
            entry_price: 100.0,
            stop_loss: 99.0,
            take_profit: 103.0,
            size: 1.0,
            reason: SignalReason::EmaCrossover {
                fast: 100.0,
                slow: 99.0,
            },
            leverage: None,
            generated_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_tick_closes_at_stop_and_flattens() {
        let h = harness();
        let opened = h.ledger.open(&signal("BTCUSD")).await.unwrap();
        h.venue.set_price("BTCUSD", 98.9).unwrap();

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.closed, 1);

        let closed = h.ledger.get(opened.id).await.unwrap().unwrap();
        assert_eq!(closed.exit_reason, Some(ExitReason::StopLoss));
        assert!(closed.pnl.unwrap() < 0.0);

        let orders = h.venue.orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Direction::Sell);

        assert!(h.events.kinds().contains(&"SL_HIT"));
    }

    #[tokio::test]
    async fn test_repeated_check_is_noop() {
        let h = harness();
        let opened = h.ledger.open(&signal("BTCUSD")).await.unwrap();

        let first = h.monitor.check_position(&opened, 103.5).await.unwrap();
        assert!(first.is_some());

        // Same stale snapshot, same crossing
        let second = h.monitor.check_position(&opened, 103.5).await.unwrap();
        assert!(second.is_none());

        let kinds = h.events.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "TP_HIT").count(), 1);
        assert_eq!(kinds.iter().filter(|k| **k == "POSITION_CLOSED").count(), 1);
    }

    struct HangingGateway;

    #[async_trait]
    impl OrderGateway for HangingGateway {
        async fn place_order(
            &self,
            _symbol: &str,
            _side: Direction,
            _size: f64,
            _leverage: Option<u32>,
        ) -> crate::Result<OrderAck> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(OrderAck::Accepted {
                order_id: "late".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_flatten_does_not_block_other_stops() {
        let h = harness();
        let monitor = SltpMonitor::new(
            h.ledger.clone(),
            h.venue.clone(),
            Arc::new(HangingGateway),
            h.events.clone(),
            MonitorSettings::default(),
        );
        h.ledger.open(&signal("BTCUSD")).await.unwrap();
        h.ledger.open(&signal("ETHUSD")).await.unwrap();
        h.venue.set_price("BTCUSD", 98.0).unwrap();
        h.venue.set_price("ETHUSD", 98.0).unwrap();

        let summary = timeout(Duration::from_secs(60), monitor.tick())
            .await
            .expect("tick finished")
            .unwrap();
        assert_eq!(summary.closed, 2);
        assert!(h.ledger.open_positions().await.unwrap().is_empty());

        let kinds = h.events.kinds();
        assert_eq!(kinds.iter().filter(|k| **k == "SL_HIT").count(), 2);
        assert_eq!(kinds.iter().filter(|k| **k == "ORDER_FAILED").count(), 2);
    }

    #[tokio::test]
    async fn test_missing_price_skips_symbol() {
        let h = harness();
        h.ledger.open(&signal("BTCUSD")).await.unwrap();
        h.ledger.open(&signal("ETHUSD")).await.unwrap();
        h.venue.set_price("ETHUSD", 103.0).unwrap();

        let summary = h.monitor.tick().await.unwrap();
        assert_eq!(summary.skipped_symbols, 1);
        assert_eq!(summary.closed, 1);
        assert_eq!(h.ledger.open_positions().await.unwrap().len(), 1);
    }
}
