use super::candle_buffer::CandleBuffer;
use super::ledger::PositionLedger;
use crate::api::{CandleFeed, OrderAck, OrderGateway};
use crate::error::EngineError;
use crate::events::{DomainEvent, EventSink};
use crate::models::{Position, TradeSignal};
use crate::scheduler::Job;
use crate::strategy::SignalEngine;
use async_trait::async_trait;
use chrono::Utc;
use futures::future::join_all;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Where a strategy looks and how often
#[derive(Debug, Clone)]
pub struct RunnerSettings {
    pub symbols: Vec<String>,
    pub resolution: String,
    pub interval: Duration,
    pub fetch_timeout: Duration,
    /// Bound on the entry order; elapsed counts as a failed order
    pub order_timeout: Duration,
    /// Candles requested per fetch
    pub fetch_count: usize,
}

/// Counts from one detection cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    pub symbols_scanned: usize,
    pub fetch_failures: usize,
    pub signals: usize,
    pub opened: usize,
    pub orders_failed: usize,
}

/// Drives one `SignalEngine` over its symbols: fetch, merge, detect, open,
/// place the order.
pub struct StrategyRunner<E: SignalEngine> {
    engine: E,
    settings: RunnerSettings,
    feed: Arc<dyn CandleFeed>,
    buffer: CandleBuffer,
    ledger: Arc<PositionLedger>,
    gateway: Arc<dyn OrderGateway>,
    events: Arc<dyn EventSink>,
    name: String,
}

impl<E: SignalEngine> StrategyRunner<E> {
    pub fn new(
        engine: E,
        settings: RunnerSettings,
        feed: Arc<dyn CandleFeed>,
        buffer: CandleBuffer,
        ledger: Arc<PositionLedger>,
        gateway: Arc<dyn OrderGateway>,
        events: Arc<dyn EventSink>,
    ) -> Self {
        let name = format!("{} ({})", engine.id(), engine.name());
        Self {
            engine,
            settings,
            feed,
            buffer,
            ledger,
            gateway,
            events,
            name,
        }
    }

    pub fn engine(&self) -> &E {
        &self.engine
    }

    pub fn buffer(&self) -> &CandleBuffer {
        &self.buffer
    }

    /// Fetch every symbol concurrently and merge what arrived. Returns the
    /// number of symbols whose fetch failed or timed out.
    async fn refresh_candles(&self) -> usize {
        let fetches = self.settings.symbols.iter().map(|symbol| {
            let feed = self.feed.clone();
            let resolution = self.settings.resolution.clone();
            let count = self.settings.fetch_count;
            let limit = self.settings.fetch_timeout;
            async move {
                let result = timeout(limit, feed.fetch_candles(symbol, &resolution, count)).await;
                (symbol, result)
            }
        });

        let mut failures = 0;
        for (symbol, result) in join_all(fetches).await {
            match result {
                Ok(Ok(candles)) => {
                    if let Err(e) = self.buffer.merge(symbol, &candles) {
                        tracing::warn!("Candle merge failed for {}: {}", symbol, e);
                    }
                }
                Ok(Err(e)) => {
                    failures += 1;
                    tracing::warn!("[{}] candle fetch failed for {}: {}", self.engine.id(), symbol, e);
                }
                Err(_) => {
                    failures += 1;
                    tracing::warn!(
                        "[{}] candle fetch for {} timed out after {:?}",
                        self.engine.id(),
                        symbol,
                        self.settings.fetch_timeout
                    );
                }
            }
        }
        failures
    }

    /// Open the signal locally, then place the order
    async fn act_on(&self, signal: &TradeSignal, summary: &mut CycleSummary) {
        let position = match self.ledger.open(signal).await {
            Ok(position) => position,
            // Reported by the ledger as SIGNAL_REJECTED
            Err(e) if e.is_transient() => {
                tracing::debug!("{} not opened, retry next cycle: {}", signal.symbol, e);
                return;
            }
            Err(_) => return,
        };
        summary.opened += 1;

        if !self.place_entry(&position).await {
            summary.orders_failed += 1;
        }
    }

    async fn place_entry(&self, position: &Position) -> bool {
        let result = timeout(
            self.settings.order_timeout,
            self.gateway
                .place_order(&position.symbol, position.direction, position.quantity, position.leverage),
        )
        .await;

        let failure = match result {
            Ok(Ok(OrderAck::Accepted { order_id })) => {
                tracing::info!(
                    symbol = %position.symbol,
                    "✅ Order {} accepted for {} {}",
                    order_id,
                    position.direction,
                    position.symbol
                );
                return true;
            }
            Ok(Ok(OrderAck::Rejected { reason })) => reason,
            Ok(Err(e)) => e.to_string(),
            Err(_) => format!("no response within {:?}", self.settings.order_timeout),
        };

        tracing::error!(
            symbol = %position.symbol,
            "❌ Order for {} {} failed: {}",
            position.direction,
            position.symbol,
            failure
        );
        self.events.emit(DomainEvent::OrderFailed {
            symbol: position.symbol.clone(),
            reason: failure,
            at: Utc::now(),
        });
        false
    }

    /// One detection cycle over every configured symbol, in configured order
    pub async fn run_cycle(&self) -> CycleSummary {
        let mut summary = CycleSummary {
            fetch_failures: self.refresh_candles().await,
            ..Default::default()
        };

        for symbol in &self.settings.symbols {
            let candles = match self.buffer.get_candles(symbol) {
                Ok(candles) => candles,
                Err(e) => {
                    tracing::warn!("Candle buffer read failed for {}: {}", symbol, e);
                    continue;
                }
            };
            summary.symbols_scanned += 1;

            if candles.len() < self.engine.min_candles_required() {
                let skipped = EngineError::DataInsufficient {
                    have: candles.len(),
                    need: self.engine.min_candles_required(),
                };
                tracing::debug!("[{}] {}: {}", self.engine.id(), symbol, skipped);
                continue;
            }

            let signals = self.engine.detect(symbol, &candles);
            for signal in signals {
                summary.signals += 1;
                tracing::info!(
                    symbol = %symbol,
                    strategy = %signal.strategy_id,
                    "📊 {} signal for {} @ {:.4} (SL {:.4}, TP {:.4})",
                    signal.direction,
                    symbol,
                    signal.entry_price,
                    signal.stop_loss,
                    signal.take_profit
                );
                self.events.emit(DomainEvent::Signal {
                    signal: signal.clone(),
                });

                match self.ledger.has_open_position(symbol, &signal.strategy_id).await {
                    Ok(true) => {
                        tracing::debug!("{} already open for {}, skipping", signal.strategy_id, symbol);
                        continue;
                    }
                    Ok(false) => {}
                    Err(e) => {
                        tracing::warn!("Ledger lookup failed for {}: {}", symbol, e);
                        continue;
                    }
                }

                self.act_on(&signal, &mut summary).await;
            }
        }

        summary
    }
}

#[async_trait]
impl<E: SignalEngine + 'static> Job for StrategyRunner<E> {
    fn name(&self) -> &str {
        &self.name
    }

    fn interval(&self) -> Duration {
        self.settings.interval
    }

    async fn run_once(&self) -> anyhow::Result<()> {
        tracing::info!("💹 [{}] tick at {}", self.name, Utc::now().format("%H:%M:%S"));
        let summary = self.run_cycle().await;
        tracing::info!(
            "[{}] scanned {}, signals {}, opened {}, fetch failures {}",
            self.name,
            summary.symbols_scanned,
            summary.signals,
            summary.opened,
            summary.fetch_failures
        );
        if summary.fetch_failures > 0 && summary.fetch_failures == self.settings.symbols.len() {
            anyhow::bail!("all {} candle fetches failed", summary.fetch_failures);
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
    use crate::models::{Candle, Direction, StrategyId};
    use crate::store::MemoryStore;
    use crate::strategy::ema_crossover::tests::crossover_closes;
    use crate::strategy::test_support::candles_from_closes;
    use crate::strategy::{EmaCrossoverConfig, EmaCrossoverEngine};
    use std::collections::HashMap;

    /// Serves fixed candles; unknown symbols error, "SLOW" never answers
    struct StaticFeed {
        candles: HashMap<String, Vec<Candle>>,
    }

    #[async_trait]
    impl CandleFeed for StaticFeed {
        async fn fetch_candles(&self, symbol: &str, _resolution: &str, count: usize) -> crate::Result<Vec<Candle>> {
            if symbol == "SLOW" {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            let candles = self
                .candles
                .get(symbol)
                .ok_or_else(|| format!("unknown symbol {}", symbol))?;
            let start = candles.len().saturating_sub(count);
            Ok(candles[start..].to_vec())
        }
    }

    struct Harness {
        runner: StrategyRunner<EmaCrossoverEngine>,
        venue: Arc<PaperExchange>,
        ledger: Arc<PositionLedger>,
        events: Arc<RecordingSink>,
    }

    fn harness(symbols: &[&str]) -> Harness {
        harness_with_gateway(symbols, None)
    }

    /// Orders go to `gateway` when given, otherwise to the paper venue
    fn harness_with_gateway(symbols: &[&str], gateway: Option<Arc<dyn OrderGateway>>) -> Harness {
        let mut candles = HashMap::new();
        candles.insert("BTCUSD".to_string(), candles_from_closes(&crossover_closes()));
        candles.insert("FLAT".to_string(), candles_from_closes(&[100.0; 10]));

        let venue = Arc::new(PaperExchange::new(AssetMap::default()));
        let events = Arc::new(RecordingSink::new());
        let gateway: Arc<dyn OrderGateway> = match gateway {
            Some(gateway) => gateway,
            None => venue.clone(),
        };
        let ledger = Arc::new(PositionLedger::new(
            Arc::new(MemoryStore::new()),
            Arc::new(ExchangeReconciler::new(
                venue.clone(),
                AssetMap::default(),
                Duration::from_millis(100),
            )),
            venue.clone(),
            events.clone(),
            LedgerSettings::default(),
        ));
        let runner = StrategyRunner::new(
            EmaCrossoverEngine::new(StrategyId::new("ema"), EmaCrossoverConfig::default()),
            RunnerSettings {
                symbols: symbols.iter().map(|s| s.to_string()).collect(),
                resolution: "1m".to_string(),
                interval: Duration::from_secs(60),
                fetch_timeout: Duration::from_millis(100),
                order_timeout: Duration::from_secs(5),
                fetch_count: 300,
            },
            Arc::new(StaticFeed { candles }),
            CandleBuffer::new(300),
            ledger.clone(),
            gateway,
            events.clone(),
        );
        Harness {
            runner,
            venue,
            ledger,
            events,
        }
    }

    #[tokio::test]
    async fn test_cycle_opens_and_places_order() {
        let h = harness(&["BTCUSD"]);
        let summary = h.runner.run_cycle().await;

        assert_eq!(summary.signals, 1);
        assert_eq!(summary.opened, 1);

        let orders = h.venue.orders().unwrap();
        assert_eq!(orders.len(), 1);
        assert_eq!(orders[0].side, Direction::Buy);

        assert_eq!(h.events.kinds(), vec!["SIGNAL", "POSITION_OPENED"]);
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
            Ok(OrderAck::Rejected {
                reason: "too late".to_string(),
            })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_entry_order_times_out() {
        let h = harness_with_gateway(&["BTCUSD"], Some(Arc::new(HangingGateway)));

        let summary = timeout(Duration::from_secs(60), h.runner.run_cycle())
            .await
            .expect("cycle finished");
        assert_eq!(summary.opened, 1);
        assert_eq!(summary.orders_failed, 1);

        // The local position stays for the monitor to manage
        assert_eq!(h.ledger.open_positions().await.unwrap().len(), 1);
        assert_eq!(h.events.kinds(), vec!["SIGNAL", "POSITION_OPENED", "ORDER_FAILED"]);
    }

    #[tokio::test]
    async fn test_second_cycle_does_not_duplicate() {
        let h = harness(&["BTCUSD"]);
        h.runner.run_cycle().await;
        let summary = h.runner.run_cycle().await;

        assert_eq!(summary.opened, 0);
        assert_eq!(h.ledger.open_positions().await.unwrap().len(), 1);
        assert_eq!(h.venue.orders().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failing_symbols_do_not_stall_others() {
        let h = harness(&["SLOW", "MISSING", "BTCUSD", "FLAT"]);
        let summary = h.runner.run_cycle().await;

        assert_eq!(summary.fetch_failures, 2);
        assert_eq!(summary.opened, 1);
        assert_eq!(h.runner.buffer().candle_count("FLAT").unwrap(), 10);
    }

    #[tokio::test]
    async fn test_job_fails_when_every_fetch_fails() {
        let h = harness(&["MISSING"]);
        assert!(h.runner.run_once().await.is_err());

        let h = harness(&["FLAT"]);
        assert!(h.runner.run_once().await.is_ok());
    }
}
