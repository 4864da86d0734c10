// Position lifecycle: candle collection, reconciliation, ledger, SL/TP exits
pub mod candle_buffer;
pub mod ledger;
pub mod monitor;
pub mod reconciler;
pub mod runner;

pub use candle_buffer::CandleBuffer;
pub use ledger::{LedgerSettings, PositionLedger, PriceBand};
pub use monitor::{MonitorSettings, SltpMonitor};
pub use reconciler::{AssetMap, ExchangeReconciler, RemoteCheck};
pub use runner::{RunnerSettings, StrategyRunner};
