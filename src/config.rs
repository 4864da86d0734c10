// Application configuration
//
// Layered: built-in defaults, then an optional TOML file, then `PERPBOT__*`
// environment variables (double-underscore separates nesting levels, e.g.
// PERPBOT__EXCHANGE__API_KEY).
use crate::execution::{AssetMap, LedgerSettings, MonitorSettings, PriceBand, RunnerSettings};
use crate::models::StrategyId;
use crate::strategy::{EmaCrossoverConfig, TrendBreakoutConfig};
use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::time::Duration;

pub const ENV_PREFIX: &str = "PERPBOT";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Orders go to the in-memory venue
    #[default]
    Paper,
    /// Orders go to the exchange
    Live,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub api_secret: Option<String>,
    pub request_timeout_secs: u64,
    /// Bound on the remote position check
    pub remote_check_timeout_secs: u64,
    pub requests_per_second: u32,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            base_url: "https://api.india.delta.exchange".to_string(),
            api_key: None,
            api_secret: None,
            request_timeout_secs: 10,
            remote_check_timeout_secs: 5,
            requests_per_second: 10,
        }
    }
}

impl ExchangeConfig {
    pub fn has_credentials(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !k.is_empty())
            && self.api_secret.as_deref().is_some_and(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StoreConfig {
    #[default]
    Memory,
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Entry sanity bands keyed by symbol or underlying asset
    pub price_bands: HashMap<String, PriceBand>,
    pub default_leverage: Option<u32>,
    pub price_timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            price_bands: HashMap::new(),
            default_leverage: None,
            price_timeout_secs: 5,
        }
    }
}

impl LedgerConfig {
    pub fn settings(&self) -> LedgerSettings {
        LedgerSettings {
            price_bands: self
                .price_bands
                .iter()
                .map(|(k, v)| (k.to_uppercase(), *v))
                .collect(),
            default_leverage: self.default_leverage,
            price_timeout: Duration::from_secs(self.price_timeout_secs),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub interval_secs: u64,
    pub proximity_pct: f64,
    pub price_timeout_secs: u64,
    pub order_timeout_secs: u64,
    pub flatten_on_exit: bool,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            interval_secs: 15,
            proximity_pct: 0.01,
            price_timeout_secs: 5,
            order_timeout_secs: 10,
            flatten_on_exit: true,
        }
    }
}

impl MonitorConfig {
    pub fn settings(&self) -> MonitorSettings {
        MonitorSettings {
            interval: Duration::from_secs(self.interval_secs),
            proximity_pct: self.proximity_pct,
            price_timeout: Duration::from_secs(self.price_timeout_secs),
            order_timeout: Duration::from_secs(self.order_timeout_secs),
            flatten_on_exit: self.flatten_on_exit,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    TrendBreakout,
    EmaCrossover,
}

/// Engine parameters resolved from a strategy's `params` table
#[derive(Debug, Clone)]
pub enum EngineParams {
    TrendBreakout(TrendBreakoutConfig),
    EmaCrossover(EmaCrossoverConfig),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub id: String,
    pub kind: StrategyKind,
    pub symbols: Vec<String>,
    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default = "default_strategy_interval")]
    pub interval_secs: u64,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_order_timeout")]
    pub order_timeout_secs: u64,
    /// Engine-specific overrides; missing keys take the engine defaults
    #[serde(default)]
    pub params: serde_json::Value,
}

fn default_resolution() -> String {
    "1m".to_string()
}

fn default_strategy_interval() -> u64 {
    60
}

fn default_fetch_timeout() -> u64 {
    10
}

fn default_order_timeout() -> u64 {
    10
}

impl StrategyConfig {
    pub fn strategy_id(&self) -> StrategyId {
        StrategyId::new(&self.id)
    }

    pub fn engine_params(&self) -> anyhow::Result<EngineParams> {
        let params = if self.params.is_null() {
            serde_json::Value::Object(Default::default())
        } else {
            self.params.clone()
        };

        Ok(match self.kind {
            StrategyKind::TrendBreakout => EngineParams::TrendBreakout(
                serde_json::from_value(params)
                    .with_context(|| format!("invalid trend_breakout params for {}", self.id))?,
            ),
            StrategyKind::EmaCrossover => EngineParams::EmaCrossover(
                serde_json::from_value(params)
                    .with_context(|| format!("invalid ema_crossover params for {}", self.id))?,
            ),
        })
    }

    pub fn runner_settings(&self, candle_window: usize) -> RunnerSettings {
        RunnerSettings {
            symbols: self.symbols.clone(),
            resolution: self.resolution.clone(),
            interval: Duration::from_secs(self.interval_secs),
            fetch_timeout: Duration::from_secs(self.fetch_timeout_secs),
            order_timeout: Duration::from_secs(self.order_timeout_secs),
            fetch_count: candle_window,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub mode: Mode,
    pub exchange: ExchangeConfig,
    pub store: StoreConfig,
    pub ledger: LedgerConfig,
    pub monitor: MonitorConfig,
    /// Candles retained per symbol
    pub candle_window: usize,
    /// Domain events buffered before new ones are dropped
    pub event_buffer: usize,
    /// Symbol -> underlying asset overrides
    pub asset_map: AssetMap,
    pub strategies: Vec<StrategyConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            mode: Mode::Paper,
            exchange: ExchangeConfig::default(),
            store: StoreConfig::Memory,
            ledger: LedgerConfig::default(),
            monitor: MonitorConfig::default(),
            candle_window: 300,
            event_buffer: 1024,
            asset_map: AssetMap::default(),
            strategies: Vec::new(),
        }
    }
}

impl AppConfig {
    /// Load from an optional file plus the process environment
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let env = ::config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        Self::load_with(path, env)
    }

    pub fn load_with(path: Option<&Path>, env: ::config::Environment) -> anyhow::Result<Self> {
        let mut builder = ::config::Config::builder();

        builder = match path {
            Some(path) => builder.add_source(::config::File::from(path).required(true)),
            None => builder.add_source(::config::File::with_name("config/default").required(false)),
        };

        let config: AppConfig = builder
            .add_source(env)
            .build()
            .context("failed to read configuration")?
            .try_deserialize()
            .context("invalid configuration")?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.candle_window == 0 {
            bail!("candle_window must be positive");
        }
        if self.event_buffer == 0 {
            bail!("event_buffer must be positive");
        }
        if self.monitor.order_timeout_secs == 0 || self.strategies.iter().any(|s| s.order_timeout_secs == 0) {
            bail!("order_timeout_secs must be positive");
        }
        if !(0.0..1.0).contains(&self.monitor.proximity_pct) {
            bail!("monitor.proximity_pct must be in [0, 1)");
        }
        if self.mode == Mode::Live && !self.exchange.has_credentials() {
            bail!("live mode needs exchange.api_key and exchange.api_secret");
        }

        let mut ids = HashSet::new();
        for strategy in &self.strategies {
            if !ids.insert(strategy.id.as_str()) {
                bail!("duplicate strategy id {}", strategy.id);
            }
            if strategy.symbols.is_empty() {
                bail!("strategy {} has no symbols", strategy.id);
            }
            if strategy.interval_secs == 0 {
                bail!("strategy {} has a zero interval", strategy.id);
            }
            strategy.engine_params()?;
        }
        Ok(())
    }
}
