use crate::api::{RemotePosition, RemotePositionSource};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::{timeout, Duration};

/// Quote suffixes stripped from a contract symbol to get its underlying
const QUOTE_SUFFIXES: &[&str] = &["USDT", "USDC", "USD", "PERP"];

/// Maps contract symbols (BTCUSD) to the underlying asset (BTC) the venue
/// indexes positions by
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetMap {
    overrides: HashMap<String, String>,
}

impl AssetMap {
    pub fn new(overrides: HashMap<String, String>) -> Self {
        Self { overrides }
    }

    pub fn underlying(&self, symbol: &str) -> String {
        if let Some((_, asset)) = self
            .overrides
            .iter()
            .find(|(contract, _)| contract.eq_ignore_ascii_case(symbol))
        {
            return asset.to_uppercase();
        }

        let upper = symbol.to_uppercase();
        let trimmed = upper
            .trim_end_matches("_PERP")
            .trim_end_matches("-PERP")
            .trim_end_matches(['-', '_', '/']);
        for suffix in QUOTE_SUFFIXES {
            if let Some(base) = trimmed.strip_suffix(suffix) {
                let base = base.trim_end_matches(['-', '_', '/']);
                if !base.is_empty() {
                    return base.to_string();
                }
            }
        }
        trimmed.to_string()
    }
}

/// Result of asking the venue about a symbol
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteCheck {
    /// Venue confirmed there is no position
    Clear,
    /// Venue reports an open position
    Occupied(RemotePosition),
    /// Venue could not be asked or gave an unusable answer
    Unverified(String),
}

impl RemoteCheck {
    /// Only a confirmed-flat answer allows a new order
    pub fn blocks(&self) -> bool {
        !matches!(self, RemoteCheck::Clear)
    }
}

/// Confirms the venue holds no conflicting position before a new one is opened.
///
/// Fails closed: errors, timeouts and malformed answers all block.
pub struct ExchangeReconciler {
    source: Arc<dyn RemotePositionSource>,
    asset_map: AssetMap,
    timeout: Duration,
}

impl ExchangeReconciler {
    pub fn new(source: Arc<dyn RemotePositionSource>, asset_map: AssetMap, timeout: Duration) -> Self {
        Self {
            source,
            asset_map,
            timeout,
        }
    }

    pub fn asset_map(&self) -> &AssetMap {
        &self.asset_map
    }

    /// Ask the venue about the underlying of `symbol`
    pub async fn check(&self, symbol: &str) -> RemoteCheck {
        let underlying = self.asset_map.underlying(symbol);

        let result = timeout(self.timeout, self.source.remote_position(&underlying)).await;
        let remote = match result {
            Ok(Ok(remote)) => remote,
            Ok(Err(e)) => {
                tracing::warn!(
                    symbol = %symbol,
                    "Remote position check failed for {}: {} (blocking)",
                    underlying,
                    e
                );
                return RemoteCheck::Unverified(e.to_string());
            }
            Err(_) => {
                tracing::warn!(
                    symbol = %symbol,
                    "Remote position check for {} timed out after {:?} (blocking)",
                    underlying,
                    self.timeout
                );
                return RemoteCheck::Unverified(format!("timed out after {:?}", self.timeout));
            }
        };

        if !remote.size.is_finite() || remote.size < 0.0 {
            tracing::warn!(
                symbol = %symbol,
                "Malformed remote position for {}: {:?} (blocking)",
                underlying,
                remote
            );
            return RemoteCheck::Unverified(format!("malformed size {}", remote.size));
        }

        if remote.exists || remote.size > 0.0 {
            tracing::info!(
                symbol = %symbol,
                "Remote position exists for {}: {:?} {} @ {:?}",
                underlying,
                remote.side,
                remote.size,
                remote.entry_price
            );
            RemoteCheck::Occupied(remote)
        } else {
            RemoteCheck::Clear
        }
    }

    /// True unless the venue positively confirms there is no position
    pub async fn has_remote_open_position(&self, symbol: &str) -> bool {
        self.check(symbol).await.blocks()
    }
}
