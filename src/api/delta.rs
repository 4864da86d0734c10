use super::{CandleFeed, OrderAck, OrderGateway, PriceSource, RemotePosition, RemotePositionSource};
use crate::models::{Candle, Direction};
use crate::Result;
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method};
use serde::Deserialize;
use serde_json::{json, Value};
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

type HmacSha256 = Hmac<Sha256>;

type DeltaRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const USER_AGENT: &str = "perpbot";

/// Envelope every Delta response is wrapped in
#[derive(Debug, Deserialize)]
struct Envelope {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    result: Value,
    #[serde(default)]
    error: Value,
}

#[derive(Debug, Deserialize)]
struct CandleRow {
    time: i64,
    open: Value,
    high: Value,
    low: Value,
    close: Value,
    #[serde(default)]
    volume: Value,
}

/// Delta returns numbers either as JSON numbers or as decimal strings
fn number(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Seconds per candle for a resolution string like "1m", "4h", "1d"
fn resolution_secs(resolution: &str) -> Option<i64> {
    let (split, unit) = resolution.char_indices().last()?;
    let value: i64 = resolution[..split].parse().ok().filter(|v| *v > 0)?;
    let unit_secs = match unit {
        'm' => 60,
        'h' => 3_600,
        'd' => 86_400,
        'w' => 604_800,
        _ => return None,
    };
    value.checked_mul(unit_secs)
}

/// REST client for a Delta Exchange style perpetuals venue.
///
/// Public endpoints (candles, tickers) need no credentials. Positions and
/// orders are signed with HMAC-SHA256 over
/// `method + timestamp + path + query + body`.
///
/// Cloneable; all clones share one rate limiter.
#[derive(Clone)]
pub struct DeltaClient {
    client: Client,
    base_url: String,
    credentials: Option<(String, String)>,
    rate_limiter: Arc<DeltaRateLimiter>,
}

impl DeltaClient {
    pub fn new(
        base_url: &str,
        api_key: Option<String>,
        api_secret: Option<String>,
        request_timeout: Duration,
        requests_per_second: u32,
    ) -> Result<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        let per_second = NonZeroU32::new(requests_per_second).ok_or("requests_per_second must be positive")?;
        let rate_limiter = Arc::new(RateLimiter::direct(Quota::per_second(per_second)));

        let credentials = match (api_key, api_secret) {
            (Some(key), Some(secret)) if !key.is_empty() && !secret.is_empty() => Some((key, secret)),
            _ => None,
        };

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter,
        })
    }

    pub fn has_credentials(&self) -> bool {
        self.credentials.is_some()
    }

    fn sign(secret: &str, payload: &str) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| format!("HMAC key error: {}", e))?;
        mac.update(payload.as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Send a request and unwrap the response envelope
    async fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
        signed: bool,
    ) -> Result<Value> {
        self.rate_limiter.until_ready().await;

        let query_string = if query.is_empty() {
            String::new()
        } else {
            let pairs: Vec<String> = query.iter().map(|(k, v)| format!("{}={}", k, v)).collect();
            format!("?{}", pairs.join("&"))
        };
        let body_string = body.as_ref().map(|b| b.to_string()).unwrap_or_default();
        let url = format!("{}{}{}", self.base_url, path, query_string);

        let mut request = self
            .client
            .request(method.clone(), &url)
            .header("User-Agent", USER_AGENT)
            .header("Content-Type", "application/json");

        if signed {
            let (key, secret) = self
                .credentials
                .as_ref()
                .ok_or("signed endpoint called without API credentials")?;
            let timestamp = Utc::now().timestamp().to_string();
            let payload = format!("{}{}{}{}{}", method.as_str(), timestamp, path, query_string, body_string);
            let signature = Self::sign(secret, &payload)?;
            request = request
                .header("api-key", key)
                .header("timestamp", timestamp)
                .header("signature", signature);
        }

        if body.is_some() {
            request = request.body(body_string);
        }

        let response = request.send().await?;
        let status = response.status();
        let text = response.text().await?;

        let envelope: Envelope = serde_json::from_str(&text)
            .map_err(|e| format!("Delta {} {} ({}): unreadable body: {}", method, path, status, e))?;

        if !status.is_success() || !envelope.success {
            return Err(format!("Delta {} {} failed ({}): {}", method, path, status, envelope.error).into());
        }

        Ok(envelope.result)
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let path = format!("/v2/products/{}/orders/leverage", symbol);
        self.request(
            Method::POST,
            &path,
            &[],
            Some(json!({ "leverage": leverage.to_string() })),
            true,
        )
        .await?;
        tracing::debug!("Leverage for {} set to {}x", symbol, leverage);
        Ok(())
    }
}

#[async_trait]
impl CandleFeed for DeltaClient {
    async fn fetch_candles(&self, symbol: &str, resolution: &str, count: usize) -> Result<Vec<Candle>> {
        let step = resolution_secs(resolution).ok_or_else(|| format!("unsupported resolution {}", resolution))?;
        let end = Utc::now().timestamp();
        let start = end - step * count as i64;

        let result = self
            .request(
                Method::GET,
                "/v2/history/candles",
                &[
                    ("resolution", resolution.to_string()),
                    ("symbol", symbol.to_string()),
                    ("start", start.to_string()),
                    ("end", end.to_string()),
                ],
                None,
                false,
            )
            .await?;

        let rows: Vec<CandleRow> = match result {
            Value::Null => Vec::new(),
            other => serde_json::from_value(other)?,
        };

        let mut candles = Vec::with_capacity(rows.len());
        for row in rows {
            let timestamp = match Utc.timestamp_opt(row.time, 0).single() {
                Some(ts) => ts,
                None => continue,
            };
            match (number(&row.open), number(&row.high), number(&row.low), number(&row.close)) {
                (Some(open), Some(high), Some(low), Some(close)) => candles.push(Candle {
                    timestamp,
                    open,
                    high,
                    low,
                    close,
                    volume: number(&row.volume).unwrap_or(0.0),
                }),
                _ => tracing::debug!("Skipping malformed candle for {} at {}", symbol, row.time),
            }
        }

        // Oldest first, newest `count` kept
        candles.sort_by_key(|c| c.timestamp);
        candles.dedup_by_key(|c| c.timestamp);
        if candles.len() > count {
            candles.drain(..candles.len() - count);
        }
        Ok(candles)
    }
}

#[async_trait]
impl PriceSource for DeltaClient {
    async fn current_price(&self, symbol: &str) -> Result<Option<f64>> {
        let path = format!("/v2/tickers/{}", symbol);
        let result = self.request(Method::GET, &path, &[], None, false).await?;

        Ok(number(&result["mark_price"]).or_else(|| number(&result["close"])))
    }
}

#[async_trait]
impl RemotePositionSource for DeltaClient {
    async fn remote_position(&self, underlying: &str) -> Result<RemotePosition> {
        let result = self
            .request(
                Method::GET,
                "/v2/positions",
                &[("underlying_asset_symbol", underlying.to_string())],
                None,
                true,
            )
            .await?;

        let rows = match result {
            Value::Array(rows) => rows,
            Value::Null => Vec::new(),
            single @ Value::Object(_) => vec![single],
            other => return Err(format!("unexpected positions payload: {}", other).into()),
        };

        // Signed contract size: positive long, negative short
        let mut net = 0.0;
        let mut entry_price = None;
        for row in &rows {
            let size = number(&row["size"]).ok_or_else(|| format!("position without size: {}", row))?;
            if size != 0.0 {
                net += size;
                entry_price = entry_price.or_else(|| number(&row["entry_price"]));
            }
        }

        if net == 0.0 {
            return Ok(RemotePosition::flat());
        }
        Ok(RemotePosition {
            exists: true,
            side: Some(if net > 0.0 { Direction::Buy } else { Direction::Sell }),
            size: net.abs(),
            entry_price,
        })
    }
}

#[async_trait]
impl OrderGateway for DeltaClient {
    async fn place_order(&self, symbol: &str, side: Direction, size: f64, leverage: Option<u32>) -> Result<OrderAck> {
        // Delta sizes are whole contracts
        let contracts = size.floor();
        if !contracts.is_finite() || contracts < 1.0 {
            return Ok(OrderAck::Rejected {
                reason: format!("size {} is below one contract", size),
            });
        }

        if let Some(leverage) = leverage {
            self.set_leverage(symbol, leverage).await?;
        }

        let body = json!({
            "product_symbol": symbol,
            "size": contracts as i64,
            "side": match side {
                Direction::Buy => "buy",
                Direction::Sell => "sell",
            },
            "order_type": "market_order",
        });

        match self.request(Method::POST, "/v2/orders", &[], Some(body), true).await {
            Ok(result) => {
                let order_id = match &result["id"] {
                    Value::Null => "unknown".to_string(),
                    Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                tracing::info!("Delta accepted {} {} {} (order {})", side, contracts, symbol, order_id);
                Ok(OrderAck::Accepted { order_id })
            }
            Err(e) => Ok(OrderAck::Rejected { reason: e.to_string() }),
        }
    }
}
