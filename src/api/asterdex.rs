use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use governor::{Quota, RateLimiter};
use hmac::{Hmac, Mac};
use reqwest::{Client, Method, StatusCode};
use rust_decimal::Decimal;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use sha2::Sha256;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use crate::api::ExchangeClient;
use crate::config::Credentials;
use crate::error::BotError;
use crate::models::{Candle, ExchangePosition, FillResult, FillStatus, OrderIntent};
use crate::Result;

type HmacSha256 = Hmac<Sha256>;

type AsterRateLimiter = RateLimiter<
    governor::state::direct::NotKeyed,
    governor::state::InMemoryState,
    governor::clock::DefaultClock,
>;

const RECV_WINDOW_MS: u64 = 5_000;
const REQUESTS_PER_SECOND: u32 = 10;
const QUOTE_ASSET: &str = "USDT";

/// REST client for AsterDex perpetual futures (Binance-compatible `/fapi`)
#[derive(Clone)]
pub struct AsterDexClient {
    client: Client,
    base_url: String,
    credentials: Option<Credentials>,
    rate_limiter: Arc<AsterRateLimiter>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
    msg: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderResponse {
    order_id: i64,
    status: String,
    orig_qty: String,
    executed_qty: String,
    avg_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    position_amt: String,
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct AccountInfo {
    #[serde(default)]
    assets: Vec<AccountAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountAsset {
    asset: String,
    available_balance: String,
}

impl AsterDexClient {
    /// Signed client for trading
    pub fn new(base_url: &str, credentials: Credentials, timeout: Duration) -> Result<Self> {
        Self::build(base_url, Some(credentials), timeout)
    }

    /// Unsigned client; only market data endpoints will work
    pub fn public(base_url: &str, timeout: Duration) -> Result<Self> {
        Self::build(base_url, None, timeout)
    }

    fn build(base_url: &str, credentials: Option<Credentials>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BotError::Configuration(format!("HTTP client: {}", e)))?;

        let quota =
            Quota::per_second(NonZeroU32::new(REQUESTS_PER_SECOND).unwrap_or(NonZeroU32::MIN));

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            rate_limiter: Arc::new(RateLimiter::direct(quota)),
        })
    }

    async fn public_get<T: DeserializeOwned>(
        &self,
        path: &str,
        params: &[(&str, String)],
    ) -> Result<T> {
        self.rate_limiter.until_ready().await;

        let url = format!("{}{}", self.base_url, path);
        let response = self.client.get(&url).query(params).send().await?;
        read_response(response).await
    }

    /// Sign `params` (plus timestamp and recvWindow) and send them as the query
    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: Vec<(&str, String)>,
    ) -> Result<T> {
        let credentials = self.credentials.as_ref().ok_or_else(|| {
            BotError::Configuration(format!("{} requires API credentials", path))
        })?;

        let mut query = encode_query(&params);
        if !query.is_empty() {
            query.push('&');
        }
        query.push_str(&format!(
            "timestamp={}&recvWindow={}",
            Utc::now().timestamp_millis(),
            RECV_WINDOW_MS
        ));
        let signature = sign(&credentials.api_secret, &query)?;
        let url = format!("{}{}?{}&signature={}", self.base_url, path, query, signature);

        self.rate_limiter.until_ready().await;

        let response = self
            .client
            .request(method, &url)
            .header("X-MBX-APIKEY", &credentials.api_key)
            .send()
            .await?;
        read_response(response).await
    }
}

#[async_trait]
impl ExchangeClient for AsterDexClient {
    async fn klines(&self, symbol: &str, interval: &str, limit: usize) -> Result<Vec<Candle>> {
        let rows: Vec<Vec<serde_json::Value>> = self
            .public_get(
                "/fapi/v1/klines",
                &[
                    ("symbol", symbol.to_string()),
                    ("interval", interval.to_string()),
                    ("limit", limit.to_string()),
                ],
            )
            .await?;

        rows.iter().map(|row| parse_kline(symbol, row)).collect()
    }

    async fn place_order(&self, intent: &OrderIntent) -> Result<FillResult> {
        let mut params = vec![
            ("symbol", intent.symbol.clone()),
            ("side", intent.side.as_str().to_string()),
            ("type", intent.order_type.as_str().to_string()),
            ("quantity", format_quantity(intent.size)),
            ("newClientOrderId", intent.client_order_id.clone()),
            ("newOrderRespType", "RESULT".to_string()),
        ];
        if intent.reduce_only {
            params.push(("reduceOnly", "true".to_string()));
        }

        tracing::debug!(
            symbol = %intent.symbol,
            side = intent.side.as_str(),
            size = intent.size,
            client_order_id = %intent.client_order_id,
            "submitting order"
        );

        let order: OrderResponse = self.signed(Method::POST, "/fapi/v1/order", params).await?;

        let executed = parse_number("executedQty", &order.executed_qty)?;
        let requested = parse_number("origQty", &order.orig_qty)?;
        let avg_price = parse_number("avgPrice", &order.avg_price)?;

        if executed <= 0.0 || avg_price <= 0.0 {
            // Accepted but not executed; pull it so it cannot fill later
            if let Err(e) = self
                .cancel_order(&intent.symbol, &intent.client_order_id)
                .await
            {
                tracing::warn!(symbol = %intent.symbol, "cancel of unfilled order failed: {}", e);
            }
            return Err(BotError::rejection(
                0,
                format!("order {} not filled (status {})", order.order_id, order.status),
            ));
        }

        Ok(FillResult {
            order_id: order.order_id.to_string(),
            filled_size: executed,
            avg_price,
            status: if executed + f64::EPSILON >= requested {
                FillStatus::Filled
            } else {
                FillStatus::PartiallyFilled
            },
        })
    }

    async fn cancel_order(&self, symbol: &str, client_order_id: &str) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::DELETE,
                "/fapi/v1/order",
                vec![
                    ("symbol", symbol.to_string()),
                    ("origClientOrderId", client_order_id.to_string()),
                ],
            )
            .await?;
        Ok(())
    }

    async fn list_positions(&self) -> Result<Vec<ExchangePosition>> {
        let rows: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", Vec::new())
            .await?;

        let mut positions = Vec::new();
        for row in rows {
            let size = parse_number("positionAmt", &row.position_amt)?;
            if size == 0.0 {
                continue;
            }
            positions.push(ExchangePosition {
                symbol: row.symbol,
                size,
                entry_price: parse_number("entryPrice", &row.entry_price)?,
            });
        }
        Ok(positions)
    }

    async fn account_balance(&self) -> Result<f64> {
        let account: AccountInfo = self
            .signed(Method::GET, "/fapi/v2/account", Vec::new())
            .await?;

        match account.assets.iter().find(|a| a.asset == QUOTE_ASSET) {
            Some(asset) => parse_number("availableBalance", &asset.available_balance),
            None => Ok(0.0),
        }
    }

    async fn set_leverage(&self, symbol: &str, leverage: u32) -> Result<()> {
        let _: serde_json::Value = self
            .signed(
                Method::POST,
                "/fapi/v1/leverage",
                vec![
                    ("symbol", symbol.to_string()),
                    ("leverage", leverage.to_string()),
                ],
            )
            .await?;
        Ok(())
    }
}

/// Map an HTTP response onto the error taxonomy
async fn read_response<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    let body = response.text().await?;

    if status.is_success() {
        return serde_json::from_str(&body)
            .map_err(|e| BotError::Transport(format!("malformed response: {}", e)));
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(BotError::Transport(format!("HTTP {}: {}", status, body)));
    }

    match serde_json::from_str::<ApiError>(&body) {
        Ok(err) => Err(BotError::rejection(err.code, err.msg)),
        Err(_) => Err(BotError::rejection(i64::from(status.as_u16()), body)),
    }
}

fn sign(secret: &str, query: &str) -> Result<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| BotError::Configuration(format!("invalid API secret: {}", e)))?;
    mac.update(query.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join("&")
}

/// Plain decimal string, no exponent
fn format_quantity(size: f64) -> String {
    Decimal::try_from(size)
        .map(|d| d.normalize().to_string())
        .unwrap_or_else(|_| size.to_string())
}

fn parse_number(field: &str, raw: &str) -> Result<f64> {
    raw.parse::<f64>()
        .map_err(|_| BotError::Transport(format!("malformed {} in response: {:?}", field, raw)))
}

fn value_f64(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::String(s) => s.parse().ok(),
        serde_json::Value::Number(n) => n.as_f64(),
        _ => None,
    }
}

fn parse_kline(symbol: &str, row: &[serde_json::Value]) -> Result<Candle> {
    let malformed = || BotError::Transport(format!("malformed kline for {}", symbol));

    let open_time = row
        .first()
        .and_then(|v| v.as_i64())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .ok_or_else(malformed)?;
    let field = |i: usize| row.get(i).and_then(value_f64).ok_or_else(malformed);

    Ok(Candle {
        symbol: symbol.to_string(),
        open_time,
        open: field(1)?,
        high: field(2)?,
        low: field(3)?,
        close: field(4)?,
        volume: field(5)?,
    })
}
