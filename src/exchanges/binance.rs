//! Binance USDⓈ-M futures integration.
//!
//! API docs: https://developers.binance.com/docs/derivatives/usds-margined-futures
//! Mainnet: https://fapi.binance.com
//! Testnet: https://testnet.binancefuture.com
//!
//! Auth: `X-MBX-APIKEY` header plus a `signature` query parameter holding
//! the hex HMAC-SHA256 of the url-encoded query string (which includes
//! `timestamp` and `recvWindow`). All parameters travel in the query
//! string, including for POST and DELETE.
//!
//! Errors come back as `{ "code": -2019, "msg": "..." }` with a 4xx status.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, Method};
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{
    classify_http_status, classify_transport, encode_query, parse_decimal, sign_hex,
    AdapterResult, ExchangeAdapter,
};
use crate::config::Credentials;
use crate::types::{
    AdapterError, AdapterErrorKind, OpenOrder, OrderAck, OrderRequest, OrderStatus, OrderType,
    OrderUpdate, PositionInfo, Side,
};

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

const MAINNET_URL: &str = "https://fapi.binance.com";
const TESTNET_URL: &str = "https://testnet.binancefuture.com";
const PLATFORM_NAME: &str = "binance";
/// How many recent orders `find_order` scans.
const RECENT_ORDERS_LIMIT: u32 = 50;

// ---------------------------------------------------------------------------
// Binance API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ApiError {
    code: i64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BinanceOrder {
    order_id: i64,
    #[serde(default)]
    client_order_id: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    status: String,
    #[serde(default)]
    orig_qty: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    executed_qty: String,
    #[serde(default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PositionRisk {
    symbol: String,
    #[serde(default)]
    position_amt: String,
    #[serde(default)]
    entry_price: String,
}

#[derive(Debug, Deserialize)]
struct Account {
    #[serde(default)]
    assets: Vec<AccountAsset>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct AccountAsset {
    asset: String,
    #[serde(default)]
    available_balance: String,
}

#[derive(Debug, Deserialize)]
struct TickerPrice {
    #[serde(default)]
    price: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Binance USDⓈ-M futures REST client.
pub struct BinanceClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    recv_window: u64,
}

impl BinanceClient {
    pub fn new(credentials: Credentials, testnet: bool, recv_window: u64) -> Result<Self> {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(credentials, base_url, recv_window)
    }

    /// Create a client against an explicit base URL (for testing).
    pub fn with_base_url(credentials: Credentials, base_url: &str, recv_window: u64) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("volume-bot/0.1.0")
            .build()
            .context("Failed to build HTTP client for Binance")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            recv_window,
        })
    }

    // -- Signing -----------------------------------------------------------

    /// Append `timestamp`, `recvWindow` and `signature` to the query.
    fn signed_query(&self, params: &[(&str, String)], timestamp: i64) -> AdapterResult<String> {
        let mut all: Vec<(&str, String)> = params.to_vec();
        all.push(("timestamp", timestamp.to_string()));
        all.push(("recvWindow", self.recv_window.to_string()));
        let query = encode_query(&all);
        let signature = sign_hex(self.credentials.api_secret.expose_secret(), &query)?;
        Ok(format!("{query}&signature={signature}"))
    }

    // -- API helpers -------------------------------------------------------

    async fn public<T: DeserializeOwned>(&self, path: &str, params: &[(&str, String)]) -> AdapterResult<T> {
        let url = format!("{}{path}?{}", self.base_url, encode_query(params));
        debug!(url = %url, "Binance public request");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        Self::handle_response(path, resp).await
    }

    async fn signed<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        params: &[(&str, String)],
    ) -> AdapterResult<T> {
        let query = self.signed_query(params, chrono::Utc::now().timestamp_millis())?;
        let url = format!("{}{path}?{query}", self.base_url);
        debug!(method = %method, path, "Binance signed request");
        let resp = self
            .http
            .request(method, &url)
            .header("X-MBX-APIKEY", &self.credentials.api_key)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        Self::handle_response(path, resp).await
    }

    async fn handle_response<T: DeserializeOwned>(path: &str, resp: reqwest::Response) -> AdapterResult<T> {
        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify_transport(&e))?;

        if !status.is_success() {
            warn!(path, status = %status, body = %text, "Binance HTTP error");
            let kind = match serde_json::from_str::<ApiError>(&text) {
                Ok(err) if !matches!(status.as_u16(), 418 | 429) => classify_error_code(err.code),
                _ => classify_http_status(status),
            };
            return Err(AdapterError::new(kind, format!("Binance {path} HTTP {status}: {text}")));
        }

        serde_json::from_str(&text)
            .map_err(|e| AdapterError::transient(format!("Unexpected Binance {path} payload: {e}")))
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Map a Binance error `code` onto the adapter error taxonomy.
fn classify_error_code(code: i64) -> AdapterErrorKind {
    match code {
        // unauthorized, bad key format, rejected key/permissions, bad signature
        -1002 | -2014 | -2015 | -1022 => AdapterErrorKind::Auth,
        // too many requests / orders
        -1003 | -1015 => AdapterErrorKind::RateLimit,
        // unknown, disconnected, timeout, timestamp outside recvWindow
        -1000 | -1001 | -1007 | -1021 => AdapterErrorKind::Transient,
        _ => AdapterErrorKind::Rejected,
    }
}

fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "REJECTED" => OrderStatus::Rejected,
        "CANCELED" | "EXPIRED" | "EXPIRED_IN_MATCH" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "BUY",
        Side::Sell => "SELL",
    }
}

fn map_side(side: &str) -> AdapterResult<Side> {
    match side {
        "BUY" => Ok(Side::Buy),
        "SELL" => Ok(Side::Sell),
        other => Err(AdapterError::rejected(format!("Unknown order side: {other}"))),
    }
}

/// Query parameters for `POST /fapi/v1/order` (before signing).
fn order_params(request: &OrderRequest) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("symbol", request.symbol.clone()),
        ("side", side_str(request.side).to_string()),
        ("quantity", request.qty.normalize().to_string()),
        ("newClientOrderId", request.client_order_id.clone()),
        ("newOrderRespType", "RESULT".to_string()),
    ];
    match request.order_type {
        OrderType::Market => params.push(("type", "MARKET".to_string())),
        OrderType::Limit => {
            params.push(("type", "LIMIT".to_string()));
            params.push(("timeInForce", "GTC".to_string()));
            if let Some(price) = request.price {
                params.push(("price", price.normalize().to_string()));
            }
        }
    }
    if request.reduce_only {
        params.push(("reduceOnly", "true".to_string()));
    }
    params
}

fn to_update(order: &BinanceOrder) -> AdapterResult<OrderUpdate> {
    Ok(OrderUpdate {
        status: map_order_status(&order.status),
        filled_qty: parse_decimal("executedQty", &order.executed_qty)?,
        avg_price: parse_decimal("avgPrice", &order.avg_price)?,
    })
}

fn to_open_order(order: &BinanceOrder) -> AdapterResult<OpenOrder> {
    Ok(OpenOrder {
        order_id: order.order_id.to_string(),
        symbol: order.symbol.clone(),
        side: map_side(&order.side)?,
        qty: parse_decimal("origQty", &order.orig_qty)?,
        price: parse_decimal("price", &order.price)?,
        status: map_order_status(&order.status),
    })
}

/// `positionAmt` is signed: positive long, negative short.
fn find_by_client_id(orders: &[BinanceOrder], client_order_id: &str) -> Option<OrderAck> {
    orders
        .iter()
        .find(|o| o.client_order_id == client_order_id)
        .map(|o| OrderAck {
            order_id: o.order_id.to_string(),
            status: map_order_status(&o.status),
        })
}

fn to_position(symbol: &str, risks: &[PositionRisk]) -> AdapterResult<PositionInfo> {
    let Some(risk) = risks.iter().find(|r| r.symbol == symbol) else {
        return Ok(PositionInfo::flat(symbol));
    };
    let amount = parse_decimal("positionAmt", &risk.position_amt)?;
    let side = if amount > Decimal::ZERO {
        Some(Side::Buy)
    } else if amount < Decimal::ZERO {
        Some(Side::Sell)
    } else {
        None
    };
    Ok(PositionInfo {
        symbol: symbol.to_string(),
        qty: amount.abs(),
        side,
        entry_price: parse_decimal("entryPrice", &risk.entry_price)?,
    })
}

// ---------------------------------------------------------------------------
// ExchangeAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeAdapter for BinanceClient {
    async fn place_order(&self, request: &OrderRequest) -> AdapterResult<OrderAck> {
        let order: BinanceOrder = self
            .signed(Method::POST, "/fapi/v1/order", &order_params(request))
            .await?;
        Ok(OrderAck {
            order_id: order.order_id.to_string(),
            status: map_order_status(&order.status),
        })
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> AdapterResult<OrderUpdate> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let order: BinanceOrder = self.signed(Method::GET, "/fapi/v1/order", &params).await?;
        to_update(&order)
    }

    async fn find_order(&self, symbol: &str, client_order_id: &str) -> AdapterResult<Option<OrderAck>> {
        // Recent orders only; an unknown id is not an error here.
        let params = [
            ("symbol", symbol.to_string()),
            ("limit", RECENT_ORDERS_LIMIT.to_string()),
        ];
        let orders: Vec<BinanceOrder> = self.signed(Method::GET, "/fapi/v1/allOrders", &params).await?;
        Ok(find_by_client_id(&orders, client_order_id))
    }

    async fn get_position(&self, symbol: &str) -> AdapterResult<PositionInfo> {
        let params = [("symbol", symbol.to_string())];
        let risks: Vec<PositionRisk> = self
            .signed(Method::GET, "/fapi/v2/positionRisk", &params)
            .await?;
        to_position(symbol, &risks)
    }

    async fn get_balance(&self) -> AdapterResult<BTreeMap<String, Decimal>> {
        let account: Account = self.signed(Method::GET, "/fapi/v2/account", &[]).await?;
        account
            .assets
            .iter()
            .map(|a| Ok((a.asset.clone(), parse_decimal(&a.asset, &a.available_balance)?)))
            .collect()
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<()> {
        let params = [
            ("symbol", symbol.to_string()),
            ("orderId", order_id.to_string()),
        ];
        let _: BinanceOrder = self.signed(Method::DELETE, "/fapi/v1/order", &params).await?;
        Ok(())
    }

    async fn get_last_price(&self, symbol: &str) -> AdapterResult<Decimal> {
        let params = [("symbol", symbol.to_string())];
        let ticker: TickerPrice = self.public("/fapi/v1/ticker/price", &params).await?;
        let price = parse_decimal("price", &ticker.price)?;
        if price <= Decimal::ZERO {
            return Err(AdapterError::transient(format!("Missing Binance price for {symbol}")));
        }
        Ok(price)
    }

    async fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let params = [("symbol", symbol.to_string())];
        let orders: Vec<BinanceOrder> = self
            .signed(Method::GET, "/fapi/v1/openOrders", &params)
            .await?;
        orders.iter().map(to_open_order).collect()
    }

    async fn cancel_all_orders(&self, symbol: &str) -> AdapterResult<usize> {
        // The bulk endpoint only answers with a message, so count first.
        let open = self.list_open_orders(symbol).await?;
        if open.is_empty() {
            return Ok(0);
        }
        let params = [("symbol", symbol.to_string())];
        let _: serde_json::Value = self
            .signed(Method::DELETE, "/fapi/v1/allOpenOrders", &params)
            .await?;
        Ok(open.len())
    }

    fn name(&self) -> &'static str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
