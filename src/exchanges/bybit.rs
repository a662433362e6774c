//! Bybit v5 integration (linear perpetuals).
//!
//! API docs: https://bybit-exchange.github.io/docs/v5/intro
//! Mainnet: https://api.bybit.com
//! Testnet: https://api-testnet.bybit.com
//!
//! Auth: every private request carries `X-BAPI-API-KEY`, `X-BAPI-TIMESTAMP`,
//! `X-BAPI-RECV-WINDOW` and `X-BAPI-SIGN`, where the signature is the hex
//! HMAC-SHA256 of `timestamp + api_key + recv_window + payload` and the
//! payload is the query string (GET) or the raw JSON body (POST).
//!
//! Responses are wrapped in `{ retCode, retMsg, result }`; a non-zero
//! `retCode` is an error even when the HTTP status is 200.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use rust_decimal::Decimal;
use secrecy::ExposeSecret;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;
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

const MAINNET_URL: &str = "https://api.bybit.com";
const TESTNET_URL: &str = "https://api-testnet.bybit.com";
const PLATFORM_NAME: &str = "bybit";

// ---------------------------------------------------------------------------
// Bybit API types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Envelope {
    ret_code: i64,
    #[serde(default)]
    ret_msg: String,
    #[serde(default)]
    result: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateOrderResult {
    order_id: String,
}

#[derive(Debug, Deserialize)]
struct ListResult<T> {
    #[serde(default = "Vec::new")]
    list: Vec<T>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitOrder {
    #[serde(default)]
    order_id: String,
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    order_status: String,
    #[serde(default)]
    qty: String,
    #[serde(default)]
    price: String,
    #[serde(default)]
    cum_exec_qty: String,
    #[serde(default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BybitPosition {
    #[serde(default)]
    symbol: String,
    #[serde(default)]
    side: String,
    #[serde(default)]
    size: String,
    #[serde(default)]
    avg_price: String,
}

#[derive(Debug, Deserialize)]
struct WalletAccount {
    #[serde(default)]
    coin: Vec<WalletCoin>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WalletCoin {
    coin: String,
    #[serde(default)]
    available_to_withdraw: String,
    #[serde(default)]
    wallet_balance: String,
    #[serde(default)]
    equity: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Ticker {
    #[serde(default)]
    last_price: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// Bybit v5 REST client.
pub struct BybitClient {
    http: Client,
    base_url: String,
    credentials: Credentials,
    category: String,
    account_type: String,
    recv_window: u64,
}

impl BybitClient {
    pub fn new(
        credentials: Credentials,
        testnet: bool,
        category: &str,
        account_type: &str,
        recv_window: u64,
    ) -> Result<Self> {
        let base_url = if testnet { TESTNET_URL } else { MAINNET_URL };
        Self::with_base_url(credentials, base_url, category, account_type, recv_window)
    }

    /// Create a client against an explicit base URL (for testing).
    pub fn with_base_url(
        credentials: Credentials,
        base_url: &str,
        category: &str,
        account_type: &str,
        recv_window: u64,
    ) -> Result<Self> {
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .user_agent("volume-bot/0.1.0")
            .build()
            .context("Failed to build HTTP client for Bybit")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            credentials,
            category: category.to_string(),
            account_type: account_type.to_string(),
            recv_window,
        })
    }

    // -- Signing -----------------------------------------------------------

    fn sign(&self, timestamp: i64, payload: &str) -> AdapterResult<String> {
        let message = format!(
            "{timestamp}{}{}{payload}",
            self.credentials.api_key, self.recv_window
        );
        sign_hex(self.credentials.api_secret.expose_secret(), &message)
    }

    fn auth_headers(
        &self,
        request: reqwest::RequestBuilder,
        payload: &str,
    ) -> AdapterResult<reqwest::RequestBuilder> {
        let timestamp = chrono::Utc::now().timestamp_millis();
        let signature = self.sign(timestamp, payload)?;
        Ok(request
            .header("X-BAPI-API-KEY", &self.credentials.api_key)
            .header("X-BAPI-SIGN", signature)
            .header("X-BAPI-SIGN-TYPE", "2")
            .header("X-BAPI-TIMESTAMP", timestamp.to_string())
            .header("X-BAPI-RECV-WINDOW", self.recv_window.to_string()))
    }

    // -- API helpers -------------------------------------------------------

    async fn get_public(&self, path: &str, params: &[(&str, String)]) -> AdapterResult<Value> {
        let url = format!("{}{path}?{}", self.base_url, encode_query(params));
        debug!(url = %url, "Bybit public request");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        Self::handle_response(path, resp).await
    }

    async fn get_private(&self, path: &str, params: &[(&str, String)]) -> AdapterResult<Value> {
        let query = encode_query(params);
        let url = format!("{}{path}?{query}", self.base_url);
        debug!(url = %url, "Bybit private request");
        let resp = self
            .auth_headers(self.http.get(&url), &query)?
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        Self::handle_response(path, resp).await
    }

    async fn post_private(&self, path: &str, body: &Value) -> AdapterResult<Value> {
        let body = body.to_string();
        let url = format!("{}{path}", self.base_url);
        debug!(url = %url, body = %body, "Bybit private request");
        let resp = self
            .auth_headers(self.http.post(&url), &body)?
            .header("Content-Type", "application/json")
            .body(body)
            .send()
            .await
            .map_err(|e| classify_transport(&e))?;
        Self::handle_response(path, resp).await
    }

    async fn handle_response(path: &str, resp: reqwest::Response) -> AdapterResult<Value> {
        let status = resp.status();
        let text = resp.text().await.map_err(|e| classify_transport(&e))?;

        let envelope: Envelope = match serde_json::from_str(&text) {
            Ok(env) => env,
            Err(_) if !status.is_success() => {
                warn!(path, status = %status, body = %text, "Bybit HTTP error");
                return Err(AdapterError::new(
                    classify_http_status(status),
                    format!("Bybit {path} HTTP {status}: {text}"),
                ));
            }
            Err(e) => {
                return Err(AdapterError::transient(format!(
                    "Bybit {path} returned non-JSON body: {e}"
                )))
            }
        };

        if envelope.ret_code != 0 {
            warn!(
                path,
                ret_code = envelope.ret_code,
                ret_msg = %envelope.ret_msg,
                "Bybit API error"
            );
            return Err(AdapterError::new(
                classify_ret_code(envelope.ret_code),
                format!(
                    "Bybit {path} retCode={}: {}",
                    envelope.ret_code, envelope.ret_msg
                ),
            ));
        }

        Ok(envelope.result)
    }

    fn decode<T: DeserializeOwned>(path: &str, value: Value) -> AdapterResult<T> {
        serde_json::from_value(value)
            .map_err(|e| AdapterError::transient(format!("Unexpected Bybit {path} payload: {e}")))
    }

    /// Single-order query by `orderId` or `orderLinkId`.
    async fn query_order(
        &self,
        path: &str,
        symbol: &str,
        id_field: &str,
        id: &str,
    ) -> AdapterResult<Option<BybitOrder>> {
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
            (id_field, id.to_string()),
        ];
        let value = self.get_private(path, &params).await?;
        let result: ListResult<BybitOrder> = Self::decode(path, value)?;
        Ok(result.list.into_iter().next())
    }
}

// ---------------------------------------------------------------------------
// Conversion helpers
// ---------------------------------------------------------------------------

/// Map a Bybit `retCode` onto the adapter error taxonomy.
fn classify_ret_code(code: i64) -> AdapterErrorKind {
    match code {
        // invalid key, bad signature, permission denied, key expired
        10003 | 10004 | 10005 | 10007 | 33004 => AdapterErrorKind::Auth,
        // rate limit, ip rate limit
        10006 | 10018 => AdapterErrorKind::RateLimit,
        // timestamp / recv_window drift, server busy
        10000 | 10002 | 10016 => AdapterErrorKind::Transient,
        _ => AdapterErrorKind::Rejected,
    }
}

fn map_order_status(status: &str) -> OrderStatus {
    match status {
        "Filled" => OrderStatus::Filled,
        "PartiallyFilled" => OrderStatus::PartiallyFilled,
        "Rejected" => OrderStatus::Rejected,
        "Cancelled" | "PartiallyFilledCanceled" | "Deactivated" => OrderStatus::Cancelled,
        _ => OrderStatus::Pending,
    }
}

fn map_side(side: &str) -> Option<Side> {
    match side {
        "Buy" => Some(Side::Buy),
        "Sell" => Some(Side::Sell),
        _ => None,
    }
}

fn side_str(side: Side) -> &'static str {
    match side {
        Side::Buy => "Buy",
        Side::Sell => "Sell",
    }
}

/// JSON body for `/v5/order/create`.
fn order_body(category: &str, request: &OrderRequest) -> Value {
    let mut body = serde_json::json!({
        "category": category,
        "symbol": request.symbol,
        "side": side_str(request.side),
        "qty": request.qty.normalize().to_string(),
        "orderLinkId": request.client_order_id,
    });

    match request.order_type {
        OrderType::Market => {
            body["orderType"] = Value::from("Market");
            body["timeInForce"] = Value::from("IOC");
        }
        OrderType::Limit => {
            body["orderType"] = Value::from("Limit");
            body["timeInForce"] = Value::from("GTC");
            if let Some(price) = request.price {
                body["price"] = Value::from(price.normalize().to_string());
            }
        }
    }

    if request.reduce_only {
        body["reduceOnly"] = Value::from(true);
    }
    body
}

fn to_update(order: &BybitOrder) -> AdapterResult<OrderUpdate> {
    Ok(OrderUpdate {
        status: map_order_status(&order.order_status),
        filled_qty: parse_decimal("cumExecQty", &order.cum_exec_qty)?,
        avg_price: parse_decimal("avgPrice", &order.avg_price)?,
    })
}

fn to_open_order(order: &BybitOrder) -> AdapterResult<OpenOrder> {
    Ok(OpenOrder {
        order_id: order.order_id.clone(),
        symbol: order.symbol.clone(),
        side: map_side(&order.side)
            .ok_or_else(|| AdapterError::rejected(format!("Unknown order side: {}", order.side)))?,
        qty: parse_decimal("qty", &order.qty)?,
        price: parse_decimal("price", &order.price)?,
        status: map_order_status(&order.order_status),
    })
}

fn to_position(symbol: &str, positions: &[BybitPosition]) -> AdapterResult<PositionInfo> {
    let Some(pos) = positions.iter().find(|p| p.symbol == symbol) else {
        return Ok(PositionInfo::flat(symbol));
    };
    let qty = parse_decimal("size", &pos.size)?.abs();
    let side = if qty.is_zero() { None } else { map_side(&pos.side) };
    Ok(PositionInfo {
        symbol: symbol.to_string(),
        qty,
        side,
        entry_price: parse_decimal("avgPrice", &pos.avg_price)?,
    })
}

/// Available amount per coin: `availableToWithdraw`, falling back to
/// `walletBalance`, then `equity` (unified accounts leave the first empty).
fn to_balances(accounts: &[WalletAccount]) -> AdapterResult<BTreeMap<String, Decimal>> {
    let mut balances = BTreeMap::new();
    for coin in accounts.iter().flat_map(|a| a.coin.iter()) {
        let raw = [&coin.available_to_withdraw, &coin.wallet_balance, &coin.equity]
            .into_iter()
            .find(|v| !v.trim().is_empty())
            .map(String::as_str)
            .unwrap_or("0");
        balances.insert(coin.coin.clone(), parse_decimal(&coin.coin, raw)?);
    }
    Ok(balances)
}

// ---------------------------------------------------------------------------
// ExchangeAdapter implementation
// ---------------------------------------------------------------------------

#[async_trait]
impl ExchangeAdapter for BybitClient {
    async fn place_order(&self, request: &OrderRequest) -> AdapterResult<OrderAck> {
        let path = "/v5/order/create";
        let value = self
            .post_private(path, &order_body(&self.category, request))
            .await?;
        let created: CreateOrderResult = Self::decode(path, value)?;
        if created.order_id.is_empty() {
            return Err(AdapterError::rejected("Bybit accepted order without orderId"));
        }
        Ok(OrderAck {
            order_id: created.order_id,
            status: OrderStatus::Pending,
        })
    }

    async fn get_order_status(&self, symbol: &str, order_id: &str) -> AdapterResult<OrderUpdate> {
        // Filled orders drop out of the realtime view after a while.
        let order = match self.query_order("/v5/order/realtime", symbol, "orderId", order_id).await? {
            Some(order) => order,
            None => self
                .query_order("/v5/order/history", symbol, "orderId", order_id)
                .await?
                .ok_or_else(|| {
                    AdapterError::transient(format!("Bybit order {order_id} not visible yet"))
                })?,
        };
        to_update(&order)
    }

    async fn find_order(&self, symbol: &str, client_order_id: &str) -> AdapterResult<Option<OrderAck>> {
        let order = match self
            .query_order("/v5/order/realtime", symbol, "orderLinkId", client_order_id)
            .await?
        {
            Some(order) => Some(order),
            None => {
                self.query_order("/v5/order/history", symbol, "orderLinkId", client_order_id)
                    .await?
            }
        };
        Ok(order
            .filter(|o| !o.order_id.is_empty())
            .map(|o| OrderAck {
                status: map_order_status(&o.order_status),
                order_id: o.order_id,
            }))
    }

    async fn get_position(&self, symbol: &str) -> AdapterResult<PositionInfo> {
        let path = "/v5/position/list";
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let value = self.get_private(path, &params).await?;
        let result: ListResult<BybitPosition> = Self::decode(path, value)?;
        to_position(symbol, &result.list)
    }

    async fn get_balance(&self) -> AdapterResult<BTreeMap<String, Decimal>> {
        let path = "/v5/account/wallet-balance";
        let params = [("accountType", self.account_type.clone())];
        let value = self.get_private(path, &params).await?;
        let result: ListResult<WalletAccount> = Self::decode(path, value)?;
        to_balances(&result.list)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<()> {
        let body = serde_json::json!({
            "category": self.category,
            "symbol": symbol,
            "orderId": order_id,
        });
        self.post_private("/v5/order/cancel", &body).await?;
        Ok(())
    }

    async fn get_last_price(&self, symbol: &str) -> AdapterResult<Decimal> {
        let path = "/v5/market/tickers";
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let value = self.get_public(path, &params).await?;
        let result: ListResult<Ticker> = Self::decode(path, value)?;
        let ticker = result
            .list
            .first()
            .ok_or_else(|| AdapterError::rejected(format!("Empty Bybit ticker for {symbol}")))?;
        let price = parse_decimal("lastPrice", &ticker.last_price)?;
        if price <= Decimal::ZERO {
            return Err(AdapterError::transient(format!("Missing Bybit lastPrice for {symbol}")));
        }
        Ok(price)
    }

    async fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let path = "/v5/order/realtime";
        let params = [
            ("category", self.category.clone()),
            ("symbol", symbol.to_string()),
        ];
        let value = self.get_private(path, &params).await?;
        let result: ListResult<BybitOrder> = Self::decode(path, value)?;
        result.list.iter().map(to_open_order).collect()
    }

    async fn cancel_all_orders(&self, symbol: &str) -> AdapterResult<usize> {
        let path = "/v5/order/cancel-all";
        let body = serde_json::json!({
            "category": self.category,
            "symbol": symbol,
        });
        let value = self.post_private(path, &body).await?;
        let result: ListResult<Value> = Self::decode(path, value)?;
        Ok(result.list.len())
    }

    fn name(&self) -> &'static str {
        PLATFORM_NAME
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
