//! Exchange integrations.
//!
//! Defines the `ExchangeAdapter` trait the cycle engine consumes and
//! provides implementations for:
//! - Bybit v5 (linear perpetuals)
//! - Binance USDⓈ-M futures
//!
//! Adapters are built once at startup by [`build_adapter`] and passed to
//! the engine by reference.

pub mod binance;
pub mod bybit;

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use sha2::Sha256;
use tracing::info;

use crate::config::{AppConfig, Credentials, ExchangeKind};
use crate::types::{
    AdapterError, AdapterErrorKind, OpenOrder, OrderAck, OrderRequest, OrderUpdate, PositionInfo,
};

/// Shorthand for adapter call results.
pub type AdapterResult<T> = std::result::Result<T, AdapterError>;

/// Uniform capability set over futures exchanges.
///
/// Every call fails with an [`AdapterError`] whose kind tells the engine
/// whether to retry (transient, rate limit) or give up (rejected, auth).
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    /// Submit an order. Returns the exchange order id and initial status.
    async fn place_order(&self, request: &OrderRequest) -> AdapterResult<OrderAck>;

    /// Current fill state of an order.
    async fn get_order_status(&self, symbol: &str, order_id: &str) -> AdapterResult<OrderUpdate>;

    /// Look an order up by the client order id it was submitted with.
    /// `None` when the exchange has no order under that id.
    async fn find_order(&self, symbol: &str, client_order_id: &str) -> AdapterResult<Option<OrderAck>>;

    /// Net position on a symbol.
    async fn get_position(&self, symbol: &str) -> AdapterResult<PositionInfo>;

    /// Available amount per asset.
    async fn get_balance(&self) -> AdapterResult<BTreeMap<String, Decimal>>;

    /// Cancel a single resting order.
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> AdapterResult<()>;

    /// Last traded price for a symbol.
    async fn get_last_price(&self, symbol: &str) -> AdapterResult<Decimal>;

    /// Resting orders on a symbol.
    async fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>>;

    /// Cancel every resting order on a symbol. Returns how many were cancelled.
    async fn cancel_all_orders(&self, symbol: &str) -> AdapterResult<usize>;

    /// Exchange name for logging.
    fn name(&self) -> &'static str;
}

/// Build the adapter selected by `bot.exchange`.
pub fn build_adapter(
    cfg: &AppConfig,
    credentials: Credentials,
) -> Result<Box<dyn ExchangeAdapter>> {
    let adapter: Box<dyn ExchangeAdapter> = match cfg.exchange_kind()? {
        ExchangeKind::Bybit => Box::new(bybit::BybitClient::new(
            credentials,
            cfg.bot.testnet,
            &cfg.bot.category,
            &cfg.bot.account_type,
            cfg.bot.recv_window,
        )?),
        ExchangeKind::Binance => Box::new(binance::BinanceClient::new(
            credentials,
            cfg.bot.testnet,
            cfg.bot.recv_window,
        )?),
    };

    info!(
        exchange = adapter.name(),
        testnet = cfg.bot.testnet,
        "Exchange adapter ready"
    );
    Ok(adapter)
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `payload`, as both exchanges expect.
pub fn sign_hex(secret: &str, payload: &str) -> AdapterResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|e| AdapterError::auth(format!("Invalid API secret: {e}")))?;
    mac.update(payload.as_bytes());
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Url-encode key/value pairs in the given order.
pub fn encode_query(params: &[(&str, String)]) -> String {
    params
        .iter()
        .map(|(k, v)| format!("{k}={}", urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

/// Parse a decimal field from an exchange payload. Empty means zero.
pub fn parse_decimal(field: &str, value: &str) -> AdapterResult<Decimal> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(Decimal::ZERO);
    }
    trimmed
        .parse::<Decimal>()
        .map_err(|e| AdapterError::rejected(format!("Invalid decimal in `{field}`: {value} ({e})")))
}

/// Map an HTTP status with no usable exchange error body.
pub fn classify_http_status(status: reqwest::StatusCode) -> AdapterErrorKind {
    match status.as_u16() {
        401 | 403 => AdapterErrorKind::Auth,
        418 | 429 => AdapterErrorKind::RateLimit,
        408 => AdapterErrorKind::Transient,
        s if s >= 500 => AdapterErrorKind::Transient,
        _ => AdapterErrorKind::Rejected,
    }
}

/// Transport failures (connect, timeout, truncated body) are all worth a retry.
pub fn classify_transport(err: &reqwest::Error) -> AdapterError {
    AdapterError::transient(format!("HTTP transport error: {err}"))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
