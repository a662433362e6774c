//! Shared types for the volume bot.
//!
//! These types form the data model used across the engine, the exchange
//! adapters and the service commands. They are kept free of I/O so the
//! engine can be exercised against in-memory adapters.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Order direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    /// The opposite side (used to flatten a position).
    pub fn opposite(&self) -> Self {
        match self {
            Side::Buy => Side::Sell,
            Side::Sell => Side::Buy,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Buy => write!(f, "BUY"),
            Side::Sell => write!(f, "SELL"),
        }
    }
}

/// Order type submitted to the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

/// Parse an order type from config (case-insensitive).
impl std::str::FromStr for OrderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "market" => Ok(OrderType::Market),
            "limit" => Ok(OrderType::Limit),
            other => Err(format!("unknown order type: {other}")),
        }
    }
}

/// Lifecycle status of an order as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    Pending,
    PartiallyFilled,
    Filled,
    Rejected,
    Cancelled,
}

impl OrderStatus {
    /// Whether the exchange will not change this order any further.
    pub fn is_final(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Rejected | OrderStatus::Cancelled
        )
    }
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderStatus::Pending => write!(f, "PENDING"),
            OrderStatus::PartiallyFilled => write!(f, "PARTIALLY_FILLED"),
            OrderStatus::Filled => write!(f, "FILLED"),
            OrderStatus::Rejected => write!(f, "REJECTED"),
            OrderStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

// ---------------------------------------------------------------------------
// Adapter request / response types
// ---------------------------------------------------------------------------

/// Everything an adapter needs to submit one order.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub order_type: OrderType,
    /// Limit price; ignored for market orders.
    pub price: Option<Decimal>,
    pub reduce_only: bool,
    /// Idempotency key echoed to the exchange (`orderLinkId` / `newClientOrderId`).
    pub client_order_id: String,
}

/// Acknowledgement returned by `place_order`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderAck {
    pub order_id: String,
    pub status: OrderStatus,
}

/// Fill state of an order returned by `get_order_status`.
#[derive(Debug, Clone, PartialEq)]
pub struct OrderUpdate {
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    /// Volume-weighted average fill price; zero when nothing filled yet.
    pub avg_price: Decimal,
}

/// Net position on a symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct PositionInfo {
    pub symbol: String,
    /// Absolute position size.
    pub qty: Decimal,
    /// `None` when flat.
    pub side: Option<Side>,
    pub entry_price: Decimal,
}

impl PositionInfo {
    pub fn flat(symbol: &str) -> Self {
        Self {
            symbol: symbol.to_string(),
            qty: Decimal::ZERO,
            side: None,
            entry_price: Decimal::ZERO,
        }
    }

    pub fn is_flat(&self) -> bool {
        self.side.is_none() || self.qty.is_zero()
    }
}

/// A resting order as listed by the exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct OpenOrder {
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: Decimal,
    pub price: Decimal,
    pub status: OrderStatus,
}

// ---------------------------------------------------------------------------
// Engine configuration
// ---------------------------------------------------------------------------

/// How long and how often an order is polled before giving up.
#[derive(Debug, Clone)]
pub struct ConfirmPolicy {
    pub poll_interval: Duration,
    pub timeout: Duration,
    pub max_polls: u32,
}

impl Default for ConfirmPolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            timeout: Duration::from_secs(10),
            max_polls: 20,
        }
    }
}

/// Bounded backoff for retryable adapter errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(2),
        }
    }
}

/// Immutable parameters for one engine run.
#[derive(Debug, Clone)]
pub struct CycleConfig {
    pub symbol: String,
    pub order_qty: Decimal,
    pub order_type: OrderType,
    /// Pause between cycles.
    pub interval: Duration,
    /// Pause between the confirmed BUY and the SELL submission.
    pub fill_delay: Duration,
    /// Volume budget in quote currency. Zero disables the cap.
    pub max_volume_usdt: Decimal,
    pub dry_run: bool,
    /// Asset the balance pre-check reads (usually USDT).
    pub quote_asset: String,
    pub check_balance: bool,
    pub confirm: ConfirmPolicy,
    pub retry: RetryPolicy,
    /// Consecutive failed cycles before the scheduler halts. Zero disables.
    pub max_consecutive_failures: u32,
}

impl CycleConfig {
    /// Minimal config with sensible defaults for everything but the essentials.
    pub fn new(symbol: &str, order_qty: Decimal, max_volume_usdt: Decimal) -> Self {
        Self {
            symbol: symbol.to_string(),
            order_qty,
            order_type: OrderType::Market,
            interval: Duration::from_secs(10),
            fill_delay: Duration::from_millis(500),
            max_volume_usdt,
            dry_run: false,
            quote_asset: "USDT".to_string(),
            check_balance: true,
            confirm: ConfirmPolicy::default(),
            retry: RetryPolicy::default(),
            max_consecutive_failures: 5,
        }
    }
}

// ---------------------------------------------------------------------------
// Orders and cycle results
// ---------------------------------------------------------------------------

/// One leg of a cycle. Owned by the cycle that created it.
#[derive(Debug, Clone, PartialEq)]
pub struct Order {
    pub side: Side,
    pub qty: Decimal,
    pub symbol: String,
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub status: OrderStatus,
    pub filled_qty: Decimal,
    pub avg_price: Decimal,
    pub reduce_only: bool,
    pub requested_at: DateTime<Utc>,
}

impl Order {
    pub fn new(symbol: &str, side: Side, qty: Decimal, reduce_only: bool) -> Self {
        Self {
            side,
            qty,
            symbol: symbol.to_string(),
            client_order_id: format!("vb-{}", uuid::Uuid::new_v4().simple()),
            exchange_order_id: None,
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            reduce_only,
            requested_at: Utc::now(),
        }
    }

    /// Apply a status report from the exchange.
    pub fn apply(&mut self, update: &OrderUpdate) {
        self.status = update.status;
        self.filled_qty = update.filled_qty;
        if !update.avg_price.is_zero() {
            self.avg_price = update.avg_price;
        }
    }

    /// Executed notional, valuing the fill at `fallback_price` when the
    /// exchange did not report an average price.
    pub fn notional(&self, fallback_price: Decimal) -> Decimal {
        let price = if self.avg_price.is_zero() {
            fallback_price
        } else {
            self.avg_price
        };
        self.filled_qty * price
    }
}

/// States of the BUY→SELL cycle state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleState {
    Idle,
    BuySubmitted,
    BuyConfirmed,
    SellWait,
    SellSubmitted,
    SellConfirmed,
    BuyFailed,
    SellFailed,
}

impl CycleState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            CycleState::SellConfirmed | CycleState::BuyFailed | CycleState::SellFailed
        )
    }
}

impl fmt::Display for CycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CycleState::Idle => "IDLE",
            CycleState::BuySubmitted => "BUY_SUBMITTED",
            CycleState::BuyConfirmed => "BUY_CONFIRMED",
            CycleState::SellWait => "SELL_WAIT",
            CycleState::SellSubmitted => "SELL_SUBMITTED",
            CycleState::SellConfirmed => "SELL_CONFIRMED",
            CycleState::BuyFailed => "BUY_FAILED",
            CycleState::SellFailed => "SELL_FAILED",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CycleOutcome {
    /// Both legs filled; volume counts.
    Completed,
    /// Stopped before any order was placed.
    Aborted,
    /// A leg failed. Check `final_state` for whether a position is open.
    Failed,
}

impl fmt::Display for CycleOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleOutcome::Completed => write!(f, "COMPLETED"),
            CycleOutcome::Aborted => write!(f, "ABORTED"),
            CycleOutcome::Failed => write!(f, "FAILED"),
        }
    }
}

/// Result of one cycle, consumed by the scheduler and then discarded.
#[derive(Debug, Clone)]
pub struct CycleResult {
    pub cycle_id: u64,
    pub buy_order: Option<Order>,
    pub sell_order: Option<Order>,
    pub realized_volume_usdt: Decimal,
    pub outcome: CycleOutcome,
    pub final_state: CycleState,
    /// Every state entered, in order, starting with `Idle`.
    pub transitions: Vec<CycleState>,
    pub error: Option<CycleError>,
}

impl CycleResult {
    /// Whether this cycle left an unmanaged position on the account.
    ///
    /// True after SELL_FAILED, and after a submission whose outcome could
    /// not be verified (the order may have filled).
    pub fn left_open_position(&self) -> bool {
        self.final_state == CycleState::SellFailed
            || matches!(self.error, Some(CycleError::SubmissionUnknown { .. }))
    }

    /// Whether the cycle ended on an authentication failure.
    pub fn is_auth_failure(&self) -> bool {
        matches!(
            &self.error,
            Some(CycleError::Adapter(e)) if e.kind == AdapterErrorKind::Auth
        )
    }
}

// ---------------------------------------------------------------------------
// Run summary
// ---------------------------------------------------------------------------

/// Why the scheduler stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StopReason {
    CapReached,
    HaltedOpenPosition,
    Shutdown,
    CircuitBreaker,
    AuthFailure,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StopReason::CapReached => "CAP_REACHED",
            StopReason::HaltedOpenPosition => "HALTED_OPEN_POSITION",
            StopReason::Shutdown => "SHUTDOWN",
            StopReason::CircuitBreaker => "CIRCUIT_BREAKER",
            StopReason::AuthFailure => "AUTH_FAILURE",
        };
        write!(f, "{s}")
    }
}

/// Summary of a complete scheduler run.
#[derive(Debug, Clone)]
pub struct RunSummary {
    pub stop_reason: StopReason,
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub cycles_aborted: u64,
    pub total_volume_usdt: Decimal,
    /// Set when the run ended with a position left open.
    pub open_position: Option<OpenPositionHalt>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stop={} completed={} failed={} aborted={} volume={} USDT",
            self.stop_reason,
            self.cycles_completed,
            self.cycles_failed,
            self.cycles_aborted,
            self.total_volume_usdt,
        )
    }
}

// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Classification of adapter failures, used by the engine to decide
/// between retrying, ending the cycle, and halting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdapterErrorKind {
    Transient,
    Rejected,
    Auth,
    RateLimit,
}

impl AdapterErrorKind {
    pub fn is_retryable(&self) -> bool {
        matches!(self, AdapterErrorKind::Transient | AdapterErrorKind::RateLimit)
    }
}

impl fmt::Display for AdapterErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AdapterErrorKind::Transient => write!(f, "TRANSIENT"),
            AdapterErrorKind::Rejected => write!(f, "REJECTED"),
            AdapterErrorKind::Auth => write!(f, "AUTH"),
            AdapterErrorKind::RateLimit => write!(f, "RATE_LIMIT"),
        }
    }
}

/// Error returned by every exchange adapter call.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{kind} adapter error: {message}")]
pub struct AdapterError {
    pub kind: AdapterErrorKind,
    pub message: String,
}

impl AdapterError {
    pub fn new(kind: AdapterErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Transient, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Rejected, message)
    }

    pub fn auth(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::Auth, message)
    }

    pub fn rate_limit(message: impl Into<String>) -> Self {
        Self::new(AdapterErrorKind::RateLimit, message)
    }
}

/// Why a cycle did not complete.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CycleError {
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    #[error("{side} order {order_id} not filled within {elapsed_ms}ms")]
    Timeout {
        side: Side,
        order_id: String,
        elapsed_ms: u128,
    },

    #[error("{side} order {order_id} ended as {status}")]
    NotFilled {
        side: Side,
        order_id: String,
        status: OrderStatus,
    },

    #[error("{side} submission {client_order_id} may have reached the exchange: {reason}")]
    SubmissionUnknown {
        side: Side,
        client_order_id: String,
        reason: String,
    },

    #[error("Next cycle (~{estimate}) would exceed the remaining volume budget ({remaining})")]
    CapWouldExceed {
        estimate: Decimal,
        remaining: Decimal,
    },

    #[error("Insufficient {asset}: need {needed}, have {available}")]
    InsufficientBalance {
        asset: String,
        needed: Decimal,
        available: Decimal,
    },

    #[error("Shutdown requested before the cycle started")]
    Shutdown,
}

/// A cycle left a position the bot no longer manages: the SELL failed
/// after a confirmed BUY, or a BUY could not be verified either way.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("OPEN POSITION on {symbol}: up to {qty} bought (order {buy_order_id}) left unmanaged: {reason}")]
pub struct OpenPositionHalt {
    pub cycle_id: u64,
    pub symbol: String,
    pub qty: Decimal,
    pub buy_order_id: String,
    pub reason: String,
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
