//! Mock exchange for integration testing.
//!
//! Provides a deterministic `ExchangeAdapter` implementation that fills
//! (or refuses to fill) orders at a fixed price, tracks the resulting
//! position, and records every call, all in-memory with no network.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use volume_bot::exchanges::{AdapterResult, ExchangeAdapter};
use volume_bot::types::*;

/// How the mock answers order placement.
#[derive(Debug, Clone)]
pub enum FillMode {
    /// Every order fills in full at the current price.
    FillAll,
    /// Orders are accepted but stay pending until cancelled.
    NeverFill,
    /// BUYs fill, SELLs are rejected with this message.
    RejectSells(String),
    /// Every placement fails with this kind of error.
    FailPlacement(AdapterErrorKind),
    /// BUYs fill but the response is lost (transient error).
    LoseBuyAcks,
}

#[derive(Debug, Clone)]
struct MockOrder {
    request: OrderRequest,
    status: OrderStatus,
    filled_qty: Decimal,
    avg_price: Decimal,
}

/// A mock futures exchange for deterministic testing.
pub struct MockExchange {
    price: Mutex<Decimal>,
    balances: Mutex<BTreeMap<String, Decimal>>,
    mode: Mutex<FillMode>,
    next_id: AtomicU64,
    orders: Mutex<HashMap<String, MockOrder>>,
    placed: Mutex<Vec<OrderRequest>>,
    cancelled: Mutex<Vec<String>>,
    fail_lookups: AtomicBool,
    /// Signed net position: positive long.
    position: Mutex<Decimal>,
}

impl MockExchange {
    /// Filling exchange at `price` with a large USDT balance.
    pub fn new(price: Decimal) -> Self {
        Self {
            price: Mutex::new(price),
            balances: Mutex::new(BTreeMap::from([("USDT".to_string(), dec!(1_000_000))])),
            mode: Mutex::new(FillMode::FillAll),
            next_id: AtomicU64::new(1),
            orders: Mutex::new(HashMap::new()),
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            fail_lookups: AtomicBool::new(false),
            position: Mutex::new(Decimal::ZERO),
        }
    }

    pub fn with_mode(price: Decimal, mode: FillMode) -> Self {
        let mock = Self::new(price);
        mock.set_mode(mode);
        mock
    }

    pub fn set_mode(&self, mode: FillMode) {
        *self.mode.lock().unwrap() = mode;
    }

    /// Make every `find_order` call fail with a transient error.
    pub fn set_lookup_failure(&self, fail: bool) {
        self.fail_lookups.store(fail, Ordering::SeqCst);
    }

    pub fn set_balance(&self, asset: &str, amount: Decimal) {
        self.balances
            .lock()
            .unwrap()
            .insert(asset.to_string(), amount);
    }

    /// Every order request received, in order.
    pub fn placed(&self) -> Vec<OrderRequest> {
        self.placed.lock().unwrap().clone()
    }

    pub fn placed_count(&self, side: Side) -> usize {
        self.placed().iter().filter(|r| r.side == side).count()
    }

    pub fn cancelled(&self) -> Vec<String> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn net_position(&self) -> Decimal {
        *self.position.lock().unwrap()
    }

    fn signed(side: Side, qty: Decimal) -> Decimal {
        match side {
            Side::Buy => qty,
            Side::Sell => -qty,
        }
    }
}

#[async_trait]
impl ExchangeAdapter for MockExchange {
    async fn place_order(&self, request: &OrderRequest) -> AdapterResult<OrderAck> {
        self.placed.lock().unwrap().push(request.clone());

        let duplicate = self
            .orders
            .lock()
            .unwrap()
            .values()
            .any(|o| o.request.client_order_id == request.client_order_id);
        if duplicate {
            return Err(AdapterError::rejected(format!(
                "retCode=110072: OrderLinkedID is duplicate ({})",
                request.client_order_id
            )));
        }

        let mode = self.mode.lock().unwrap().clone();
        let price = *self.price.lock().unwrap();
        let lose_ack = matches!(mode, FillMode::LoseBuyAcks) && request.side == Side::Buy;
        let fills = match mode {
            FillMode::FailPlacement(kind) => {
                return Err(AdapterError::new(kind, "mock placement failure"));
            }
            FillMode::RejectSells(msg) if request.side == Side::Sell => {
                return Err(AdapterError::rejected(msg));
            }
            FillMode::NeverFill => false,
            FillMode::FillAll | FillMode::RejectSells(_) | FillMode::LoseBuyAcks => true,
        };

        let order_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let order = if fills {
            *self.position.lock().unwrap() += Self::signed(request.side, request.qty);
            MockOrder {
                request: request.clone(),
                status: OrderStatus::Filled,
                filled_qty: request.qty,
                avg_price: price,
            }
        } else {
            MockOrder {
                request: request.clone(),
                status: OrderStatus::Pending,
                filled_qty: Decimal::ZERO,
                avg_price: Decimal::ZERO,
            }
        };
        self.orders.lock().unwrap().insert(order_id.clone(), order);

        if lose_ack {
            return Err(AdapterError::transient("operation timed out"));
        }
        Ok(OrderAck {
            order_id,
            status: OrderStatus::Pending,
        })
    }

    async fn get_order_status(&self, _symbol: &str, order_id: &str) -> AdapterResult<OrderUpdate> {
        let orders = self.orders.lock().unwrap();
        let order = orders
            .get(order_id)
            .ok_or_else(|| AdapterError::rejected(format!("Unknown order {order_id}")))?;
        Ok(OrderUpdate {
            status: order.status,
            filled_qty: order.filled_qty,
            avg_price: order.avg_price,
        })
    }

    async fn find_order(&self, _symbol: &str, client_order_id: &str) -> AdapterResult<Option<OrderAck>> {
        if self.fail_lookups.load(Ordering::SeqCst) {
            return Err(AdapterError::transient("lookup timed out"));
        }
        let orders = self.orders.lock().unwrap();
        Ok(orders
            .iter()
            .find(|(_, o)| o.request.client_order_id == client_order_id)
            .map(|(id, o)| OrderAck {
                order_id: id.clone(),
                status: o.status,
            }))
    }

    async fn get_position(&self, symbol: &str) -> AdapterResult<PositionInfo> {
        let net = self.net_position();
        if net.is_zero() {
            return Ok(PositionInfo::flat(symbol));
        }
        Ok(PositionInfo {
            symbol: symbol.to_string(),
            qty: net.abs(),
            side: Some(if net > Decimal::ZERO { Side::Buy } else { Side::Sell }),
            entry_price: *self.price.lock().unwrap(),
        })
    }

    async fn get_balance(&self) -> AdapterResult<BTreeMap<String, Decimal>> {
        Ok(self.balances.lock().unwrap().clone())
    }

    async fn cancel_order(&self, _symbol: &str, order_id: &str) -> AdapterResult<()> {
        self.cancelled.lock().unwrap().push(order_id.to_string());
        if let Some(order) = self.orders.lock().unwrap().get_mut(order_id) {
            if !order.status.is_final() {
                order.status = OrderStatus::Cancelled;
            }
        }
        Ok(())
    }

    async fn get_last_price(&self, _symbol: &str) -> AdapterResult<Decimal> {
        Ok(*self.price.lock().unwrap())
    }

    async fn list_open_orders(&self, symbol: &str) -> AdapterResult<Vec<OpenOrder>> {
        let orders = self.orders.lock().unwrap();
        Ok(orders
            .iter()
            .filter(|(_, o)| !o.status.is_final() && o.request.symbol == symbol)
            .map(|(id, o)| OpenOrder {
                order_id: id.clone(),
                symbol: symbol.to_string(),
                side: o.request.side,
                qty: o.request.qty,
                price: o.request.price.unwrap_or(Decimal::ZERO),
                status: o.status,
            })
            .collect())
    }

    async fn cancel_all_orders(&self, symbol: &str) -> AdapterResult<usize> {
        let open = self.list_open_orders(symbol).await?;
        for o in &open {
            self.cancel_order(symbol, &o.order_id).await?;
        }
        Ok(open.len())
    }

    fn name(&self) -> &'static str {
        "mock"
    }
}

/// Engine config used across the integration tests: 0.001 BTC per leg,
/// 10s between cycles, no balance check.
pub fn make_config(cap: Decimal) -> CycleConfig {
    let mut cfg = CycleConfig::new("BTCUSDT", dec!(0.001), cap);
    cfg.check_balance = false;
    cfg
}
