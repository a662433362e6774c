//! One-shot service commands.
//!
//! Thin wrappers over the adapter for manual account housekeeping on the
//! configured symbol. In dry-run mode the mutating commands only log what
//! they would do.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use tracing::info;

use crate::exchanges::ExchangeAdapter;
use crate::types::{OpenOrder, Order, OrderRequest, OrderType, Side};

/// What `close-position` did.
#[derive(Debug, Clone, PartialEq)]
pub enum CloseOutcome {
    /// Nothing to close.
    Flat,
    /// Dry-run: the order that would have been sent.
    DryRun { side: Side, qty: Decimal },
    Submitted { order_id: String, side: Side, qty: Decimal },
}

/// Available balances, non-zero only.
pub async fn balances(adapter: &dyn ExchangeAdapter) -> Result<BTreeMap<String, Decimal>> {
    let all = adapter
        .get_balance()
        .await
        .with_context(|| format!("Failed to fetch {} balances", adapter.name()))?;
    let balances: BTreeMap<String, Decimal> = all
        .into_iter()
        .filter(|(_, amount)| !amount.is_zero())
        .collect();

    if balances.is_empty() {
        info!(exchange = adapter.name(), "No non-zero balances");
    }
    for (asset, amount) in &balances {
        info!(asset = %asset, available = %amount, "Balance");
    }
    Ok(balances)
}

pub async fn open_orders(adapter: &dyn ExchangeAdapter, symbol: &str) -> Result<Vec<OpenOrder>> {
    let orders = adapter
        .list_open_orders(symbol)
        .await
        .with_context(|| format!("Failed to list open orders on {symbol}"))?;

    info!(symbol, count = orders.len(), "Open orders");
    for o in &orders {
        info!(
            order_id = %o.order_id,
            side = %o.side,
            qty = %o.qty,
            price = %o.price,
            status = %o.status,
            "Open order"
        );
    }
    Ok(orders)
}

/// Cancel every resting order on `symbol`. Returns how many were (or
/// would be) cancelled.
pub async fn cancel_all(adapter: &dyn ExchangeAdapter, symbol: &str, dry_run: bool) -> Result<usize> {
    if dry_run {
        let open = adapter
            .list_open_orders(symbol)
            .await
            .with_context(|| format!("Failed to list open orders on {symbol}"))?;
        info!(symbol, count = open.len(), "[DRY RUN] Would cancel all open orders");
        return Ok(open.len());
    }

    let cancelled = adapter
        .cancel_all_orders(symbol)
        .await
        .with_context(|| format!("Failed to cancel orders on {symbol}"))?;
    info!(symbol, cancelled, "Cancelled open orders");
    Ok(cancelled)
}

/// Flatten the position on `symbol` with an opposite-side reduce-only
/// market order for its full size.
pub async fn close_position(adapter: &dyn ExchangeAdapter, symbol: &str, dry_run: bool) -> Result<CloseOutcome> {
    let position = adapter
        .get_position(symbol)
        .await
        .with_context(|| format!("Failed to read position on {symbol}"))?;

    let Some(held) = position.side.filter(|_| !position.is_flat()) else {
        info!(symbol, "No open position");
        return Ok(CloseOutcome::Flat);
    };

    let side = held.opposite();
    let qty = position.qty;

    if dry_run {
        info!(symbol, side = %side, qty = %qty, "[DRY RUN] Would close position");
        return Ok(CloseOutcome::DryRun { side, qty });
    }

    let order = Order::new(symbol, side, qty, true);
    let request = OrderRequest {
        symbol: symbol.to_string(),
        side,
        qty,
        order_type: OrderType::Market,
        price: None,
        reduce_only: true,
        client_order_id: order.client_order_id,
    };
    let ack = adapter
        .place_order(&request)
        .await
        .with_context(|| format!("Failed to close {qty} {symbol} position"))?;

    info!(
        symbol,
        side = %side,
        qty = %qty,
        order_id = %ack.order_id,
        status = %ack.status,
        "Close order submitted"
    );
    Ok(CloseOutcome::Submitted {
        order_id: ack.order_id,
        side,
        qty,
    })
}

/// Cancel all open orders, then flatten the position.
pub async fn close_all(adapter: &dyn ExchangeAdapter, symbol: &str, dry_run: bool) -> Result<(usize, CloseOutcome)> {
    let cancelled = cancel_all(adapter, symbol, dry_run).await?;
    let closed = close_position(adapter, symbol, dry_run).await?;
    Ok((cancelled, closed))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
