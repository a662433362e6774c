//! Cycle state machine.
//!
//! Runs one BUY → wait → SELL iteration against an [`ExchangeAdapter`]:
//!
//! ```text
//! IDLE → BUY_SUBMITTED → BUY_CONFIRMED → SELL_WAIT → SELL_SUBMITTED → SELL_CONFIRMED
//!             ↓                                             ↓
//!         BUY_FAILED                                   SELL_FAILED (position open)
//! ```
//!
//! Before the BUY, a pre-flight step reads the reference price and (when
//! enabled) the quote balance, and checks that a cycle at that price fits
//! the remaining volume budget; failures there abort the cycle without
//! placing anything. In dry-run mode fills are synthesized at the
//! reference price and no order ever reaches the exchange.
//!
//! A confirmed BUY is always followed by a SELL attempt. Shutdown during
//! SELL_WAIT only shortens the wait.

use rust_decimal::Decimal;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::engine::ledger::VolumeLedger;
use crate::engine::retry::retry_transient;
use crate::engine::{pause, shutdown_requested};
use crate::exchanges::ExchangeAdapter;
use crate::types::{
    AdapterError, AdapterErrorKind, CycleConfig, CycleError, CycleOutcome, CycleResult,
    CycleState, Order, OrderAck, OrderRequest, OrderStatus, OrderType, Side,
};

// ---------------------------------------------------------------------------
// Transition trace
// ---------------------------------------------------------------------------

/// Records and logs every state the cycle enters.
struct Trace {
    cycle_id: u64,
    ledger_total: Decimal,
    dry_run: bool,
    states: Vec<CycleState>,
}

impl Trace {
    fn new(cycle_id: u64, ledger_total: Decimal, dry_run: bool) -> Self {
        Self {
            cycle_id,
            ledger_total,
            dry_run,
            states: Vec::with_capacity(6),
        }
    }

    fn enter(&mut self, state: CycleState, side: Option<Side>, qty: Decimal, price: Decimal) {
        self.states.push(state);
        info!(
            cycle_id = self.cycle_id,
            state = %state,
            side = ?side,
            qty = %qty,
            price = %price,
            ledger_total = %self.ledger_total,
            dry_run = self.dry_run,
            "Cycle transition"
        );
    }

    fn current(&self) -> CycleState {
        self.states.last().copied().unwrap_or(CycleState::Idle)
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Executes cycles for one symbol with a fixed configuration.
pub struct CycleRunner<'a> {
    config: &'a CycleConfig,
    adapter: &'a dyn ExchangeAdapter,
}

impl<'a> CycleRunner<'a> {
    pub fn new(config: &'a CycleConfig, adapter: &'a dyn ExchangeAdapter) -> Self {
        Self { config, adapter }
    }

    /// Run one full cycle. Never panics on adapter failure: every outcome
    /// is reported through the returned [`CycleResult`].
    ///
    /// The ledger is only read, to refuse a cycle that would not fit.
    pub async fn run_cycle(
        &self,
        cycle_id: u64,
        ledger: &VolumeLedger,
        shutdown: &mut watch::Receiver<bool>,
    ) -> CycleResult {
        let cfg = self.config;
        let mut trace = Trace::new(cycle_id, ledger.cumulative(), cfg.dry_run);
        trace.enter(CycleState::Idle, None, cfg.order_qty, Decimal::ZERO);

        // -- Pre-flight ----------------------------------------------------

        let reference_price = match self.preflight().await {
            Ok(price) => price,
            Err(e) => return abort(cycle_id, trace, e),
        };

        // Both legs at the reference price.
        let estimate = Decimal::TWO * cfg.order_qty * reference_price;
        if ledger.would_exceed(estimate) {
            let remaining = ledger.remaining_capacity();
            info!(
                cycle_id,
                estimate = %estimate,
                remaining = %remaining,
                cap = ?ledger.cap(),
                "Cycle would exceed the volume cap"
            );
            return abort(cycle_id, trace, CycleError::CapWouldExceed { estimate, remaining });
        }

        if shutdown_requested(shutdown) {
            return abort(cycle_id, trace, CycleError::Shutdown);
        }

        // -- BUY leg -------------------------------------------------------

        let mut buy = Order::new(&cfg.symbol, Side::Buy, cfg.order_qty, false);
        trace.enter(CycleState::BuySubmitted, Some(Side::Buy), buy.qty, reference_price);

        if let Err(e) = self.execute_leg(&mut buy, reference_price).await {
            if buy.filled_qty > Decimal::ZERO {
                warn!(
                    cycle_id,
                    order_id = buy.exchange_order_id.as_deref().unwrap_or_default(),
                    requested = %buy.qty,
                    filled = %buy.filled_qty,
                    error = %e,
                    "BUY only partially filled, continuing with filled quantity"
                );
            } else {
                if matches!(e, CycleError::SubmissionUnknown { .. }) {
                    warn!(cycle_id, error = %e, "BUY may be open on the exchange, no SELL will be placed");
                } else {
                    warn!(cycle_id, error = %e, "BUY leg failed, no SELL will be placed");
                }
                trace.enter(CycleState::BuyFailed, Some(Side::Buy), buy.qty, reference_price);
                return finish(cycle_id, trace, Some(buy), None, Decimal::ZERO, Some(e));
            }
        }

        let buy_price = price_or(buy.avg_price, reference_price);
        trace.enter(CycleState::BuyConfirmed, Some(Side::Buy), buy.filled_qty, buy_price);

        // -- Wait ----------------------------------------------------------

        trace.enter(CycleState::SellWait, Some(Side::Sell), buy.filled_qty, buy_price);
        if pause(cfg.fill_delay, shutdown).await {
            info!(cycle_id, "Shutdown requested during SELL_WAIT, selling now");
        }

        // -- SELL leg ------------------------------------------------------

        let mut sell = Order::new(&cfg.symbol, Side::Sell, buy.filled_qty, true);
        trace.enter(CycleState::SellSubmitted, Some(Side::Sell), sell.qty, reference_price);

        let sell_result = self.execute_leg(&mut sell, reference_price).await;
        let sell_error = match sell_result {
            Ok(()) => None,
            Err(e) if sell.status == OrderStatus::Filled => {
                debug!(cycle_id, error = %e, "SELL filled after cancel attempt");
                None
            }
            Err(e) => Some(e),
        };

        if let Some(e) = sell_error {
            warn!(
                cycle_id,
                qty = %buy.filled_qty,
                sold = %sell.filled_qty,
                error = %e,
                "SELL leg failed after confirmed BUY"
            );
            trace.enter(CycleState::SellFailed, Some(Side::Sell), sell.qty, reference_price);
            return finish(cycle_id, trace, Some(buy), Some(sell), Decimal::ZERO, Some(e));
        }

        let sell_price = price_or(sell.avg_price, reference_price);
        trace.enter(CycleState::SellConfirmed, Some(Side::Sell), sell.filled_qty, sell_price);

        let volume = buy.notional(reference_price) + sell.notional(reference_price);
        info!(
            cycle_id,
            volume = %volume,
            buy_price = %buy_price,
            sell_price = %sell_price,
            "Cycle complete"
        );
        finish(cycle_id, trace, Some(buy), Some(sell), volume, None)
    }

    /// Reference price plus the optional balance check.
    async fn preflight(&self) -> Result<Decimal, CycleError> {
        let cfg = self.config;
        let price = retry_transient(&cfg.retry, "get_last_price", || {
            self.adapter.get_last_price(&cfg.symbol)
        })
        .await?;

        if cfg.check_balance {
            let balances = retry_transient(&cfg.retry, "get_balance", || self.adapter.get_balance()).await?;
            let available = balances
                .get(&cfg.quote_asset)
                .copied()
                .unwrap_or(Decimal::ZERO);
            let needed = cfg.order_qty * price;
            if available < needed {
                warn!(
                    asset = %cfg.quote_asset,
                    needed = %needed,
                    available = %available,
                    "Insufficient balance, skipping cycle"
                );
                return Err(CycleError::InsufficientBalance {
                    asset: cfg.quote_asset.clone(),
                    needed,
                    available,
                });
            }
        }

        Ok(price)
    }

    /// Submit one leg and wait for it to fill.
    ///
    /// On timeout or polling failure the resting order is cancelled (best
    /// effort) and its status re-read once, so `order` always reflects the
    /// last known fill.
    async fn execute_leg(&self, order: &mut Order, reference_price: Decimal) -> Result<(), CycleError> {
        let cfg = self.config;

        if cfg.dry_run {
            order.exchange_order_id = Some(format!("dry-{}", order.client_order_id));
            order.status = OrderStatus::Filled;
            order.filled_qty = order.qty;
            order.avg_price = reference_price;
            info!(
                side = %order.side,
                qty = %order.qty,
                price = %reference_price,
                reduce_only = order.reduce_only,
                "[DRY RUN] Would place order"
            );
            return Ok(());
        }

        let request = OrderRequest {
            symbol: order.symbol.clone(),
            side: order.side,
            qty: order.qty,
            order_type: cfg.order_type,
            price: (cfg.order_type == OrderType::Limit).then_some(reference_price),
            reduce_only: order.reduce_only,
            client_order_id: order.client_order_id.clone(),
        };

        let ack = match retry_transient(&cfg.retry, "place_order", || self.adapter.place_order(&request)).await {
            Ok(ack) => ack,
            Err(e) if e.kind == AdapterErrorKind::Auth => return Err(e.into()),
            Err(e) => self.recover_submission(order, e).await?,
        };
        info!(
            side = %order.side,
            order_id = %ack.order_id,
            client_order_id = %order.client_order_id,
            status = %ack.status,
            "Order placed"
        );
        order.exchange_order_id = Some(ack.order_id.clone());
        order.status = ack.status;

        if ack.status == OrderStatus::Rejected {
            return Err(CycleError::NotFilled {
                side: order.side,
                order_id: ack.order_id,
                status: ack.status,
            });
        }

        match self.confirm(order, &ack.order_id).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if !order.status.is_final() {
                    self.cancel_and_refresh(order, &ack.order_id).await;
                }
                Err(e)
            }
        }
    }

    /// A failed submission may still have reached the exchange (response
    /// lost, then the resend refused as a duplicate). Look the order up by
    /// its client id: continue with it if it exists, report the original
    /// error if it provably does not, and report the outcome as unknown
    /// when the lookup itself fails.
    async fn recover_submission(&self, order: &Order, error: AdapterError) -> Result<OrderAck, CycleError> {
        let cfg = self.config;
        let lookup = retry_transient(&cfg.retry, "find_order", || {
            self.adapter.find_order(&order.symbol, &order.client_order_id)
        })
        .await;

        match lookup {
            Ok(Some(ack)) => {
                warn!(
                    side = %order.side,
                    client_order_id = %order.client_order_id,
                    order_id = %ack.order_id,
                    error = %error,
                    "Submission reported an error but the order exists, continuing with it"
                );
                Ok(ack)
            }
            Ok(None) => Err(error.into()),
            Err(lookup_error) => {
                warn!(
                    side = %order.side,
                    client_order_id = %order.client_order_id,
                    error = %error,
                    lookup_error = %lookup_error,
                    "Could not verify whether the order was placed"
                );
                Err(CycleError::SubmissionUnknown {
                    side: order.side,
                    client_order_id: order.client_order_id.clone(),
                    reason: format!("{error}; lookup failed: {lookup_error}"),
                })
            }
        }
    }

    /// Poll until FILLED, a final non-filled status, the timeout, or the
    /// poll budget runs out, whichever comes first.
    async fn confirm(&self, order: &mut Order, order_id: &str) -> Result<(), CycleError> {
        let cfg = self.config;
        let started = Instant::now();

        for poll in 1..=cfg.confirm.max_polls {
            let update = retry_transient(&cfg.retry, "get_order_status", || {
                self.adapter.get_order_status(&order.symbol, order_id)
            })
            .await?;
            order.apply(&update);

            debug!(
                side = %order.side,
                order_id,
                poll,
                status = %update.status,
                filled = %update.filled_qty,
                "Order status"
            );

            match update.status {
                OrderStatus::Filled => return Ok(()),
                OrderStatus::Rejected | OrderStatus::Cancelled => {
                    return Err(CycleError::NotFilled {
                        side: order.side,
                        order_id: order_id.to_string(),
                        status: update.status,
                    });
                }
                OrderStatus::Pending | OrderStatus::PartiallyFilled => {}
            }

            if poll == cfg.confirm.max_polls || started.elapsed() >= cfg.confirm.timeout {
                break;
            }
            tokio::time::sleep(cfg.confirm.poll_interval).await;
        }

        Err(CycleError::Timeout {
            side: order.side,
            order_id: order_id.to_string(),
            elapsed_ms: started.elapsed().as_millis(),
        })
    }

    async fn cancel_and_refresh(&self, order: &mut Order, order_id: &str) {
        let cfg = self.config;
        if let Err(e) = self.adapter.cancel_order(&order.symbol, order_id).await {
            warn!(side = %order.side, order_id, error = %e, "Cancel after timeout failed");
        }
        match retry_transient(&cfg.retry, "get_order_status", || {
            self.adapter.get_order_status(&order.symbol, order_id)
        })
        .await
        {
            Ok(update) => order.apply(&update),
            Err(e) => warn!(side = %order.side, order_id, error = %e, "Could not re-read order after cancel"),
        }
    }
}

// ---------------------------------------------------------------------------
// Result helpers
// ---------------------------------------------------------------------------

fn price_or(price: Decimal, fallback: Decimal) -> Decimal {
    if price.is_zero() {
        fallback
    } else {
        price
    }
}

fn abort(cycle_id: u64, trace: Trace, error: CycleError) -> CycleResult {
    debug!(cycle_id, error = %error, "Cycle aborted before BUY");
    CycleResult {
        cycle_id,
        buy_order: None,
        sell_order: None,
        realized_volume_usdt: Decimal::ZERO,
        outcome: CycleOutcome::Aborted,
        final_state: trace.current(),
        transitions: trace.states,
        error: Some(error),
    }
}

fn finish(
    cycle_id: u64,
    trace: Trace,
    buy_order: Option<Order>,
    sell_order: Option<Order>,
    realized_volume_usdt: Decimal,
    error: Option<CycleError>,
) -> CycleResult {
    let final_state = trace.current();
    let outcome = if final_state == CycleState::SellConfirmed {
        CycleOutcome::Completed
    } else {
        CycleOutcome::Failed
    };
    CycleResult {
        cycle_id,
        buy_order,
        sell_order,
        realized_volume_usdt,
        outcome,
        final_state,
        transitions: trace.states,
        error,
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchanges::MockExchangeAdapter;
    use crate::types::{AdapterError, OrderAck, OrderUpdate};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const FULL_PATH: [CycleState; 6] = [
        CycleState::Idle,
        CycleState::BuySubmitted,
        CycleState::BuyConfirmed,
        CycleState::SellWait,
        CycleState::SellSubmitted,
        CycleState::SellConfirmed,
    ];

    fn make_config() -> CycleConfig {
        let mut cfg = CycleConfig::new("BTCUSDT", dec!(0.001), dec!(1000));
        cfg.check_balance = false;
        cfg.fill_delay = Duration::from_millis(500);
        cfg
    }

    fn ledger() -> VolumeLedger {
        VolumeLedger::new(dec!(1000))
    }

    fn filled(qty: Decimal, price: Decimal) -> OrderUpdate {
        OrderUpdate {
            status: OrderStatus::Filled,
            filled_qty: qty,
            avg_price: price,
        }
    }

    fn pending() -> OrderUpdate {
        OrderUpdate {
            status: OrderStatus::Pending,
            filled_qty: Decimal::ZERO,
            avg_price: Decimal::ZERO,
        }
    }

    fn ack(id: &str) -> OrderAck {
        OrderAck {
            order_id: id.to_string(),
            status: OrderStatus::Pending,
        }
    }

    /// Mock that fills both legs: BUY at 50000 (order "b1"), SELL at 50010 ("s1").
    fn make_filling_mock() -> MockExchangeAdapter {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy && !r.reduce_only)
            .times(1)
            .returning(|_| Ok(ack("b1")));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell && r.reduce_only)
            .times(1)
            .returning(|_| Ok(ack("s1")));
        mock.expect_get_order_status()
            .withf(|_, id| id == "b1")
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        mock.expect_get_order_status()
            .withf(|_, id| id == "s1")
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50010))));
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn test_happy_path_completes_with_volume() {
        let cfg = make_config();
        let mock = make_filling_mock();
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        assert_eq!(result.transitions, FULL_PATH.to_vec());
        assert_eq!(result.realized_volume_usdt, dec!(100.010));
        assert!(result.error.is_none());
        let sell = result.sell_order.unwrap();
        assert!(sell.reduce_only);
        assert_eq!(sell.exchange_order_id.as_deref(), Some("s1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dry_run_places_nothing_and_keeps_transitions() {
        let mut cfg = make_config();
        cfg.dry_run = true;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order().never();
        mock.expect_get_order_status().never();
        let (_tx, mut rx) = watch::channel(false);

        let start = Instant::now();
        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        assert_eq!(result.transitions, FULL_PATH.to_vec());
        assert_eq!(result.realized_volume_usdt, dec!(100));
        assert_eq!(start.elapsed(), cfg.fill_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_live_timing_matches_dry_run() {
        let cfg = make_config();
        let mock = make_filling_mock();
        let (_tx, mut rx) = watch::channel(false);

        let start = Instant::now();
        CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(start.elapsed(), cfg.fill_delay);
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_rejected_places_no_sell() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(1)
            .returning(|_| Err(AdapterError::rejected("insufficient margin")));
        mock.expect_find_order().times(1).returning(|_, _| Ok(None));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Failed);
        assert_eq!(result.final_state, CycleState::BuyFailed);
        assert!(result.sell_order.is_none());
        assert!(!result.left_open_position());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buy_timeout_cancels_and_places_no_sell() {
        let mut cfg = make_config();
        cfg.confirm.timeout = Duration::from_secs(2);
        cfg.confirm.poll_interval = Duration::from_millis(500);
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(1)
            .returning(|_| Ok(ack("b1")));
        mock.expect_get_order_status().returning(|_, _| Ok(pending()));
        mock.expect_cancel_order()
            .withf(|_, id| id == "b1")
            .times(1)
            .returning(|_, _| Ok(()));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.final_state, CycleState::BuyFailed);
        assert!(matches!(result.error, Some(CycleError::Timeout { side: Side::Buy, .. })));
        assert!(result.sell_order.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_budget_bounds_confirmation() {
        let mut cfg = make_config();
        cfg.confirm.max_polls = 3;
        cfg.confirm.timeout = Duration::from_secs(3600);
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order().times(1).returning(|_| Ok(ack("b1")));
        // 3 polls plus one re-read after the cancel.
        mock.expect_get_order_status().times(4).returning(|_, _| Ok(pending()));
        mock.expect_cancel_order().times(1).returning(|_, _| Ok(()));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(result.final_state, CycleState::BuyFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_buy_sells_filled_quantity() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(1)
            .returning(|_| Ok(ack("b1")));
        mock.expect_get_order_status()
            .withf(|_, id| id == "b1")
            .returning(|_, _| {
                Ok(OrderUpdate {
                    status: OrderStatus::Cancelled,
                    filled_qty: dec!(0.0006),
                    avg_price: dec!(50000),
                })
            });
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell && r.qty == dec!(0.0006))
            .times(1)
            .returning(|_| Ok(ack("s1")));
        mock.expect_get_order_status()
            .withf(|_, id| id == "s1")
            .returning(|_, _| Ok(filled(dec!(0.0006), dec!(50000))));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        assert_eq!(result.realized_volume_usdt, dec!(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_rejection_leaves_open_position() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(1)
            .returning(|_| Ok(ack("b1")));
        mock.expect_get_order_status()
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell)
            .times(1)
            .returning(|_| Err(AdapterError::rejected("reduce-only order rejected")));
        mock.expect_find_order().times(1).returning(|_, _| Ok(None));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(7, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Failed);
        assert_eq!(result.final_state, CycleState::SellFailed);
        assert!(result.left_open_position());
        assert_eq!(result.realized_volume_usdt, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_submission_error_is_retried() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        let mut buy_calls = 0;
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(2)
            .returning(move |_| {
                buy_calls += 1;
                if buy_calls == 1 {
                    Err(AdapterError::transient("connection reset"))
                } else {
                    Ok(ack("b1"))
                }
            });
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell)
            .times(1)
            .returning(|_| Ok(ack("s1")));
        mock.expect_get_order_status()
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(result.outcome, CycleOutcome::Completed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_insufficient_balance_aborts_without_orders() {
        let mut cfg = make_config();
        cfg.check_balance = true;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_get_balance()
            .returning(|| Ok(BTreeMap::from([("USDT".to_string(), dec!(10))])));
        mock.expect_place_order().never();
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Aborted);
        assert_eq!(result.final_state, CycleState::Idle);
        assert!(matches!(
            result.error,
            Some(CycleError::InsufficientBalance { needed, .. }) if needed == dec!(50)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_error_on_buy() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .times(1)
            .returning(|_| Err(AdapterError::auth("API key expired")));
        mock.expect_find_order().never();
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(result.final_state, CycleState::BuyFailed);
        assert!(result.is_auth_failure());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_during_sell_wait_still_sells() {
        let mut cfg = make_config();
        cfg.fill_delay = Duration::from_secs(30);
        let mock = make_filling_mock();
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        assert!(start.elapsed() < Duration::from_secs(30));
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_before_buy_aborts() {
        let cfg = make_config();
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order().never();
        let (_tx, mut rx) = watch::channel(true);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(result.outcome, CycleOutcome::Aborted);
        assert_eq!(result.error, Some(CycleError::Shutdown));
    }

    #[tokio::test(start_paused = true)]
    async fn test_limit_orders_carry_reference_price() {
        let mut cfg = make_config();
        cfg.order_type = OrderType::Limit;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.order_type == OrderType::Limit && r.price == Some(dec!(50000)))
            .times(2)
            .returning(|r| Ok(ack(if r.side == Side::Buy { "b1" } else { "s1" })));
        mock.expect_get_order_status()
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;
        assert_eq!(result.outcome, CycleOutcome::Completed);
    }

    /// BUY lands but its response is lost; the resend is refused as a duplicate.
    fn lost_ack_mock() -> MockExchangeAdapter {
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        let mut buy_calls = 0;
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(2)
            .returning(move |_| {
                buy_calls += 1;
                if buy_calls == 1 {
                    Err(AdapterError::transient("operation timed out"))
                } else {
                    Err(AdapterError::rejected("retCode=110072: OrderLinkedID is duplicate"))
                }
            });
        mock
    }

    #[tokio::test(start_paused = true)]
    async fn test_lost_buy_ack_continues_with_order_found_by_client_id() {
        let cfg = make_config();
        let mut mock = lost_ack_mock();
        mock.expect_find_order()
            .withf(|_, client_id| client_id.starts_with("vb-"))
            .times(1)
            .returning(|_, _| Ok(Some(ack("b1"))));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell)
            .times(1)
            .returning(|_| Ok(ack("s1")));
        mock.expect_get_order_status()
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        let buy = result.buy_order.unwrap();
        assert_eq!(buy.exchange_order_id.as_deref(), Some("b1"));
        assert_eq!(result.realized_volume_usdt, dec!(100));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverifiable_buy_leaves_open_position() {
        let cfg = make_config();
        let mut mock = lost_ack_mock();
        mock.expect_find_order()
            .returning(|_, _| Err(AdapterError::transient("connection reset")));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.final_state, CycleState::BuyFailed);
        assert!(result.sell_order.is_none());
        assert!(result.left_open_position());
        assert!(matches!(
            result.error,
            Some(CycleError::SubmissionUnknown { side: Side::Buy, .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_larger_than_remaining_budget_is_refused() {
        let mut cfg = make_config();
        cfg.dry_run = true;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order().never();
        let (_tx, mut rx) = watch::channel(false);

        // One cycle is worth ~100 USDT.
        let small = VolumeLedger::new(dec!(50));
        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &small, &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Aborted);
        assert!(result.buy_order.is_none());
        assert_eq!(
            result.error,
            Some(CycleError::CapWouldExceed {
                estimate: dec!(100),
                remaining: dec!(50),
            })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sell_partial_until_timeout_fails_with_partial_fill() {
        let mut cfg = make_config();
        cfg.confirm.max_polls = 3;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .returning(|r| Ok(ack(if r.side == Side::Buy { "b1" } else { "s1" })));
        mock.expect_get_order_status()
            .withf(|_, id| id == "b1")
            .returning(|_, _| Ok(filled(dec!(0.001), dec!(50000))));
        mock.expect_get_order_status()
            .withf(|_, id| id == "s1")
            .returning(|_, _| {
                Ok(OrderUpdate {
                    status: OrderStatus::PartiallyFilled,
                    filled_qty: dec!(0.0004),
                    avg_price: dec!(50000),
                })
            });
        mock.expect_cancel_order()
            .withf(|_, id| id == "s1")
            .times(1)
            .returning(|_, _| Ok(()));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.final_state, CycleState::SellFailed);
        assert!(result.left_open_position());
        assert!(matches!(result.error, Some(CycleError::Timeout { side: Side::Sell, .. })));
        assert_eq!(result.sell_order.unwrap().filled_qty, dec!(0.0004));
        assert_eq!(result.realized_volume_usdt, Decimal::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_partial_buy_sells_fill_when_cancel_and_reread_fail() {
        let mut cfg = make_config();
        cfg.confirm.max_polls = 3;
        let mut mock = MockExchangeAdapter::new();
        mock.expect_get_last_price().returning(|_| Ok(dec!(50000)));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Buy)
            .times(1)
            .returning(|_| Ok(ack("b1")));
        // Three polls report the partial fill, then the venue stops answering.
        let mut buy_polls = 0;
        mock.expect_get_order_status()
            .withf(|_, id| id == "b1")
            .returning(move |_, _| {
                buy_polls += 1;
                if buy_polls <= 3 {
                    Ok(OrderUpdate {
                        status: OrderStatus::PartiallyFilled,
                        filled_qty: dec!(0.0005),
                        avg_price: dec!(50000),
                    })
                } else {
                    Err(AdapterError::transient("gateway timeout"))
                }
            });
        mock.expect_cancel_order()
            .withf(|_, id| id == "b1")
            .times(1)
            .returning(|_, _| Err(AdapterError::transient("gateway timeout")));
        mock.expect_place_order()
            .withf(|r| r.side == Side::Sell && r.qty == dec!(0.0005) && r.reduce_only)
            .times(1)
            .returning(|_| Ok(ack("s1")));
        mock.expect_get_order_status()
            .withf(|_, id| id == "s1")
            .returning(|_, _| Ok(filled(dec!(0.0005), dec!(50000))));
        let (_tx, mut rx) = watch::channel(false);

        let result = CycleRunner::new(&cfg, &mock).run_cycle(1, &ledger(), &mut rx).await;

        assert_eq!(result.outcome, CycleOutcome::Completed);
        let buy = result.buy_order.unwrap();
        assert_eq!(buy.status, OrderStatus::PartiallyFilled);
        assert_eq!(buy.filled_qty, dec!(0.0005));
        assert_eq!(result.realized_volume_usdt, dec!(50));
    }
}
