//! Cycle scheduler.
//!
//! Repeats cycles one at a time with a pause between them, recording each
//! completed cycle's volume in the ledger. Stops when:
//! - the ledger reports the cap reached (or the next cycle would pass it)
//! - a SELL fails after a confirmed BUY, or a BUY cannot be verified
//!   (position left open)
//! - the exchange rejects our credentials
//! - too many consecutive cycles fail
//! - shutdown is requested

use chrono::Utc;
use rust_decimal::Decimal;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::engine::cycle::CycleRunner;
use crate::engine::ledger::VolumeLedger;
use crate::engine::{pause, shutdown_requested};
use crate::exchanges::ExchangeAdapter;
use crate::types::{
    CycleConfig, CycleError, CycleOutcome, CycleResult, OpenPositionHalt, RunSummary, Side,
    StopReason,
};

/// Drive cycles until a stop condition. Never returns early on adapter
/// errors: every stop is reported through the summary.
pub async fn run(
    config: &CycleConfig,
    adapter: &dyn ExchangeAdapter,
    mut shutdown: watch::Receiver<bool>,
) -> RunSummary {
    let started_at = Utc::now();
    let runner = CycleRunner::new(config, adapter);
    let mut ledger = VolumeLedger::new(config.max_volume_usdt);

    let mut cycle_id: u64 = 0;
    let mut completed: u64 = 0;
    let mut failed: u64 = 0;
    let mut aborted: u64 = 0;
    let mut consecutive_failures: u32 = 0;
    let mut last_volume: Option<Decimal> = None;
    let mut open_position: Option<OpenPositionHalt> = None;

    info!(
        exchange = adapter.name(),
        symbol = %config.symbol,
        qty = %config.order_qty,
        cap = ?ledger.cap(),
        interval_secs = config.interval.as_secs(),
        dry_run = config.dry_run,
        "Volume bot starting"
    );

    let stop_reason = loop {
        if ledger.cap_reached() {
            info!(total = %ledger.cumulative(), "Volume cap reached");
            break StopReason::CapReached;
        }
        if let Some(estimate) = last_volume {
            if ledger.would_exceed(estimate) {
                info!(
                    total = %ledger.cumulative(),
                    remaining = %ledger.remaining_capacity(),
                    next_estimate = %estimate,
                    "Next cycle would exceed the volume cap"
                );
                break StopReason::CapReached;
            }
        }
        if shutdown_requested(&shutdown) {
            info!("Shutdown requested, not starting a new cycle");
            break StopReason::Shutdown;
        }

        cycle_id += 1;
        info!(cycle = cycle_id, total = %ledger.cumulative(), "Starting cycle");
        let result = runner.run_cycle(cycle_id, &ledger, &mut shutdown).await;

        match result.outcome {
            CycleOutcome::Completed => {
                completed += 1;
                consecutive_failures = 0;
                ledger.record_fill(result.realized_volume_usdt);
                last_volume = Some(result.realized_volume_usdt);
            }
            CycleOutcome::Failed if result.left_open_position() => {
                failed += 1;
                let halt = open_position_halt(config, &result);
                error!(
                    alert = true,
                    cycle = halt.cycle_id,
                    symbol = %halt.symbol,
                    qty = %halt.qty,
                    buy_order_id = %halt.buy_order_id,
                    reason = %halt.reason,
                    "{halt}"
                );
                open_position = Some(halt);
                break StopReason::HaltedOpenPosition;
            }
            CycleOutcome::Failed => {
                failed += 1;
                consecutive_failures += 1;
                warn!(
                    cycle = cycle_id,
                    state = %result.final_state,
                    consecutive_failures,
                    error = %describe(&result),
                    "Cycle failed"
                );
            }
            CycleOutcome::Aborted => {
                aborted += 1;
                match &result.error {
                    Some(CycleError::Shutdown) => {
                        info!(cycle = cycle_id, "Shutdown requested before BUY");
                        break StopReason::Shutdown;
                    }
                    Some(CycleError::CapWouldExceed { .. }) => {
                        info!(total = %ledger.cumulative(), "Volume cap reached");
                        break StopReason::CapReached;
                    }
                    Some(CycleError::InsufficientBalance { .. }) => {
                        info!(cycle = cycle_id, "Cycle skipped: insufficient balance");
                    }
                    _ => {
                        consecutive_failures += 1;
                        warn!(
                            cycle = cycle_id,
                            consecutive_failures,
                            error = %describe(&result),
                            "Cycle aborted"
                        );
                    }
                }
            }
        }

        if result.is_auth_failure() {
            error!(cycle = cycle_id, error = %describe(&result), "Authentication failed, halting");
            break StopReason::AuthFailure;
        }

        if config.max_consecutive_failures > 0
            && consecutive_failures >= config.max_consecutive_failures
        {
            error!(
                consecutive_failures,
                threshold = config.max_consecutive_failures,
                "Circuit breaker tripped, halting"
            );
            break StopReason::CircuitBreaker;
        }

        if ledger.cap_reached() {
            continue;
        }

        if pause(config.interval, &mut shutdown).await {
            info!("Shutdown requested during inter-cycle pause");
            break StopReason::Shutdown;
        }
    };

    let summary = RunSummary {
        stop_reason,
        cycles_completed: completed,
        cycles_failed: failed,
        cycles_aborted: aborted,
        total_volume_usdt: ledger.cumulative(),
        open_position,
        started_at,
        finished_at: Utc::now(),
    };

    info!(
        stop = %summary.stop_reason,
        completed,
        failed,
        aborted,
        fills = ledger.fills(),
        volume = %summary.total_volume_usdt,
        "Volume bot stopped"
    );
    summary
}

fn describe(result: &CycleResult) -> String {
    result
        .error
        .as_ref()
        .map(|e| e.to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Build the report for a cycle that left a position open. An unverified
/// BUY is reported at its full requested quantity.
fn open_position_halt(config: &CycleConfig, result: &CycleResult) -> OpenPositionHalt {
    let buy_unverified = matches!(
        result.error,
        Some(CycleError::SubmissionUnknown { side: Side::Buy, .. })
    );
    let (bought, buy_order_id) = result
        .buy_order
        .as_ref()
        .map(|o| {
            (
                if buy_unverified { o.qty } else { o.filled_qty },
                o.exchange_order_id.clone().unwrap_or_else(|| o.client_order_id.clone()),
            )
        })
        .unwrap_or((config.order_qty, String::new()));
    let sold = result
        .sell_order
        .as_ref()
        .map(|o| o.filled_qty)
        .unwrap_or(Decimal::ZERO);

    OpenPositionHalt {
        cycle_id: result.cycle_id,
        symbol: config.symbol.clone(),
        qty: bought - sold,
        buy_order_id,
        reason: describe(result),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
