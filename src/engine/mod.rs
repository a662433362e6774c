//! Core engine: the paced BUY → wait → SELL loop.
//!
//! - [`ledger`] tracks executed volume against the cap.
//! - [`retry`] wraps adapter calls in bounded backoff.
//! - [`cycle`] runs one BUY→SELL iteration as a state machine.
//! - [`scheduler`] repeats cycles until the cap, a halt, or shutdown.

pub mod cycle;
pub mod ledger;
pub mod retry;
pub mod scheduler;

use std::time::Duration;

use tokio::sync::watch;

/// Whether a stop has been requested.
pub fn shutdown_requested(shutdown: &watch::Receiver<bool>) -> bool {
    *shutdown.borrow()
}

/// Sleep for `duration` unless shutdown is requested first.
///
/// Returns `true` when the sleep was cut short by shutdown. A dropped
/// sender never interrupts the sleep.
pub async fn pause(duration: Duration, shutdown: &mut watch::Receiver<bool>) -> bool {
    if shutdown_requested(shutdown) {
        return true;
    }
    if duration.is_zero() {
        return false;
    }
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        stopped = wait_for_shutdown(shutdown) => stopped,
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) -> bool {
    loop {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if *shutdown.borrow() {
            return true;
        }
    }
}
