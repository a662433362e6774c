//! Volume ledger: cumulative executed notional against the budget.
//!
//! Pure state, no I/O. Owned by the scheduler and only updated once a
//! cycle has fully resolved.

use rust_decimal::Decimal;
use tracing::{info, warn};

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct VolumeLedger {
    cumulative: Decimal,
    /// `None` runs without a cap.
    cap: Option<Decimal>,
    fills: u64,
}

impl VolumeLedger {
    /// A cap of zero (or less) disables the limit.
    pub fn new(cap: Decimal) -> Self {
        Self {
            cumulative: Decimal::ZERO,
            cap: (cap > Decimal::ZERO).then_some(cap),
            fills: 0,
        }
    }

    /// Add a confirmed cycle's volume. Returns the new total.
    ///
    /// Non-positive volumes are ignored so the total never decreases.
    pub fn record_fill(&mut self, volume_usdt: Decimal) -> Decimal {
        if volume_usdt <= Decimal::ZERO {
            warn!(volume = %volume_usdt, "Ignoring non-positive fill volume");
            return self.cumulative;
        }
        self.cumulative += volume_usdt;
        self.fills += 1;

        info!(
            volume = %volume_usdt,
            total = %self.cumulative,
            remaining = %self.remaining_capacity(),
            "Volume recorded"
        );
        self.cumulative
    }

    /// Budget left before the cap. `Decimal::MAX` when uncapped.
    pub fn remaining_capacity(&self) -> Decimal {
        match self.cap {
            Some(cap) => (cap - self.cumulative).max(Decimal::ZERO),
            None => Decimal::MAX,
        }
    }

    pub fn cap_reached(&self) -> bool {
        self.cap.is_some_and(|cap| self.cumulative >= cap)
    }

    /// Whether recording `volume_usdt` would take the total past the cap.
    pub fn would_exceed(&self, volume_usdt: Decimal) -> bool {
        self.cap
            .is_some_and(|cap| self.cumulative + volume_usdt > cap)
    }

    pub fn cumulative(&self) -> Decimal {
        self.cumulative
    }

    pub fn cap(&self) -> Option<Decimal> {
        self.cap
    }

    /// Number of fills recorded.
    pub fn fills(&self) -> u64 {
        self.fills
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
