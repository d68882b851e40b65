//! Demand accounting for the reactive-streams contract.

use std::sync::atomic::{AtomicI64, Ordering};

use crossbeam_utils::CachePadded;

use crate::error::{Result, RingError};

/// Marker for unbounded demand. Once requested, it is sticky: later finite
/// requests are absorbed and the counter is never decremented again.
pub const UNBOUNDED: i64 = i64::MAX;

/// Validate a `request(n)` argument.
pub fn check_request(n: i64) -> Result<()> {
    if n <= 0 {
        return Err(RingError::InvalidArgument(format!(
            "request must be positive, got {n}"
        )));
    }
    Ok(())
}

/// Pending-demand counter for one subscriber.
///
/// Additions saturate at [`UNBOUNDED`]; consumption is a no-op once
/// unbounded. Padded because the counter sits between a requesting thread
/// and a delivering worker.
#[derive(Debug, Default)]
pub struct Demand {
    pending: CachePadded<AtomicI64>,
}

impl Demand {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` to the pending demand, saturating at unbounded.
    pub fn add(&self, n: i64) {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return;
            }
            let next = current.saturating_add(n);
            match self.pending.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => current = observed,
            }
        }
    }

    /// Consume one unit of demand. Returns `false` when none is pending.
    pub fn try_consume_one(&self) -> bool {
        let mut current = self.pending.load(Ordering::Acquire);
        loop {
            if current == UNBOUNDED {
                return true;
            }
            if current == 0 {
                return false;
            }
            match self.pending.compare_exchange_weak(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(observed) => current = observed,
            }
        }
    }

    pub fn pending(&self) -> i64 {
        self.pending.load(Ordering::Acquire)
    }

    pub fn is_unbounded(&self) -> bool {
        self.pending() == UNBOUNDED
    }
}
