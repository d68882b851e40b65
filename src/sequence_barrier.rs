//! Coordination point between one consumer and the producer cursor.

use std::sync::atomic::{fence, AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Result, RingError};
use crate::sequence::Sequence;
use crate::sequencer::Sequencer;
use crate::wait_strategy::WaitStrategy;

/// One-shot cancellation/shutdown flag threaded through wait loops.
///
/// Raising the signal does not wake blocked waiters by itself; the owner of
/// the signal (the barrier) pairs `set` with the strategy's
/// `signal_all_when_blocking`.
#[derive(Debug, Default)]
pub struct AlertSignal {
    flag: AtomicBool,
}

impl AlertSignal {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn set(&self) {
        self.flag.store(true, Ordering::Release);
    }

    #[inline]
    pub fn clear(&self) {
        self.flag.store(false, Ordering::Release);
    }

    #[inline]
    pub fn is_set(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Fail with [`RingError::Alert`] when the signal is raised.
    #[inline]
    pub fn check(&self) -> Result<()> {
        if self.is_set() {
            Err(RingError::Alert)
        } else {
            Ok(())
        }
    }
}

/// Barrier a consumer waits on to discover newly published sequences.
///
/// Holds non-owning references to the producer cursor and to any dependent
/// consumer sequences; the processor owns its tracked sequence and a handle
/// to this barrier, so no reference cycle exists.
pub struct SequenceBarrier {
    cursor: Arc<Sequence>,
    dependents: Vec<Arc<Sequence>>,
    wait_strategy: Arc<dyn WaitStrategy>,
    alert: AlertSignal,
    sequencer: Arc<dyn Sequencer>,
}

impl SequenceBarrier {
    pub(crate) fn new(
        cursor: Arc<Sequence>,
        dependents: Vec<Arc<Sequence>>,
        wait_strategy: Arc<dyn WaitStrategy>,
        sequencer: Arc<dyn Sequencer>,
    ) -> Self {
        Self {
            cursor,
            dependents,
            wait_strategy,
            alert: AlertSignal::new(),
            sequencer,
        }
    }

    /// Wait until `sequence` is available.
    ///
    /// Returns the highest contiguously published sequence `>= sequence`, or
    /// a smaller value when dependent consumers lag behind the cursor (the
    /// caller re-waits). Fails with [`RingError::Alert`] once the barrier is
    /// alerted; after that point no further value is returned until the
    /// alert is cleared.
    pub fn wait_for(&self, sequence: i64) -> Result<i64> {
        self.alert.check()?;

        let mut available = self
            .wait_strategy
            .wait_for(sequence, &self.cursor, &self.alert)?;

        self.alert.check()?;

        // Pair with the producer's release store on publish before touching
        // slot contents.
        fence(Ordering::Acquire);

        if !self.dependents.is_empty() {
            available = available.min(Sequence::minimum(&self.dependents, available));
        }

        if available < sequence {
            return Ok(available);
        }

        Ok(self.sequencer.highest_published(sequence, available))
    }

    pub fn cursor_value(&self) -> i64 {
        self.cursor.get()
    }

    /// Raise the alert and wake any blocked waiter.
    pub fn alert(&self) {
        self.alert.set();
        self.wait_strategy.signal_all_when_blocking();
    }

    pub fn clear_alert(&self) {
        self.alert.clear();
    }

    pub fn is_alerted(&self) -> bool {
        self.alert.is_set()
    }

    pub fn check_alert(&self) -> Result<()> {
        self.alert.check()
    }
}

impl std::fmt::Debug for SequenceBarrier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SequenceBarrier")
            .field("cursor", &self.cursor.get())
            .field("dependents", &self.dependents.len())
            .field("alerted", &self.alert.is_set())
            .finish()
    }
}
