//! Wait strategies: how a consumer idles until its target sequence is
//! published.
//!
//! Every strategy checks the barrier's alert signal on each iteration of its
//! wait loop, so cancellation and shutdown are observed promptly no matter
//! how the strategy idles.

use std::sync::{Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::Result;
use crate::sequence::Sequence;
use crate::sequence_barrier::AlertSignal;

/// Policy deciding how a consumer waits for the cursor to reach a target
/// sequence.
///
/// `wait_for` returns the highest sequence currently visible on the cursor,
/// which may be greater than the requested one; callers consume the whole
/// range as a batch. It returns `RingError::Alert` as soon as the alert
/// signal is raised.
pub trait WaitStrategy: Send + Sync + std::fmt::Debug {
    /// Block, yield or spin until `cursor >= sequence` or the barrier is
    /// alerted.
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64>;

    /// Wake all blocked waiters. Only meaningful for strategies that park on
    /// a condition variable; the default is a no-op.
    fn signal_all_when_blocking(&self) {}
}

/// Condvar-based strategy: lowest CPU use, highest wake-up latency.
///
/// Producers call `signal_all_when_blocking` on every publish. The wait is
/// re-checked on a short timeout so a missed signal can never stall a
/// consumer for long.
#[derive(Debug, Default)]
pub struct BlockingWaitStrategy {
    mutex: Mutex<()>,
    condvar: Condvar,
}

impl BlockingWaitStrategy {
    pub fn new() -> Self {
        Self::default()
    }
}

impl WaitStrategy for BlockingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64> {
        let mut available = cursor.get();
        if available >= sequence {
            return Ok(available);
        }

        let mut guard = self.mutex.lock().expect("wait strategy mutex poisoned");
        loop {
            alert.check()?;
            available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            let (next_guard, _timeout) = self
                .condvar
                .wait_timeout(guard, Duration::from_millis(1))
                .expect("wait strategy mutex poisoned");
            guard = next_guard;
        }
    }

    fn signal_all_when_blocking(&self) {
        let _guard = self.mutex.lock().expect("wait strategy mutex poisoned");
        self.condvar.notify_all();
    }
}

/// Tight spin loop. Lowest latency, pins a core; use only when a core can be
/// dedicated to the consumer.
#[derive(Debug, Default)]
pub struct BusySpinWaitStrategy;

impl BusySpinWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for BusySpinWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64> {
        let mut available;
        loop {
            available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;
            std::hint::spin_loop();
        }
    }
}

/// Spin a bounded number of tries, then yield the thread each iteration.
/// The balanced default for consumers that share cores.
#[derive(Debug, Default)]
pub struct YieldingWaitStrategy;

const SPIN_TRIES: u32 = 100;

impl YieldingWaitStrategy {
    pub fn new() -> Self {
        Self
    }
}

impl WaitStrategy for YieldingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64> {
        let mut counter = SPIN_TRIES;
        let mut available;
        loop {
            available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;
            if counter == 0 {
                thread::yield_now();
            } else {
                counter -= 1;
            }
        }
    }
}

/// Spin, then yield, then sleep a short fixed interval between checks.
#[derive(Debug)]
pub struct SleepingWaitStrategy {
    retries: u32,
    sleep_interval: Duration,
}

impl SleepingWaitStrategy {
    pub fn new() -> Self {
        Self::with_interval(Duration::from_micros(100))
    }

    pub fn with_interval(sleep_interval: Duration) -> Self {
        Self {
            retries: 200,
            sleep_interval,
        }
    }
}

impl Default for SleepingWaitStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl WaitStrategy for SleepingWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64> {
        let mut counter = self.retries;
        let mut available;
        loop {
            available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;
            if counter > 100 {
                counter -= 1;
                std::hint::spin_loop();
            } else if counter > 0 {
                counter -= 1;
                thread::yield_now();
            } else {
                thread::sleep(self.sleep_interval);
            }
        }
    }
}

/// Time-bounded spin, then yield, then fall back to a delegate strategy.
///
/// Gives the low-latency behavior of spinning for bursts that resolve
/// quickly while bounding CPU burn on long stalls.
#[derive(Debug)]
pub struct PhasedBackoffWaitStrategy {
    spin_for: Duration,
    yield_for: Duration,
    fallback: Box<dyn WaitStrategy>,
}

impl PhasedBackoffWaitStrategy {
    pub fn new(spin_for: Duration, yield_for: Duration, fallback: Box<dyn WaitStrategy>) -> Self {
        Self {
            spin_for,
            yield_for,
            fallback,
        }
    }

    /// Spin 10 µs, yield for a further 100 µs, then block.
    pub fn with_blocking_fallback() -> Self {
        Self::new(
            Duration::from_micros(10),
            Duration::from_micros(100),
            Box::new(BlockingWaitStrategy::new()),
        )
    }
}

impl WaitStrategy for PhasedBackoffWaitStrategy {
    fn wait_for(&self, sequence: i64, cursor: &Sequence, alert: &AlertSignal) -> Result<i64> {
        let start = Instant::now();
        let yield_deadline = self.spin_for + self.yield_for;
        let mut available;
        loop {
            available = cursor.get();
            if available >= sequence {
                return Ok(available);
            }
            alert.check()?;

            let elapsed = start.elapsed();
            if elapsed < self.spin_for {
                std::hint::spin_loop();
            } else if elapsed < yield_deadline {
                thread::yield_now();
            } else {
                return self.fallback.wait_for(sequence, cursor, alert);
            }
        }
    }

    fn signal_all_when_blocking(&self) {
        self.fallback.signal_all_when_blocking();
    }
}
