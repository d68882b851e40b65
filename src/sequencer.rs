//! Claim/publish coordination between producers and the ring buffer.
//!
//! Two variants share one trait: a single-producer sequencer whose claims are
//! uncontended, and a multi-producer sequencer that arbitrates claims with a
//! CAS loop and tracks per-slot availability so the cursor only ever exposes
//! the longest contiguous prefix of fully published sequences.

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, Ordering};
use std::sync::Arc;
use std::thread;

use crossbeam_utils::CachePadded;

use crate::error::{Result, RingError};
use crate::ring_buffer::validate_buffer_size;
use crate::sequence::{Sequence, SequenceGroup, INITIAL_CURSOR_VALUE};
use crate::sequence_barrier::SequenceBarrier;
use crate::wait_strategy::WaitStrategy;

/// Coordinates sequence allocation between producers and the gating set of
/// consumer sequences.
pub trait Sequencer: Send + Sync + std::fmt::Debug {
    /// The producer cursor: the highest sequence guaranteed published.
    fn cursor(&self) -> Arc<Sequence>;

    fn buffer_size(&self) -> usize;

    fn wait_strategy(&self) -> Arc<dyn WaitStrategy>;

    /// Claim the next `n` sequences, spinning while the buffer is full.
    ///
    /// # Errors
    /// `InvalidArgument` when `n < 1` or `n` exceeds the buffer size;
    /// `Alert` once the sequencer has been halted.
    fn next(&self, n: i64) -> Result<i64>;

    /// Claim the next `n` sequences without blocking.
    ///
    /// # Errors
    /// `InsufficientCapacity` when the claim would overtake the slowest
    /// consumer; otherwise as [`Sequencer::next`].
    fn try_next(&self, n: i64) -> Result<i64>;

    /// Make `sequence` (and everything claimed below it by this producer)
    /// visible to consumers.
    fn publish(&self, sequence: i64);

    fn publish_range(&self, low: i64, high: i64);

    /// Whether `sequence` has been published and not yet wrapped.
    fn is_available(&self, sequence: i64) -> bool;

    /// Highest sequence in `[next_sequence, available_sequence]` such that
    /// every sequence up to it is published.
    fn highest_published(&self, next_sequence: i64, available_sequence: i64) -> i64;

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]);

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool;

    /// Minimum over the gating set, falling back to the producer position
    /// when no consumer is registered.
    fn minimum_gating(&self) -> i64;

    fn remaining_capacity(&self) -> i64;

    /// Permanently refuse further claims with `Alert`. Used when the last
    /// subscriber of an auto-cancelling processor leaves.
    fn halt(&self);

    fn is_halted(&self) -> bool;
}

/// Build a consumer barrier over a sequencer's cursor.
pub fn barrier_for(
    sequencer: Arc<dyn Sequencer>,
    dependents: Vec<Arc<Sequence>>,
) -> SequenceBarrier {
    SequenceBarrier::new(
        sequencer.cursor(),
        dependents,
        sequencer.wait_strategy(),
        sequencer,
    )
}

fn validate_claim(n: i64, buffer_size: usize) -> Result<()> {
    if n < 1 {
        return Err(RingError::InvalidArgument(format!(
            "claim count must be positive, got {n}"
        )));
    }
    if n > buffer_size as i64 {
        return Err(RingError::InvalidArgument(format!(
            "cannot claim {n} sequences from a buffer of {buffer_size}"
        )));
    }
    Ok(())
}

/// Sequencer for exactly one publishing thread.
///
/// Claims are uncontended: the claimed position is only ever advanced by the
/// owning producer, and `publish` moves the cursor with a release store.
#[derive(Debug)]
pub struct SingleProducerSequencer {
    buffer_size: usize,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    claimed: Sequence,
    gating: SequenceGroup,
    cached_gating: CachePadded<AtomicI64>,
    halted: AtomicBool,
}

impl SingleProducerSequencer {
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        debug_assert!(validate_buffer_size(buffer_size).is_ok());
        Self {
            buffer_size,
            wait_strategy,
            cursor: Arc::new(Sequence::default()),
            claimed: Sequence::default(),
            gating: SequenceGroup::new(),
            cached_gating: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
            halted: AtomicBool::new(false),
        }
    }

    fn has_capacity(&self, wrap_point: i64, current: i64) -> bool {
        let cached = self.cached_gating.load(Ordering::Acquire);
        if wrap_point > cached {
            let min = self.gating.minimum(current);
            self.cached_gating.store(min, Ordering::Release);
            return wrap_point <= min;
        }
        true
    }
}

impl Sequencer for SingleProducerSequencer {
    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        Arc::clone(&self.wait_strategy)
    }

    fn next(&self, n: i64) -> Result<i64> {
        validate_claim(n, self.buffer_size)?;
        if self.is_halted() {
            return Err(RingError::Alert);
        }

        let current = self.claimed.get_relaxed();
        let next = current + n;
        let wrap_point = next - self.buffer_size as i64;

        let mut spins = 0u32;
        while !self.has_capacity(wrap_point, current) {
            if self.is_halted() {
                return Err(RingError::Alert);
            }
            if spins < 100 {
                spins += 1;
                std::hint::spin_loop();
            } else {
                thread::yield_now();
            }
        }

        self.claimed.set(next);
        Ok(next)
    }

    fn try_next(&self, n: i64) -> Result<i64> {
        validate_claim(n, self.buffer_size)?;
        if self.is_halted() {
            return Err(RingError::Alert);
        }

        let current = self.claimed.get_relaxed();
        let next = current + n;
        if !self.has_capacity(next - self.buffer_size as i64, current) {
            return Err(RingError::InsufficientCapacity);
        }

        self.claimed.set(next);
        Ok(next)
    }

    fn publish(&self, sequence: i64) {
        self.cursor.set(sequence);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, _low: i64, high: i64) {
        self.publish(high);
    }

    fn is_available(&self, sequence: i64) -> bool {
        sequence <= self.cursor.get()
    }

    fn highest_published(&self, _next_sequence: i64, available_sequence: i64) -> i64 {
        available_sequence
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        for sequence in sequences {
            self.gating.add(Arc::clone(sequence));
        }
        self.cached_gating
            .store(self.minimum_gating(), Ordering::Release);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let removed = self.gating.remove(sequence);
        if removed {
            self.cached_gating
                .store(self.minimum_gating(), Ordering::Release);
        }
        removed
    }

    fn minimum_gating(&self) -> i64 {
        self.gating.minimum(self.claimed.get())
    }

    fn remaining_capacity(&self) -> i64 {
        let consumed = self.minimum_gating();
        let produced = self.claimed.get();
        self.buffer_size as i64 - (produced - consumed)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}

/// Sequencer for any number of concurrent publishing threads.
///
/// Claims are arbitrated with a CAS loop on a shared claim sequence (the
/// capacity check runs inside the loop, so two producers can never jointly
/// over-claim). A per-slot availability array records the wrap count of the
/// latest publish; the cursor is advanced over the longest contiguous
/// published prefix, so consumers waiting on the cursor never observe an
/// unpublished sequence.
#[derive(Debug)]
pub struct MultiProducerSequencer {
    buffer_size: usize,
    wait_strategy: Arc<dyn WaitStrategy>,
    cursor: Arc<Sequence>,
    claimed: Sequence,
    gating: SequenceGroup,
    cached_gating: CachePadded<AtomicI64>,
    available: Box<[AtomicI32]>,
    index_mask: usize,
    index_shift: u32,
    halted: AtomicBool,
}

impl MultiProducerSequencer {
    pub fn new(buffer_size: usize, wait_strategy: Arc<dyn WaitStrategy>) -> Self {
        debug_assert!(validate_buffer_size(buffer_size).is_ok());
        let available: Box<[AtomicI32]> =
            (0..buffer_size).map(|_| AtomicI32::new(-1)).collect();
        Self {
            buffer_size,
            wait_strategy,
            cursor: Arc::new(Sequence::default()),
            claimed: Sequence::default(),
            gating: SequenceGroup::new(),
            cached_gating: CachePadded::new(AtomicI64::new(INITIAL_CURSOR_VALUE)),
            available,
            index_mask: buffer_size - 1,
            index_shift: buffer_size.trailing_zeros(),
            halted: AtomicBool::new(false),
        }
    }

    #[inline]
    fn availability_flag(&self, sequence: i64) -> i32 {
        (sequence >> self.index_shift) as i32
    }

    fn set_available(&self, sequence: i64) {
        let index = (sequence as usize) & self.index_mask;
        self.available[index].store(self.availability_flag(sequence), Ordering::Release);
    }

    fn is_published(&self, sequence: i64) -> bool {
        let index = (sequence as usize) & self.index_mask;
        self.available[index].load(Ordering::Acquire) == self.availability_flag(sequence)
    }

    /// Advance the cursor over every contiguously published sequence.
    fn advance_cursor(&self) {
        loop {
            let current = self.cursor.get();
            let mut next = current;
            while self.is_published(next + 1) {
                next += 1;
            }
            if next == current || self.cursor.compare_and_set(current, next) {
                return;
            }
            // Lost the race to another publisher; rescan from its cursor.
        }
    }

    fn check_capacity(&self, wrap_point: i64, current: i64) -> bool {
        let cached = self.cached_gating.load(Ordering::Acquire);
        if wrap_point > cached {
            let min = self.gating.minimum(current);
            self.cached_gating.store(min, Ordering::Release);
            return wrap_point <= min;
        }
        true
    }
}

impl Sequencer for MultiProducerSequencer {
    fn cursor(&self) -> Arc<Sequence> {
        Arc::clone(&self.cursor)
    }

    fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn wait_strategy(&self) -> Arc<dyn WaitStrategy> {
        Arc::clone(&self.wait_strategy)
    }

    fn next(&self, n: i64) -> Result<i64> {
        validate_claim(n, self.buffer_size)?;

        let mut spins = 0u32;
        loop {
            if self.is_halted() {
                return Err(RingError::Alert);
            }
            let current = self.claimed.get();
            let next = current + n;
            let wrap_point = next - self.buffer_size as i64;

            if !self.check_capacity(wrap_point, current) {
                if self.is_halted() {
                    return Err(RingError::Alert);
                }
                if spins < 100 {
                    spins += 1;
                    std::hint::spin_loop();
                } else {
                    thread::yield_now();
                }
                continue;
            }

            if self.claimed.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn try_next(&self, n: i64) -> Result<i64> {
        validate_claim(n, self.buffer_size)?;

        loop {
            if self.is_halted() {
                return Err(RingError::Alert);
            }
            let current = self.claimed.get();
            let next = current + n;
            if !self.check_capacity(next - self.buffer_size as i64, current) {
                return Err(RingError::InsufficientCapacity);
            }
            if self.claimed.compare_and_set(current, next) {
                return Ok(next);
            }
        }
    }

    fn publish(&self, sequence: i64) {
        self.set_available(sequence);
        self.advance_cursor();
        self.wait_strategy.signal_all_when_blocking();
    }

    fn publish_range(&self, low: i64, high: i64) {
        for sequence in low..=high {
            self.set_available(sequence);
        }
        self.advance_cursor();
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_available(&self, sequence: i64) -> bool {
        self.is_published(sequence)
    }

    fn highest_published(&self, next_sequence: i64, available_sequence: i64) -> i64 {
        let mut sequence = next_sequence;
        while sequence <= available_sequence {
            if !self.is_published(sequence) {
                return sequence - 1;
            }
            sequence += 1;
        }
        available_sequence
    }

    fn add_gating_sequences(&self, sequences: &[Arc<Sequence>]) {
        for sequence in sequences {
            self.gating.add(Arc::clone(sequence));
        }
        self.cached_gating
            .store(self.minimum_gating(), Ordering::Release);
    }

    fn remove_gating_sequence(&self, sequence: &Arc<Sequence>) -> bool {
        let removed = self.gating.remove(sequence);
        if removed {
            self.cached_gating
                .store(self.minimum_gating(), Ordering::Release);
        }
        removed
    }

    fn minimum_gating(&self) -> i64 {
        self.gating.minimum(self.cursor.get())
    }

    fn remaining_capacity(&self) -> i64 {
        let consumed = self.minimum_gating();
        let produced = self.claimed.get();
        self.buffer_size as i64 - (produced - consumed)
    }

    fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.wait_strategy.signal_all_when_blocking();
    }

    fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }
}
