//! Atomic sequence counters used to name positions in the ring buffer.
//!
//! A `Sequence` is the only cross-thread mutable state in the runtime: the
//! producer cursor, each consumer's tracked position and the shared work
//! sequence are all instances of it. The value is padded to a cache line so
//! that two sequences updated by different threads never share one.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

/// Initial value of every sequence: nothing claimed, nothing published.
pub const INITIAL_CURSOR_VALUE: i64 = -1;

/// Value a consumer parks its sequence at while leaving the gating set, so a
/// concurrent producer overtake check can never observe a stale low value.
pub const DONE_MARKER: i64 = i64::MAX;

const CACHE_LINE_SIZE: usize = 64;

/// A cache-line padded, atomically updated 64-bit sequence counter.
#[repr(align(64))]
pub struct Sequence {
    value: AtomicI64,
    _padding: [u8; CACHE_LINE_SIZE - std::mem::size_of::<AtomicI64>()],
}

impl Sequence {
    pub fn new(initial_value: i64) -> Self {
        Self {
            value: AtomicI64::new(initial_value),
            _padding: [0; CACHE_LINE_SIZE - std::mem::size_of::<AtomicI64>()],
        }
    }

    /// Read the current value with acquire semantics.
    #[inline]
    pub fn get(&self) -> i64 {
        self.value.load(Ordering::Acquire)
    }

    /// Store a value with release semantics.
    #[inline]
    pub fn set(&self, value: i64) {
        self.value.store(value, Ordering::Release);
    }

    /// Relaxed read for the single-producer fast path, where the value is
    /// only ever written by the calling thread.
    #[inline]
    pub(crate) fn get_relaxed(&self) -> i64 {
        self.value.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn compare_and_set(&self, expected: i64, new: i64) -> bool {
        self.value
            .compare_exchange(expected, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn increment_and_get(&self) -> i64 {
        self.value.fetch_add(1, Ordering::AcqRel) + 1
    }

    #[inline]
    pub fn add_and_get(&self, increment: i64) -> i64 {
        self.value.fetch_add(increment, Ordering::AcqRel) + increment
    }

    /// Minimum over a set of sequences, or `default` when the set is empty.
    pub fn minimum(sequences: &[Arc<Sequence>], default: i64) -> i64 {
        sequences
            .iter()
            .map(|s| s.get())
            .min()
            .unwrap_or(default)
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new(INITIAL_CURSOR_VALUE)
    }
}

impl std::fmt::Debug for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sequence").field("value", &self.get()).finish()
    }
}

impl std::fmt::Display for Sequence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.get())
    }
}

/// The gating set: consumer sequences a producer must not overtake.
///
/// Removal protocol: the departing consumer first sets its sequence to
/// [`DONE_MARKER`], then removes it here. A producer racing with the removal
/// either sees the marker (never gating) or no longer sees the entry at all.
#[derive(Debug, Default)]
pub struct SequenceGroup {
    sequences: RwLock<Vec<Arc<Sequence>>>,
}

impl SequenceGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, sequence: Arc<Sequence>) {
        self.sequences.write().push(sequence);
    }

    pub fn remove(&self, sequence: &Arc<Sequence>) -> bool {
        let mut sequences = self.sequences.write();
        if let Some(pos) = sequences.iter().position(|s| Arc::ptr_eq(s, sequence)) {
            sequences.remove(pos);
            true
        } else {
            false
        }
    }

    /// Minimum tracked sequence, or `default` when no consumer is registered.
    pub fn minimum(&self, default: i64) -> i64 {
        Sequence::minimum(&self.sequences.read(), default)
    }

    pub fn len(&self) -> usize {
        self.sequences.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sequences.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn sequence_starts_at_initial_cursor_value() {
        assert_eq!(Sequence::default().get(), INITIAL_CURSOR_VALUE);
    }

    #[test]
    fn sequence_set_get_round_trip() {
        let seq = Sequence::new(0);
        seq.set(100);
        assert_eq!(seq.get(), 100);
    }

    #[test]
    fn sequence_increment_and_add() {
        let seq = Sequence::new(10);
        assert_eq!(seq.increment_and_get(), 11);
        assert_eq!(seq.add_and_get(5), 16);
        assert_eq!(seq.get(), 16);
    }

    #[test]
    fn sequence_compare_and_set() {
        let seq = Sequence::new(10);
        assert!(seq.compare_and_set(10, 20));
        assert_eq!(seq.get(), 20);
        assert!(!seq.compare_and_set(10, 30));
        assert_eq!(seq.get(), 20);
    }

    #[test]
    fn minimum_of_empty_set_is_default() {
        assert_eq!(Sequence::minimum(&[], 42), 42);
    }

    #[test]
    fn sequence_group_tracks_minimum() {
        let group = SequenceGroup::new();
        assert!(group.is_empty());

        let a = Arc::new(Sequence::new(10));
        let b = Arc::new(Sequence::new(5));
        group.add(a.clone());
        group.add(b.clone());

        assert_eq!(group.len(), 2);
        assert_eq!(group.minimum(i64::MAX), 5);

        assert!(group.remove(&b));
        assert_eq!(group.minimum(i64::MAX), 10);
        assert!(!group.remove(&b));
    }

    #[test]
    fn departing_consumer_never_lowers_the_minimum() {
        let group = SequenceGroup::new();
        let leaving = Arc::new(Sequence::new(3));
        let staying = Arc::new(Sequence::new(7));
        group.add(leaving.clone());
        group.add(staying);

        leaving.set(DONE_MARKER);
        assert_eq!(group.minimum(i64::MAX), 7);
        group.remove(&leaving);
        assert_eq!(group.minimum(i64::MAX), 7);
    }

    #[test]
    fn concurrent_increments_are_not_lost() {
        let seq = Arc::new(Sequence::new(0));
        let mut handles = vec![];
        for _ in 0..8 {
            let seq = Arc::clone(&seq);
            handles.push(thread::spawn(move || {
                for _ in 0..1000 {
                    seq.increment_and_get();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(seq.get(), 8000);
    }
}
