//! Pre-allocated circular slot storage.
//!
//! The buffer owns every slot for its whole lifetime; producers mutate a slot
//! between claim and publish, consumers read it between publish and wrap.
//! All coordination lives in the sequencer, so the buffer itself is nothing
//! more than an indexed array with interior mutability.

use std::cell::UnsafeCell;

use crate::config::MAX_BUFFER_SIZE;
use crate::error::{Result, RingError};

pub fn is_power_of_two(n: usize) -> bool {
    n != 0 && (n & (n - 1)) == 0
}

pub(crate) fn validate_buffer_size(buffer_size: usize) -> Result<()> {
    if !is_power_of_two(buffer_size) {
        return Err(RingError::InvalidArgument(format!(
            "buffer size must be a power of two, got {buffer_size}"
        )));
    }
    if buffer_size > MAX_BUFFER_SIZE {
        return Err(RingError::InvalidArgument(format!(
            "buffer size must not exceed {MAX_BUFFER_SIZE}, got {buffer_size}"
        )));
    }
    Ok(())
}

/// Fixed-size power-of-two slot array indexed by `sequence & (size - 1)`.
pub struct RingBuffer<T> {
    slots: Box<[UnsafeCell<T>]>,
    index_mask: i64,
}

impl<T> RingBuffer<T> {
    /// Allocate the buffer, filling every slot from `factory`.
    pub fn new<F>(buffer_size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut() -> T,
    {
        validate_buffer_size(buffer_size)?;
        let slots: Box<[UnsafeCell<T>]> =
            (0..buffer_size).map(|_| UnsafeCell::new(factory())).collect();
        Ok(Self {
            slots,
            index_mask: (buffer_size - 1) as i64,
        })
    }

    #[inline]
    pub fn buffer_size(&self) -> usize {
        self.slots.len()
    }

    /// Shared read of the slot at `sequence`.
    ///
    /// # Safety
    /// The sequence must be published and not yet wrapped, so no producer is
    /// concurrently writing the slot.
    #[inline]
    pub unsafe fn slot(&self, sequence: i64) -> &T {
        let index = (sequence & self.index_mask) as usize;
        &*self.slots.get_unchecked(index).get()
    }

    /// Exclusive write access to the slot at `sequence`.
    ///
    /// # Safety
    /// The caller must hold the claim on `sequence` (between `next` and
    /// `publish`), which is what guarantees no other reference exists.
    #[inline]
    pub unsafe fn slot_mut(&self, sequence: i64) -> &mut T {
        let index = (sequence & self.index_mask) as usize;
        &mut *self.slots.get_unchecked(index).get()
    }
}

// SAFETY: slots are UnsafeCell, but every access is mediated by the
// sequencer's claim/publish protocol: a slot is written only by the thread
// holding the claim on its sequence, and read only after the release-store
// publish that hands it over.
unsafe impl<T: Send + Sync> Send for RingBuffer<T> {}
unsafe impl<T: Send + Sync> Sync for RingBuffer<T> {}

impl<T> std::fmt::Debug for RingBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingBuffer")
            .field("buffer_size", &self.buffer_size())
            .finish()
    }
}

/// Lock-guarded buffer with the same publish/consume contract, for targets
/// where the `UnsafeCell` buffer cannot be used. Not lock-free; every
/// invariant of [`RingBuffer`] still holds.
#[cfg(feature = "locked-ring-buffer")]
pub struct LockedRingBuffer<T> {
    slots: parking_lot::RwLock<Vec<T>>,
    index_mask: i64,
}

#[cfg(feature = "locked-ring-buffer")]
impl<T> LockedRingBuffer<T> {
    pub fn new<F>(buffer_size: usize, mut factory: F) -> Result<Self>
    where
        F: FnMut() -> T,
    {
        validate_buffer_size(buffer_size)?;
        Ok(Self {
            slots: parking_lot::RwLock::new((0..buffer_size).map(|_| factory()).collect()),
            index_mask: (buffer_size - 1) as i64,
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.slots.read().len()
    }

    pub fn read<R>(&self, sequence: i64, f: impl FnOnce(&T) -> R) -> R {
        let slots = self.slots.read();
        f(&slots[(sequence & self.index_mask) as usize])
    }

    pub fn write<R>(&self, sequence: i64, f: impl FnOnce(&mut T) -> R) -> R {
        let mut slots = self.slots.write();
        f(&mut slots[(sequence & self.index_mask) as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_power_of_two_sizes() {
        for size in [0usize, 3, 5, 1023] {
            assert!(matches!(
                RingBuffer::<i64>::new(size, || 0),
                Err(RingError::InvalidArgument(_))
            ));
        }
    }

    #[test]
    fn accepts_single_slot_buffer() {
        let buffer = RingBuffer::new(1, || 7i64).unwrap();
        assert_eq!(buffer.buffer_size(), 1);
        unsafe {
            *buffer.slot_mut(0) = 11;
            assert_eq!(*buffer.slot(0), 11);
            // Sequence 8 maps back onto the same slot.
            assert_eq!(*buffer.slot(8), 11);
        }
    }

    #[test]
    fn sequences_wrap_onto_slots() {
        let buffer = RingBuffer::new(8, || 0i64).unwrap();
        unsafe {
            for seq in 0..8i64 {
                *buffer.slot_mut(seq) = seq;
            }
            for seq in 0..8i64 {
                assert_eq!(*buffer.slot(seq + 8), seq);
            }
            *buffer.slot_mut(9) = 99;
            assert_eq!(*buffer.slot(1), 99);
        }
    }

    #[test]
    fn is_power_of_two_matches_definition() {
        assert!(is_power_of_two(1));
        assert!(is_power_of_two(2));
        assert!(is_power_of_two(1024));
        assert!(!is_power_of_two(0));
        assert!(!is_power_of_two(6));
    }

    #[cfg(feature = "locked-ring-buffer")]
    #[test]
    fn locked_buffer_round_trip() {
        let buffer = LockedRingBuffer::new(4, || 0i64).unwrap();
        buffer.write(2, |slot| *slot = 42);
        assert_eq!(buffer.read(2, |slot| *slot), 42);
        assert_eq!(buffer.read(6, |slot| *slot), 42);
    }
}
