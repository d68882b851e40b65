//! Slot payload for the processor ring buffers.
//!
//! A slot carries either a value or a terminal sentinel. Terminal signals
//! travel through the buffer like any other publish, so consumers observe
//! them strictly after every preceding value.

use crate::error::RingError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SignalKind {
    #[default]
    Next,
    Complete,
    Error,
}

/// One ring-buffer slot. Reused across wraps; the producer overwrites it at
/// claim time and consumers read it between publish and wrap.
#[derive(Debug)]
pub struct Signal<T> {
    pub(crate) kind: SignalKind,
    pub(crate) value: Option<T>,
    pub(crate) error: Option<RingError>,
    /// Delivery attempts already made, for the work processor's retry
    /// envelope. Zero on first publish.
    pub(crate) attempts: u32,
}

impl<T> Signal<T> {
    pub(crate) fn set_next(&mut self, value: T) {
        self.kind = SignalKind::Next;
        self.value = Some(value);
        self.error = None;
        self.attempts = 0;
    }

    pub(crate) fn set_retry(&mut self, value: T, attempts: u32) {
        self.kind = SignalKind::Next;
        self.value = Some(value);
        self.error = None;
        self.attempts = attempts;
    }

    pub(crate) fn set_complete(&mut self) {
        self.kind = SignalKind::Complete;
        self.value = None;
        self.error = None;
        self.attempts = 0;
    }

    pub(crate) fn set_error(&mut self, error: RingError) {
        self.kind = SignalKind::Error;
        self.value = None;
        self.error = Some(error);
        self.attempts = 0;
    }
}

impl<T> Default for Signal<T> {
    fn default() -> Self {
        Self {
            kind: SignalKind::Next,
            value: None,
            error: None,
            attempts: 0,
        }
    }
}
