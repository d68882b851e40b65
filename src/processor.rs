//! Types shared by the broadcast and work processors.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backpressure::Demand;
use crate::error::{Result, RingError};
use crate::subscriber::Subscriber;

/// Handler invoked for errors that cannot be delivered to any subscriber:
/// dead-lettered work items and worker-level failures.
pub type UncaughtHandler = Arc<dyn Fn(&RingError) + Send + Sync>;

/// Handler invoked exactly once when a shared service shuts down.
pub type ShutdownHandler = Box<dyn FnOnce() + Send>;

/// Dyn-safe processor surface the shared service drives.
pub trait Processor<T>: Send + Sync {
    /// Attach a boxed subscriber; `on_subscribe` fires exactly once before
    /// any data signal.
    fn subscribe_boxed(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()>;

    /// Publish one value into the ring.
    fn publish(&self, value: T) -> Result<()>;

    /// Publish the completion sentinel. Idempotent.
    fn complete(&self);

    /// Publish a terminal error sentinel. Idempotent with `complete`.
    fn error(&self, error: RingError);

    /// Live (not yet departed) subscribers.
    fn subscriber_count(&self) -> usize;

    fn set_uncaught_handler(&self, handler: UncaughtHandler);

    /// Join all worker threads that are not the calling thread.
    fn await_shutdown(&self);

    fn name(&self) -> &str;
}

/// Lifecycle of one event-processing worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ProcessorState {
    Idle = 0,
    Running = 1,
    Halted = 2,
}

/// Terminal outcome recorded by the publishing side, replayed to late
/// subscribers and to workers whose claim ran past the sentinel.
#[derive(Debug, Clone)]
pub(crate) enum Terminal {
    Complete,
    Error(RingError),
}

impl Terminal {
    pub(crate) fn deliver<T, S: Subscriber<T> + ?Sized>(&self, subscriber: &mut S) {
        match self {
            Terminal::Complete => subscriber.on_complete(),
            Terminal::Error(error) => subscriber.on_error(error.clone()),
        }
    }
}

/// Per-subscriber state shared between its subscription handle and the
/// worker thread delivering to it.
#[derive(Debug, Default)]
pub(crate) struct SubscriberLink {
    pub(crate) demand: Demand,
    pub(crate) cancelled: AtomicBool,
    /// Guards unregistration so a subscriber leaves the live count once,
    /// whether it cancelled or terminated.
    pub(crate) departed: AtomicBool,
    /// Protocol violation raised from a subscription call, delivered as
    /// `on_error` by the worker at the next loop boundary.
    pub(crate) pending_error: Mutex<Option<RingError>>,
    state: AtomicU8,
}

impl SubscriberLink {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    pub(crate) fn take_pending_error(&self) -> Option<RingError> {
        self.pending_error.lock().take()
    }

    pub(crate) fn fail(&self, error: RingError) {
        *self.pending_error.lock() = Some(error);
    }

    pub(crate) fn state(&self) -> ProcessorState {
        match self.state.load(Ordering::Acquire) {
            0 => ProcessorState::Idle,
            1 => ProcessorState::Running,
            _ => ProcessorState::Halted,
        }
    }

    pub(crate) fn set_state(&self, state: ProcessorState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_state_transitions() {
        let link = SubscriberLink::new();
        assert_eq!(link.state(), ProcessorState::Idle);
        link.set_state(ProcessorState::Running);
        assert_eq!(link.state(), ProcessorState::Running);
        link.set_state(ProcessorState::Halted);
        assert_eq!(link.state(), ProcessorState::Halted);
    }

    #[test]
    fn pending_error_is_taken_once() {
        let link = SubscriberLink::new();
        link.fail(RingError::InvalidArgument("bad demand".into()));
        assert!(link.take_pending_error().is_some());
        assert!(link.take_pending_error().is_none());
    }
}
