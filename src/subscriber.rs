//! The reactive-streams surface: publishers, subscribers and subscriptions.

use std::sync::Arc;

use crate::error::Result;

/// The per-subscriber demand channel handed out by `on_subscribe`.
pub trait Subscription: Send + Sync {
    /// Request `n` more elements. `n <= 0` is a protocol violation routed to
    /// the subscriber's `on_error`; `i64::MAX` means unbounded and is sticky.
    fn request(&self, n: i64);

    /// Stop delivery. Idempotent; at most one in-flight `on_next` may still
    /// arrive after this returns.
    fn cancel(&self);
}

/// A consumer of a stream of values.
///
/// Callbacks run on the processor's worker thread, one at a time, in strict
/// sequence order: `on_subscribe` first, then any number of `on_next`, then
/// at most one terminal signal.
pub trait Subscriber<T>: Send + 'static {
    /// Called exactly once before any other signal.
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>);

    /// Deliver one element. An `Err` marks the delivery as failed: the work
    /// processor hands the element to a peer, the subscriber barrier cancels
    /// upstream and routes the failure to `on_error`.
    fn on_next(&mut self, value: T) -> Result<()>;

    /// Terminal failure; no further signals follow.
    fn on_error(&mut self, error: crate::error::RingError);

    /// Terminal completion; no further signals follow.
    fn on_complete(&mut self);

    /// Capacity this consumer advertises to upstream flow control.
    /// Unbounded by default.
    fn capacity(&self) -> i64 {
        i64::MAX
    }
}

/// A source that pushes values to subscribers under the demand protocol.
pub trait Publisher<T> {
    /// Attach a subscriber. `on_subscribe` is invoked exactly once before
    /// any data signal.
    fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()>;
}

impl<T: 'static> Subscriber<T> for Box<dyn Subscriber<T>> {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        (**self).on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        (**self).on_next(value)
    }

    fn on_error(&mut self, error: crate::error::RingError) {
        (**self).on_error(error);
    }

    fn on_complete(&mut self) {
        (**self).on_complete();
    }

    fn capacity(&self) -> i64 {
        (**self).capacity()
    }
}

/// Subscription that ignores demand and cancellation. Used to drive a
/// processor standalone, without a real upstream.
#[derive(Debug, Default)]
pub struct NoopSubscription;

impl Subscription for NoopSubscription {
    fn request(&self, _n: i64) {}

    fn cancel(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn noop_subscription_accepts_everything() {
        let subscription = NoopSubscription;
        subscription.request(-5);
        subscription.request(i64::MAX);
        subscription.cancel();
        subscription.cancel();
    }
}
