//! Adapter sitting between one publisher and one downstream subscriber,
//! enforcing the demand-protocol rules the downstream may not be trusted to
//! follow: one-shot subscription, exactly-once terminal signals, validated
//! demand and idempotent, serialized cancellation.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::backpressure::check_request;
use crate::error::{Result, RingError};
use crate::subscriber::{Subscriber, Subscription};

struct Inner<T, S> {
    downstream: Mutex<S>,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    subscribed: AtomicBool,
    terminated: AtomicBool,
    cancelled: AtomicBool,
    /// Error raised while the downstream lock was held by another signal;
    /// delivered at the next signal boundary.
    deferred_error: Mutex<Option<RingError>>,
    _marker: PhantomData<fn(T) -> T>,
}

/// Wraps a downstream subscriber and is handed back to it as its
/// [`Subscription`]. Signals are serialized on the downstream.
///
/// The processors install this adapter around every subscriber they attach,
/// so a failed delivery always cancels the subscription and reaches
/// `on_error` augmented with the offending value. The failure is also
/// returned to the delivering worker, which lets the work processor hand
/// the value to a peer.
pub struct SubscriberBarrier<T, S: Subscriber<T>> {
    inner: Arc<Inner<T, S>>,
}

impl<T, S: Subscriber<T>> Clone for SubscriberBarrier<T, S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T, S> SubscriberBarrier<T, S>
where
    T: Clone + std::fmt::Debug + Send + 'static,
    S: Subscriber<T>,
{
    pub fn new(downstream: S) -> Self {
        Self {
            inner: Arc::new(Inner {
                downstream: Mutex::new(downstream),
                upstream: Mutex::new(None),
                subscribed: AtomicBool::new(false),
                terminated: AtomicBool::new(false),
                cancelled: AtomicBool::new(false),
                deferred_error: Mutex::new(None),
                _marker: PhantomData,
            }),
        }
    }

    pub fn is_terminated(&self) -> bool {
        self.inner.terminated.load(Ordering::Acquire)
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    fn cancel_upstream(&self) {
        if let Some(upstream) = self.inner.upstream.lock().take() {
            upstream.cancel();
        }
    }

    /// Route a protocol failure downstream, exactly once. Falls back to a
    /// deferred slot when another signal currently holds the downstream.
    fn route_error(&self, error: RingError) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel_upstream();
        match self.inner.downstream.try_lock() {
            Some(mut downstream) => downstream.on_error(error),
            None => *self.inner.deferred_error.lock() = Some(error),
        }
    }

    fn flush_deferred(&self, downstream: &mut S) {
        if let Some(error) = self.inner.deferred_error.lock().take() {
            downstream.on_error(error);
        }
    }
}

impl<T, S> Subscriber<T> for SubscriberBarrier<T, S>
where
    T: Clone + std::fmt::Debug + Send + 'static,
    S: Subscriber<T>,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        if self.inner.subscribed.swap(true, Ordering::AcqRel) {
            // Second upstream: reject it and fail the stream.
            subscription.cancel();
            self.route_error(RingError::IllegalState(
                "on_subscribe called more than once".into(),
            ));
            return;
        }
        *self.inner.upstream.lock() = Some(subscription);
        let handle: Arc<dyn Subscription> = Arc::new(self.clone());
        self.inner.downstream.lock().on_subscribe(handle);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        let mut downstream = self.inner.downstream.lock();
        self.flush_deferred(&mut downstream);

        if self.inner.cancelled.load(Ordering::Acquire) {
            return Err(RingError::Cancel);
        }
        if self.inner.terminated.load(Ordering::Acquire) {
            return Err(RingError::Cancel);
        }

        let kept = value.clone();
        match downstream.on_next(value) {
            Ok(()) => Ok(()),
            // Control signals unwind upward untouched.
            Err(error) if error.is_control() => Err(error),
            Err(error) => {
                let routed = match error {
                    subscriber @ RingError::Subscriber { .. } => subscriber,
                    other => RingError::Subscriber {
                        message: other.to_string(),
                        value: None,
                    },
                }
                .with_value(format!("{kept:?}"));

                self.cancel_upstream();
                if !self.inner.terminated.swap(true, Ordering::AcqRel) {
                    downstream.on_error(routed.clone());
                }
                Err(routed)
            }
        }
    }

    fn on_error(&mut self, error: RingError) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.downstream.lock().on_error(error);
    }

    fn on_complete(&mut self) {
        if self.inner.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.downstream.lock().on_complete();
    }

    fn capacity(&self) -> i64 {
        self.inner.downstream.lock().capacity()
    }
}

impl<T, S> Subscription for SubscriberBarrier<T, S>
where
    T: Clone + std::fmt::Debug + Send + 'static,
    S: Subscriber<T>,
{
    fn request(&self, n: i64) {
        if let Err(error) = check_request(n) {
            self.route_error(error);
            return;
        }
        let upstream = self.inner.upstream.lock().clone();
        if let Some(upstream) = upstream {
            upstream.request(n);
        }
    }

    fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
        self.cancel_upstream();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicI64;

    #[derive(Default)]
    struct Recording {
        next: Vec<i64>,
        errors: Vec<RingError>,
        completes: usize,
        subscriptions: usize,
        fail_on: Option<i64>,
    }

    #[derive(Clone, Default)]
    struct RecordingSubscriber {
        state: Arc<Mutex<Recording>>,
    }

    impl Subscriber<i64> for RecordingSubscriber {
        fn on_subscribe(&mut self, _subscription: Arc<dyn Subscription>) {
            self.state.lock().subscriptions += 1;
        }

        fn on_next(&mut self, value: i64) -> Result<()> {
            let mut state = self.state.lock();
            if state.fail_on == Some(value) {
                return Err(RingError::Subscriber {
                    message: "handler refused value".into(),
                    value: None,
                });
            }
            state.next.push(value);
            Ok(())
        }

        fn on_error(&mut self, error: RingError) {
            self.state.lock().errors.push(error);
        }

        fn on_complete(&mut self) {
            self.state.lock().completes += 1;
        }
    }

    #[derive(Default)]
    struct CountingUpstream {
        requested: AtomicI64,
        cancels: AtomicI64,
    }

    impl Subscription for CountingUpstream {
        fn request(&self, n: i64) {
            self.requested.fetch_add(n, Ordering::SeqCst);
        }

        fn cancel(&self) {
            self.cancels.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn wired_barrier() -> (
        SubscriberBarrier<i64, RecordingSubscriber>,
        Arc<Mutex<Recording>>,
        Arc<CountingUpstream>,
    ) {
        let subscriber = RecordingSubscriber::default();
        let state = subscriber.state.clone();
        let mut barrier = SubscriberBarrier::new(subscriber);
        let upstream = Arc::new(CountingUpstream::default());
        barrier.on_subscribe(upstream.clone() as Arc<dyn Subscription>);
        (barrier, state, upstream)
    }

    #[test]
    fn forwards_signals_in_order() {
        let (mut barrier, state, _upstream) = wired_barrier();

        barrier.on_next(1).unwrap();
        barrier.on_next(2).unwrap();
        barrier.on_complete();

        let state = state.lock();
        assert_eq!(state.subscriptions, 1);
        assert_eq!(state.next, vec![1, 2]);
        assert_eq!(state.completes, 1);
        assert!(state.errors.is_empty());
    }

    #[test]
    fn second_on_subscribe_cancels_and_errors() {
        let (mut barrier, state, _upstream) = wired_barrier();

        let second = Arc::new(CountingUpstream::default());
        barrier.on_subscribe(second.clone() as Arc<dyn Subscription>);

        assert_eq!(second.cancels.load(Ordering::SeqCst), 1);
        let state = state.lock();
        assert_eq!(state.errors.len(), 1);
        assert!(matches!(state.errors[0], RingError::IllegalState(_)));
    }

    #[test]
    fn failed_delivery_cancels_upstream_and_routes_error_with_value() {
        let (mut barrier, state, upstream) = wired_barrier();
        state.lock().fail_on = Some(42);

        barrier.on_next(41).unwrap();
        let failure = barrier.on_next(42);

        // The augmented failure is returned to the delivering worker as
        // well as routed downstream.
        match failure {
            Err(RingError::Subscriber { value, .. }) => {
                assert_eq!(value.as_deref(), Some("42"));
            }
            other => panic!("unexpected delivery outcome: {other:?}"),
        }

        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 1);
        let state = state.lock();
        assert_eq!(state.next, vec![41]);
        assert_eq!(state.errors.len(), 1);
        match &state.errors[0] {
            RingError::Subscriber { value, .. } => assert_eq!(value.as_deref(), Some("42")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn cancel_signal_is_rethrown_not_routed() {
        #[derive(Default)]
        struct Cancelling {
            errors: Arc<AtomicI64>,
        }
        impl Subscriber<i64> for Cancelling {
            fn on_subscribe(&mut self, _s: Arc<dyn Subscription>) {}
            fn on_next(&mut self, _v: i64) -> Result<()> {
                Err(RingError::Cancel)
            }
            fn on_error(&mut self, _e: RingError) {
                self.errors.fetch_add(1, Ordering::SeqCst);
            }
            fn on_complete(&mut self) {}
        }

        let subscriber = Cancelling::default();
        let errors = subscriber.errors.clone();
        let mut barrier = SubscriberBarrier::new(subscriber);
        barrier.on_subscribe(Arc::new(CountingUpstream::default()) as Arc<dyn Subscription>);

        assert_eq!(barrier.on_next(1), Err(RingError::Cancel));
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn terminal_signals_are_delivered_exactly_once() {
        let (mut barrier, state, _upstream) = wired_barrier();

        barrier.on_complete();
        barrier.on_complete();
        barrier.on_error(RingError::InsufficientCapacity);

        let state = state.lock();
        assert_eq!(state.completes, 1);
        assert!(state.errors.is_empty());
    }

    #[test]
    fn invalid_request_routes_invalid_argument() {
        let (barrier, state, upstream) = wired_barrier();

        Subscription::request(&barrier, 0);

        let state = state.lock();
        assert_eq!(state.errors.len(), 1);
        assert!(matches!(state.errors[0], RingError::InvalidArgument(_)));
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 0);
        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn valid_request_forwards_upstream() {
        let (barrier, _state, upstream) = wired_barrier();
        Subscription::request(&barrier, 10);
        Subscription::request(&barrier, 5);
        assert_eq!(upstream.requested.load(Ordering::SeqCst), 15);
    }

    #[test]
    fn cancel_is_idempotent() {
        let (barrier, _state, upstream) = wired_barrier();

        Subscription::cancel(&barrier);
        Subscription::cancel(&barrier);

        assert_eq!(upstream.cancels.load(Ordering::SeqCst), 1);
        assert!(barrier.is_cancelled());
    }

    #[test]
    fn delivery_after_cancel_unwinds_with_cancel() {
        let (mut barrier, state, _upstream) = wired_barrier();
        Subscription::cancel(&barrier);
        assert_eq!(barrier.on_next(1), Err(RingError::Cancel));
        assert!(state.lock().next.is_empty());
    }
}
