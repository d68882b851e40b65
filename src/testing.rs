//! Test doubles shared by the unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::error::{Result, RingError};
use crate::subscriber::{Subscriber, Subscription};

#[derive(Default)]
pub struct CollectedState {
    pub next: Vec<i64>,
    pub errors: Vec<RingError>,
    pub completes: usize,
    pub subscriptions: usize,
    pub subscription: Option<Arc<dyn Subscription>>,
}

type FailurePredicate = Box<dyn Fn(i64) -> bool + Send>;

/// Records every signal it receives; optionally refuses deliveries.
pub struct CollectingSubscriber {
    state: Arc<Mutex<CollectedState>>,
    initial_request: Option<i64>,
    fail_always: Option<FailurePredicate>,
    fail_first: Option<FailurePredicate>,
    seen: HashSet<i64>,
}

impl CollectingSubscriber {
    fn new(initial_request: Option<i64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CollectedState::default())),
            initial_request,
            fail_always: None,
            fail_first: None,
            seen: HashSet::new(),
        }
    }

    /// Requests unbounded demand on subscribe.
    pub fn unbounded() -> Self {
        Self::new(Some(i64::MAX))
    }

    /// Requests exactly `n` on subscribe; more only via the stored
    /// subscription handle.
    pub fn bounded(n: i64) -> Self {
        Self::new(Some(n))
    }

    /// Refuse matching values on every attempt.
    pub fn failing_always(mut self, predicate: impl Fn(i64) -> bool + Send + 'static) -> Self {
        self.fail_always = Some(Box::new(predicate));
        self
    }

    /// Refuse matching values the first time they are seen, accept retries.
    pub fn failing_first_sight(
        mut self,
        predicate: impl Fn(i64) -> bool + Send + 'static,
    ) -> Self {
        self.fail_first = Some(Box::new(predicate));
        self
    }

    pub fn state(&self) -> Arc<Mutex<CollectedState>> {
        Arc::clone(&self.state)
    }
}

impl Subscriber<i64> for CollectingSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        let mut state = self.state.lock();
        state.subscriptions += 1;
        state.subscription = Some(Arc::clone(&subscription));
        drop(state);
        if let Some(n) = self.initial_request {
            subscription.request(n);
        }
    }

    fn on_next(&mut self, value: i64) -> Result<()> {
        if let Some(predicate) = &self.fail_always {
            if predicate(value) {
                return Err(RingError::Subscriber {
                    message: format!("refused {value}"),
                    value: None,
                });
            }
        }
        if let Some(predicate) = &self.fail_first {
            if predicate(value) && self.seen.insert(value) {
                return Err(RingError::Subscriber {
                    message: format!("refused {value} on first sight"),
                    value: None,
                });
            }
        }
        self.state.lock().next.push(value);
        Ok(())
    }

    fn on_error(&mut self, error: RingError) {
        self.state.lock().errors.push(error);
    }

    fn on_complete(&mut self) {
        self.state.lock().completes += 1;
    }
}

/// Poll `condition` for up to five seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
