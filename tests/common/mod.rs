//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use std::collections::HashSet;
use std::sync::{Arc, Mutex, Once};
use std::time::{Duration, Instant};

use ringflow::{Result, RingError, Subscriber, Subscription};

static TRACING: Once = Once::new();

/// Install the fmt subscriber once per test binary; `RUST_LOG` filters it.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

#[derive(Default)]
pub struct Recorded {
    pub next: Vec<i64>,
    pub errors: Vec<RingError>,
    pub completes: usize,
    pub subscription: Option<Arc<dyn Subscription>>,
}

/// Scriptable recording subscriber: bounded or unbounded initial demand,
/// optional cancel-on-value, optional delivery refusal.
pub struct TestSubscriber {
    state: Arc<Mutex<Recorded>>,
    initial_request: Option<i64>,
    cancel_on: Option<i64>,
    fail_first_sight: Option<Box<dyn Fn(i64) -> bool + Send>>,
    seen: HashSet<i64>,
}

impl TestSubscriber {
    pub fn unbounded() -> Self {
        Self::with_request(Some(i64::MAX))
    }

    pub fn bounded(n: i64) -> Self {
        Self::with_request(Some(n))
    }

    fn with_request(initial_request: Option<i64>) -> Self {
        Self {
            state: Arc::new(Mutex::new(Recorded::default())),
            initial_request,
            cancel_on: None,
            fail_first_sight: None,
            seen: HashSet::new(),
        }
    }

    /// Cancel the subscription from inside `on_next` when `value` arrives.
    pub fn cancelling_on(mut self, value: i64) -> Self {
        self.cancel_on = Some(value);
        self
    }

    /// Refuse matching values the first time they are delivered; accept the
    /// retry.
    pub fn failing_first_sight(
        mut self,
        predicate: impl Fn(i64) -> bool + Send + 'static,
    ) -> Self {
        self.fail_first_sight = Some(Box::new(predicate));
        self
    }

    pub fn state(&self) -> Arc<Mutex<Recorded>> {
        Arc::clone(&self.state)
    }
}

impl Subscriber<i64> for TestSubscriber {
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.state.lock().unwrap().subscription = Some(Arc::clone(&subscription));
        if let Some(n) = self.initial_request {
            subscription.request(n);
        }
    }

    fn on_next(&mut self, value: i64) -> Result<()> {
        if let Some(predicate) = &self.fail_first_sight {
            if predicate(value) && self.seen.insert(value) {
                return Err(RingError::Subscriber {
                    message: format!("refused {value} on first sight"),
                    value: None,
                });
            }
        }
        let subscription = {
            let mut state = self.state.lock().unwrap();
            state.next.push(value);
            state.subscription.clone()
        };
        if self.cancel_on == Some(value) {
            if let Some(subscription) = subscription {
                subscription.cancel();
            }
        }
        Ok(())
    }

    fn on_error(&mut self, error: RingError) {
        self.state.lock().unwrap().errors.push(error);
    }

    fn on_complete(&mut self) {
        self.state.lock().unwrap().completes += 1;
    }
}

/// Poll `condition` for up to ten seconds.
pub fn wait_until(condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    condition()
}
