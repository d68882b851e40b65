//! Shared processor service: many logical subscribers multiplexed over one
//! backing processor with a bounded worker pool, plus service-level
//! uncaught-exception and shutdown hooks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::broadcast::BroadcastProcessor;
use crate::config::ServiceConfig;
use crate::error::{Result, RingError};
use crate::processor::{Processor, ShutdownHandler, UncaughtHandler};
use crate::subscriber::{Subscriber, Subscription};
use crate::work::WorkProcessor;

/// Service facade over one backing processor.
///
/// Subscribing registers a logical subscriber; the backing processor runs
/// one worker per registration, bounded by the configured concurrency. When
/// the last registration departs and auto-shutdown is enabled, the backing
/// processor is completed and the shutdown handler runs exactly once.
///
/// Per-processor `auto_cancel` and service-level `auto_shutdown` are
/// independent policies: the former propagates cancellation upstream, the
/// latter completes the backing processor.
pub struct SharedProcessorService<T> {
    weak_self: Weak<SharedProcessorService<T>>,
    processor: Arc<dyn Processor<T>>,
    concurrency: usize,
    auto_shutdown: bool,
    shutdown_handler: Mutex<Option<ShutdownHandler>>,
    live: AtomicUsize,
    shut_down: AtomicBool,
}

impl<T> SharedProcessorService<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Wrap `processor` in a service.
    ///
    /// # Errors
    /// `InvalidArgument` when `concurrency` is zero.
    pub fn create(
        processor: Arc<dyn Processor<T>>,
        concurrency: usize,
        uncaught_handler: Option<UncaughtHandler>,
        shutdown_handler: Option<ShutdownHandler>,
        auto_shutdown: bool,
    ) -> Result<Arc<Self>> {
        if concurrency < 1 {
            return Err(RingError::InvalidArgument(format!(
                "concurrency must be at least 1, got {concurrency}"
            )));
        }
        if let Some(handler) = uncaught_handler {
            processor.set_uncaught_handler(handler);
        }
        Ok(Arc::new_cyclic(|weak_self| Self {
            weak_self: weak_self.clone(),
            processor,
            concurrency,
            auto_shutdown,
            shutdown_handler: Mutex::new(shutdown_handler),
            live: AtomicUsize::new(0),
            shut_down: AtomicBool::new(false),
        }))
    }

    pub fn with_config(
        processor: Arc<dyn Processor<T>>,
        config: ServiceConfig,
        uncaught_handler: Option<UncaughtHandler>,
        shutdown_handler: Option<ShutdownHandler>,
    ) -> Result<Arc<Self>> {
        Self::create(
            processor,
            config.concurrency,
            uncaught_handler,
            shutdown_handler,
            config.auto_shutdown,
        )
    }

    /// Register a logical subscriber with the backing processor.
    ///
    /// # Errors
    /// `IllegalState` after shutdown or when the worker-count limit is
    /// reached.
    pub fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        if self.shut_down.load(Ordering::Acquire) {
            return Err(RingError::IllegalState(
                "service has been shut down".into(),
            ));
        }
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live >= self.concurrency {
                    None
                } else {
                    Some(live + 1)
                }
            })
            .map_err(|_| {
                RingError::IllegalState(format!(
                    "worker-count limit of {} reached",
                    self.concurrency
                ))
            })?;

        let wrapper = ServiceSubscriber {
            inner: subscriber,
            service: self.weak_self.clone(),
        };
        // On rejection the wrapper is dropped inside the call and the
        // registration is released through its Drop.
        self.processor.subscribe_boxed(Box::new(wrapper))
    }

    pub fn publish(&self, value: T) -> Result<()> {
        self.processor.publish(value)
    }

    pub fn processor(&self) -> Arc<dyn Processor<T>> {
        Arc::clone(&self.processor)
    }

    pub fn subscriber_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Complete the backing processor, join its workers and run the
    /// shutdown handler. Safe to call from a worker thread and from user
    /// code alike; only the first call acts.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.processor.complete();
        self.processor.await_shutdown();
        if let Some(handler) = self.shutdown_handler.lock().take() {
            handler();
        }
        debug!(processor = self.processor.name(), "shared processor service shut down");
    }

    /// Join the backing processor's workers without initiating shutdown.
    pub fn await_shutdown(&self) {
        self.processor.await_shutdown();
    }

    fn unregister(&self) {
        let remaining = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.auto_shutdown {
            self.shutdown();
        }
    }
}

/// Wrapper registering departure with the service however the subscriber
/// leaves: terminal signal, cancellation or rejected attach.
struct ServiceSubscriber<T, S>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    inner: S,
    service: Weak<SharedProcessorService<T>>,
}

impl<T, S> Subscriber<T> for ServiceSubscriber<T, S>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
    S: Subscriber<T>,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        self.inner.on_subscribe(subscription);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        self.inner.on_next(value)
    }

    fn on_error(&mut self, error: RingError) {
        self.inner.on_error(error);
    }

    fn on_complete(&mut self) {
        self.inner.on_complete();
    }

    fn capacity(&self) -> i64 {
        self.inner.capacity()
    }
}

impl<T, S> Drop for ServiceSubscriber<T, S>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn drop(&mut self) {
        if let Some(service) = self.service.upgrade() {
            service.unregister();
        }
    }
}

/// Broadcast-backed service: every logical subscriber observes the whole
/// stream.
pub fn async_service<T>(
    name: impl Into<String>,
    buffer_size: usize,
    concurrency: usize,
    uncaught_handler: Option<UncaughtHandler>,
    shutdown_handler: Option<ShutdownHandler>,
    auto_shutdown: bool,
) -> Result<Arc<SharedProcessorService<T>>>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    let processor = BroadcastProcessor::share(name, buffer_size)?;
    SharedProcessorService::create(
        Arc::new(processor),
        concurrency,
        uncaught_handler,
        shutdown_handler,
        auto_shutdown,
    )
}

/// Work-backed service: the stream is partitioned across the workers.
pub fn work_service<T>(
    name: impl Into<String>,
    buffer_size: usize,
    concurrency: usize,
    uncaught_handler: Option<UncaughtHandler>,
    shutdown_handler: Option<ShutdownHandler>,
    auto_shutdown: bool,
) -> Result<Arc<SharedProcessorService<T>>>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    let processor = WorkProcessor::create(name, buffer_size)?;
    SharedProcessorService::create(
        Arc::new(processor),
        concurrency,
        uncaught_handler,
        shutdown_handler,
        auto_shutdown,
    )
}
