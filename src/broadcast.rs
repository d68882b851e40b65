//! Fan-out processor: every subscriber observes every published value, in
//! publish order, each on its own worker thread.
//!
//! The slowest subscriber gates how far producers may wrap; a subscriber
//! that stops requesting pauses its own worker without holding back its
//! peers beyond the buffer capacity.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error};

use crate::backpressure::check_request;
use crate::config::{ProcessorConfig, ProducerKind};
use crate::error::{Result, RingError};
use crate::executor::{ManagedThread, ThreadBuilder};
use crate::processor::{Processor, ProcessorState, SubscriberLink, Terminal, UncaughtHandler};
use crate::ring_buffer::RingBuffer;
use crate::sequence::{Sequence, DONE_MARKER};
use crate::sequence_barrier::SequenceBarrier;
use crate::sequencer::{barrier_for, MultiProducerSequencer, Sequencer, SingleProducerSequencer};
use crate::signal::{Signal, SignalKind};
use crate::subscriber::{NoopSubscription, Publisher, Subscriber, Subscription};
use crate::subscriber_barrier::SubscriberBarrier;

const NO_TERMINAL: i64 = i64::MAX;

struct Shared<T> {
    name: String,
    buffer: RingBuffer<Signal<T>>,
    sequencer: Arc<dyn Sequencer>,
    auto_cancel: bool,
    terminated: AtomicBool,
    terminal: Mutex<Option<Terminal>>,
    /// Sequence carrying the terminal sentinel, [`NO_TERMINAL`] while live.
    terminal_sequence: AtomicI64,
    cancelled: AtomicBool,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    live: AtomicUsize,
    workers: Mutex<Vec<ManagedThread>>,
    worker_counter: AtomicUsize,
    uncaught: RwLock<Option<UncaughtHandler>>,
}

impl<T> Shared<T> {
    fn unregister(&self, link: &SubscriberLink) {
        if link.departed.swap(true, Ordering::AcqRel) {
            return;
        }
        let remaining = self.live.fetch_sub(1, Ordering::AcqRel) - 1;
        if remaining == 0 && self.auto_cancel && !self.terminated.load(Ordering::Acquire) {
            self.cancel_upstream();
        }
    }

    fn cancel_upstream(&self) {
        if self.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(upstream) = self.upstream.lock().take() {
            upstream.cancel();
        }
        self.sequencer.halt();
        debug!(processor = %self.name, "cancelled upstream after last subscriber left");
    }

    fn report_uncaught(&self, error: &RingError) {
        let handler = self.uncaught.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!(processor = %self.name, %error, "uncaught worker error"),
        }
    }
}

/// Broadcast (fan-out) processor over a ring buffer.
///
/// Cheap to clone; all clones drive the same ring. Values must be `Clone`
/// because each subscriber receives its own copy of every element.
pub struct BroadcastProcessor<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for BroadcastProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> BroadcastProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Processor for a single publishing thread, blocking wait, auto-cancel.
    pub fn create(name: impl Into<String>, buffer_size: usize) -> Result<Self> {
        Self::with_config(ProcessorConfig::new(name).buffer_size(buffer_size))
    }

    /// Processor accepting concurrent publishers (fan-in), blocking wait,
    /// auto-cancel.
    pub fn share(name: impl Into<String>, buffer_size: usize) -> Result<Self> {
        Self::with_config(
            ProcessorConfig::new(name)
                .buffer_size(buffer_size)
                .producer(ProducerKind::Multi),
        )
    }

    pub fn with_config(config: ProcessorConfig) -> Result<Self> {
        let buffer = RingBuffer::new(config.buffer_size, Signal::default)?;
        let wait_strategy = config.wait_strategy.into_strategy();
        let sequencer: Arc<dyn Sequencer> = match config.producer {
            ProducerKind::Single => Arc::new(SingleProducerSequencer::new(
                config.buffer_size,
                wait_strategy,
            )),
            ProducerKind::Multi => Arc::new(MultiProducerSequencer::new(
                config.buffer_size,
                wait_strategy,
            )),
        };

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name,
                buffer,
                sequencer,
                auto_cancel: config.auto_cancel,
                terminated: AtomicBool::new(false),
                terminal: Mutex::new(None),
                terminal_sequence: AtomicI64::new(NO_TERMINAL),
                cancelled: AtomicBool::new(false),
                upstream: Mutex::new(None),
                live: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                worker_counter: AtomicUsize::new(0),
                uncaught: RwLock::new(None),
            }),
        })
    }

    /// Drive the processor standalone, without a real upstream publisher.
    pub fn start(&self) {
        let mut this = self.clone();
        Subscriber::on_subscribe(&mut this, Arc::new(NoopSubscription));
    }

    /// Publish one value, spinning while the buffer is full.
    ///
    /// # Errors
    /// `Cancel` once every subscriber is gone and auto-cancel fired;
    /// `IllegalState` after a terminal signal was published.
    pub fn publish(&self, value: T) -> Result<()> {
        let shared = &self.shared;
        if shared.cancelled.load(Ordering::Acquire) {
            return Err(RingError::Cancel);
        }
        if shared.terminated.load(Ordering::Acquire) {
            return Err(RingError::IllegalState(
                "publish after terminal signal".into(),
            ));
        }
        let sequence = match shared.sequencer.next(1) {
            Ok(sequence) => sequence,
            Err(RingError::Alert) => return Err(RingError::Cancel),
            Err(error) => return Err(error),
        };
        // SAFETY: the claim on `sequence` grants exclusive slot access until
        // publish.
        unsafe { shared.buffer.slot_mut(sequence).set_next(value) };
        shared.sequencer.publish(sequence);
        Ok(())
    }

    /// Publish without blocking; `InsufficientCapacity` when the buffer is
    /// full.
    pub fn try_publish(&self, value: T) -> Result<()> {
        let shared = &self.shared;
        if shared.cancelled.load(Ordering::Acquire) {
            return Err(RingError::Cancel);
        }
        if shared.terminated.load(Ordering::Acquire) {
            return Err(RingError::IllegalState(
                "publish after terminal signal".into(),
            ));
        }
        let sequence = match shared.sequencer.try_next(1) {
            Ok(sequence) => sequence,
            Err(RingError::Alert) => return Err(RingError::Cancel),
            Err(error) => return Err(error),
        };
        // SAFETY: as in `publish`.
        unsafe { shared.buffer.slot_mut(sequence).set_next(value) };
        shared.sequencer.publish(sequence);
        Ok(())
    }

    /// Publish the completion sentinel. Subscribers drain everything before
    /// it, then receive `on_complete`. Idempotent.
    pub fn complete(&self) {
        self.terminate(Terminal::Complete);
    }

    /// Publish a terminal error sentinel, broadcast to every subscriber
    /// after the preceding values. Idempotent with `complete`.
    pub fn error(&self, error: RingError) {
        self.terminate(Terminal::Error(error));
    }

    fn terminate(&self, terminal: Terminal) {
        let shared = &self.shared;
        if shared.terminated.swap(true, Ordering::AcqRel) {
            return;
        }
        *shared.terminal.lock() = Some(terminal.clone());
        match shared.sequencer.next(1) {
            Ok(sequence) => {
                // SAFETY: claim grants exclusive slot access.
                unsafe {
                    let slot = shared.buffer.slot_mut(sequence);
                    match &terminal {
                        Terminal::Complete => slot.set_complete(),
                        Terminal::Error(error) => slot.set_error(error.clone()),
                    }
                }
                shared
                    .terminal_sequence
                    .store(sequence, Ordering::Release);
                shared.sequencer.publish(sequence);
            }
            Err(_) => {
                debug!(processor = %shared.name, "terminal signal with no live consumers");
            }
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.sequencer.buffer_size()
    }

    pub fn subscriber_count(&self) -> usize {
        self.shared.live.load(Ordering::Acquire)
    }

    pub fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        *self.shared.uncaught.write() = Some(handler);
    }

    /// Join every worker thread except the calling one.
    pub fn await_shutdown(&self) {
        let workers = std::mem::take(&mut *self.shared.workers.lock());
        for worker in workers {
            if !worker.is_current() {
                let _ = worker.join();
            }
        }
    }

    fn attach<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        // Every subscriber goes through the barrier, so delivery failures
        // cancel the subscription and reach on_error augmented with the
        // offending value.
        let mut subscriber = SubscriberBarrier::new(subscriber);
        let shared = Arc::clone(&self.shared);

        if shared.terminated.load(Ordering::Acquire) {
            let terminal = shared.terminal.lock().clone();
            if let Some(terminal) = terminal {
                subscriber.on_subscribe(Arc::new(NoopSubscription));
                terminal.deliver(&mut subscriber);
                return Ok(());
            }
        }
        if shared.cancelled.load(Ordering::Acquire) {
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            subscriber.on_error(RingError::IllegalState(
                "processor already cancelled".into(),
            ));
            return Ok(());
        }

        let link = Arc::new(SubscriberLink::new());
        let tracked = Arc::new(Sequence::default());
        shared.sequencer.add_gating_sequences(&[tracked.clone()]);
        tracked.set(shared.sequencer.cursor().get());

        // The terminal may have landed at or before our starting point while
        // we were attaching; replay it directly instead of spawning a worker
        // that would wait forever.
        let terminal_sequence = shared.terminal_sequence.load(Ordering::Acquire);
        if terminal_sequence != NO_TERMINAL && tracked.get() >= terminal_sequence {
            tracked.set(DONE_MARKER);
            shared.sequencer.remove_gating_sequence(&tracked);
            let terminal = shared.terminal.lock().clone();
            subscriber.on_subscribe(Arc::new(NoopSubscription));
            if let Some(terminal) = terminal {
                terminal.deliver(&mut subscriber);
            }
            return Ok(());
        }

        let barrier = Arc::new(barrier_for(Arc::clone(&shared.sequencer), vec![]));
        let subscription: Arc<dyn Subscription> = Arc::new(BroadcastSubscription {
            link: Arc::clone(&link),
            barrier: Arc::clone(&barrier),
        });

        shared.live.fetch_add(1, Ordering::AcqRel);
        let id = shared.worker_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let thread_name = format!("{}-{}", shared.name, id);

        let worker = {
            let shared = Arc::clone(&shared);
            let tracked_for_worker = tracked.clone();
            ThreadBuilder::new()
                .thread_name(thread_name)
                .spawn(move || {
                    run_worker(
                        shared,
                        subscriber,
                        subscription,
                        link,
                        barrier,
                        tracked_for_worker,
                    );
                })
                .map_err(|spawn_error| {
                    RingError::IllegalState(format!("failed to spawn worker: {spawn_error}"))
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(error) => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                tracked.set(DONE_MARKER);
                shared.sequencer.remove_gating_sequence(&tracked);
                return Err(error);
            }
        };
        shared.workers.lock().push(worker);
        Ok(())
    }
}

struct BroadcastSubscription {
    link: Arc<SubscriberLink>,
    barrier: Arc<SequenceBarrier>,
}

impl Subscription for BroadcastSubscription {
    fn request(&self, n: i64) {
        if self.link.is_cancelled() {
            return;
        }
        if let Err(error) = check_request(n) {
            self.link.fail(error);
            self.barrier.alert();
            return;
        }
        self.link.demand.add(n);
    }

    fn cancel(&self) {
        if self.link.cancelled.swap(true, Ordering::AcqRel) {
            return;
        }
        self.barrier.alert();
    }
}

enum Exit {
    Cancelled,
    Terminal,
    ProtocolError(RingError),
}

fn run_worker<T, S>(
    shared: Arc<Shared<T>>,
    mut subscriber: S,
    subscription: Arc<dyn Subscription>,
    link: Arc<SubscriberLink>,
    barrier: Arc<SequenceBarrier>,
    tracked: Arc<Sequence>,
) where
    T: Clone + Send + Sync + 'static,
    S: Subscriber<T>,
{
    link.set_state(ProcessorState::Running);
    subscriber.on_subscribe(subscription);

    let mut next = tracked.get() + 1;
    let exit = 'main: loop {
        if let Some(error) = link.take_pending_error() {
            break 'main Exit::ProtocolError(error);
        }
        if link.is_cancelled() {
            break 'main Exit::Cancelled;
        }

        match barrier.wait_for(next) {
            Ok(available) if available >= next => {
                for sequence in next..=available {
                    if link.is_cancelled() {
                        break 'main Exit::Cancelled;
                    }
                    if let Some(error) = link.take_pending_error() {
                        break 'main Exit::ProtocolError(error);
                    }

                    // SAFETY: sequence is published and gated by `tracked`,
                    // so the producer cannot reuse the slot yet.
                    let slot = unsafe { shared.buffer.slot(sequence) };
                    match slot.kind {
                        SignalKind::Next => {
                            let Some(value) = slot.value.clone() else {
                                tracked.set(sequence);
                                continue;
                            };
                            if !link.demand.try_consume_one() {
                                match await_demand(&link) {
                                    DemandOutcome::Granted => {}
                                    DemandOutcome::Cancelled => break 'main Exit::Cancelled,
                                    DemandOutcome::Failed(error) => {
                                        break 'main Exit::ProtocolError(error)
                                    }
                                }
                            }
                            match subscriber.on_next(value) {
                                Ok(()) => {}
                                Err(error) if error.is_control() => {
                                    break 'main Exit::Cancelled;
                                }
                                Err(_) => {
                                    // The barrier already cancelled this
                                    // subscription and routed the augmented
                                    // failure downstream.
                                    tracked.set(sequence);
                                    break 'main Exit::Cancelled;
                                }
                            }
                            tracked.set(sequence);
                        }
                        SignalKind::Complete => {
                            tracked.set(sequence);
                            subscriber.on_complete();
                            break 'main Exit::Terminal;
                        }
                        SignalKind::Error => {
                            let error = slot.error.clone().unwrap_or_else(|| {
                                RingError::IllegalState("terminal slot without error".into())
                            });
                            tracked.set(sequence);
                            subscriber.on_error(error);
                            break 'main Exit::Terminal;
                        }
                    }
                }
                next = available + 1;
            }
            Ok(_) => {}
            Err(RingError::Alert) => {
                if let Some(error) = link.take_pending_error() {
                    break 'main Exit::ProtocolError(error);
                }
                break 'main Exit::Cancelled;
            }
            Err(error) => {
                shared.report_uncaught(&error);
                break 'main Exit::Cancelled;
            }
        }
    };

    if let Exit::ProtocolError(error) = exit {
        subscriber.on_error(error);
    }

    link.set_state(ProcessorState::Halted);
    tracked.set(DONE_MARKER);
    shared.sequencer.remove_gating_sequence(&tracked);
    shared.unregister(&link);
    debug!(processor = %shared.name, "broadcast worker stopped");
}

enum DemandOutcome {
    Granted,
    Cancelled,
    Failed(RingError),
}

/// Park until the subscriber requests more, it cancels, or a protocol error
/// arrives. Terminal slots never pass through here.
fn await_demand(link: &SubscriberLink) -> DemandOutcome {
    loop {
        if link.is_cancelled() {
            return DemandOutcome::Cancelled;
        }
        if let Some(error) = link.take_pending_error() {
            return DemandOutcome::Failed(error);
        }
        if link.demand.try_consume_one() {
            return DemandOutcome::Granted;
        }
        thread::park_timeout(Duration::from_micros(50));
    }
}

impl<T> Publisher<T> for BroadcastProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        self.attach(subscriber)
    }
}

impl<T> Subscriber<T> for BroadcastProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
        {
            let mut upstream = self.shared.upstream.lock();
            if upstream.is_some() {
                subscription.cancel();
                return;
            }
            *upstream = Some(Arc::clone(&subscription));
        }
        subscription.request(i64::MAX);
    }

    fn on_next(&mut self, value: T) -> Result<()> {
        self.publish(value)
    }

    fn on_error(&mut self, error: RingError) {
        BroadcastProcessor::error(self, error);
    }

    fn on_complete(&mut self) {
        self.complete();
    }

    fn capacity(&self) -> i64 {
        self.buffer_size() as i64
    }
}

impl<T> Processor<T> for BroadcastProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn subscribe_boxed(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()> {
        self.attach(subscriber)
    }

    fn publish(&self, value: T) -> Result<()> {
        BroadcastProcessor::publish(self, value)
    }

    fn complete(&self) {
        BroadcastProcessor::complete(self);
    }

    fn error(&self, error: RingError) {
        BroadcastProcessor::error(self, error);
    }

    fn subscriber_count(&self) -> usize {
        BroadcastProcessor::subscriber_count(self)
    }

    fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        BroadcastProcessor::set_uncaught_handler(self, handler);
    }

    fn await_shutdown(&self) {
        BroadcastProcessor::await_shutdown(self);
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}
