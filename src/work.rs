//! Work-partition processor: peer workers share one work sequence and each
//! published value is delivered to exactly one of them.
//!
//! A failed delivery is re-published as a retry envelope so another worker
//! can pick it up; once the attempt limit is exhausted the value is
//! dead-lettered to the uncaught handler. Retry envelopes may land after
//! the terminal sentinel; workers keep claiming past the sentinel until the
//! outstanding-retry count drains to zero.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, warn};

use crate::backpressure::check_request;
use crate::config::ProcessorConfig;
use crate::error::{Result, RingError};
use crate::executor::{ManagedThread, ThreadBuilder};
use crate::processor::{Processor, ProcessorState, SubscriberLink, Terminal, UncaughtHandler};
use crate::ring_buffer::RingBuffer;
use crate::sequence::{Sequence, DONE_MARKER};
use crate::sequence_barrier::SequenceBarrier;
use crate::sequencer::{barrier_for, MultiProducerSequencer, Sequencer};
use crate::signal::{Signal, SignalKind};
use crate::subscriber::{NoopSubscription, Publisher, Subscriber, Subscription};
use crate::subscriber_barrier::SubscriberBarrier;

const NO_TERMINAL: i64 = i64::MAX;

/// Delivery attempts per value before dead-lettering.
pub const DEFAULT_MAX_DELIVERY_ATTEMPTS: u32 = 3;

struct Shared<T> {
    name: String,
    buffer: RingBuffer<Signal<T>>,
    sequencer: Arc<dyn Sequencer>,
    /// Next-to-deliver counter shared by all workers.
    work_sequence: Arc<Sequence>,
    auto_cancel: bool,
    max_delivery_attempts: u32,
    terminated: AtomicBool,
    terminal: Mutex<Option<Terminal>>,
    terminal_sequence: AtomicI64,
    /// Retry envelopes published but not yet resolved. Workers only stop
    /// claiming past the sentinel once this is zero.
    pending_retries: AtomicUsize,
    cancelled: AtomicBool,
    upstream: Mutex<Option<Arc<dyn Subscription>>>,
    live: AtomicUsize,
    workers: Mutex<Vec<ManagedThread>>,
    worker_counter: AtomicUsize,
    /// Worker barriers, alerted on the terminal sentinel and when the retry
    /// count drains, so claims that ran ahead stop waiting.
    barriers: Mutex<Vec<Arc<SequenceBarrier>>>,
    uncaught: RwLock<Option<UncaughtHandler>>,
}

impl<T: std::fmt::Debug> Shared<T> {
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
        self.alert_all_workers();
        debug!(processor = %self.name, "cancelled upstream after last worker left");
    }

    fn alert_all_workers(&self) {
        for barrier in self.barriers.lock().iter() {
            barrier.alert();
        }
    }

    fn drop_barrier(&self, barrier: &Arc<SequenceBarrier>) {
        let mut barriers = self.barriers.lock();
        if let Some(pos) = barriers.iter().position(|b| Arc::ptr_eq(b, barrier)) {
            barriers.remove(pos);
        }
    }

    fn report_uncaught(&self, error: &RingError) {
        let handler = self.uncaught.read().clone();
        match handler {
            Some(handler) => handler(error),
            None => error!(processor = %self.name, %error, "uncaught worker error"),
        }
    }

    fn terminal_sequence(&self) -> i64 {
        self.terminal_sequence.load(Ordering::Acquire)
    }

    /// Hand a failed or undeliverable value back to the ring so a peer
    /// retries it. Dead-letters instead when the ring no longer accepts
    /// publishes.
    fn republish(&self, value: T, attempts: u32, cause: &RingError) {
        match self.sequencer.next(1) {
            Ok(sequence) => {
                self.pending_retries.fetch_add(1, Ordering::AcqRel);
                // SAFETY: the claim grants exclusive slot access.
                unsafe { self.buffer.slot_mut(sequence).set_retry(value, attempts) };
                self.sequencer.publish(sequence);
            }
            Err(_) => {
                self.report_uncaught(&RingError::Subscriber {
                    message: format!("dropped retry, processor halted: {cause}"),
                    value: Some(format!("{value:?}")),
                });
            }
        }
    }

    /// Resolve one retry envelope; the last resolution wakes workers parked
    /// on claims past the sentinel.
    fn resolve_retry(&self) {
        if self.pending_retries.fetch_sub(1, Ordering::AcqRel) == 1
            && self.terminal_sequence() != NO_TERMINAL
        {
            self.alert_all_workers();
        }
    }

    /// True once the sentinel landed and no retry envelope is outstanding.
    fn drained(&self, next_claim: i64) -> bool {
        let terminal = self.terminal_sequence();
        terminal != NO_TERMINAL
            && next_claim > terminal
            && self.pending_retries.load(Ordering::Acquire) == 0
    }
}

/// Work-stealing processor over a ring buffer. Each subscriber becomes one
/// peer worker; the union of deliveries across workers is the published
/// stream, with no value seen twice under normal conditions.
pub struct WorkProcessor<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for WorkProcessor<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> WorkProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    /// Work processor with blocking wait and auto-cancel.
    ///
    /// Claims are always arbitrated multi-producer style: workers republish
    /// retry envelopes, so there is more than one publisher by construction.
    pub fn create(name: impl Into<String>, buffer_size: usize) -> Result<Self> {
        Self::with_config(ProcessorConfig::new(name).buffer_size(buffer_size))
    }

    pub fn with_config(config: ProcessorConfig) -> Result<Self> {
        let buffer = RingBuffer::new(config.buffer_size, Signal::default)?;
        let wait_strategy = config.wait_strategy.into_strategy();
        let sequencer: Arc<dyn Sequencer> = Arc::new(MultiProducerSequencer::new(
            config.buffer_size,
            wait_strategy,
        ));

        Ok(Self {
            shared: Arc::new(Shared {
                name: config.name,
                buffer,
                sequencer,
                work_sequence: Arc::new(Sequence::default()),
                auto_cancel: config.auto_cancel,
                max_delivery_attempts: DEFAULT_MAX_DELIVERY_ATTEMPTS,
                terminated: AtomicBool::new(false),
                terminal: Mutex::new(None),
                terminal_sequence: AtomicI64::new(NO_TERMINAL),
                pending_retries: AtomicUsize::new(0),
                cancelled: AtomicBool::new(false),
                upstream: Mutex::new(None),
                live: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                worker_counter: AtomicUsize::new(0),
                barriers: Mutex::new(Vec::new()),
                uncaught: RwLock::new(None),
            }),
        })
    }

    /// Drive the processor standalone, without a real upstream publisher.
    pub fn start(&self) {
        let mut this = self.clone();
        Subscriber::on_subscribe(&mut this, Arc::new(NoopSubscription));
    }

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
        // SAFETY: the claim grants exclusive slot access until publish.
        unsafe { shared.buffer.slot_mut(sequence).set_next(value) };
        shared.sequencer.publish(sequence);
        Ok(())
    }

    pub fn complete(&self) {
        self.terminate(Terminal::Complete);
    }

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
                shared.terminal_sequence.store(sequence, Ordering::Release);
                shared.sequencer.publish(sequence);
                shared.alert_all_workers();
            }
            Err(_) => {
                debug!(processor = %shared.name, "terminal signal with no live workers");
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

        if shared.terminated.load(Ordering::Acquire)
            && shared.drained(shared.work_sequence.get() + 1)
        {
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
        tracked.set(shared.work_sequence.get());

        let barrier = Arc::new(barrier_for(Arc::clone(&shared.sequencer), vec![]));
        shared.barriers.lock().push(Arc::clone(&barrier));

        let subscription: Arc<dyn Subscription> = Arc::new(WorkSubscription {
            link: Arc::clone(&link),
            barrier: Arc::clone(&barrier),
        });

        shared.live.fetch_add(1, Ordering::AcqRel);
        let id = shared.worker_counter.fetch_add(1, Ordering::AcqRel) + 1;
        let thread_name = format!("{}-{}", shared.name, id);

        let worker = {
            let shared = Arc::clone(&shared);
            let barrier_for_worker = barrier.clone();
            let tracked_for_worker = tracked.clone();
            ThreadBuilder::new()
                .thread_name(thread_name)
                .spawn(move || {
                    run_worker(
                        shared,
                        subscriber,
                        subscription,
                        link,
                        barrier_for_worker,
                        tracked_for_worker,
                    );
                })
                .map_err(|spawn_error| {
                    RingError::IllegalState(format!("failed to spawn worker: {spawn_error}"))
                })
        };
        let worker = match worker {
            Ok(worker) => worker,
            Err(spawn_error) => {
                shared.live.fetch_sub(1, Ordering::AcqRel);
                shared.drop_barrier(&barrier);
                tracked.set(DONE_MARKER);
                shared.sequencer.remove_gating_sequence(&tracked);
                return Err(spawn_error);
            }
        };
        shared.workers.lock().push(worker);
        Ok(())
    }
}

struct WorkSubscription {
    link: Arc<SubscriberLink>,
    barrier: Arc<SequenceBarrier>,
}

impl Subscription for WorkSubscription {
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
    /// Stream drained; deliver the recorded terminal on exit.
    Terminal,
    ProtocolError(RingError),
}

enum Claimed {
    Sequence(i64),
    Stop(Exit),
}

fn run_worker<T, S>(
    shared: Arc<Shared<T>>,
    mut subscriber: S,
    subscription: Arc<dyn Subscription>,
    link: Arc<SubscriberLink>,
    barrier: Arc<SequenceBarrier>,
    tracked: Arc<Sequence>,
) where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
    S: Subscriber<T>,
{
    link.set_state(ProcessorState::Running);
    subscriber.on_subscribe(subscription);

    let mut claim: Option<i64> = None;
    let mut cached_available = i64::MIN;

    let exit = 'main: loop {
        let next_sequence = match claim {
            Some(sequence) => sequence,
            None => match claim_next(&shared, &link, &tracked) {
                Claimed::Sequence(sequence) => {
                    claim = Some(sequence);
                    sequence
                }
                Claimed::Stop(exit) => break 'main exit,
            },
        };

        if cached_available < next_sequence {
            match barrier.wait_for(next_sequence) {
                Ok(available) if available >= next_sequence => cached_available = available,
                Ok(_) => {}
                Err(RingError::Alert) => {
                    if let Some(protocol_error) = link.take_pending_error() {
                        release_claim(&shared, claim.take());
                        break 'main Exit::ProtocolError(protocol_error);
                    }
                    if link.is_cancelled() || shared.cancelled.load(Ordering::Acquire) {
                        release_claim(&shared, claim.take());
                        break 'main Exit::Cancelled;
                    }
                    let terminal = shared.terminal_sequence();
                    if terminal == NO_TERMINAL {
                        // Retry bookkeeping woke us before any terminal; the
                        // stream is still live.
                        barrier.clear_alert();
                        continue;
                    }
                    if next_sequence <= terminal || !shared.drained(next_sequence) {
                        // The sentinel (or a retry beyond it) is still in
                        // flight at or above our claim: keep draining.
                        barrier.clear_alert();
                        continue;
                    }
                    break 'main Exit::Terminal;
                }
                Err(other) => {
                    shared.report_uncaught(&other);
                    release_claim(&shared, claim.take());
                    break 'main Exit::Cancelled;
                }
            }
            continue;
        }

        // SAFETY: the work claim on this sequence is exclusive across
        // workers, and `tracked` gates the producer at claim - 1.
        let slot = unsafe { shared.buffer.slot(next_sequence) };
        match slot.kind {
            SignalKind::Next => {
                let attempts = slot.attempts;
                let Some(value) = slot.value.clone() else {
                    tracked.set(next_sequence);
                    claim = None;
                    continue;
                };
                if link.is_cancelled() {
                    shared.republish(value, attempts, &RingError::Cancel);
                    if attempts > 0 {
                        shared.resolve_retry();
                    }
                    tracked.set(next_sequence);
                    claim = None;
                    break 'main Exit::Cancelled;
                }
                match subscriber.on_next(value.clone()) {
                    Ok(()) => {
                        if attempts > 0 {
                            shared.resolve_retry();
                        }
                    }
                    Err(cause) if cause.is_control() => {
                        shared.republish(value, attempts, &cause);
                        if attempts > 0 {
                            shared.resolve_retry();
                        }
                        tracked.set(next_sequence);
                        claim = None;
                        break 'main Exit::Cancelled;
                    }
                    Err(cause) => {
                        // The barrier already cancelled this subscription
                        // and routed the augmented failure downstream; the
                        // value itself goes to a peer, or to the dead-letter
                        // handler when no peer remains to retry it.
                        let attempted = attempts + 1;
                        let peers = shared.live.load(Ordering::Acquire).saturating_sub(1);
                        if attempted >= shared.max_delivery_attempts || peers == 0 {
                            shared.report_uncaught(&RingError::Subscriber {
                                message: format!(
                                    "delivery failed after {attempted} attempts: {cause}"
                                ),
                                value: Some(format!("{value:?}")),
                            });
                        } else {
                            shared.republish(value, attempted, &cause);
                        }
                        if attempts > 0 {
                            shared.resolve_retry();
                        }
                        tracked.set(next_sequence);
                        claim = None;
                        break 'main Exit::Cancelled;
                    }
                }
                tracked.set(next_sequence);
                claim = None;
            }
            SignalKind::Complete | SignalKind::Error => {
                // The terminal itself is delivered on exit, once the retry
                // region past the sentinel has drained too.
                tracked.set(next_sequence);
                claim = None;
            }
        }
    };

    match exit {
        Exit::ProtocolError(error) => subscriber.on_error(error),
        Exit::Terminal => {
            if let Some(terminal) = shared.terminal.lock().clone() {
                terminal.deliver(&mut subscriber);
            }
        }
        Exit::Cancelled => {}
    }

    link.set_state(ProcessorState::Halted);
    tracked.set(DONE_MARKER);
    shared.sequencer.remove_gating_sequence(&tracked);
    shared.drop_barrier(&barrier);
    shared.unregister(&link);
    debug!(processor = %shared.name, "work worker stopped");
}

/// Claim the next work sequence, waiting for demand first.
///
/// Demand is not consumed for the sentinel slot or for the retry region
/// beyond it: completion and redelivery are never gated on fresh requests.
fn claim_next<T: std::fmt::Debug>(
    shared: &Shared<T>,
    link: &SubscriberLink,
    tracked: &Sequence,
) -> Claimed {
    loop {
        if let Some(error) = link.take_pending_error() {
            return Claimed::Stop(Exit::ProtocolError(error));
        }
        if link.is_cancelled() {
            return Claimed::Stop(Exit::Cancelled);
        }

        let terminal = shared.terminal_sequence.load(Ordering::Acquire);
        let current = shared.work_sequence.get();
        let next = current + 1;

        if shared.drained(next) {
            return Claimed::Stop(Exit::Terminal);
        }

        let needs_demand = terminal == NO_TERMINAL || next < terminal;
        if needs_demand && !link.demand.try_consume_one() {
            thread::park_timeout(Duration::from_micros(50));
            continue;
        }

        // Gate the producer at claim - 1 before contending for the claim;
        // this is what keeps a one-slot buffer with many workers live.
        tracked.set(current);
        if shared.work_sequence.compare_and_set(current, next) {
            return Claimed::Sequence(next);
        }
        if needs_demand {
            link.demand.add(1);
        }
    }
}

/// A worker leaving with an outstanding claim must not strand the value the
/// producer will (or did) publish there: wait briefly for the slot and hand
/// it to a peer.
fn release_claim<T: Clone + std::fmt::Debug + Send + Sync + 'static>(
    shared: &Shared<T>,
    claim: Option<i64>,
) {
    let Some(sequence) = claim else { return };
    let terminal = shared.terminal_sequence();
    if terminal != NO_TERMINAL && sequence > terminal {
        let outstanding = shared.pending_retries.load(Ordering::Acquire);
        if outstanding == 0 {
            return;
        }
    }
    if shared.cancelled.load(Ordering::Acquire) {
        return;
    }

    let deadline = Instant::now() + Duration::from_millis(100);
    while !shared.sequencer.is_available(sequence) {
        if Instant::now() > deadline || shared.cancelled.load(Ordering::Acquire) {
            warn!(processor = %shared.name, sequence, "cancelled worker abandoned unpublished claim");
            return;
        }
        thread::park_timeout(Duration::from_micros(50));
    }
    // SAFETY: the work claim on this sequence is exclusive.
    let slot = unsafe { shared.buffer.slot(sequence) };
    if slot.kind == SignalKind::Next {
        let attempts = slot.attempts;
        if let Some(value) = slot.value.clone() {
            shared.republish(value, attempts, &RingError::Cancel);
        }
        if attempts > 0 {
            shared.resolve_retry();
        }
    }
}

impl<T> Publisher<T> for WorkProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn subscribe<S: Subscriber<T>>(&self, subscriber: S) -> Result<()> {
        self.attach(subscriber)
    }
}

impl<T> Subscriber<T> for WorkProcessor<T>
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
        WorkProcessor::error(self, error);
    }

    fn on_complete(&mut self) {
        self.complete();
    }

    fn capacity(&self) -> i64 {
        self.buffer_size() as i64
    }
}

impl<T> Processor<T> for WorkProcessor<T>
where
    T: Clone + std::fmt::Debug + Send + Sync + 'static,
{
    fn subscribe_boxed(&self, subscriber: Box<dyn Subscriber<T>>) -> Result<()> {
        self.attach(subscriber)
    }

    fn publish(&self, value: T) -> Result<()> {
        WorkProcessor::publish(self, value)
    }

    fn complete(&self) {
        WorkProcessor::complete(self);
    }

    fn error(&self, error: RingError) {
        WorkProcessor::error(self, error);
    }

    fn subscriber_count(&self) -> usize {
        WorkProcessor::subscriber_count(self)
    }

    fn set_uncaught_handler(&self, handler: UncaughtHandler) {
        WorkProcessor::set_uncaught_handler(self, handler);
    }

    fn await_shutdown(&self) {
        WorkProcessor::await_shutdown(self);
    }

    fn name(&self) -> &str {
        &self.shared.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_until, CollectingSubscriber};

    #[test]
    fn two_workers_partition_the_stream() {
        let processor = WorkProcessor::create("work", 16).unwrap();
        let a = CollectingSubscriber::unbounded();
        let b = CollectingSubscriber::unbounded();
        let (state_a, state_b) = (a.state(), b.state());
        processor.subscribe(a).unwrap();
        processor.subscribe(b).unwrap();

        for i in 0..200i64 {
            processor.publish(i).unwrap();
        }
        processor.complete();

        assert!(wait_until(|| {
            state_a.lock().completes == 1 && state_b.lock().completes == 1
        }));

        let mut union: Vec<i64> = state_a
            .lock()
            .next
            .iter()
            .chain(state_b.lock().next.iter())
            .copied()
            .collect();
        union.sort_unstable();
        assert_eq!(union, (0..200).collect::<Vec<_>>());
        processor.await_shutdown();
    }

    #[test]
    fn every_worker_sees_the_terminal() {
        let processor = WorkProcessor::create("work", 8).unwrap();
        let a = CollectingSubscriber::unbounded();
        let b = CollectingSubscriber::unbounded();
        let c = CollectingSubscriber::unbounded();
        let states = [a.state(), b.state(), c.state()];
        processor.subscribe(a).unwrap();
        processor.subscribe(b).unwrap();
        processor.subscribe(c).unwrap();

        processor.publish(1).unwrap();
        processor.complete();

        assert!(wait_until(|| {
            states.iter().all(|s| s.lock().completes == 1)
        }));
        processor.await_shutdown();
    }

    #[test]
    fn publish_after_terminal_is_an_illegal_state() {
        let processor = WorkProcessor::<i64>::create("work", 8).unwrap();
        processor.complete();
        assert!(matches!(
            processor.publish(1),
            Err(RingError::IllegalState(_))
        ));
    }

    #[test]
    fn failed_delivery_is_retried_by_a_peer() {
        let processor = WorkProcessor::create("work", 16).unwrap();
        let dead_letters = Arc::new(AtomicUsize::new(0));
        {
            let dead_letters = dead_letters.clone();
            processor.set_uncaught_handler(Arc::new(move |_| {
                dead_letters.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // The failing worker is terminated by its barrier on the first
        // refused value; the peer picks up the retry and the rest of the
        // stream.
        let failing = CollectingSubscriber::unbounded().failing_first_sight(|_| true);
        let accepting = CollectingSubscriber::unbounded();
        let (state_f, state_a) = (failing.state(), accepting.state());
        processor.subscribe(failing).unwrap();
        processor.subscribe(accepting).unwrap();

        for i in 0..50i64 {
            processor.publish(i).unwrap();
        }
        processor.complete();

        assert!(wait_until(|| {
            let failing = state_f.lock();
            let accepting = state_a.lock();
            accepting.completes == 1 && failing.completes + failing.errors.len() == 1
        }));

        let mut union: Vec<i64> = state_f
            .lock()
            .next
            .iter()
            .chain(state_a.lock().next.iter())
            .copied()
            .collect();
        union.sort_unstable();
        union.dedup();
        assert_eq!(union, (0..50).collect::<Vec<_>>());
        assert_eq!(dead_letters.load(Ordering::SeqCst), 0);
        processor.await_shutdown();
    }

    #[test]
    fn dead_letter_when_no_peer_can_retry() {
        let processor = WorkProcessor::create("work", 8).unwrap();
        let dead_letters = Arc::new(parking_lot::Mutex::new(Vec::new()));
        {
            let dead_letters = dead_letters.clone();
            processor.set_uncaught_handler(Arc::new(move |error| {
                dead_letters.lock().push(error.clone());
            }));
        }

        // The only worker refuses; there is no peer to hand the value to.
        let refusing = CollectingSubscriber::unbounded().failing_always(|_| true);
        let state = refusing.state();
        processor.subscribe(refusing).unwrap();

        processor.publish(7).unwrap();
        processor.complete();

        assert!(wait_until(|| dead_letters.lock().len() == 1));
        assert!(wait_until(|| state.lock().errors.len() == 1));
        assert_eq!(state.lock().completes, 0);

        // Both the dead letter and the subscriber's terminal error carry
        // the rendered value.
        match &dead_letters.lock()[0] {
            RingError::Subscriber { value, .. } => assert_eq!(value.as_deref(), Some("7")),
            other => panic!("unexpected dead letter: {other:?}"),
        }
        match &state.lock().errors[0] {
            RingError::Subscriber { value, .. } => assert_eq!(value.as_deref(), Some("7")),
            other => panic!("unexpected terminal error: {other:?}"),
        }
        processor.await_shutdown();
    }

    #[test]
    fn dead_letter_after_every_peer_refuses() {
        let processor = WorkProcessor::create("work", 8).unwrap();
        let dead_letters = Arc::new(AtomicUsize::new(0));
        {
            let dead_letters = dead_letters.clone();
            processor.set_uncaught_handler(Arc::new(move |_| {
                dead_letters.fetch_add(1, Ordering::SeqCst);
            }));
        }

        // Each refusal terminates one worker and hands the value on; the
        // last worker has no peer left and dead-letters it.
        let states: Vec<_> = (0..3)
            .map(|_| {
                let refusing = CollectingSubscriber::unbounded().failing_always(|_| true);
                let state = refusing.state();
                processor.subscribe(refusing).unwrap();
                state
            })
            .collect();

        processor.publish(9).unwrap();
        processor.complete();

        assert!(wait_until(|| dead_letters.load(Ordering::SeqCst) == 1));
        assert!(wait_until(|| {
            states.iter().map(|s| s.lock().errors.len()).sum::<usize>() == 3
        }));
        assert!(states.iter().all(|s| s.lock().completes == 0));
        processor.await_shutdown();
    }
}
