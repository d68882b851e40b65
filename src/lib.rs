//! `ringflow` - reactive-streams processors on a lock-free ring buffer
//!
//! A family of asynchronous processors that mediate between publishers and
//! subscribers under the demand-driven, backpressure-respecting
//! reactive-streams protocol, built on a pre-allocated power-of-two ring
//! buffer with a wait-free claim/publish protocol.
//!
//! ## Features
//!
//! - **Lock-free conveyor**: atomic sequences and memory barriers only; no
//!   lock on the publish or consume path
//! - **Two delivery disciplines**: broadcast (every subscriber sees every
//!   value) and work partition (each value goes to exactly one peer worker,
//!   with retry on failed deliveries)
//! - **Backpressure**: per-subscriber demand accounting with sticky
//!   unbounded requests
//! - **Pluggable wait strategies**: blocking, busy-spin, yielding, sleeping
//!   and phased backoff trade CPU for latency
//! - **Cooperative cancellation**: an alert signal woven through every wait
//!   loop, observed promptly no matter how a consumer idles
//!
//! ## Quick start
//!
//! ```rust
//! use ringflow::{BroadcastProcessor, Publisher, RingError, Subscriber, Subscription};
//! use std::sync::Arc;
//!
//! struct Printer;
//!
//! impl Subscriber<i64> for Printer {
//!     fn on_subscribe(&mut self, subscription: Arc<dyn Subscription>) {
//!         subscription.request(i64::MAX);
//!     }
//!
//!     fn on_next(&mut self, value: i64) -> ringflow::Result<()> {
//!         println!("got {value}");
//!         Ok(())
//!     }
//!
//!     fn on_error(&mut self, _error: RingError) {}
//!
//!     fn on_complete(&mut self) {}
//! }
//!
//! # fn main() -> ringflow::Result<()> {
//! let processor = BroadcastProcessor::create("quickstart", 8)?;
//! processor.subscribe(Printer)?;
//! for i in 0..4 {
//!     processor.publish(i)?;
//! }
//! processor.complete();
//! processor.await_shutdown();
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`Sequence`]: padded atomic counter naming a position in the ring
//! - [`Sequencer`]: claim/publish coordination, single or multi producer
//! - [`WaitStrategy`]: how a consumer idles until its target is published
//! - [`SequenceBarrier`]: per-consumer coordination point with an alert flag
//! - [`BroadcastProcessor`] / [`WorkProcessor`]: the two delivery disciplines
//! - [`SubscriberBarrier`]: adapts untrusted downstream consumers onto the
//!   demand protocol
//! - [`SharedProcessorService`]: many logical subscribers over one backing
//!   processor with shutdown hooks

pub mod backpressure;
pub mod broadcast;
pub mod config;
pub mod error;
pub mod executor;
pub mod processor;
pub mod ring_buffer;
pub mod sequence;
pub mod sequence_barrier;
pub mod sequencer;
mod signal;
pub mod service;
pub mod subscriber;
pub mod subscriber_barrier;
pub mod wait_strategy;
pub mod work;

#[cfg(test)]
mod testing;

pub use backpressure::{check_request, Demand, UNBOUNDED};
pub use broadcast::BroadcastProcessor;
pub use config::{
    default_pool_size, ProcessorConfig, ProducerKind, ServiceConfig, WaitStrategyKind,
    MAX_BUFFER_SIZE, MEDIUM_BUFFER_SIZE, SMALL_BUFFER_SIZE,
};
pub use error::{Result, RingError};
pub use executor::{available_cores, ManagedThread, ThreadBuilder};
pub use processor::{Processor, ProcessorState, ShutdownHandler, UncaughtHandler};
#[cfg(feature = "locked-ring-buffer")]
pub use ring_buffer::LockedRingBuffer;
pub use ring_buffer::{is_power_of_two, RingBuffer};
pub use sequence::{Sequence, SequenceGroup, DONE_MARKER, INITIAL_CURSOR_VALUE};
pub use sequence_barrier::{AlertSignal, SequenceBarrier};
pub use sequencer::{barrier_for, MultiProducerSequencer, Sequencer, SingleProducerSequencer};
pub use service::{async_service, work_service, SharedProcessorService};
pub use subscriber::{NoopSubscription, Publisher, Subscriber, Subscription};
pub use subscriber_barrier::SubscriberBarrier;
pub use wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, PhasedBackoffWaitStrategy, SleepingWaitStrategy,
    WaitStrategy, YieldingWaitStrategy,
};
pub use work::{WorkProcessor, DEFAULT_MAX_DELIVERY_ATTEMPTS};
