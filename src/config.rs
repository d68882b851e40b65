//! Construction-time configuration values and defaults.
//!
//! There is no file or environment loading here; callers build these values
//! explicitly and pass them at construction. Defaults mirror the factory
//! surface: small backlog, blocking wait, auto-cancel on.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::wait_strategy::{
    BlockingWaitStrategy, BusySpinWaitStrategy, PhasedBackoffWaitStrategy, SleepingWaitStrategy,
    WaitStrategy, YieldingWaitStrategy,
};

/// Default backlog for latency-oriented processors.
pub const SMALL_BUFFER_SIZE: usize = 256;

/// Default backlog for throughput-oriented shared services.
pub const MEDIUM_BUFFER_SIZE: usize = 8192;

/// Hard cap on ring-buffer capacity.
pub const MAX_BUFFER_SIZE: usize = 1 << 30;

/// Default worker-pool width: the available parallelism, capped at 2.
pub fn default_pool_size() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
        .min(2)
}

/// Closed set of wait strategies, for configuration surfaces that cannot
/// carry a trait object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitStrategyKind {
    #[default]
    Blocking,
    BusySpin,
    Yielding,
    Sleeping,
    Phased,
}

impl WaitStrategyKind {
    pub fn into_strategy(self) -> Arc<dyn WaitStrategy> {
        match self {
            WaitStrategyKind::Blocking => Arc::new(BlockingWaitStrategy::new()),
            WaitStrategyKind::BusySpin => Arc::new(BusySpinWaitStrategy::new()),
            WaitStrategyKind::Yielding => Arc::new(YieldingWaitStrategy::new()),
            WaitStrategyKind::Sleeping => {
                Arc::new(SleepingWaitStrategy::with_interval(Duration::from_micros(100)))
            }
            WaitStrategyKind::Phased => Arc::new(PhasedBackoffWaitStrategy::with_blocking_fallback()),
        }
    }
}

/// Whether the sequencer must arbitrate between concurrent publishers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProducerKind {
    #[default]
    Single,
    Multi,
}

/// Construction parameters for a processor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessorConfig {
    /// Label used to name worker threads (`{name}-{n}`).
    pub name: String,
    pub buffer_size: usize,
    pub producer: ProducerKind,
    pub wait_strategy: WaitStrategyKind,
    /// Propagate cancellation upstream when the last subscriber leaves.
    pub auto_cancel: bool,
}

impl ProcessorConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn buffer_size(mut self, buffer_size: usize) -> Self {
        self.buffer_size = buffer_size;
        self
    }

    pub fn producer(mut self, producer: ProducerKind) -> Self {
        self.producer = producer;
        self
    }

    pub fn wait_strategy(mut self, kind: WaitStrategyKind) -> Self {
        self.wait_strategy = kind;
        self
    }

    pub fn auto_cancel(mut self, auto_cancel: bool) -> Self {
        self.auto_cancel = auto_cancel;
        self
    }
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            name: "ringflow".to_string(),
            buffer_size: SMALL_BUFFER_SIZE,
            producer: ProducerKind::Single,
            wait_strategy: WaitStrategyKind::Blocking,
            auto_cancel: true,
        }
    }
}

/// Construction parameters for a shared processor service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub concurrency: usize,
    /// Complete the backing processor when the last logical subscriber
    /// unregisters.
    pub auto_shutdown: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            concurrency: default_pool_size(),
            auto_shutdown: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_factory_surface() {
        let config = ProcessorConfig::default();
        assert_eq!(config.buffer_size, SMALL_BUFFER_SIZE);
        assert_eq!(config.wait_strategy, WaitStrategyKind::Blocking);
        assert_eq!(config.producer, ProducerKind::Single);
        assert!(config.auto_cancel);

        let service = ServiceConfig::default();
        assert!(service.auto_shutdown);
        assert!(service.concurrency >= 1 && service.concurrency <= 2);
    }

    #[test]
    fn builder_style_overrides() {
        let config = ProcessorConfig::new("ticker")
            .buffer_size(1024)
            .producer(ProducerKind::Multi)
            .wait_strategy(WaitStrategyKind::Yielding)
            .auto_cancel(false);
        assert_eq!(config.name, "ticker");
        assert_eq!(config.buffer_size, 1024);
        assert_eq!(config.producer, ProducerKind::Multi);
        assert_eq!(config.wait_strategy, WaitStrategyKind::Yielding);
        assert!(!config.auto_cancel);
    }

    #[test]
    fn every_kind_builds_a_strategy() {
        for kind in [
            WaitStrategyKind::Blocking,
            WaitStrategyKind::BusySpin,
            WaitStrategyKind::Yielding,
            WaitStrategyKind::Sleeping,
            WaitStrategyKind::Phased,
        ] {
            let _strategy = kind.into_strategy();
        }
    }

}
