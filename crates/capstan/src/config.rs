//! Configuration for a capstan runner.

use std::time::Duration;

use capstan_core::sink::DEFAULT_CONCURRENCY;
use capstan_fetch::FetchOptions;

/// How the sink dispatches the updates of one batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DispatchMode {
    /// One update at a time, strict input order.
    Sequential,
    /// Whole batch concurrently, completed as a unit.
    Batch,
    /// Bounded concurrency across batches, with capacity backpressure.
    #[default]
    Concurrent,
}

/// Configuration for a runner instance.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// In-flight bound of the concurrent dispatch mode.
    pub concurrency: usize,
    /// Dispatch mode of the sink.
    pub dispatch: DispatchMode,
    /// Per-update handler deadline (`None` = no deadline).
    pub timeout: Option<Duration>,
    /// Trade latency for reduced call volume, in `[0, 1]`.
    pub speed_traffic_balance: f64,
    /// Hard cap on the feedback-driven inter-batch wait.
    pub max_delay: Duration,
    /// Fetcher retry policy and forwarded protocol extras.
    pub fetch: FetchOptions,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: DEFAULT_CONCURRENCY,
            dispatch: DispatchMode::default(),
            timeout: None,
            speed_traffic_balance: 0.0,
            max_delay: Duration::from_millis(500),
            fetch: FetchOptions::default(),
        }
    }
}
