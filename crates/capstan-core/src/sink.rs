//! Batch-to-queue adapter with three dispatch modes.
//!
//! [`UpdateSink`] feeds batches pulled by the runner into a single
//! [`DecayingDeque`]. The mode decides what "done" means for a batch and
//! what capacity is reported back:
//!
//! - **sequential** — one update at a time through a size-1 queue, strict
//!   FIFO, reports no downstream bound;
//! - **batch** — whole batch concurrently, returns once it fully drained,
//!   reports no downstream bound;
//! - **concurrent** (default) — forwards the batch to a bounded queue and
//!   reports its live capacity, which is the backpressure signal.

use std::sync::Arc;
use std::time::Duration;

use crate::metrics::QueueMetrics;
use crate::queue::{ConsumeFn, DecayingDeque, ErrorFn, TimeoutFn, UNBOUNDED_CAPACITY};
use crate::update::Update;

/// Default concurrency bound of the concurrent sink mode.
pub const DEFAULT_CONCURRENCY: usize = 500;

/// Timeout behavior shared by all sink modes.
pub struct SinkOptions<Y> {
    /// Per-task deadline; `None` disables expiry.
    pub timeout: Option<Duration>,
    /// Invoked synchronously when a task outlives the deadline.
    pub timeout_handler: TimeoutFn<Y>,
}

impl<Y> Default for SinkOptions<Y> {
    fn default() -> Self {
        Self {
            timeout: None,
            timeout_handler: Arc::new(|_, _| {}),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SinkMode {
    Sequential,
    Batch,
    Concurrent,
}

/// Adapter from a batch of updates to the task queue.
///
/// Cheaply cloneable; all clones share the underlying queue.
pub struct UpdateSink<Y: Update> {
    queue: DecayingDeque<Y>,
    mode: SinkMode,
}

impl<Y: Update> Clone for UpdateSink<Y> {
    fn clone(&self) -> Self {
        Self {
            queue: self.queue.clone(),
            mode: self.mode,
        }
    }
}

impl<Y: Update> UpdateSink<Y> {
    /// Sink processing updates strictly one-by-one, in input order.
    #[must_use]
    pub fn sequential(
        consume: ConsumeFn<Y>,
        error_handler: ErrorFn<Y>,
        options: SinkOptions<Y>,
    ) -> Self {
        Self {
            queue: DecayingDeque::new(
                options.timeout,
                Some(1),
                consume,
                error_handler,
                options.timeout_handler,
            ),
            mode: SinkMode::Sequential,
        }
    }

    /// Sink processing each batch concurrently but completing it as a unit.
    #[must_use]
    pub fn batch(consume: ConsumeFn<Y>, error_handler: ErrorFn<Y>, options: SinkOptions<Y>) -> Self {
        Self {
            queue: DecayingDeque::new(
                options.timeout,
                None,
                consume,
                error_handler,
                options.timeout_handler,
            ),
            mode: SinkMode::Batch,
        }
    }

    /// Sink processing updates concurrently under `concurrency` in-flight
    /// tasks, reporting live capacity back for backpressure.
    ///
    /// # Panics
    ///
    /// Panics if `concurrency` is zero.
    #[must_use]
    pub fn concurrent(
        consume: ConsumeFn<Y>,
        error_handler: ErrorFn<Y>,
        concurrency: usize,
        options: SinkOptions<Y>,
    ) -> Self {
        Self {
            queue: DecayingDeque::new(
                options.timeout,
                Some(concurrency),
                consume,
                error_handler,
                options.timeout_handler,
            ),
            mode: SinkMode::Concurrent,
        }
    }

    /// Feeds one batch through the sink and returns the number of
    /// additional updates the sink will accept next ([`UNBOUNDED_CAPACITY`]
    /// when the mode imposes no downstream bound).
    pub async fn handle(&self, batch: Vec<Y>) -> usize {
        match self.mode {
            SinkMode::Sequential => {
                for update in batch {
                    self.queue.add(vec![update]).await;
                }
                UNBOUNDED_CAPACITY
            }
            SinkMode::Batch => {
                self.queue.add(batch).await;
                self.queue.drained().await;
                UNBOUNDED_CAPACITY
            }
            SinkMode::Concurrent => self.queue.add(batch).await,
        }
    }

    /// Resolves once all in-flight work has finished.
    pub async fn drain(&self) {
        self.queue.drained().await;
    }

    /// Updates admitted but not yet completed, errored, or timed out, in
    /// insertion order.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Y> {
        self.queue.snapshot()
    }

    /// Current in-flight count.
    #[must_use]
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// Whether no work is in flight.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Queue metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        self.queue.metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use parking_lot::Mutex;

    #[derive(Debug, Clone)]
    struct TestUpdate {
        id: u64,
        tag: &'static str,
    }

    impl Update for TestUpdate {
        fn update_id(&self) -> u64 {
            self.id
        }
    }

    fn noop_error_handler() -> ErrorFn<TestUpdate> {
        Arc::new(|_, _| async { Ok(()) }.boxed())
    }

    /// Consume handler appending each update's tag to a shared record,
    /// after yielding so that out-of-order execution would be observable.
    fn recording_consume(record: Arc<Mutex<String>>) -> ConsumeFn<TestUpdate> {
        Arc::new(move |update: TestUpdate| {
            let record = Arc::clone(&record);
            async move {
                tokio::task::yield_now().await;
                record.lock().push_str(update.tag);
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_sequential_preserves_input_order() {
        let record = Arc::new(Mutex::new(String::new()));
        let sink = UpdateSink::sequential(
            recording_consume(Arc::clone(&record)),
            noop_error_handler(),
            SinkOptions::default(),
        );

        let capacity = sink
            .handle(vec![
                TestUpdate { id: 1, tag: "a" },
                TestUpdate { id: 2, tag: "b" },
            ])
            .await;

        assert_eq!(capacity, UNBOUNDED_CAPACITY);
        assert_eq!(*record.lock(), "ab");
    }

    #[tokio::test]
    async fn test_batch_returns_after_drain() {
        let record = Arc::new(Mutex::new(String::new()));
        let sink = UpdateSink::batch(
            recording_consume(Arc::clone(&record)),
            noop_error_handler(),
            SinkOptions::default(),
        );

        let capacity = sink
            .handle(vec![
                TestUpdate { id: 1, tag: "a" },
                TestUpdate { id: 2, tag: "b" },
                TestUpdate { id: 3, tag: "c" },
            ])
            .await;

        assert_eq!(capacity, UNBOUNDED_CAPACITY);
        assert_eq!(sink.len(), 0);
        assert_eq!(record.lock().len(), 3);
    }

    #[tokio::test]
    async fn test_concurrent_reports_capacity() {
        let record = Arc::new(Mutex::new(String::new()));
        let sink = UpdateSink::concurrent(
            recording_consume(Arc::clone(&record)),
            noop_error_handler(),
            12,
            SinkOptions::default(),
        );

        let capacity = sink.handle(vec![TestUpdate { id: 7, tag: "a" }]).await;
        assert!(capacity >= 11, "capacity: {capacity}");

        sink.drain().await;
        assert_eq!(*record.lock(), "a");
    }
}
