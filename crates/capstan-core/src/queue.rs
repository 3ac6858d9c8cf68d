//! Bounded-concurrency task queue with per-task timeout expiry.
//!
//! [`DecayingDeque`] executes a bounded number of asynchronous handler tasks
//! concurrently. New work arrives in batches via [`DecayingDeque::add`],
//! which reports live capacity back to the caller once the queue has
//! headroom again — that number is the backpressure signal fed to the pull
//! loop. Every task is enqueued with a fixed deadline; a single per-queue
//! purge task expires whatever outlives it without blocking the slot.

use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::time::Instant;

use crate::error::HandlerError;
use crate::metrics::QueueMetrics;
use crate::update::Update;

/// Capacity value meaning "no downstream bound".
pub const UNBOUNDED_CAPACITY: usize = usize::MAX;

/// Fixed banner for error-handler failures. These are printed to stderr
/// directly: the error handler is the last line of defense, so its own
/// failure has nowhere else to go.
const ERROR_HANDLER_BANNER: &str = "[capstan] update error handler failed";

/// Handler invoked with each update admitted to the queue.
pub type ConsumeFn<Y> =
    Arc<dyn Fn(Y) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Handler invoked when `consume` rejects before its deadline. The node's
/// slot is released only after the returned future resolves.
pub type ErrorFn<Y> =
    Arc<dyn Fn(HandlerError, Y) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

/// Synchronous handler invoked when a task outlives its deadline. Receives
/// the update and a [`LateTask`] tracking the still-running handler.
pub type TimeoutFn<Y> = Arc<dyn Fn(Y, LateTask) + Send + Sync>;

/// Future handed to the timeout handler for a task that was purged at its
/// deadline while its handler was still running.
///
/// Resolves with the late task's eventual outcome: `Ok(())` when the handler
/// finally resolved (typically ignored), `Err` when it rejected. If the
/// handler vanishes without settling (e.g. its task panicked), the late task
/// resolves with `Ok(())`.
pub struct LateTask {
    rx: oneshot::Receiver<Result<(), HandlerError>>,
}

impl Future for LateTask {
    type Output = Result<(), HandlerError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Ok(())),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// One enqueued update. Nodes are kept in insertion order; since the timeout
/// is constant per queue, insertion order is also deadline order.
struct Node<Y> {
    seq: u64,
    update: Y,
    deadline: Option<Instant>,
    /// Set when `consume` settled but the node still occupies its slot
    /// (error-handler in flight). The purger skips completed nodes.
    completed: bool,
    late_rx: Option<oneshot::Receiver<Result<(), HandlerError>>>,
}

struct State<Y> {
    nodes: VecDeque<Node<Y>>,
    next_seq: u64,
}

struct Shared<Y: Update> {
    state: Mutex<State<Y>>,
    /// Live node count, observed by capacity and drain waiters.
    len_tx: watch::Sender<usize>,
    /// Pinged whenever the node set changes so the purger re-arms.
    wake_tx: watch::Sender<()>,
    consume: ConsumeFn<Y>,
    error_handler: ErrorFn<Y>,
    timeout_handler: TimeoutFn<Y>,
    timeout: Option<Duration>,
    metrics: Arc<QueueMetrics>,
}

/// Bounded-concurrency task queue whose nodes self-expire at a fixed
/// deadline.
///
/// Cheaply cloneable; all clones share the same queue. The queue never tears
/// itself down on handler failure — a rejecting `consume`, a timed-out task,
/// or even a failing error handler all release their slot and leave the
/// queue running.
pub struct DecayingDeque<Y: Update> {
    shared: Arc<Shared<Y>>,
    /// Fair lock ordering concurrent `add` callers FIFO by arrival.
    admission: Arc<tokio::sync::Mutex<()>>,
    limit: Option<usize>,
}

impl<Y: Update> Clone for DecayingDeque<Y> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            admission: Arc::clone(&self.admission),
            limit: self.limit,
        }
    }
}

impl<Y: Update> DecayingDeque<Y> {
    /// Creates a new queue.
    ///
    /// * `timeout` — per-task deadline; `None` disables expiry entirely.
    /// * `limit` — concurrency bound; `None` means unbounded.
    /// * `consume` — the per-update handler.
    /// * `error_handler` — invoked when `consume` rejects in time.
    /// * `timeout_handler` — invoked synchronously when a task expires.
    ///
    /// Must be called within a tokio runtime when `timeout` is set (the
    /// purge task is spawned here).
    ///
    /// # Panics
    ///
    /// Panics if `limit` is `Some(0)`.
    #[must_use]
    pub fn new(
        timeout: Option<Duration>,
        limit: Option<usize>,
        consume: ConsumeFn<Y>,
        error_handler: ErrorFn<Y>,
        timeout_handler: TimeoutFn<Y>,
    ) -> Self {
        assert!(limit != Some(0), "queue limit must be positive");

        let (len_tx, _) = watch::channel(0usize);
        let (wake_tx, wake_rx) = watch::channel(());
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                nodes: VecDeque::new(),
                next_seq: 0,
            }),
            len_tx,
            wake_tx,
            consume,
            error_handler,
            timeout_handler,
            timeout,
            metrics: Arc::new(QueueMetrics::default()),
        });

        if timeout.is_some() {
            // Holds only a Weak so the purger exits once the queue and all
            // in-flight tasks are gone.
            tokio::spawn(run_purger(Arc::downgrade(&shared), wake_rx));
        }

        Self {
            shared,
            admission: Arc::new(tokio::sync::Mutex::new(())),
            limit,
        }
    }

    /// Appends all `updates`, launches their consume tasks, and resolves
    /// with the remaining capacity.
    ///
    /// Bounded mode resolves with `limit - len` as soon as that value is
    /// positive — immediately if the queue already has headroom, otherwise
    /// once enough tasks complete. An `add` that fills the queue exactly
    /// therefore resolves only after at least one slot frees, and always
    /// with a positive number. Unbounded mode resolves at admission with
    /// [`UNBOUNDED_CAPACITY`].
    ///
    /// Concurrent callers are admitted in FIFO order of arrival.
    pub async fn add(&self, updates: Vec<Y>) -> usize {
        let _admitted = self.admission.lock().await;
        let mut len_rx = self.shared.len_tx.subscribe();

        {
            let mut state = self.shared.state.lock();
            let deadline = self.shared.timeout.map(|t| Instant::now() + t);
            for update in updates {
                let seq = state.next_seq;
                state.next_seq += 1;
                let (late_tx, late_rx) = oneshot::channel();
                state.nodes.push_back(Node {
                    seq,
                    update: update.clone(),
                    deadline,
                    completed: false,
                    late_rx: Some(late_rx),
                });
                spawn_task(Arc::clone(&self.shared), seq, update, late_tx);
            }
            let len = state.nodes.len();
            self.shared.len_tx.send_replace(len);
        }
        self.shared.wake_tx.send_replace(());

        match self.limit {
            None => UNBOUNDED_CAPACITY,
            Some(limit) => {
                let len = len_rx.wait_for(|&n| n < limit).await.map_or(0, |n| *n);
                limit - len
            }
        }
    }

    /// Resolves once the queue is empty.
    pub async fn drained(&self) {
        let mut len_rx = self.shared.len_tx.subscribe();
        let _ = len_rx.wait_for(|&n| n == 0).await;
    }

    /// Number of live nodes.
    #[must_use]
    pub fn len(&self) -> usize {
        *self.shared.len_tx.borrow()
    }

    /// Whether the queue currently holds no nodes.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The configured concurrency bound, if any.
    #[must_use]
    pub fn limit(&self) -> Option<usize> {
        self.limit
    }

    /// Updates of all nodes currently enqueued, in insertion order. Does
    /// not mutate the queue.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Y> {
        self.shared
            .state
            .lock()
            .nodes
            .iter()
            .map(|node| node.update.clone())
            .collect()
    }

    /// Queue metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<QueueMetrics> {
        Arc::clone(&self.shared.metrics)
    }
}

/// Launches the consume task for one node.
fn spawn_task<Y: Update>(
    shared: Arc<Shared<Y>>,
    seq: u64,
    update: Y,
    late_tx: oneshot::Sender<Result<(), HandlerError>>,
) {
    tokio::spawn(async move {
        let result = (shared.consume)(update.clone()).await;

        // Mark the node completed, or detect that the purger got there
        // first. A purged node no longer owns a slot; its outcome is
        // forwarded to whatever observer the timeout handler installed.
        let timed_out = {
            let mut state = shared.state.lock();
            match state.nodes.iter_mut().find(|node| node.seq == seq) {
                Some(node) => {
                    node.completed = true;
                    false
                }
                None => true,
            }
        };
        if timed_out {
            let _ = late_tx.send(result);
            return;
        }

        match result {
            Ok(()) => shared.metrics.record_completion(),
            Err(err) => {
                shared.metrics.record_handler_error();
                if let Err(handler_err) = (shared.error_handler)(err, update).await {
                    eprintln!("{ERROR_HANDLER_BANNER}: {handler_err}");
                }
            }
        }
        remove_node(&shared, seq);
    });
}

/// Removes a node and signals capacity waiters and the purger.
fn remove_node<Y: Update>(shared: &Shared<Y>, seq: u64) {
    let len = {
        let mut state = shared.state.lock();
        if let Some(pos) = state.nodes.iter().position(|node| node.seq == seq) {
            state.nodes.remove(pos);
        }
        state.nodes.len()
    };
    shared.len_tx.send_replace(len);
    shared.wake_tx.send_replace(());
}

/// The single timer task of a queue: sleeps until the oldest uncompleted
/// deadline, purges everything that has elapsed (possibly many nodes after
/// a long stall), then re-arms for the next oldest.
async fn run_purger<Y: Update>(weak: Weak<Shared<Y>>, mut wake_rx: watch::Receiver<()>) {
    loop {
        let next_deadline = match weak.upgrade() {
            None => return,
            Some(shared) => {
                let state = shared.state.lock();
                state
                    .nodes
                    .iter()
                    .find(|node| !node.completed)
                    .and_then(|node| node.deadline)
            }
        };

        match next_deadline {
            None => {
                if wake_rx.changed().await.is_err() {
                    return;
                }
            }
            Some(deadline) => {
                tokio::select! {
                    () = tokio::time::sleep_until(deadline) => {
                        let Some(shared) = weak.upgrade() else { return };
                        purge_expired(&shared);
                    }
                    changed = wake_rx.changed() => {
                        if changed.is_err() {
                            return;
                        }
                    }
                }
            }
        }
    }
}

/// Purges every uncompleted node whose deadline has elapsed, releasing
/// their slots immediately and handing the still-pending task to the
/// timeout handler.
fn purge_expired<Y: Update>(shared: &Shared<Y>) {
    let now = Instant::now();
    let mut expired = Vec::new();
    let len = {
        let mut state = shared.state.lock();
        let nodes = std::mem::take(&mut state.nodes);
        for node in nodes {
            let elapsed = !node.completed && node.deadline.is_some_and(|d| d <= now);
            if elapsed {
                expired.push(node);
            } else {
                state.nodes.push_back(node);
            }
        }
        state.nodes.len()
    };
    if expired.is_empty() {
        return;
    }

    shared.len_tx.send_replace(len);
    tracing::debug!(expired = expired.len(), remaining = len, "Purged timed-out tasks");

    // Handlers run outside the lock; they are synchronous by contract.
    for mut node in expired {
        shared.metrics.record_timeout();
        if let Some(rx) = node.late_rx.take() {
            (shared.timeout_handler)(node.update, LateTask { rx });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::Semaphore;
    use tokio::time::timeout;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestUpdate {
        id: u64,
        tag: &'static str,
    }

    impl TestUpdate {
        fn new(id: u64, tag: &'static str) -> Self {
            Self { id, tag }
        }
    }

    impl Update for TestUpdate {
        fn update_id(&self) -> u64 {
            self.id
        }
    }

    fn noop_error_handler() -> ErrorFn<TestUpdate> {
        Arc::new(|_, _| async { Ok(()) }.boxed())
    }

    fn noop_timeout_handler() -> TimeoutFn<TestUpdate> {
        Arc::new(|_, _| {})
    }

    /// Consume handler that completes once it can acquire (and keep) a
    /// permit from the gate.
    fn gated_consume(gate: Arc<Semaphore>) -> ConsumeFn<TestUpdate> {
        Arc::new(move |_| {
            let gate = Arc::clone(&gate);
            async move {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
                Ok(())
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn test_add_with_headroom_resolves_immediately() {
        let queue = DecayingDeque::new(
            None,
            Some(12),
            Arc::new(|_| futures::future::pending().boxed()),
            noop_error_handler(),
            noop_timeout_handler(),
        );

        let capacity = queue.add(vec![TestUpdate::new(7, "a")]).await;
        assert_eq!(capacity, 11);
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_unbounded_add_resolves_at_admission() {
        let queue = DecayingDeque::new(
            None,
            None,
            Arc::new(|_| futures::future::pending().boxed()),
            noop_error_handler(),
            noop_timeout_handler(),
        );

        let capacity = queue.add(vec![TestUpdate::new(1, "a")]).await;
        assert_eq!(capacity, UNBOUNDED_CAPACITY);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_resolves_once_a_slot_frees() {
        let gate = Arc::new(Semaphore::new(0));
        let queue = DecayingDeque::new(
            None,
            Some(3),
            gated_consume(Arc::clone(&gate)),
            noop_error_handler(),
            noop_timeout_handler(),
        );

        let updates: Vec<_> = (1..=6)
            .map(|id| TestUpdate::new(id, "x"))
            .collect();
        let mut add = Box::pin(queue.add(updates));

        // Nothing has drained yet: the future must stay pending.
        assert!(timeout(Duration::from_millis(10), add.as_mut()).await.is_err());

        // Three drained: len == limit, still no positive capacity.
        gate.add_permits(3);
        assert!(timeout(Duration::from_millis(10), add.as_mut()).await.is_err());

        // A fourth drains: len == 2, capacity 1.
        gate.add_permits(1);
        let capacity = add.await;
        assert_eq!(capacity, 1);
        assert!(queue.len() <= 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_purges_all_stuck_tasks() {
        let timeouts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&timeouts);
        let queue: DecayingDeque<TestUpdate> = DecayingDeque::new(
            Some(Duration::from_millis(5)),
            None,
            Arc::new(|_| futures::future::pending().boxed()),
            noop_error_handler(),
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        );

        let updates: Vec<_> = (1..=100).map(|id| TestUpdate::new(id, "x")).collect();
        queue.add(updates).await;
        assert_eq!(queue.len(), 100);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(queue.len(), 0);
        assert_eq!(timeouts.load(Ordering::SeqCst), 100);
        assert_eq!(queue.metrics().snapshot().timeouts, 100);
    }

    #[tokio::test]
    async fn test_handler_error_routed_and_slot_released() {
        let errors = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&errors);
        let queue = DecayingDeque::new(
            None,
            Some(1),
            Arc::new(|_| async { Err("boom".into()) }.boxed()),
            Arc::new(move |err, _| {
                let counter = Arc::clone(&counter);
                async move {
                    assert_eq!(err.to_string(), "boom");
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                }
                .boxed()
            }),
            noop_timeout_handler(),
        );

        queue.add(vec![TestUpdate::new(1, "a")]).await;
        queue.drained().await;
        assert_eq!(errors.load(Ordering::SeqCst), 1);
        assert_eq!(queue.metrics().snapshot().handler_errors, 1);
    }

    #[tokio::test]
    async fn test_failing_error_handler_still_releases_slot() {
        let queue = DecayingDeque::new(
            None,
            Some(1),
            Arc::new(|_| async { Err("boom".into()) }.boxed()),
            Arc::new(|_, _| async { Err("error handler also failed".into()) }.boxed()),
            noop_timeout_handler(),
        );

        queue.add(vec![TestUpdate::new(1, "a")]).await;
        queue.drained().await;
        assert_eq!(queue.len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_rejection_surfaces_through_late_task() {
        let late_slot: Arc<Mutex<Option<LateTask>>> = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&late_slot);
        let error_calls = Arc::new(AtomicUsize::new(0));
        let error_counter = Arc::clone(&error_calls);

        let queue = DecayingDeque::new(
            Some(Duration::from_millis(5)),
            None,
            Arc::new(|_| {
                async {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err("late boom".into())
                }
                .boxed()
            }),
            Arc::new(move |_, _| {
                error_counter.fetch_add(1, Ordering::SeqCst);
                async { Ok(()) }.boxed()
            }),
            Arc::new(move |_, late| {
                *slot.lock() = Some(late);
            }),
        );

        queue.add(vec![TestUpdate::new(1, "a")]).await;
        tokio::time::sleep(Duration::from_millis(6)).await;

        // Slot released at the deadline, handler still running.
        assert_eq!(queue.len(), 0);
        let late = late_slot.lock().take().expect("timeout handler not called");

        let outcome = late.await;
        assert_eq!(outcome.unwrap_err().to_string(), "late boom");
        // The regular error path must not fire for a purged node.
        assert_eq!(error_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_snapshot_preserves_insertion_order() {
        let gate = Arc::new(Semaphore::new(0));
        let queue = DecayingDeque::new(
            None,
            None,
            gated_consume(Arc::clone(&gate)),
            noop_error_handler(),
            noop_timeout_handler(),
        );

        queue
            .add(vec![
                TestUpdate::new(1, "a"),
                TestUpdate::new(2, "b"),
                TestUpdate::new(3, "c"),
            ])
            .await;

        let tags: Vec<_> = queue.snapshot().iter().map(|u| u.tag).collect();
        assert_eq!(tags, vec!["a", "b", "c"]);

        gate.add_permits(3);
        queue.drained().await;
        assert!(queue.snapshot().is_empty());
    }
}
