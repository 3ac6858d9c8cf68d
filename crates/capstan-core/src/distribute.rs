//! Round-robin dispatch to a pool of isolated workers.
//!
//! [`UpdateDistributor`] complements the queue's concurrency with CPU
//! parallelism: updates are routed by `update_id % N` to one of `N` worker
//! threads, each running its own single-threaded runtime so updates within
//! a worker are processed strictly in arrival order. Workers receive a
//! one-time seed message before any update and echo back each `update_id`
//! on completion, which resolves the parent-side waiter.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};

use crate::error::DistributeError;
use crate::queue::ConsumeFn;
use crate::update::Update;

/// Default size of the worker pool.
pub const DEFAULT_WORKER_COUNT: usize = 4;

/// Messages on the parent → worker channel.
pub enum WorkerMessage<Y, S> {
    /// One-time identity message, sent before any update.
    Seed(S),
    /// An update to process.
    Update(Y),
}

/// Builds a worker's consume handler from the seed it was given.
pub type WorkerInit<Y, S> = Arc<dyn Fn(S) -> ConsumeFn<Y> + Send + Sync>;

/// Waiters for completion acks, keyed by `update_id`.
///
/// The remote protocol guarantees strictly monotonic ids, so at most one
/// entry per id exists under normal operation; a queue per id keeps the
/// correlation correct even if that assumption is violated. Each waiter
/// carries a distributor-unique token so failure cleanup removes exactly
/// the waiter it registered, never another caller's live one.
type PendingMap = Arc<Mutex<HashMap<u64, VecDeque<(u64, oneshot::Sender<()>)>>>>;

/// Fixed-size pool of isolated workers with round-robin dispatch.
pub struct UpdateDistributor<Y: Update, S: Clone + Send + 'static> {
    senders: Vec<mpsc::UnboundedSender<WorkerMessage<Y, S>>>,
    pending: PendingMap,
    /// Source of the per-waiter tokens in [`PendingMap`].
    next_token: AtomicU64,
    threads: Vec<std::thread::JoinHandle<()>>,
}

impl<Y, S> UpdateDistributor<Y, S>
where
    Y: Update,
    S: Clone + Send + 'static,
{
    /// Spawns `count` worker threads, seeds each with `seed`, and starts
    /// the parent-side ack collector.
    ///
    /// Must be called within a tokio runtime (the collector task is
    /// spawned here).
    ///
    /// # Panics
    ///
    /// Panics if `count` is zero or a worker thread cannot be spawned.
    #[must_use]
    pub fn spawn(count: usize, seed: &S, init: WorkerInit<Y, S>) -> Self {
        assert!(count > 0, "worker pool must have at least one worker");

        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel::<u64>();

        let collector_pending = Arc::clone(&pending);
        tokio::spawn(async move {
            while let Some(update_id) = done_rx.recv().await {
                let waiter = {
                    let mut pending = collector_pending.lock();
                    match pending.get_mut(&update_id) {
                        Some(queue) => {
                            let waiter = queue.pop_front();
                            if queue.is_empty() {
                                pending.remove(&update_id);
                            }
                            waiter
                        }
                        None => None,
                    }
                };
                match waiter {
                    Some((_token, tx)) => {
                        let _ = tx.send(());
                    }
                    None => {
                        tracing::warn!(update_id, "Completion ack without a registered waiter");
                    }
                }
            }
        });

        let mut senders = Vec::with_capacity(count);
        let mut threads = Vec::with_capacity(count);
        for worker_idx in 0..count {
            let (tx, rx) = mpsc::unbounded_channel();
            // The seed goes out before any update can be enqueued.
            let _ = tx.send(WorkerMessage::Seed(seed.clone()));

            let init = Arc::clone(&init);
            let done = done_tx.clone();
            let thread = std::thread::Builder::new()
                .name(format!("capstan-worker-{worker_idx}"))
                .spawn(move || worker_main(worker_idx, rx, &init, &done))
                .expect("failed to spawn worker thread");

            senders.push(tx);
            threads.push(thread);
        }

        Self {
            senders,
            pending,
            next_token: AtomicU64::new(0),
            threads,
        }
    }

    /// Routes `update` to its worker and resolves once the worker echoes
    /// the `update_id` back.
    ///
    /// # Errors
    ///
    /// Returns [`DistributeError::WorkerGone`] when the selected worker's
    /// channel is closed.
    pub async fn process(&self, update: Y) -> Result<(), DistributeError> {
        let update_id = update.update_id();
        #[allow(clippy::cast_possible_truncation)]
        let worker = (update_id % self.senders.len() as u64) as usize;

        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .entry(update_id)
            .or_default()
            .push_back((token, tx));

        if self.senders[worker]
            .send(WorkerMessage::Update(update))
            .is_err()
        {
            // Discard exactly the waiter registered above; with duplicate
            // in-flight ids, the tail may belong to another live caller.
            let mut pending = self.pending.lock();
            if let Some(queue) = pending.get_mut(&update_id) {
                queue.retain(|(queued_token, _)| *queued_token != token);
                if queue.is_empty() {
                    pending.remove(&update_id);
                }
            }
            return Err(DistributeError::WorkerGone(worker));
        }

        rx.await.map_err(|_| DistributeError::WorkerGone(worker))
    }

    /// Size of the worker pool.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.senders.len()
    }

    /// Number of updates awaiting a completion ack.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.pending.lock().values().map(VecDeque::len).sum()
    }

    /// Closes the worker channels and joins the worker threads. Queued
    /// updates are still processed before each worker exits.
    ///
    /// Blocks the calling thread; from async code, wrap in
    /// `spawn_blocking`.
    pub fn shutdown(self) {
        drop(self.senders);
        for thread in self.threads {
            if thread.join().is_err() {
                tracing::warn!("Worker thread panicked during shutdown");
            }
        }
    }
}

/// Worker thread body: a single-threaded runtime processing messages in
/// arrival order.
fn worker_main<Y, S>(
    worker_idx: usize,
    mut rx: mpsc::UnboundedReceiver<WorkerMessage<Y, S>>,
    init: &WorkerInit<Y, S>,
    done: &mpsc::UnboundedSender<u64>,
) where
    Y: Update,
    S: Clone + Send + 'static,
{
    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
    {
        Ok(runtime) => runtime,
        Err(err) => {
            tracing::error!(worker = worker_idx, error = %err, "Worker runtime build failed");
            return;
        }
    };

    runtime.block_on(async {
        let mut consume: Option<ConsumeFn<Y>> = None;
        while let Some(message) = rx.recv().await {
            match message {
                WorkerMessage::Seed(seed) => {
                    consume = Some(init(seed));
                    tracing::debug!(worker = worker_idx, "Worker seeded");
                }
                WorkerMessage::Update(update) => {
                    let update_id = update.update_id();
                    match &consume {
                        Some(consume) => {
                            if let Err(err) = consume(update).await {
                                tracing::warn!(
                                    worker = worker_idx,
                                    update_id,
                                    error = %err,
                                    "Worker handler error"
                                );
                            }
                        }
                        None => {
                            tracing::error!(
                                worker = worker_idx,
                                update_id,
                                "Update before seed, dropping"
                            );
                        }
                    }
                    if done.send(update_id).is_err() {
                        break;
                    }
                }
            }
        }
    });
}
