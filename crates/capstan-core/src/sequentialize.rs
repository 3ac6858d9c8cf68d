//! Per-key FIFO middleware.
//!
//! [`Sequentialize`] serializes handler invocations whose constraint sets
//! share at least one key, while letting disjoint-key invocations run
//! concurrently. Chains are linked on *settle*, not success: a rejected
//! task still releases everything queued behind it, so one failure never
//! poisons a chain.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::{BoxFuture, Shared};
use futures::FutureExt;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::error::HandlerError;
use crate::queue::ConsumeFn;
use crate::update::Update;

/// A future that resolves once some prior task settled (resolved *or*
/// rejected). Never fails itself.
type SettledFuture = Shared<BoxFuture<'static, ()>>;

struct ChainEntry {
    /// The most recent task registered under this key; later arrivals
    /// chain onto it.
    tail: SettledFuture,
    /// Number of live tasks referencing this key. The entry is removed
    /// when this drops to zero.
    refcount: usize,
}

type ChainMap = Arc<Mutex<HashMap<String, ChainEntry>>>;

/// Serializes invocations sharing any constraint key.
pub struct Sequentialize<Y> {
    chains: ChainMap,
    constraint: Arc<dyn Fn(&Y) -> Vec<String> + Send + Sync>,
}

impl<Y> Clone for Sequentialize<Y> {
    fn clone(&self) -> Self {
        Self {
            chains: Arc::clone(&self.chains),
            constraint: Arc::clone(&self.constraint),
        }
    }
}

impl<Y> Sequentialize<Y> {
    /// Creates the middleware from a constraint function. Empty keys are
    /// filtered out; duplicate keys are coalesced. An invocation whose
    /// constraint yields no keys runs unserialised.
    #[must_use]
    pub fn new(constraint: impl Fn(&Y) -> Vec<String> + Send + Sync + 'static) -> Self {
        Self {
            chains: Arc::new(Mutex::new(HashMap::new())),
            constraint: Arc::new(constraint),
        }
    }

    /// Number of keys currently holding a chain. Returns to zero once all
    /// tasks settled.
    #[must_use]
    pub fn chain_count(&self) -> usize {
        self.chains.lock().len()
    }

    /// Runs `next` for `update`, serialized against every invocation whose
    /// key set intersects this one, in arrival order.
    ///
    /// # Errors
    ///
    /// Rethrows the error of `next`. The chain itself settles either way.
    pub async fn run<F, Fut>(&self, update: Y, next: F) -> Result<(), HandlerError>
    where
        F: FnOnce(Y) -> Fut,
        Fut: Future<Output = Result<(), HandlerError>> + Send,
    {
        let mut keys = (self.constraint)(&update);
        keys.retain(|key| !key.is_empty());
        let mut deduped: Vec<String> = Vec::with_capacity(keys.len());
        for key in keys {
            if !deduped.contains(&key) {
                deduped.push(key);
            }
        }
        let keys = deduped;

        if keys.is_empty() {
            return next(update).await;
        }

        let (settle_tx, settle_rx) = oneshot::channel::<()>();
        let tail: SettledFuture = async move {
            let _ = settle_rx.await;
        }
        .boxed()
        .shared();

        // Register our tail and bump refcounts before awaiting anything,
        // so later arrivals chain onto us.
        let barriers: Vec<SettledFuture> = {
            let mut chains = self.chains.lock();
            keys.iter()
                .filter_map(|key| match chains.entry(key.clone()) {
                    Entry::Occupied(mut occupied) => {
                        let entry = occupied.get_mut();
                        let prior = entry.tail.clone();
                        entry.tail = tail.clone();
                        entry.refcount += 1;
                        Some(prior)
                    }
                    Entry::Vacant(vacant) => {
                        vacant.insert(ChainEntry {
                            tail: tail.clone(),
                            refcount: 1,
                        });
                        None
                    }
                })
                .collect()
        };

        // Settles our tail and releases the refcounts even if this future
        // is dropped mid-flight.
        let _guard = ChainGuard {
            chains: Arc::clone(&self.chains),
            keys,
            settle_tx: Some(settle_tx),
        };

        futures::future::join_all(barriers).await;
        next(update).await
    }
}

impl<Y: Update> Sequentialize<Y> {
    /// Wraps a consume handler so every invocation goes through this
    /// middleware.
    #[must_use]
    pub fn wrap(&self, inner: ConsumeFn<Y>) -> ConsumeFn<Y> {
        let this = self.clone();
        Arc::new(move |update: Y| {
            let this = this.clone();
            let inner = Arc::clone(&inner);
            async move { this.run(update, move |u| inner(u)).await }.boxed()
        })
    }
}

struct ChainGuard {
    chains: ChainMap,
    keys: Vec<String>,
    settle_tx: Option<oneshot::Sender<()>>,
}

impl Drop for ChainGuard {
    fn drop(&mut self) {
        if let Some(tx) = self.settle_tx.take() {
            let _ = tx.send(());
        }
        let mut chains = self.chains.lock();
        for key in &self.keys {
            if let Some(entry) = chains.get_mut(key) {
                entry.refcount -= 1;
                if entry.refcount == 0 {
                    chains.remove(key);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex as PlMutex;
    use std::time::Duration;
    use tokio::time::Instant;

    #[derive(Debug, Clone)]
    struct Keyed {
        id: u64,
        keys: Vec<&'static str>,
    }

    impl Update for Keyed {
        fn update_id(&self) -> u64 {
            self.id
        }
    }

    fn by_keys() -> Sequentialize<Keyed> {
        Sequentialize::new(|update: &Keyed| {
            update.keys.iter().map(|k| (*k).to_string()).collect()
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_overlapping_keys_serialize_in_arrival_order() {
        let seq = Arc::new(by_keys());
        let events: Arc<PlMutex<Vec<(&'static str, Duration)>>> = Arc::new(PlMutex::new(Vec::new()));
        let epoch = Instant::now();

        let spawn_task = |tag: &'static str, keys: Vec<&'static str>, id: u64| {
            let seq = Arc::clone(&seq);
            let events = Arc::clone(&events);
            tokio::spawn(async move {
                seq.run(Keyed { id, keys }, move |_| async move {
                    events.lock().push((tag, epoch.elapsed()));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(())
                })
                .await
                .unwrap();
            })
        };

        // A holds a..d; B shares c, so it must wait for A to settle.
        let a = spawn_task("a", vec!["a", "b", "c", "d"], 1);
        tokio::task::yield_now().await;
        let b = spawn_task("b", vec!["c", "e"], 2);

        a.await.unwrap();
        b.await.unwrap();

        let events = events.lock().clone();
        assert_eq!(events[0].0, "a");
        assert_eq!(events[1].0, "b");
        // B started only after A's 50 ms of work settled.
        assert!(events[1].1 >= events[0].1 + Duration::from_millis(50));

        assert_eq!(seq.chain_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disjoint_keys_run_concurrently() {
        let seq = Arc::new(by_keys());
        let started: Arc<PlMutex<Vec<Duration>>> = Arc::new(PlMutex::new(Vec::new()));
        let epoch = Instant::now();

        let mut handles = Vec::new();
        for (id, key) in [(1, "a"), (2, "b"), (3, "c")] {
            let seq = Arc::clone(&seq);
            let started = Arc::clone(&started);
            handles.push(tokio::spawn(async move {
                seq.run(
                    Keyed {
                        id,
                        keys: vec![key],
                    },
                    move |_| async move {
                        started.lock().push(epoch.elapsed());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        Ok(())
                    },
                )
                .await
                .unwrap();
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }

        // All three started without waiting on each other.
        for start in started.lock().iter() {
            assert!(*start < Duration::from_millis(50));
        }
        assert_eq!(seq.chain_count(), 0);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_chain() {
        let seq = Arc::new(by_keys());

        let failing = seq.run(
            Keyed {
                id: 1,
                keys: vec!["k"],
            },
            |_| async { Err::<(), HandlerError>("first failed".into()) },
        );

        let seq2 = Arc::clone(&seq);
        let second = async {
            seq2.run(
                Keyed {
                    id: 2,
                    keys: vec!["k"],
                },
                |_| async { Ok(()) },
            )
            .await
        };

        let (first_result, second_result) = tokio::join!(failing, second);
        assert_eq!(first_result.unwrap_err().to_string(), "first failed");
        second_result.unwrap();
        assert_eq!(seq.chain_count(), 0);
    }

    #[tokio::test]
    async fn test_empty_and_duplicate_keys() {
        let seq = by_keys();

        // No keys: runs unserialised, never touches the map.
        seq.run(
            Keyed {
                id: 1,
                keys: vec!["", ""],
            },
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(seq.chain_count(), 0);

        // Duplicate keys count once.
        seq.run(
            Keyed {
                id: 2,
                keys: vec!["k", "k"],
            },
            |_| async { Ok(()) },
        )
        .await
        .unwrap();
        assert_eq!(seq.chain_count(), 0);
    }

    #[tokio::test]
    async fn test_map_drains_after_settle() {
        let seq = Arc::new(by_keys());
        let mut handles = Vec::new();
        for id in 0..10 {
            let seq = Arc::clone(&seq);
            handles.push(tokio::spawn(async move {
                seq.run(
                    Keyed {
                        id,
                        keys: vec!["x", "y"],
                    },
                    |_| async {
                        tokio::task::yield_now().await;
                        Ok(())
                    },
                )
                .await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }
        assert_eq!(seq.chain_count(), 0);
    }
}
