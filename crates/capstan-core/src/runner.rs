//! Runner glue: drive `source → sink`, propagate capacity, own lifecycle.
//!
//! [`UpdateRunner`] composes an [`UpdateSource`] and an [`UpdateSink`] into
//! a controllable loop. Each yielded batch goes through the sink; the
//! capacity the sink reports back becomes the pace of the next pull. The
//! source itself is parked while stopped so the runner can be started
//! again after a stop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::task::JoinHandle;

use crate::error::{RunnerError, SupplyError};
use crate::sink::UpdateSink;
use crate::source::{SourceController, UpdateSource, UpdateSupplier};
use crate::update::Update;

/// Lifecycle handle around a `source → sink` drive loop.
pub struct UpdateRunner<Y: Update, S: UpdateSupplier<Y>> {
    running: Arc<AtomicBool>,
    ctl: SourceController,
    sink: UpdateSink<Y>,
    /// The source is parked here between runs; the drive task takes it on
    /// start and puts it back on exit.
    parked: Arc<tokio::sync::Mutex<Option<UpdateSource<Y, S>>>>,
    task: Option<JoinHandle<Result<(), RunnerError>>>,
}

impl<Y, S> UpdateRunner<Y, S>
where
    Y: Update,
    S: UpdateSupplier<Y>,
{
    /// Creates a runner over `source` and `sink`. Call [`start`] to begin
    /// processing.
    ///
    /// [`start`]: UpdateRunner::start
    #[must_use]
    pub fn new(source: UpdateSource<Y, S>, sink: UpdateSink<Y>) -> Self {
        let ctl = source.controller();
        Self {
            running: Arc::new(AtomicBool::new(false)),
            ctl,
            sink,
            parked: Arc::new(tokio::sync::Mutex::new(Some(source))),
            task: None,
        }
    }

    /// Spawns the drive loop. A no-op if the runner is already running.
    pub fn start(&mut self) {
        if self.running.swap(true, Ordering::SeqCst) {
            return;
        }
        self.ctl.reopen();

        let running = Arc::clone(&self.running);
        let ctl = self.ctl.clone();
        let sink = self.sink.clone();
        let parked = Arc::clone(&self.parked);

        self.task = Some(tokio::spawn(async move {
            let Some(mut source) = parked.lock().await.take() else {
                // A previous drive task still owns the source; nothing to do.
                running.store(false, Ordering::SeqCst);
                return Ok(());
            };
            tracing::debug!("Runner started");

            let result = drive(&mut source, &sink, &running, &ctl).await;

            // Whatever ended the loop, in-flight handler work finishes
            // before the completion future resolves.
            sink.drain().await;
            *parked.lock().await = Some(source);
            running.store(false, Ordering::SeqCst);
            tracing::debug!("Runner stopped");
            result
        }));
    }

    /// Stops the runner: flips the running flag, closes the source
    /// (aborting any in-flight supply), and awaits in-flight handler work.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the drive loop, if it failed before
    /// the stop.
    pub async fn stop(&mut self) -> Result<(), RunnerError> {
        self.running.store(false, Ordering::SeqCst);
        self.ctl.close();
        self.join().await
    }

    /// Awaits the completion of the current drive loop without stopping it.
    /// Resolves immediately when the runner was never started.
    ///
    /// # Errors
    ///
    /// Returns the terminal error of the drive loop.
    pub async fn join(&mut self) -> Result<(), RunnerError> {
        match self.task.take() {
            None => Ok(()),
            Some(handle) => handle
                .await
                .unwrap_or_else(|join_err| Err(RunnerError::Task(join_err.to_string()))),
        }
    }

    /// Handle on the current completion future, if a drive loop is live.
    #[must_use]
    pub fn task(&mut self) -> Option<&mut JoinHandle<Result<(), RunnerError>>> {
        self.task.as_mut()
    }

    /// Whether the loop is running and the source has not been closed.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst) && self.ctl.is_active()
    }

    /// Current in-flight update count.
    #[must_use]
    pub fn size(&self) -> usize {
        self.sink.len()
    }

    /// The sink driving handler execution (snapshot, metrics).
    #[must_use]
    pub fn sink(&self) -> &UpdateSink<Y> {
        &self.sink
    }
}

/// The loop proper: pull, dispatch, feed capacity back as pace.
async fn drive<Y, S>(
    source: &mut UpdateSource<Y, S>,
    sink: &UpdateSink<Y>,
    running: &AtomicBool,
    ctl: &SourceController,
) -> Result<(), RunnerError>
where
    Y: Update,
    S: UpdateSupplier<Y>,
{
    loop {
        match source.next_batch().await {
            None => return Ok(()),
            Some(Err(err)) => {
                if running.load(Ordering::SeqCst) {
                    let SupplyError::Failed(inner) = err else {
                        return Ok(());
                    };
                    return Err(RunnerError::Supply(inner));
                }
                // Errors after a stop are expected abort artifacts.
                tracing::debug!(error = %err, "Ignoring supply error after stop");
                return Ok(());
            }
            Some(Ok(batch)) => {
                let capacity = sink.handle(batch).await;
                if !running.load(Ordering::SeqCst) {
                    return Ok(());
                }
                ctl.set_pace(capacity);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::FutureExt;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    use crate::queue::{ConsumeFn, ErrorFn};
    use crate::sink::SinkOptions;
    use crate::source::SourceOptions;

    #[derive(Debug, Clone, PartialEq, Eq)]
    struct TestUpdate(u64);

    impl Update for TestUpdate {
        fn update_id(&self) -> u64 {
            self.0
        }
    }

    /// Supplier yielding scripted batches, then blocking until cancelled.
    struct ScriptedSupplier {
        batches: Vec<Vec<TestUpdate>>,
        paces: Arc<Mutex<Vec<usize>>>,
    }

    #[async_trait]
    impl UpdateSupplier<TestUpdate> for ScriptedSupplier {
        async fn supply(
            &mut self,
            batch_size: usize,
            cancel: &CancellationToken,
        ) -> Result<Vec<TestUpdate>, crate::error::SupplyError> {
            self.paces.lock().push(batch_size);
            if self.batches.is_empty() {
                cancel.cancelled().await;
                return Err(crate::error::SupplyError::Aborted);
            }
            Ok(self.batches.remove(0))
        }
    }

    fn collecting_sink(seen: Arc<Mutex<Vec<u64>>>, concurrency: usize) -> UpdateSink<TestUpdate> {
        let consume: ConsumeFn<TestUpdate> = Arc::new(move |update: TestUpdate| {
            let seen = Arc::clone(&seen);
            async move {
                seen.lock().push(update.update_id());
                Ok(())
            }
            .boxed()
        });
        let error_handler: ErrorFn<TestUpdate> = Arc::new(|_, _| async { Ok(()) }.boxed());
        UpdateSink::concurrent(consume, error_handler, concurrency, SinkOptions::default())
    }

    #[tokio::test]
    async fn test_processes_batches_and_feeds_pace_back() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let paces = Arc::new(Mutex::new(Vec::new()));
        let supplier = ScriptedSupplier {
            batches: vec![vec![TestUpdate(1), TestUpdate(2)], vec![TestUpdate(3)]],
            paces: Arc::clone(&paces),
        };
        let source = UpdateSource::new(supplier, SourceOptions::default());
        let sink = collecting_sink(Arc::clone(&seen), 12);
        let mut runner = UpdateRunner::new(source, sink);

        runner.start();
        assert!(runner.is_running());

        tokio::time::sleep(Duration::from_millis(20)).await;
        runner.stop().await.unwrap();

        let mut ids = seen.lock().clone();
        ids.sort_unstable();
        assert_eq!(ids, vec![1, 2, 3]);

        // The second and third pulls were paced by the sink's capacity.
        let paces = paces.lock().clone();
        assert!(paces.len() >= 3);
        assert!(paces[1] <= 12);
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_stop_awaits_in_flight_work() {
        let gate = Arc::new(tokio::sync::Semaphore::new(0));
        let done = Arc::new(Mutex::new(false));
        let consume_gate = Arc::clone(&gate);
        let consume_done = Arc::clone(&done);
        let consume: ConsumeFn<TestUpdate> = Arc::new(move |_| {
            let gate = Arc::clone(&consume_gate);
            let done = Arc::clone(&consume_done);
            async move {
                let permit = gate.acquire().await.expect("gate closed");
                permit.forget();
                *done.lock() = true;
                Ok(())
            }
            .boxed()
        });
        let error_handler: ErrorFn<TestUpdate> = Arc::new(|_, _| async { Ok(()) }.boxed());
        let sink = UpdateSink::concurrent(consume, error_handler, 8, SinkOptions::default());

        let supplier = ScriptedSupplier {
            batches: vec![vec![TestUpdate(1)]],
            paces: Arc::new(Mutex::new(Vec::new())),
        };
        let source = UpdateSource::new(supplier, SourceOptions::default());
        let mut runner = UpdateRunner::new(source, sink);

        runner.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(runner.size(), 1);

        let release = {
            let gate = Arc::clone(&gate);
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(10)).await;
                gate.add_permits(1);
            })
        };

        runner.stop().await.unwrap();
        assert!(*done.lock(), "stop resolved before in-flight work finished");
        assert_eq!(runner.size(), 0);
        release.await.unwrap();
    }

    #[tokio::test]
    async fn test_error_while_running_propagates() {
        struct FailingSupplier;

        #[async_trait]
        impl UpdateSupplier<TestUpdate> for FailingSupplier {
            async fn supply(
                &mut self,
                _batch_size: usize,
                _cancel: &CancellationToken,
            ) -> Result<Vec<TestUpdate>, crate::error::SupplyError> {
                Err(crate::error::SupplyError::Failed("409 conflict".into()))
            }
        }

        let source = UpdateSource::new(FailingSupplier, SourceOptions::default());
        let sink = collecting_sink(Arc::new(Mutex::new(Vec::new())), 8);
        let mut runner = UpdateRunner::new(source, sink);

        runner.start();
        let err = runner.join().await.unwrap_err();
        assert!(matches!(err, RunnerError::Supply(_)));
        assert!(!runner.is_running());
    }

    #[tokio::test]
    async fn test_restart_after_stop() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let supplier = ScriptedSupplier {
            batches: vec![vec![TestUpdate(1)], vec![TestUpdate(2)]],
            paces: Arc::new(Mutex::new(Vec::new())),
        };
        let source = UpdateSource::new(supplier, SourceOptions::default());
        let sink = collecting_sink(Arc::clone(&seen), 8);
        let mut runner = UpdateRunner::new(source, sink);

        runner.start();
        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.stop().await.unwrap();
        let after_first = seen.lock().len();
        assert!(after_first >= 1);

        runner.start();
        assert!(runner.is_running());
        tokio::time::sleep(Duration::from_millis(10)).await;
        runner.stop().await.unwrap();
    }
}
