//! Fluent builder composing fetcher, source, sink, and runner.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use capstan_core::distribute::UpdateDistributor;
use capstan_core::queue::{ConsumeFn, ErrorFn, LateTask, TimeoutFn};
use capstan_core::sink::{SinkOptions, UpdateSink};
use capstan_core::source::{SourceOptions, UpdateSource};
use capstan_core::{HandlerError, Sequentialize, Update, UpdateRunner};
use capstan_fetch::{FetchOptions, UpdateApi, UpdateFetcher};

use crate::config::{DispatchMode, RunnerConfig};

/// Errors from [`RunnerBuilder::build`].
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    /// Neither an update handler nor a distributor was configured.
    #[error("no update handler was configured")]
    MissingHandler,
}

/// Fluent builder for a running [`UpdateRunner`].
///
/// # Example
///
/// ```rust,ignore
/// let mut runner = RunnerBuilder::new(api)
///     .concurrency(200)
///     .timeout(Duration::from_secs(10))
///     .on_update(|update| async move {
///         handle(update).await?;
///         Ok(())
///     })
///     .start()?;
/// runner.stop().await?;
/// ```
pub struct RunnerBuilder<A: UpdateApi> {
    api: A,
    config: RunnerConfig,
    handler: Option<ConsumeFn<A::Update>>,
    error_handler: Option<ErrorFn<A::Update>>,
    timeout_handler: Option<TimeoutFn<A::Update>>,
    constraint: Option<Arc<dyn Fn(&A::Update) -> Vec<String> + Send + Sync>>,
}

impl<A: UpdateApi> RunnerBuilder<A> {
    /// Creates a builder over `api` with the default configuration.
    #[must_use]
    pub fn new(api: A) -> Self {
        Self {
            api,
            config: RunnerConfig::default(),
            handler: None,
            error_handler: None,
            timeout_handler: None,
            constraint: None,
        }
    }

    /// Replaces the whole configuration.
    #[must_use]
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the update handler.
    #[must_use]
    pub fn on_update<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(A::Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.handler = Some(Arc::new(move |update| handler(update).boxed()));
        self
    }

    /// Sets the handler for update-handler rejections. Defaults to a
    /// structured error log.
    #[must_use]
    pub fn on_error<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(HandlerError, A::Update) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.error_handler = Some(Arc::new(move |err, update| handler(err, update).boxed()));
        self
    }

    /// Sets the synchronous handler invoked when an update outlives the
    /// configured timeout.
    #[must_use]
    pub fn on_timeout<F>(mut self, handler: F) -> Self
    where
        F: Fn(A::Update, LateTask) + Send + Sync + 'static,
    {
        self.timeout_handler = Some(Arc::new(handler));
        self
    }

    /// Serializes updates sharing any constraint key, in arrival order.
    #[must_use]
    pub fn sequentialize<F>(mut self, constraint: F) -> Self
    where
        F: Fn(&A::Update) -> Vec<String> + Send + Sync + 'static,
    {
        self.constraint = Some(Arc::new(constraint));
        self
    }

    /// Routes every update through a worker pool instead of an inline
    /// handler. Replaces any handler set via [`on_update`].
    ///
    /// [`on_update`]: RunnerBuilder::on_update
    #[must_use]
    pub fn distribute<S>(mut self, distributor: Arc<UpdateDistributor<A::Update, S>>) -> Self
    where
        S: Clone + Send + 'static,
    {
        self.handler = Some(Arc::new(move |update| {
            let distributor = Arc::clone(&distributor);
            async move {
                distributor
                    .process(update)
                    .await
                    .map_err(|err| Box::new(err) as HandlerError)
            }
            .boxed()
        }));
        self
    }

    /// Sets the dispatch mode of the sink.
    #[must_use]
    pub fn dispatch(mut self, mode: DispatchMode) -> Self {
        self.config.dispatch = mode;
        self
    }

    /// Sets the in-flight bound of the concurrent dispatch mode.
    #[must_use]
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.config.concurrency = concurrency;
        self
    }

    /// Sets the per-update handler deadline.
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = Some(timeout);
        self
    }

    /// Sets the speed/traffic balance (clamped to `[0, 1]`).
    #[must_use]
    pub fn speed_traffic_balance(mut self, balance: f64) -> Self {
        self.config.speed_traffic_balance = balance;
        self
    }

    /// Sets the hard cap on the inter-batch wait.
    #[must_use]
    pub fn max_delay(mut self, max_delay: Duration) -> Self {
        self.config.max_delay = max_delay;
        self
    }

    /// Sets the fetcher retry policy and forwarded extras.
    #[must_use]
    pub fn fetch(mut self, options: FetchOptions) -> Self {
        self.config.fetch = options;
        self
    }

    /// Composes fetcher → source → sink → runner. The runner is returned
    /// stopped; call [`UpdateRunner::start`] (or use [`start`]).
    ///
    /// [`start`]: RunnerBuilder::start
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingHandler`] when no handler was set.
    pub fn build(self) -> Result<UpdateRunner<A::Update, UpdateFetcher<A>>, BuildError> {
        let handler = self.handler.ok_or(BuildError::MissingHandler)?;
        let consume = match self.constraint {
            Some(constraint) => {
                let sequentialize = Sequentialize::new(move |update: &A::Update| constraint(update));
                sequentialize.wrap(handler)
            }
            None => handler,
        };

        let error_handler = self.error_handler.unwrap_or_else(default_error_handler);
        let sink_options = SinkOptions {
            timeout: self.config.timeout,
            timeout_handler: self
                .timeout_handler
                .unwrap_or_else(|| Arc::new(|_, _| {})),
        };
        let sink = match self.config.dispatch {
            DispatchMode::Sequential => UpdateSink::sequential(consume, error_handler, sink_options),
            DispatchMode::Batch => UpdateSink::batch(consume, error_handler, sink_options),
            DispatchMode::Concurrent => UpdateSink::concurrent(
                consume,
                error_handler,
                self.config.concurrency,
                sink_options,
            ),
        };

        let fetcher = UpdateFetcher::new(self.api, self.config.fetch);
        let source = UpdateSource::new(
            fetcher,
            SourceOptions {
                speed_traffic_balance: self.config.speed_traffic_balance,
                max_delay: self.config.max_delay,
            },
        );

        Ok(UpdateRunner::new(source, sink))
    }

    /// Builds the runner and starts it immediately.
    ///
    /// # Errors
    ///
    /// Returns [`BuildError::MissingHandler`] when no handler was set.
    pub fn start(self) -> Result<UpdateRunner<A::Update, UpdateFetcher<A>>, BuildError> {
        let mut runner = self.build()?;
        runner.start();
        Ok(runner)
    }
}

fn default_error_handler<Y: Update>() -> ErrorFn<Y> {
    Arc::new(|err, update| {
        let update_id = update.update_id();
        async move {
            tracing::error!(update_id, error = %err, "Unhandled error in update handler");
            Ok(())
        }
        .boxed()
    })
}
