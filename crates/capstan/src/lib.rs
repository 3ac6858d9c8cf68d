//! # capstan
//!
//! Long-polling update runner for chat-bot frameworks.
//!
//! A remote service exposes a batch-pull interface returning newly observed
//! updates (opaque records with a strictly monotonic `update_id`). capstan
//! continuously pulls batches, dispatches each update to your handler under
//! a bounded concurrency limit with per-update timeouts, feeds the sink's
//! remaining capacity back into the pull loop as backpressure, and hands
//! you a lifecycle handle.
//!
//! ```rust,ignore
//! let mut runner = capstan::run(api, |update| async move {
//!     bot.handle(update).await?;
//!     Ok(())
//! })?;
//!
//! // ... later:
//! runner.stop().await?;
//! ```
//!
//! For anything beyond the defaults, go through [`RunnerBuilder`]:
//! sequential or batch dispatch, per-key serialization via
//! [`RunnerBuilder::sequentialize`], worker-pool distribution via
//! [`RunnerBuilder::distribute`], timeouts, and the fetcher retry policy.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

mod builder;
mod config;

pub use builder::{BuildError, RunnerBuilder};
pub use config::{DispatchMode, RunnerConfig};

pub use capstan_core::distribute::{UpdateDistributor, WorkerInit, DEFAULT_WORKER_COUNT};
pub use capstan_core::queue::LateTask;
pub use capstan_core::sink::DEFAULT_CONCURRENCY;
pub use capstan_core::{
    HandlerError, RunnerError, Sequentialize, SupplyError, Update, UpdateRunner, UpdateSupplier,
};
pub use capstan_fetch::{
    ApiError, BotIdentity, FetchOptions, GetUpdatesRequest, RetryInterval, UpdateApi,
    UpdateFetcher,
};

use std::future::Future;

/// Starts a runner over `api` with the default configuration and the given
/// handler.
///
/// # Errors
///
/// Never fails in practice (the handler is supplied here); the `Result`
/// mirrors [`RunnerBuilder::start`].
pub fn run<A, F, Fut>(
    api: A,
    handler: F,
) -> Result<UpdateRunner<A::Update, UpdateFetcher<A>>, BuildError>
where
    A: UpdateApi,
    F: Fn(A::Update) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    RunnerBuilder::new(api).on_update(handler).start()
}
