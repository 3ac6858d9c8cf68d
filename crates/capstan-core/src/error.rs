//! Error types shared across the engine.

use std::error::Error;

/// Boxed error produced by a user-supplied handler.
pub type HandlerError = Box<dyn Error + Send + Sync>;

/// Failure modes of an [`UpdateSupplier`](crate::source::UpdateSupplier) call.
#[derive(Debug, thiserror::Error)]
pub enum SupplyError {
    /// The call observed its cancellation token and gave up. The source
    /// treats this as a clean end of iteration, never as a failure.
    #[error("supply aborted by close")]
    Aborted,
    /// The supplier failed for good: retries exhausted or a non-recoverable
    /// protocol error.
    #[error("update supply failed: {0}")]
    Failed(#[source] HandlerError),
}

/// Terminal failures of the runner drive loop.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    /// The update supply failed while the runner was still running.
    #[error("update supply failed: {0}")]
    Supply(#[source] HandlerError),
    /// The drive task panicked or was aborted out from under the runner.
    #[error("runner task failed: {0}")]
    Task(String),
}

/// Failures when routing an update to a worker pool.
#[derive(Debug, thiserror::Error)]
pub enum DistributeError {
    /// The selected worker's channel is closed; the worker thread is gone.
    #[error("worker {0} is no longer running")]
    WorkerGone(usize),
}
