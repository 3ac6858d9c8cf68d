//! # capstan-core
//!
//! Concurrency engine connecting a long-poll source to a user handler.
//!
//! The engine is built from small pieces that compose into a runner:
//!
//! - [`queue::DecayingDeque`] — bounded-concurrency task queue whose nodes
//!   self-expire at a fixed deadline.
//! - [`source::UpdateSource`] — adaptive pull loop over an
//!   [`source::UpdateSupplier`], with feedback-driven pacing and abort.
//! - [`sink::UpdateSink`] — adapter from a batch of updates to the deque,
//!   reporting live capacity back for backpressure.
//! - [`runner::UpdateRunner`] — drives `source → sink` and exposes the
//!   lifecycle handle.
//! - [`sequentialize::Sequentialize`] — per-key FIFO middleware.
//! - [`distribute::UpdateDistributor`] — round-robin dispatch to isolated
//!   workers.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod distribute;
pub mod error;
pub mod metrics;
pub mod queue;
pub mod runner;
pub mod sequentialize;
pub mod sink;
pub mod source;
pub mod update;

pub use error::{DistributeError, HandlerError, RunnerError, SupplyError};
pub use queue::{ConsumeFn, DecayingDeque, ErrorFn, LateTask, TimeoutFn, UNBOUNDED_CAPACITY};
pub use runner::UpdateRunner;
pub use sequentialize::Sequentialize;
pub use sink::{SinkOptions, UpdateSink, DEFAULT_CONCURRENCY};
pub use source::{SourceController, SourceOptions, UpdateSource, UpdateSupplier, MAX_BATCH_SIZE};
pub use update::Update;
