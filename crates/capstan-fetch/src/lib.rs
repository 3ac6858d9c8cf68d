//! # capstan-fetch
//!
//! Adapter between the capstan engine and the remote batch-pull service.
//!
//! [`api::UpdateApi`] is the only thing the engine knows about the remote
//! protocol: a one-shot identity handshake and a
//! `get_updates(offset, limit, timeout)` shape. [`fetcher::UpdateFetcher`]
//! wraps an api implementation into an
//! [`UpdateSupplier`](capstan_core::UpdateSupplier) with offset tracking and
//! retry-with-backoff.

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod api;
pub mod error;
pub mod fetcher;
pub mod testing;

pub use api::{BotIdentity, GetUpdatesRequest, UpdateApi};
pub use error::ApiError;
pub use fetcher::{FetchOptions, RetryInterval, UpdateFetcher};
