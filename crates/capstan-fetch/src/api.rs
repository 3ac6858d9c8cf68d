//! The remote batch-pull interface contract.
//!
//! Only the shape of the protocol matters to the engine: a one-shot
//! identity handshake plus `get_updates(offset, limit, timeout) → updates`.
//! Implementations own HTTP, serialization, and authentication.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use capstan_core::Update;

use crate::error::ApiError;

/// Identity of the bot the runner is polling for, resolved by the one-shot
/// handshake before the first fetch. Also the seed handed to distributor
/// workers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BotIdentity {
    /// Account id.
    pub id: u64,
    /// Account username.
    pub username: String,
}

/// Arguments of one `get_updates` call.
#[derive(Debug, Clone, Serialize)]
pub struct GetUpdatesRequest {
    /// First update id the caller is interested in.
    pub offset: u64,
    /// Maximum number of updates to return, already clamped to the
    /// protocol-valid range `[1, 100]`.
    pub limit: usize,
    /// Long-poll timeout in seconds.
    pub timeout_secs: u64,
    /// Extra protocol arguments forwarded verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// A client for the remote batch-pull service.
#[async_trait]
pub trait UpdateApi: Send + Sync + 'static {
    /// The update record this service produces.
    type Update: Update;

    /// One-shot handshake resolving the bot identity. Called once before
    /// the first fetch.
    async fn identity(&self, cancel: &CancellationToken) -> Result<BotIdentity, ApiError>;

    /// Pulls newly observed updates at or after `request.offset`. Must
    /// abort with [`ApiError::Aborted`] when `cancel` is raised, and
    /// resolve with `0..=request.limit` updates otherwise.
    async fn get_updates(
        &self,
        request: &GetUpdatesRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self::Update>, ApiError>;
}

#[async_trait]
impl<A: UpdateApi> UpdateApi for std::sync::Arc<A> {
    type Update = A::Update;

    async fn identity(&self, cancel: &CancellationToken) -> Result<BotIdentity, ApiError> {
        (**self).identity(cancel).await
    }

    async fn get_updates(
        &self,
        request: &GetUpdatesRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<Self::Update>, ApiError> {
        (**self).get_updates(request, cancel).await
    }
}
