//! Scripted test double for the update api.
//!
//! [`MockUpdateApi`] replays a fixed sequence of responses and records
//! every observed request, so engine and facade tests can assert offsets,
//! batch-size clamping, and retry behavior without a network.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use capstan_core::Update;

use crate::api::{BotIdentity, GetUpdatesRequest, UpdateApi};
use crate::error::ApiError;

/// Minimal update record for tests.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestUpdate {
    /// Protocol-assigned id.
    pub update_id: u64,
    /// Free-form payload.
    pub payload: String,
}

impl TestUpdate {
    /// An update with an empty payload.
    #[must_use]
    pub fn new(update_id: u64) -> Self {
        Self {
            update_id,
            payload: String::new(),
        }
    }

    /// An update with a payload.
    #[must_use]
    pub fn with_payload(update_id: u64, payload: impl Into<String>) -> Self {
        Self {
            update_id,
            payload: payload.into(),
        }
    }
}

impl Update for TestUpdate {
    fn update_id(&self) -> u64 {
        self.update_id
    }
}

/// One scripted `get_updates` outcome.
pub enum ScriptedResponse {
    /// Resolve with a batch.
    Batch(Vec<TestUpdate>),
    /// Reject with a protocol error.
    Api {
        /// Protocol error code.
        code: u16,
        /// `retry_after` seconds, for rate limits.
        retry_after: Option<u64>,
    },
    /// Reject with a transport error.
    Transport(&'static str),
}

/// Scripted [`UpdateApi`] implementation.
///
/// Responses are consumed front to back; once the script is exhausted,
/// `get_updates` long-polls forever (until the token is raised), which is
/// what an idle real service looks like.
pub struct MockUpdateApi {
    identity: BotIdentity,
    responses: Mutex<VecDeque<ScriptedResponse>>,
    requests: Mutex<Vec<GetUpdatesRequest>>,
    identity_calls: AtomicU64,
}

impl Default for MockUpdateApi {
    fn default() -> Self {
        Self::new()
    }
}

impl MockUpdateApi {
    /// A mock with the default identity and an empty script.
    #[must_use]
    pub fn new() -> Self {
        Self {
            identity: BotIdentity {
                id: 1,
                username: "test_bot".to_string(),
            },
            responses: Mutex::new(VecDeque::new()),
            requests: Mutex::new(Vec::new()),
            identity_calls: AtomicU64::new(0),
        }
    }

    /// Replaces the scripted responses.
    #[must_use]
    pub fn with_responses(self, responses: Vec<ScriptedResponse>) -> Self {
        *self.responses.lock() = responses.into();
        self
    }

    /// Replaces the handshake identity.
    #[must_use]
    pub fn with_identity(mut self, identity: BotIdentity) -> Self {
        self.identity = identity;
        self
    }

    /// Number of handshake calls observed.
    #[must_use]
    pub fn identity_calls(&self) -> u64 {
        self.identity_calls.load(Ordering::SeqCst)
    }

    /// All observed `get_updates` requests.
    #[must_use]
    pub fn requests(&self) -> Vec<GetUpdatesRequest> {
        self.requests.lock().clone()
    }

    /// The offsets of all observed `get_updates` requests.
    #[must_use]
    pub fn observed_offsets(&self) -> Vec<u64> {
        self.requests.lock().iter().map(|r| r.offset).collect()
    }
}

#[async_trait]
impl UpdateApi for MockUpdateApi {
    type Update = TestUpdate;

    async fn identity(&self, _cancel: &CancellationToken) -> Result<BotIdentity, ApiError> {
        self.identity_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.identity.clone())
    }

    async fn get_updates(
        &self,
        request: &GetUpdatesRequest,
        cancel: &CancellationToken,
    ) -> Result<Vec<TestUpdate>, ApiError> {
        self.requests.lock().push(request.clone());
        let response = self.responses.lock().pop_front();
        match response {
            Some(ScriptedResponse::Batch(updates)) => Ok(updates),
            Some(ScriptedResponse::Api { code, retry_after }) => Err(ApiError::Api {
                code,
                description: format!("scripted error {code}"),
                retry_after,
            }),
            Some(ScriptedResponse::Transport(message)) => {
                Err(ApiError::Transport(message.into()))
            }
            None => {
                cancel.cancelled().await;
                Err(ApiError::Aborted)
            }
        }
    }
}
