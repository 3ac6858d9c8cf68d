//! Errors from the remote batch-pull service.

use std::time::Duration;

use capstan_core::HandlerError;

/// Error returned by an [`UpdateApi`](crate::api::UpdateApi) call.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// Transport-level failure (network, serialization). Retried by the
    /// fetcher.
    #[error("transport error: {0}")]
    Transport(#[source] HandlerError),
    /// Protocol-level rejection carrying an error code.
    #[error("api error {code}: {description}")]
    Api {
        /// Protocol error code.
        code: u16,
        /// Human-readable description from the service.
        description: String,
        /// Seconds to wait before retrying, when the service says so.
        retry_after: Option<u64>,
    },
    /// The call observed its cancellation token.
    #[error("request aborted")]
    Aborted,
}

impl ApiError {
    /// Whether this error must never be retried. `401` (the credentials
    /// are wrong) and `409` (another consumer is pulling the same stream)
    /// cannot resolve themselves.
    #[must_use]
    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Api { code: 401 | 409, .. })
    }

    /// The service-mandated pause before the next attempt, for rate-limit
    /// rejections that carry one.
    #[must_use]
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Api {
                code: 429,
                retry_after: Some(seconds),
                ..
            } => Some(Duration::from_secs(*seconds)),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16, retry_after: Option<u64>) -> ApiError {
        ApiError::Api {
            code,
            description: "test".to_string(),
            retry_after,
        }
    }

    #[test]
    fn test_unrecoverable_codes() {
        assert!(api_error(401, None).is_unrecoverable());
        assert!(api_error(409, None).is_unrecoverable());
        assert!(!api_error(429, None).is_unrecoverable());
        assert!(!api_error(500, None).is_unrecoverable());
        assert!(!ApiError::Transport("io".into()).is_unrecoverable());
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        assert_eq!(
            api_error(429, Some(7)).retry_after(),
            Some(Duration::from_secs(7))
        );
        assert_eq!(api_error(429, None).retry_after(), None);
        assert_eq!(api_error(500, Some(7)).retry_after(), None);
    }
}
