//! Retrying fetcher: the supplier implementation over an [`UpdateApi`].
//!
//! [`UpdateFetcher`] owns the pull offset and wraps every api call in the
//! retry policy: back off on transport failures per the configured
//! schedule, honor `retry_after` on rate limits, fail fast on
//! non-recoverable codes, and give up once the retry budget is exhausted.
//! All sleeps observe the cancellation token.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use capstan_core::{SupplyError, Update, UpdateSupplier, MAX_BATCH_SIZE};

use crate::api::{BotIdentity, GetUpdatesRequest, UpdateApi};
use crate::error::ApiError;

/// First delay of the exponential and quadratic schedules.
const INITIAL_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Additive step of the quadratic schedule.
const QUADRATIC_RETRY_STEP: Duration = Duration::from_millis(100);

/// Backoff schedule between retry attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryInterval {
    /// `t ← 2t`, starting at 100 ms.
    Exponential,
    /// `t ← t + 100 ms`, starting at 100 ms.
    Quadratic,
    /// The same fixed delay every time.
    Fixed(Duration),
}

impl Default for RetryInterval {
    fn default() -> Self {
        Self::Exponential
    }
}

impl RetryInterval {
    fn schedule(self) -> RetrySchedule {
        let next = match self {
            Self::Fixed(delay) => delay,
            Self::Exponential | Self::Quadratic => INITIAL_RETRY_DELAY,
        };
        RetrySchedule {
            interval: self,
            next,
        }
    }
}

struct RetrySchedule {
    interval: RetryInterval,
    next: Duration,
}

impl RetrySchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.next = match self.interval {
            RetryInterval::Exponential => delay * 2,
            RetryInterval::Quadratic => delay + QUADRATIC_RETRY_STEP,
            RetryInterval::Fixed(fixed) => fixed,
        };
        delay
    }
}

/// Fetcher configuration.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Total budget for retrying one api call. Once the next backoff would
    /// cross this budget, the last error is surfaced instead.
    pub max_retry_time: Duration,
    /// Backoff schedule between attempts.
    pub retry_interval: RetryInterval,
    /// Suppress the per-retry warning logs.
    pub silent: bool,
    /// Long-poll timeout forwarded to `get_updates`.
    pub poll_timeout: Duration,
    /// Extra `get_updates` arguments forwarded verbatim.
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            // 15 hours: long enough to ride out a full service outage.
            max_retry_time: Duration::from_millis(54_000_000),
            retry_interval: RetryInterval::default(),
            silent: false,
            poll_timeout: Duration::from_secs(30),
            extra: serde_json::Map::new(),
        }
    }
}

/// Supplier implementation over an [`UpdateApi`] with offset tracking and
/// retry-with-backoff.
pub struct UpdateFetcher<A: UpdateApi> {
    api: Arc<A>,
    options: FetchOptions,
    /// Advances to `max(update_id) + 1` after each successful batch, so no
    /// update is pulled twice unless the service violates monotonicity.
    offset: u64,
    /// Resolved by the one-shot handshake on the first supply call.
    identity: Option<BotIdentity>,
}

impl<A: UpdateApi> UpdateFetcher<A> {
    /// Creates a fetcher over `api`.
    #[must_use]
    pub fn new(api: A, options: FetchOptions) -> Self {
        Self {
            api: Arc::new(api),
            options,
            offset: 0,
            identity: None,
        }
    }

    /// The next update id to be requested.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The bot identity, once the handshake has run.
    #[must_use]
    pub fn identity(&self) -> Option<&BotIdentity> {
        self.identity.as_ref()
    }
}

#[async_trait]
impl<A: UpdateApi> UpdateSupplier<A::Update> for UpdateFetcher<A> {
    async fn supply(
        &mut self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<A::Update>, SupplyError> {
        if self.identity.is_none() {
            let api = Arc::clone(&self.api);
            let identity = retrying(&self.options, cancel, "identity", move |cancel| {
                let api = Arc::clone(&api);
                async move { api.identity(&cancel).await }.boxed()
            })
            .await?;
            tracing::info!(bot_id = identity.id, username = %identity.username, "Bot identity resolved");
            self.identity = Some(identity);
        }

        let request = GetUpdatesRequest {
            offset: self.offset,
            limit: batch_size.clamp(1, MAX_BATCH_SIZE),
            timeout_secs: self.options.poll_timeout.as_secs(),
            extra: self.options.extra.clone(),
        };
        let api = Arc::clone(&self.api);
        let updates = retrying(&self.options, cancel, "get_updates", move |cancel| {
            let api = Arc::clone(&api);
            let request = request.clone();
            async move { api.get_updates(&request, &cancel).await }.boxed()
        })
        .await?;

        if let Some(max_id) = updates.iter().map(Update::update_id).max() {
            self.offset = max_id + 1;
        }
        Ok(updates)
    }
}

/// Runs `attempt` under the retry policy until it succeeds, aborts, hits a
/// non-recoverable error, or exhausts the retry budget.
async fn retrying<T, F>(
    options: &FetchOptions,
    cancel: &CancellationToken,
    call: &'static str,
    mut attempt: F,
) -> Result<T, SupplyError>
where
    F: FnMut(CancellationToken) -> BoxFuture<'static, Result<T, ApiError>> + Send,
{
    let started = Instant::now();
    let mut schedule = options.retry_interval.schedule();
    loop {
        match attempt(cancel.clone()).await {
            Ok(value) => return Ok(value),
            Err(ApiError::Aborted) => return Err(SupplyError::Aborted),
            Err(err) if err.is_unrecoverable() => {
                tracing::error!(call, error = %err, "Non-recoverable api error");
                return Err(SupplyError::Failed(Box::new(err)));
            }
            Err(err) => {
                if let Some(wait) = err.retry_after() {
                    // Rate-limit waits count against the retry budget too;
                    // only the backoff schedule is exempt.
                    if started.elapsed() + wait >= options.max_retry_time {
                        tracing::error!(call, error = %err, "Retry budget exhausted");
                        return Err(SupplyError::Failed(Box::new(err)));
                    }
                    if !options.silent {
                        tracing::warn!(call, wait_secs = wait.as_secs(), "Rate limited, honoring retry_after");
                    }
                    if !sleep_unless_cancelled(wait, cancel).await {
                        return Err(SupplyError::Aborted);
                    }
                    // The schedule itself does not advance for rate limits.
                    continue;
                }

                let delay = schedule.next_delay();
                if started.elapsed() + delay >= options.max_retry_time {
                    tracing::error!(call, error = %err, "Retry budget exhausted");
                    return Err(SupplyError::Failed(Box::new(err)));
                }
                if !options.silent {
                    let retry_in_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
                    tracing::warn!(call, error = %err, retry_in_ms, "Api call failed, backing off");
                }
                if !sleep_unless_cancelled(delay, cancel).await {
                    return Err(SupplyError::Aborted);
                }
            }
        }
    }
}

/// Sleeps for `duration` unless `cancel` is raised first. Returns whether
/// the sleep completed.
async fn sleep_unless_cancelled(duration: Duration, cancel: &CancellationToken) -> bool {
    tokio::select! {
        () = cancel.cancelled() => false,
        () = tokio::time::sleep(duration) => true,
    }
}
