//! Adaptive long-poll source.
//!
//! [`UpdateSource`] presents an asynchronous sequence of update batches
//! pulled from an [`UpdateSupplier`]. Three feedback inputs shape the pull
//! loop: the externally set pace (how many updates the downstream will
//! accept next), a speed/traffic balance trading latency for call volume,
//! and a hard cap on the inter-batch wait. Cancellation is a
//! [`CancellationToken`] raised by [`SourceController::close`]; the token is
//! regenerated on close so a new consumer can resume iteration.

use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::SupplyError;
use crate::metrics::SourceMetrics;

/// Upper bound of the protocol-valid batch size range.
pub const MAX_BATCH_SIZE: usize = 100;

/// Pace value meaning "no downstream bound".
pub const PACE_UNLIMITED: usize = usize::MAX;

/// Length of the supply stats ring. Fixed so the pacing estimator runs in
/// constant memory no matter how long the source lives.
const STATS_RING: usize = 16;

/// Batch supplier consumed by the source.
///
/// Implementations clamp `batch_size` to the protocol-valid range `[1, 100]`,
/// must observe `cancel` (rejecting with [`SupplyError::Aborted`]), and
/// resolve with zero or more updates.
#[async_trait]
pub trait UpdateSupplier<Y>: Send + 'static {
    /// Pulls the next batch of at most `batch_size` updates.
    async fn supply(
        &mut self,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<Vec<Y>, SupplyError>;
}

struct ControllerInner {
    active: AtomicBool,
    pace: AtomicUsize,
    /// Current abort signal. Replaced with a fresh token on close so the
    /// source can be re-consumed after a stop.
    token: Mutex<CancellationToken>,
}

/// Clonable handle controlling a source from outside its drive loop.
#[derive(Clone)]
pub struct SourceController {
    inner: Arc<ControllerInner>,
}

impl SourceController {
    fn new() -> Self {
        Self {
            inner: Arc::new(ControllerInner {
                active: AtomicBool::new(true),
                pace: AtomicUsize::new(PACE_UNLIMITED),
                token: Mutex::new(CancellationToken::new()),
            }),
        }
    }

    /// Whether the source has not been closed since its last (re)start.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.inner.active.load(Ordering::Acquire)
    }

    /// Sets the maximum size of the next requested batch. Zero is treated
    /// as one: the source never stops asking entirely.
    pub fn set_pace(&self, pace: usize) {
        self.inner.pace.store(pace.max(1), Ordering::Release);
    }

    /// Current pace.
    #[must_use]
    pub fn pace(&self) -> usize {
        self.inner.pace.load(Ordering::Acquire)
    }

    /// Closes the source: raises the current abort signal (cancelling any
    /// in-flight supply and pacing sleep), marks the source inactive,
    /// resets the pace, and installs a fresh token for the next consumer.
    pub fn close(&self) {
        self.inner.active.store(false, Ordering::Release);
        self.inner.pace.store(PACE_UNLIMITED, Ordering::Release);
        let mut slot = self.inner.token.lock();
        slot.cancel();
        *slot = CancellationToken::new();
        tracing::debug!("Source closed");
    }

    /// Re-arms the source for a new consumer after a close.
    pub fn reopen(&self) {
        self.inner.active.store(true, Ordering::Release);
    }

    fn current_token(&self) -> CancellationToken {
        self.inner.token.lock().clone()
    }
}

/// Knobs for the feedback-driven pacing of a source.
#[derive(Debug, Clone)]
pub struct SourceOptions {
    /// Trade latency for reduced call volume, in `[0, 1]`. Zero keeps the
    /// pipeline hot at all times; one backs off aggressively when batches
    /// come back thin. Clamped on construction.
    pub speed_traffic_balance: f64,
    /// Hard cap on the inter-batch wait.
    pub max_delay: Duration,
}

impl Default for SourceOptions {
    fn default() -> Self {
        Self {
            speed_traffic_balance: 0.0,
            max_delay: Duration::from_millis(500),
        }
    }
}

/// Ring of the last [`STATS_RING`] supply observations with running sums,
/// backing the constant-memory pacing estimator.
#[derive(Debug, Default)]
struct SupplyStats {
    counts: [u64; STATS_RING],
    durations_ms: [u64; STATS_RING],
    idx: usize,
    sum_counts: u64,
    sum_durations_ms: u64,
}

impl SupplyStats {
    fn record(&mut self, count: usize, elapsed: Duration) {
        let elapsed_ms = u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX);
        self.sum_counts -= self.counts[self.idx];
        self.sum_durations_ms -= self.durations_ms[self.idx];
        self.counts[self.idx] = count as u64;
        self.durations_ms[self.idx] = elapsed_ms;
        self.sum_counts += self.counts[self.idx];
        self.sum_durations_ms += elapsed_ms;
        self.idx = (self.idx + 1) % STATS_RING;
    }

    /// `wait = max_delay * tanh(balance * sum(durations) / max(1, sum(counts)))`
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn pacing_delay(&self, balance: f64, max_delay: Duration) -> Duration {
        let estimate = balance * self.sum_durations_ms as f64 / self.sum_counts.max(1) as f64;
        let wait_ms = max_delay.as_millis() as f64 * estimate.tanh();
        if wait_ms <= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_millis(wait_ms as u64)
        }
    }
}

/// Pull loop over an [`UpdateSupplier`] with feedback-driven pacing.
///
/// Owned by exactly one drive loop at a time (`&mut` iteration); control
/// from the outside goes through the clonable [`SourceController`].
pub struct UpdateSource<Y, S> {
    supplier: S,
    ctl: SourceController,
    stats: SupplyStats,
    /// Precomputed `100 * speed_traffic_balance / max(1, max_delay_ms)`.
    balance: f64,
    max_delay: Duration,
    /// Delay computed after the previous batch, applied before the next
    /// supply call.
    pending_delay: Option<Duration>,
    metrics: Arc<SourceMetrics>,
    _updates: PhantomData<fn() -> Y>,
}

impl<Y, S> UpdateSource<Y, S>
where
    Y: Send + 'static,
    S: UpdateSupplier<Y>,
{
    /// Creates a source over `supplier`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn new(supplier: S, options: SourceOptions) -> Self {
        let balance_input = options.speed_traffic_balance.clamp(0.0, 1.0);
        let max_delay_ms = options.max_delay.as_millis().max(1);
        Self {
            supplier,
            ctl: SourceController::new(),
            stats: SupplyStats::default(),
            balance: 100.0 * balance_input / max_delay_ms as f64,
            max_delay: options.max_delay,
            pending_delay: None,
            metrics: Arc::new(SourceMetrics::default()),
            _updates: PhantomData,
        }
    }

    /// Control handle for this source.
    #[must_use]
    pub fn controller(&self) -> SourceController {
        self.ctl.clone()
    }

    /// Source metrics handle.
    #[must_use]
    pub fn metrics(&self) -> Arc<SourceMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Pulls the next batch.
    ///
    /// Returns `None` once the source is closed (including a close that
    /// lands mid-supply or mid-pacing-sleep: abort-induced failures end
    /// iteration silently). A non-abort supply failure closes the source
    /// and surfaces as `Some(Err(..))`.
    pub async fn next_batch(&mut self) -> Option<Result<Vec<Y>, SupplyError>> {
        if !self.ctl.is_active() {
            return None;
        }

        if let Some(delay) = self.pending_delay.take() {
            let token = self.ctl.current_token();
            tokio::select! {
                () = token.cancelled() => return None,
                () = tokio::time::sleep(delay) => {}
            }
        }

        let token = self.ctl.current_token();
        let batch_size = self.ctl.pace();
        let started = Instant::now();
        match self.supplier.supply(batch_size, &token).await {
            Ok(batch) => {
                let elapsed = started.elapsed();
                let latency_ns = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
                self.metrics.record_supply(batch.len() as u64, latency_ns);
                self.stats.record(batch.len(), elapsed);

                // Back off only when batches come back thin; a full batch
                // means there is more waiting right now.
                let wait = self.stats.pacing_delay(self.balance, self.max_delay);
                if wait > Duration::ZERO && batch.len() < MAX_BATCH_SIZE {
                    self.pending_delay = Some(wait);
                }
                Some(Ok(batch))
            }
            Err(SupplyError::Aborted) => {
                tracing::debug!("Supply aborted, ending iteration");
                None
            }
            Err(err) => {
                self.metrics.record_failure();
                self.ctl.close();
                Some(Err(err))
            }
        }
    }
}
