//! Transid sampling with rate-estimated polling.
//!
//! The watcher thread needs to know how long to sleep between transid
//! polls. `RateEstimator` keeps an exponentially weighted average of
//! transid growth; `TransidTracker` combines it with the metadata
//! source and the configured polling floor.

use fbs_btrfs::MetaSearch;
use fbs_error::Result;
use fbs_types::Transid;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::trace;

/// Smoothing factor applied to the previous rate on each new sample.
const RATE_DECAY: f64 = 0.9;
/// Never predict a wait longer than this.
const MAX_PREDICTED_WAIT: Duration = Duration::from_secs(3600);

#[derive(Debug, Default)]
struct RateInner {
    last_count: u64,
    last_change: Option<Instant>,
    /// Events per second, exponentially smoothed.
    rate: f64,
}

/// Exponentially weighted estimate of a monotonic counter's growth.
#[derive(Debug, Default)]
pub struct RateEstimator {
    inner: Mutex<RateInner>,
}

impl RateEstimator {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new observation of the counter.
    pub fn update(&self, count: u64) {
        let now = Instant::now();
        let mut inner = self.inner.lock();
        if inner.last_change.is_none() {
            inner.last_count = count;
            inner.last_change = Some(now);
            return;
        }
        if count <= inner.last_count {
            return;
        }
        let elapsed = inner
            .last_change
            .map(|t| now.duration_since(t).as_secs_f64())
            .unwrap_or(0.0)
            .max(1e-3);
        let delta = (count - inner.last_count) as f64;
        let instant_rate = delta / elapsed;
        inner.rate = if inner.rate > 0.0 {
            RATE_DECAY * inner.rate + (1.0 - RATE_DECAY) * instant_rate
        } else {
            instant_rate
        };
        inner.last_count = count;
        inner.last_change = Some(now);
    }

    /// Last observed counter value.
    #[must_use]
    pub fn count(&self) -> u64 {
        self.inner.lock().last_count
    }

    /// Expected wall time until the counter grows by `n`.
    ///
    /// With no growth observed yet there is nothing to extrapolate
    /// from; zero is returned so the caller's polling floor governs.
    #[must_use]
    pub fn seconds_for(&self, n: u64) -> Duration {
        let inner = self.inner.lock();
        if inner.rate <= 0.0 {
            return Duration::ZERO;
        }
        let secs = (n as f64 / inner.rate).min(MAX_PREDICTED_WAIT.as_secs_f64());
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Cached view of the filesystem transid.
pub struct TransidTracker {
    meta: Arc<dyn MetaSearch>,
    estimator: RateEstimator,
    min_poll: Duration,
}

impl TransidTracker {
    #[must_use]
    pub fn new(meta: Arc<dyn MetaSearch>, min_poll: Duration) -> Self {
        Self {
            meta,
            estimator: RateEstimator::new(),
            min_poll,
        }
    }

    /// Force a fresh read of the filesystem transid.
    pub fn sample(&self) -> Result<Transid> {
        let transid = self.meta.current_transid()?;
        self.estimator.update(transid);
        trace!(transid, "sampled filesystem transid");
        Ok(transid)
    }

    /// Last sampled transid.
    #[must_use]
    pub fn current(&self) -> Transid {
        self.estimator.count()
    }

    /// How long to wait before the next poll.
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        self.min_poll.max(self.estimator.seconds_for(1))
    }

    #[must_use]
    pub fn estimator(&self) -> &RateEstimator {
        &self.estimator
    }
}
