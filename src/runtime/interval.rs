//! A fixed-period ticker used for per-connection heartbeats and
//! reconnection backoff scheduling.

use std::time::{Duration, Instant};

/// Wraps [`tokio::time::Interval`] so callers depend on this crate's own
/// type rather than `tokio::time` directly.
pub(crate) struct Interval {
    inner: tokio::time::Interval,
}

impl Interval {
    pub(crate) fn new(period: Duration) -> Self {
        let mut inner = tokio::time::interval(period);
        inner.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { inner }
    }

    pub(crate) async fn tick(&mut self) -> Instant {
        self.inner.tick().await.into_std()
    }
}
