//! Pluggable reconnection delay scheduling, used both by a
//! [`crate::pool::connection_pool::Pool`] scheduling its next connector and
//! by the [`crate::cluster::Cluster`] scheduling its next control
//! connection attempt.

use std::time::Duration;

use rand::Rng;

/// Produces a fresh [`ReconnectionSchedule`] each time something starts
/// reconnecting from scratch (e.g. a pool that just went `DOWN`).
pub trait ReconnectionPolicy: Send + Sync + std::fmt::Debug {
    /// Begins a new reconnection attempt sequence.
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule>;
}

/// Yields the delay to wait before each successive reconnection attempt.
pub trait ReconnectionSchedule: Send {
    /// The delay before the next attempt. Called once per attempt; state
    /// advances (e.g. exponential backoff grows) with each call.
    fn next_delay(&mut self) -> Duration;
}

/// A fixed delay between every attempt.
#[derive(Clone, Copy, Debug)]
pub struct ConstantReconnectionPolicy {
    delay: Duration,
}

impl ConstantReconnectionPolicy {
    /// Reconnects every `delay`, with no backoff.
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl ReconnectionPolicy for ConstantReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ConstantSchedule { delay: self.delay })
    }
}

struct ConstantSchedule {
    delay: Duration,
}

impl ReconnectionSchedule for ConstantSchedule {
    fn next_delay(&mut self) -> Duration {
        self.delay
    }
}

/// Doubles the delay on each attempt up to `max_delay`, with up to ±50%
/// jitter applied to avoid synchronized reconnect storms across many
/// clients.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
}

impl ExponentialReconnectionPolicy {
    /// Starts at `base_delay`, doubling each attempt, capped at `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self { base_delay, max_delay }
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn new_schedule(&self) -> Box<dyn ReconnectionSchedule> {
        Box::new(ExponentialSchedule {
            base_delay: self.base_delay,
            max_delay: self.max_delay,
            next: self.base_delay,
        })
    }
}

struct ExponentialSchedule {
    base_delay: Duration,
    max_delay: Duration,
    next: Duration,
}

impl ReconnectionSchedule for ExponentialSchedule {
    fn next_delay(&mut self) -> Duration {
        let delay = self.next.min(self.max_delay);
        self.next = (self.next * 2).min(self.max_delay);
        if self.next < self.base_delay {
            self.next = self.base_delay;
        }
        jitter(delay)
    }
}

fn jitter(delay: Duration) -> Duration {
    let factor = rand::rng().random_range(0.5..1.5);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_schedule_never_changes() {
        let policy = ConstantReconnectionPolicy::new(Duration::from_millis(500));
        let mut schedule = policy.new_schedule();
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
        assert_eq!(schedule.next_delay(), Duration::from_millis(500));
    }

    #[test]
    fn exponential_schedule_is_capped() {
        let policy = ExponentialReconnectionPolicy::new(
            Duration::from_millis(100),
            Duration::from_millis(300),
        );
        let mut schedule = policy.new_schedule();
        for _ in 0..10 {
            let delay = schedule.next_delay();
            assert!(delay <= Duration::from_millis(450));
        }
    }
}
