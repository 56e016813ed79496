//! Client-assigned write timestamps.

use std::{
    sync::atomic::{AtomicI64, Ordering},
    time::{SystemTime, UNIX_EPOCH},
};

/// Produces the timestamp attached to a request, if any.
pub trait TimestampGenerator: Send + Sync + std::fmt::Debug {
    /// Returns the timestamp (microseconds since the epoch) to attach to the
    /// next request, or `None` to let the coordinator assign one.
    fn next(&self) -> Option<i64>;
}

/// Attaches no client timestamp; the coordinator assigns one on write.
#[derive(Clone, Copy, Debug, Default)]
pub struct ServerSideTimestamps;

impl TimestampGenerator for ServerSideTimestamps {
    fn next(&self) -> Option<i64> {
        None
    }
}

/// Attaches a strictly increasing microsecond timestamp derived from the
/// system clock, clamped forward by one microsecond whenever the clock is
/// observed to go backwards (or to not advance) relative to the last value
/// handed out.
#[derive(Debug, Default)]
pub struct MonotonicTimestampGenerator {
    last: AtomicI64,
}

impl MonotonicTimestampGenerator {
    /// Creates a generator with no prior timestamp issued.
    pub fn new() -> Self {
        Self {
            last: AtomicI64::new(i64::MIN),
        }
    }

    fn wall_clock_micros() -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the unix epoch")
            .as_micros() as i64
    }
}

impl TimestampGenerator for MonotonicTimestampGenerator {
    fn next(&self) -> Option<i64> {
        let wall_clock = Self::wall_clock_micros();
        let mut prev = self.last.load(Ordering::Relaxed);
        loop {
            let candidate = if wall_clock > prev { wall_clock } else { prev + 1 };
            match self
                .last
                .compare_exchange_weak(prev, candidate, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return Some(candidate),
                Err(actual) => prev = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_side_never_attaches_a_timestamp() {
        assert_eq!(ServerSideTimestamps.next(), None);
    }

    #[test]
    fn monotonic_generator_is_strictly_increasing_even_under_clock_regression() {
        let generator = MonotonicTimestampGenerator::new();
        let first = generator.next().unwrap();
        generator.last.store(first + 1_000_000, Ordering::Relaxed);
        let second = generator.next().unwrap();
        assert!(second > first);
        assert_eq!(second, first + 1_000_001);
    }
}
