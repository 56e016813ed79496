//! Speculative execution: for idempotent requests, fire extra attempts on
//! later hosts in the query plan without waiting for the first to fail.

use std::time::Duration;

/// Decides whether and when to launch another speculative attempt.
///
/// The execution engine asks `new_plan` once per request (to get a fresh
/// state machine) and then calls `delay` repeatedly; each `Some(d)` schedules
/// one more attempt after `d` elapses, until either the request completes or
/// the policy returns `None`.
pub trait SpeculativeExecutionPolicy: Send + Sync + std::fmt::Debug {
    /// Creates a new per-request state machine.
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan>;
}

/// Per-request speculative execution state: how many more attempts remain
/// and how long to wait before each.
pub trait SpeculativeExecutionPlan: Send {
    /// The delay before the next speculative attempt, or `None` if no more
    /// attempts should be launched (cap reached).
    fn next_execution(&mut self, running: bool) -> Option<Duration>;
}

/// Never launches speculative attempts.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoSpeculativeExecution;

impl SpeculativeExecutionPolicy for NoSpeculativeExecution {
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan> {
        Box::new(NoSpeculativeExecutionPlan)
    }
}

#[derive(Debug)]
struct NoSpeculativeExecutionPlan;

impl SpeculativeExecutionPlan for NoSpeculativeExecutionPlan {
    fn next_execution(&mut self, _running: bool) -> Option<Duration> {
        None
    }
}

/// Launches another attempt every `delay`, up to `max_executions` extra
/// attempts beyond the first.
#[derive(Clone, Copy, Debug)]
pub struct ConstantSpeculativeExecutionPolicy {
    delay: Duration,
    max_executions: u32,
}

impl ConstantSpeculativeExecutionPolicy {
    /// Creates a policy allowing at most `max_executions` extra attempts,
    /// `delay` apart.
    pub fn new(delay: Duration, max_executions: u32) -> Self {
        Self { delay, max_executions }
    }
}

impl SpeculativeExecutionPolicy for ConstantSpeculativeExecutionPolicy {
    fn new_plan(&self) -> Box<dyn SpeculativeExecutionPlan> {
        Box::new(ConstantSpeculativeExecutionPlan {
            delay: self.delay,
            remaining: self.max_executions,
        })
    }
}

#[derive(Debug)]
struct ConstantSpeculativeExecutionPlan {
    delay: Duration,
    remaining: u32,
}

impl SpeculativeExecutionPlan for ConstantSpeculativeExecutionPlan {
    fn next_execution(&mut self, _running: bool) -> Option<Duration> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        Some(self.delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_speculative_execution_never_fires() {
        let mut plan = NoSpeculativeExecution.new_plan();
        assert_eq!(plan.next_execution(true), None);
    }

    #[test]
    fn constant_policy_caps_extra_attempts() {
        let policy = ConstantSpeculativeExecutionPolicy::new(Duration::from_millis(100), 2);
        let mut plan = policy.new_plan();
        assert_eq!(plan.next_execution(true), Some(Duration::from_millis(100)));
        assert_eq!(plan.next_execution(true), Some(Duration::from_millis(100)));
        assert_eq!(plan.next_execution(true), None);
    }
}
