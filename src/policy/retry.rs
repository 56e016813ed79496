//! Retry decisions for `ERROR` responses other than `UNPREPARED` (which is
//! always handled transparently by the execution engine's re-prepare
//! logic, never consulted here).

use crate::protocol::Consistency;

/// The kind of write a `WriteTimeout`/`WriteFailure` error reports, as sent
/// on the wire (`SIMPLE`, `BATCH`, `BATCH_LOG`, `UNLOGGED_BATCH`, `CAS`).
pub type WriteType = String;

/// The inputs a retry policy needs to decide what to do next.
#[derive(Clone, Debug)]
pub struct RetryContext<'a> {
    /// The consistency level the failed request was issued at.
    pub consistency: Consistency,
    /// The number of replicas that responded or acknowledged.
    pub received: i32,
    /// The number of replicas required at the requested consistency.
    pub required: i32,
    /// The kind of write that failed, if this was a write error.
    pub write_type: Option<&'a str>,
    /// How many times this request has already been attempted (including
    /// the one that just failed), starting at 1.
    pub attempts: u32,
    /// Whether the request is known idempotent (only idempotent requests
    /// are retried on ambiguous outcomes like write timeouts).
    pub is_idempotent: bool,
}

/// What to do in response to an `ERROR`.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum RetryDecision {
    /// Retry on the same host, optionally at a different consistency.
    RetrySame {
        /// The consistency to retry at, or the original if unset.
        consistency: Option<Consistency>,
    },
    /// Retry on the next host in the query plan.
    RetryNext {
        /// The consistency to retry at, or the original if unset.
        consistency: Option<Consistency>,
    },
    /// Treat as a success with no data (used for read timeouts with enough
    /// partial data to be considered acceptable by the policy).
    Ignore,
    /// Give up and surface the error to the caller.
    Rethrow,
}

/// Decides what happens after a non-`UNPREPARED` typed server error.
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// Decides how to proceed after a write timeout.
    fn on_write_timeout(&self, ctx: &RetryContext) -> RetryDecision;
    /// Decides how to proceed after a read timeout.
    fn on_read_timeout(&self, ctx: &RetryContext) -> RetryDecision;
    /// Decides how to proceed after an unavailable-replicas error or other
    /// error not covered by a more specific method.
    fn on_other_error(&self, ctx: &RetryContext) -> RetryDecision;
}

/// The original driver's default: retry once on a write timeout for a
/// batch log write, retry once on a read timeout if enough replicas
/// responded to satisfy the consistency level even without the data
/// flag set, and never retry anything else.
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn on_write_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.attempts <= 1 && ctx.write_type == Some("BATCH_LOG") {
            RetryDecision::RetrySame { consistency: None }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_read_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.attempts <= 1 && ctx.received >= ctx.required {
            RetryDecision::RetrySame { consistency: None }
        } else {
            RetryDecision::Rethrow
        }
    }

    fn on_other_error(&self, _ctx: &RetryContext) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Like [`DefaultRetryPolicy`], but on an unavailable error retries once at
/// a lower consistency level rather than rethrowing, trading consistency
/// for availability.
#[derive(Clone, Copy, Debug, Default)]
pub struct DowngradingConsistencyRetryPolicy;

impl DowngradingConsistencyRetryPolicy {
    fn downgraded(consistency: Consistency) -> Consistency {
        match consistency {
            Consistency::Each => Consistency::LocalQuorum,
            Consistency::Quorum | Consistency::All => Consistency::One,
            other => other,
        }
    }
}

impl RetryPolicy for DowngradingConsistencyRetryPolicy {
    fn on_write_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        DefaultRetryPolicy.on_write_timeout(ctx)
    }

    fn on_read_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        DefaultRetryPolicy.on_read_timeout(ctx)
    }

    fn on_other_error(&self, ctx: &RetryContext) -> RetryDecision {
        if ctx.attempts <= 1 && ctx.received > 0 {
            RetryDecision::RetrySame {
                consistency: Some(Self::downgraded(ctx.consistency)),
            }
        } else {
            RetryDecision::Rethrow
        }
    }
}

/// Never retries; every error is surfaced to the caller.
#[derive(Clone, Copy, Debug, Default)]
pub struct FallthroughRetryPolicy;

impl RetryPolicy for FallthroughRetryPolicy {
    fn on_write_timeout(&self, _ctx: &RetryContext) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_read_timeout(&self, _ctx: &RetryContext) -> RetryDecision {
        RetryDecision::Rethrow
    }

    fn on_other_error(&self, _ctx: &RetryContext) -> RetryDecision {
        RetryDecision::Rethrow
    }
}

/// Wraps another policy, logging every decision at `debug` level before
/// returning it unchanged.
#[derive(Debug)]
pub struct LoggingRetryPolicy<P> {
    inner: P,
}

impl<P: RetryPolicy> LoggingRetryPolicy<P> {
    /// Wraps `inner`, logging each decision it makes.
    pub fn new(inner: P) -> Self {
        Self { inner }
    }
}

impl<P: RetryPolicy> RetryPolicy for LoggingRetryPolicy<P> {
    fn on_write_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        let decision = self.inner.on_write_timeout(ctx);
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(?decision, attempts = ctx.attempts, "write timeout retry decision");
        decision
    }

    fn on_read_timeout(&self, ctx: &RetryContext) -> RetryDecision {
        let decision = self.inner.on_read_timeout(ctx);
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(?decision, attempts = ctx.attempts, "read timeout retry decision");
        decision
    }

    fn on_other_error(&self, ctx: &RetryContext) -> RetryDecision {
        let decision = self.inner.on_other_error(ctx);
        #[cfg(feature = "tracing-unstable")]
        tracing::debug!(?decision, attempts = ctx.attempts, "retry decision");
        decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx(attempts: u32, received: i32, required: i32) -> RetryContext<'static> {
        RetryContext {
            consistency: Consistency::Quorum,
            received,
            required,
            write_type: None,
            attempts,
            is_idempotent: true,
        }
    }

    #[test]
    fn default_policy_retries_read_timeout_once_when_enough_replicas_responded() {
        let policy = DefaultRetryPolicy;
        let decision = policy.on_read_timeout(&ctx(1, 2, 2));
        assert_eq!(decision, RetryDecision::RetrySame { consistency: None });
        let decision = policy.on_read_timeout(&ctx(2, 2, 2));
        assert_eq!(decision, RetryDecision::Rethrow);
    }

    #[test]
    fn fallthrough_never_retries() {
        let policy = FallthroughRetryPolicy;
        assert_eq!(policy.on_read_timeout(&ctx(1, 2, 2)), RetryDecision::Rethrow);
    }
}
