//! Request execution: query-plan-driven dispatch, prepared statement
//! bookkeeping, batches, and page-at-a-time iteration.

mod batch;
mod paging;
mod plan;
mod prepared;

pub(crate) use batch::{execute_batch, BatchEntry};
pub(crate) use paging::{Page, Paginator};
pub(crate) use plan::{ExecutionOutcome, ExecutionRequest, Executor, Statement};
pub(crate) use prepared::{PreparedStatementCache, PreparedStatementMetadata, ReprepareOnHost};
