//! Batch statement construction: assembles a `BATCH` request body from a
//! mix of ad-hoc and prepared statements and runs it through the same
//! execution engine as a single statement.

use crate::{
    error::Result,
    protocol::{BatchRequest, BatchStatement, BatchType, Consistency, RoutingKey},
};

use super::plan::{ExecutionOutcome, ExecutionRequest, Executor, Statement};

/// One statement to include in a batch, mirroring [`BatchStatement`] but
/// kept at this layer so callers build batches the same way they build
/// single statements.
pub(crate) enum BatchEntry {
    Query(String, Vec<crate::protocol::CqlValue>),
    Prepared(bytes::Bytes, Vec<crate::protocol::CqlValue>),
}

/// Builds and executes a `BATCH` request.
#[allow(clippy::too_many_arguments)]
pub(crate) async fn execute_batch(
    executor: &Executor,
    batch_type: BatchType,
    entries: Vec<BatchEntry>,
    consistency: Consistency,
    serial_consistency: Option<Consistency>,
    timestamp: Option<i64>,
    keyspace: Option<String>,
    routing_key: Option<RoutingKey>,
    is_idempotent: bool,
) -> Result<ExecutionOutcome> {
    let statements = entries
        .into_iter()
        .map(|entry| match entry {
            BatchEntry::Query(query, values) => BatchStatement::Query(query, values),
            BatchEntry::Prepared(id, values) => BatchStatement::Prepared(id, values),
        })
        .collect();

    let batch = BatchRequest {
        batch_type,
        statements,
        consistency,
        serial_consistency,
        timestamp,
    };

    executor
        .execute(ExecutionRequest {
            statement: Statement::Batch(batch),
            params: crate::protocol::QueryParams {
                consistency,
                ..Default::default()
            },
            keyspace,
            routing_key,
            is_idempotent,
        })
        .await
}
