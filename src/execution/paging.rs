//! Page-at-a-time iteration: wraps a statement and re-issues it with an
//! updated paging-state token each time the previous page reported more
//! pages available.

use std::sync::Arc;

use bytes::Bytes;

use crate::{
    error::Result,
    protocol::{CqlValue, QueryParams, ResultBody, RoutingKey, RowsMetadata},
};

use super::plan::{ExecutionRequest, Executor, Statement};

/// One page of results: the rows themselves plus the metadata describing
/// their columns, exposed so a caller that has already decoded column specs
/// doesn't have to re-fetch them per page.
pub(crate) struct Page {
    pub(crate) metadata: RowsMetadata,
    pub(crate) rows: Vec<Vec<CqlValue>>,
}

/// Drives a statement page by page. Each call to [`Paginator::next_page`]
/// issues one request and, if the response carries a paging-state token,
/// carries it forward to the next call.
pub(crate) struct Paginator {
    executor: Arc<Executor>,
    statement: Statement,
    params: QueryParams,
    keyspace: Option<String>,
    routing_key: Option<RoutingKey>,
    paging_state: Option<Bytes>,
    exhausted: bool,
}

impl Paginator {
    pub(crate) fn new(
        executor: Arc<Executor>,
        statement: Statement,
        params: QueryParams,
        keyspace: Option<String>,
        routing_key: Option<RoutingKey>,
    ) -> Self {
        Self {
            executor,
            statement,
            params,
            keyspace,
            routing_key,
            paging_state: None,
            exhausted: false,
        }
    }

    /// Fetches the next page, or `None` once the result set is exhausted.
    /// Statements are read-only by construction (paging a write makes no
    /// sense), so every attempt is idempotent.
    pub(crate) async fn next_page(&mut self) -> Result<Option<Page>> {
        if self.exhausted {
            return Ok(None);
        }

        let mut params = self.params.clone();
        params.paging_state = self.paging_state.take();

        let outcome = self
            .executor
            .execute(ExecutionRequest {
                statement: self.statement.clone(),
                params,
                keyspace: self.keyspace.clone(),
                routing_key: self.routing_key.clone(),
                is_idempotent: true,
            })
            .await?;

        match outcome.result {
            ResultBody::Rows { metadata, rows } => {
                if metadata.has_more_pages {
                    self.paging_state = metadata.paging_state.clone();
                } else {
                    self.exhausted = true;
                }
                Ok(Some(Page { metadata, rows }))
            }
            _ => {
                self.exhausted = true;
                Ok(None)
            }
        }
    }
}
