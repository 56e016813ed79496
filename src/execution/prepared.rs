//! Prepared statement bookkeeping: the cache keyed by both the original CQL
//! text (to detect a statement already prepared) and the server-issued id
//! (to look up bind/result metadata after a `PREPARED` response), plus the
//! re-prepare machinery the execution engine and cluster both depend on.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{Arc, Mutex},
};

use bytes::Bytes;

use crate::{
    cluster::PrepareHostHandler,
    error::Result,
    pool::{conn::Connection, PoolManager},
    protocol::{Opcode, PrepareRequest, ResultBody, RowsMetadata},
};

/// Everything about a statement the execution engine needs once it has been
/// `PREPARE`d: its id and the metadata describing bind variables and result
/// columns.
#[derive(Clone, Debug)]
pub(crate) struct PreparedStatementMetadata {
    pub(crate) id: Bytes,
    pub(crate) bind_metadata: RowsMetadata,
    pub(crate) result_metadata: RowsMetadata,
}

/// Read-mostly cache from CQL text to its prepared metadata, guarded by a
/// single mutex since lookups vastly outnumber inserts.
#[derive(Default)]
pub(crate) struct PreparedStatementCache {
    by_query: Mutex<HashMap<String, PreparedStatementMetadata>>,
}

impl PreparedStatementCache {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, query: &str) -> Option<PreparedStatementMetadata> {
        self.by_query.lock().unwrap().get(query).cloned()
    }

    pub(crate) fn insert(&self, query: String, metadata: PreparedStatementMetadata) {
        self.by_query.lock().unwrap().insert(query, metadata);
    }

    fn snapshot(&self) -> Vec<String> {
        self.by_query.lock().unwrap().keys().cloned().collect()
    }
}

/// Sends `PREPARE` for `query` on `connection` and caches the result.
pub(crate) async fn prepare_on_connection(
    cache: &PreparedStatementCache,
    connection: &Connection,
    query: &str,
) -> Result<PreparedStatementMetadata> {
    let request = PrepareRequest {
        query: query.to_string(),
    };
    let body = request.encode()?;
    let frame = connection.send(Opcode::Prepare, body).await?;
    let mut raw = frame.body.clone().freeze();
    let metadata = match ResultBody::decode(&mut raw)? {
        ResultBody::Prepared {
            id,
            bind_metadata,
            result_metadata,
        } => PreparedStatementMetadata {
            id,
            bind_metadata,
            result_metadata,
        },
        other => {
            return Err(crate::error::Error::internal(format!(
                "PREPARE returned unexpected result kind {other:?}"
            )))
        }
    };
    cache.insert(query.to_string(), metadata.clone());
    Ok(metadata)
}

/// Bridges the cluster's generic [`PrepareHostHandler`] hook to this crate's
/// concrete prepared-statement cache and pool manager: re-prepares every
/// cached statement on a newly up or newly added host before the cluster's
/// own listener is told about it. Injected into the `Cluster` by `Session`
/// at construction time, since `cluster` must not depend on `execution`
/// directly.
pub(crate) struct ReprepareOnHost {
    cache: Arc<PreparedStatementCache>,
    pools: Arc<PoolManager>,
}

impl ReprepareOnHost {
    pub(crate) fn new(cache: Arc<PreparedStatementCache>, pools: Arc<PoolManager>) -> Self {
        Self { cache, pools }
    }
}

impl PrepareHostHandler for ReprepareOnHost {
    fn prepare_on_host(
        &self,
        address: SocketAddr,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        let cache = self.cache.clone();
        let pools = self.pools.clone();
        Box::pin(async move {
            let Some(connection) = pools.find_least_busy(address) else {
                return;
            };
            for query in cache.snapshot() {
                // A failed re-prepare is non-fatal: the host is still marked
                // ready, and the next use of this statement on this host
                // re-prepares transparently via the UNPREPARED path in
                // request execution.
                #[allow(unused_variables)]
                if let Err(e) = prepare_on_connection(&cache, &connection, &query).await {
                    #[cfg(feature = "tracing-unstable")]
                    tracing::warn!(%address, error = %e, "failed to re-prepare statement on host");
                }
            }
        })
    }
}
