//! The crate's single public entry point: connects to a cluster, keeps its
//! topology current, and runs requests against it.

use std::sync::Arc;

use bytes::Bytes;
use typed_builder::TypedBuilder;

use crate::{
    cluster::{Cluster, ClusterEventListener, PrepareHostHandler},
    error::Result,
    event::{NoopSessionEventListener, PoolNotifyBridge, SessionEventListener},
    execution::{
        execute_batch, BatchEntry, ExecutionRequest, Executor, Page, Paginator,
        PreparedStatementCache, ReprepareOnHost, Statement,
    },
    options::ClusterConfig,
    pool::PoolManager,
    protocol::{BatchType, Consistency, CqlValue, QueryParams, RoutingKey, RowsMetadata},
    runtime,
};

/// A statement previously compiled on the cluster, returned by
/// [`Session::prepare`]. Carries enough of its own bind/result metadata that
/// [`Session::execute`] never needs to round-trip to look it up.
#[derive(Clone, Debug)]
pub struct PreparedStatement {
    id: Bytes,
    source_query: String,
    /// Metadata describing the statement's bind variables, in position order.
    pub bind_metadata: RowsMetadata,
    /// Metadata describing the eventual result rows.
    pub result_metadata: RowsMetadata,
}

impl PreparedStatement {
    /// The server-issued prepared statement id.
    pub fn id(&self) -> &[u8] {
        &self.id
    }

    /// The CQL text this statement was prepared from.
    pub fn source_query(&self) -> &str {
        &self.source_query
    }
}

/// The outcome of a non-paging `query`/`execute`/`batch` call.
#[derive(Debug)]
pub enum QueryResult {
    /// The statement returned no rows (`VOID`, `SET_KEYSPACE`, or a batch).
    Void,
    /// The statement returned a result set.
    Rows {
        /// The result-set's column metadata.
        metadata: RowsMetadata,
        /// The row data, each row a vector of column values in
        /// `metadata.columns` order.
        rows: Vec<Vec<CqlValue>>,
    },
}

impl QueryResult {
    /// The row data, or `None` if this result carried no rows at all (as
    /// opposed to an empty result set, which is `Some(&[])`).
    pub fn rows(&self) -> Option<&[Vec<CqlValue>]> {
        match self {
            QueryResult::Rows { rows, .. } => Some(rows),
            QueryResult::Void => None,
        }
    }
}

/// One statement to include in a [`Session::batch`] call.
pub enum BatchStatement {
    /// Ad-hoc CQL text with positional bound values.
    Query(String, Vec<CqlValue>),
    /// A previously prepared statement with positional bound values.
    Prepared(PreparedStatement, Vec<CqlValue>),
}

/// Per-request overrides for [`Session::query`]/[`Session::execute`], layered
/// on top of the session's defaults.
#[derive(Clone, Debug, Default, TypedBuilder)]
#[builder(field_defaults(default))]
pub struct QueryOptions {
    /// The consistency level to execute at.
    #[builder(default)]
    pub consistency: Consistency,
    /// The serial consistency level, for conditional updates.
    #[builder(default, setter(strip_option))]
    pub serial_consistency: Option<Consistency>,
    /// A client-supplied microsecond write timestamp, overriding the
    /// session's configured [`crate::policy::timestamp::TimestampGenerator`].
    #[builder(default, setter(strip_option))]
    pub timestamp: Option<i64>,
    /// The keyspace to resolve unqualified table names against, independent
    /// of the session's current keyspace.
    #[builder(default, setter(strip_option))]
    pub keyspace: Option<String>,
    /// The partition key to route this request by, for token-aware
    /// load balancing.
    #[builder(default, setter(strip_option))]
    pub routing_key: Option<RoutingKey>,
    /// Whether this request is safe to retry or speculatively execute.
    /// Defaults to `false`: only reads and statements the caller knows are
    /// idempotent should set this.
    #[builder(default)]
    pub is_idempotent: bool,
    /// The page size to request, for [`Session::query_paged`]/
    /// [`Session::execute_paged`].
    #[builder(default, setter(strip_option))]
    pub page_size: Option<i32>,
}

struct SessionInner {
    cluster: Cluster,
    pools: Arc<PoolManager>,
    executor: Arc<Executor>,
    prepared: Arc<PreparedStatementCache>,
}

/// A connected session: owns the [`Cluster`] that tracks topology and the
/// pools requests are dispatched against.
///
/// `Session` is cheap to clone (it is an `Arc` handle) and safe to share
/// across tasks:
///
/// ```no_run
/// # use scylla_native_driver::{options::ClusterConfig, Session};
/// # async fn run() -> scylla_native_driver::Result<()> {
/// let config = ClusterConfig::builder()
///     .contact_points(vec!["127.0.0.1".to_string()])
///     .build();
/// let session = Session::connect(config).await?;
///
/// let session = session.clone();
/// tokio::spawn(async move {
///     let _ = session.query("SELECT * FROM system.local", Vec::new()).await;
/// });
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

/// Bridges cluster topology events to the pool manager: a host becoming
/// known or reachable opens a pool for it, a host leaving the cluster
/// closes its pool. `on_down` is deliberately not handled here: pool-driven
/// down detection already closed the relevant connections, and opting a
/// host back in on a bare `STATUS_CHANGE DOWN` hint (when configured) should
/// not itself tear down the pool.
struct PoolHostBridge {
    pools: Arc<PoolManager>,
}

impl ClusterEventListener for PoolHostBridge {
    fn on_add(&self, address: std::net::SocketAddr) {
        self.pools.add(address);
    }

    fn on_up(&self, address: std::net::SocketAddr) {
        self.pools.add(address);
    }

    fn on_remove(&self, address: std::net::SocketAddr) {
        let pools = self.pools.clone();
        runtime::spawn(async move { pools.remove(address).await });
    }
}

impl Session {
    /// Connects to a cluster as described by `config`: resolves contact
    /// points (or cloud metadata), opens the control connection, bootstraps
    /// the host map, and opens a connection pool to every host already
    /// known as up.
    pub async fn connect(config: ClusterConfig) -> Result<Self> {
        Self::connect_with_listener(config, Arc::new(NoopSessionEventListener)).await
    }

    /// Like [`Session::connect`], additionally forwarding pool up/down/
    /// critical transitions to `listener`.
    pub async fn connect_with_listener(
        config: ClusterConfig,
        listener: Arc<dyn SessionEventListener>,
    ) -> Result<Self> {
        runtime::tls::ensure_crypto_provider_installed();

        let resolved = config.resolve().await?;
        let prepared = Arc::new(PreparedStatementCache::new());

        let pools = Arc::new(PoolManager::new(
            resolved.connector,
            resolved.connection_options,
            resolved.core_connections_per_host,
            resolved.reconnection_policy.clone(),
            Arc::new(PoolNotifyBridge { listener }),
        ));

        let mut cluster_options = resolved.cluster_options;
        cluster_options.listener = Arc::new(PoolHostBridge { pools: pools.clone() });
        cluster_options.prepare_host_handler =
            Arc::new(ReprepareOnHost::new(prepared.clone(), pools.clone())) as Arc<dyn PrepareHostHandler>;

        let cluster = Cluster::connect(cluster_options).await?;

        for host in cluster.hosts().lock().unwrap().up_hosts() {
            pools.add(host.address);
        }

        let executor = Arc::new(Executor::new(
            pools.clone(),
            cluster.hosts(),
            resolved.load_balancing_policy,
            resolved.retry_policy,
            resolved.speculative_execution_policy,
            resolved.timestamp_generator,
            prepared.clone(),
            resolved.request_timeout,
        ));

        Ok(Self {
            inner: Arc::new(SessionInner {
                cluster,
                pools,
                executor,
                prepared,
            }),
        })
    }

    /// Runs ad-hoc CQL text with positional bound values at default options.
    pub async fn query(&self, query: impl Into<String>, values: Vec<CqlValue>) -> Result<QueryResult> {
        self.query_with(query, values, &QueryOptions::default()).await
    }

    /// Runs ad-hoc CQL text with positional bound values and per-request
    /// `options`.
    pub async fn query_with(
        &self,
        query: impl Into<String>,
        values: Vec<CqlValue>,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let outcome = self
            .inner
            .executor
            .execute(ExecutionRequest {
                statement: Statement::Query(query.into()),
                params: params_from(options, values),
                keyspace: options.keyspace.clone(),
                routing_key: options.routing_key.clone(),
                is_idempotent: options.is_idempotent,
            })
            .await?;
        Ok(result_from(outcome.result))
    }

    /// Compiles `query` on the cluster and caches its metadata, returning a
    /// handle [`Session::execute`] can bind values against.
    pub async fn prepare(&self, query: impl Into<String>) -> Result<PreparedStatement> {
        let query = query.into();
        let metadata = self.inner.executor.prepare(&query).await?;
        Ok(PreparedStatement {
            id: metadata.id,
            source_query: query,
            bind_metadata: metadata.bind_metadata,
            result_metadata: metadata.result_metadata,
        })
    }

    /// Executes a previously [`Session::prepare`]d statement with positional
    /// bound values at default options.
    pub async fn execute(&self, prepared: &PreparedStatement, values: Vec<CqlValue>) -> Result<QueryResult> {
        self.execute_with(prepared, values, &QueryOptions::default()).await
    }

    /// Executes a previously [`Session::prepare`]d statement with positional
    /// bound values and per-request `options`.
    pub async fn execute_with(
        &self,
        prepared: &PreparedStatement,
        values: Vec<CqlValue>,
        options: &QueryOptions,
    ) -> Result<QueryResult> {
        let outcome = self
            .inner
            .executor
            .execute(ExecutionRequest {
                statement: Statement::Execute {
                    id: prepared.id.clone(),
                    source_query: prepared.source_query.clone(),
                },
                params: params_from(options, values),
                keyspace: options.keyspace.clone(),
                routing_key: options.routing_key.clone(),
                is_idempotent: options.is_idempotent,
            })
            .await?;
        Ok(result_from(outcome.result))
    }

    /// Runs a `BATCH` of statements. Batches carry a single consistency and
    /// timestamp, taken from `options`; per-statement routing/idempotency
    /// are not meaningful for a batch and are ignored.
    pub async fn batch(
        &self,
        batch_type: BatchType,
        statements: Vec<BatchStatement>,
        options: &QueryOptions,
    ) -> Result<()> {
        let entries = statements
            .into_iter()
            .map(|statement| match statement {
                BatchStatement::Query(query, values) => BatchEntry::Query(query, values),
                BatchStatement::Prepared(prepared, values) => BatchEntry::Prepared(prepared.id, values),
            })
            .collect();

        execute_batch(
            &self.inner.executor,
            batch_type,
            entries,
            options.consistency,
            options.serial_consistency,
            options.timestamp,
            options.keyspace.clone(),
            options.routing_key.clone(),
            options.is_idempotent,
        )
        .await?;
        Ok(())
    }

    /// Begins paging through ad-hoc CQL text, one page per
    /// [`Pager::next_page`] call.
    pub fn query_paged(&self, query: impl Into<String>, values: Vec<CqlValue>, options: &QueryOptions) -> Pager {
        Pager {
            inner: Paginator::new(
                self.inner.executor.clone(),
                Statement::Query(query.into()),
                params_from(options, values),
                options.keyspace.clone(),
                options.routing_key.clone(),
            ),
        }
    }

    /// Begins paging through a prepared statement, one page per
    /// [`Pager::next_page`] call.
    pub fn execute_paged(&self, prepared: &PreparedStatement, values: Vec<CqlValue>, options: &QueryOptions) -> Pager {
        Pager {
            inner: Paginator::new(
                self.inner.executor.clone(),
                Statement::Execute {
                    id: prepared.id.clone(),
                    source_query: prepared.source_query.clone(),
                },
                params_from(options, values),
                options.keyspace.clone(),
                options.routing_key.clone(),
            ),
        }
    }

    /// Sets the keyspace every pooled connection (present and future) uses
    /// when no per-request keyspace is given.
    pub async fn use_keyspace(&self, keyspace: impl Into<String>) -> Result<()> {
        self.inner.pools.set_keyspace(&keyspace.into()).await;
        Ok(())
    }

    /// Closes every connection pool and stops the control connection's
    /// reconnect loop. A `Session` is unusable after this call; further
    /// requests return `NoHostsAvailable`.
    pub async fn close(&self) {
        self.inner.cluster.close();
        self.inner.pools.close().await;
    }
}

fn params_from(options: &QueryOptions, values: Vec<CqlValue>) -> QueryParams {
    QueryParams {
        consistency: options.consistency,
        values,
        skip_metadata: false,
        page_size: options.page_size,
        paging_state: None,
        serial_consistency: options.serial_consistency,
        timestamp: options.timestamp,
    }
}

fn result_from(result: crate::protocol::ResultBody) -> QueryResult {
    match result {
        crate::protocol::ResultBody::Rows { metadata, rows } => QueryResult::Rows { metadata, rows },
        _ => QueryResult::Void,
    }
}

/// Iterates a statement's result set one page at a time, returned by
/// [`Session::query_paged`]/[`Session::execute_paged`].
pub struct Pager {
    inner: Paginator,
}

impl Pager {
    /// Fetches the next page, or `None` once the result set is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<QueryResult>> {
        Ok(self.inner.next_page().await?.map(|Page { metadata, rows }| QueryResult::Rows { metadata, rows }))
    }
}
