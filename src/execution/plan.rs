//! Drives one request to completion against a load-balancing query plan:
//! least-busy connection acquisition, the `RESULT`/`ERROR` handling table,
//! transparent `UNPREPARED` re-preparation, retry-policy consultation, and
//! speculative execution across hosts.

use std::{
    collections::VecDeque,
    net::SocketAddr,
    sync::{Arc, Mutex},
    time::Duration,
};

use bytes::Bytes;
use futures_util::stream::FuturesUnordered;
use futures_util::StreamExt;

use super::prepared::{prepare_on_connection, PreparedStatementCache};
use crate::{
    cluster::HostMap,
    error::{Error, ErrorKind, Result, ServerError},
    policy::{
        load_balancing::{LoadBalancingPolicy, PlanRequest},
        retry::{RetryContext, RetryDecision, RetryPolicy},
        speculative::SpeculativeExecutionPolicy,
        timestamp::TimestampGenerator,
    },
    pool::PoolManager,
    protocol::{BatchRequest, ExecuteRequest, Opcode, QueryParams, QueryRequest, ResultBody, RoutingKey},
    runtime,
};

/// The statement shape being executed: ad-hoc CQL text, a prepared id paired
/// with the text it was prepared from (so a transparent re-prepare on
/// `UNPREPARED` has something to re-send), or a batch of several statements.
#[derive(Clone)]
pub(crate) enum Statement {
    Query(String),
    Execute { id: Bytes, source_query: String },
    Batch(BatchRequest),
}

/// One request's execution context: everything [`Executor::execute`] needs
/// besides the statement itself.
pub(crate) struct ExecutionRequest {
    pub(crate) statement: Statement,
    pub(crate) params: QueryParams,
    pub(crate) keyspace: Option<String>,
    pub(crate) routing_key: Option<RoutingKey>,
    pub(crate) is_idempotent: bool,
}

/// The successful outcome of executing a request, along with the keyspace
/// update a `SET_KEYSPACE` result implies.
pub(crate) struct ExecutionOutcome {
    pub(crate) result: ResultBody,
}

pub(crate) struct Executor {
    pools: Arc<PoolManager>,
    hosts: Arc<Mutex<HostMap>>,
    load_balancing: Arc<dyn LoadBalancingPolicy>,
    retry_policy: Arc<dyn RetryPolicy>,
    speculative: Arc<dyn SpeculativeExecutionPolicy>,
    timestamp_generator: Arc<dyn TimestampGenerator>,
    prepared: Arc<PreparedStatementCache>,
    request_timeout: Duration,
}

impl Executor {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        pools: Arc<PoolManager>,
        hosts: Arc<Mutex<HostMap>>,
        load_balancing: Arc<dyn LoadBalancingPolicy>,
        retry_policy: Arc<dyn RetryPolicy>,
        speculative: Arc<dyn SpeculativeExecutionPolicy>,
        timestamp_generator: Arc<dyn TimestampGenerator>,
        prepared: Arc<PreparedStatementCache>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pools,
            hosts,
            load_balancing,
            retry_policy,
            speculative,
            timestamp_generator,
            prepared,
            request_timeout,
        }
    }

    /// Computes the query plan, attaches a client timestamp if configured,
    /// then drives the request across that plan with speculative execution.
    pub(crate) async fn execute(&self, mut request: ExecutionRequest) -> Result<ExecutionOutcome> {
        if request.params.timestamp.is_none() {
            request.params.timestamp = self.timestamp_generator.next();
        }

        let plan = self.build_plan(request.keyspace.as_deref(), request.routing_key.as_ref());
        if plan.is_empty() {
            return Err(ErrorKind::NoHostsAvailable {
                message: "no hosts available in the query plan".to_string(),
            }
            .into());
        }

        self.run_plan(plan, Arc::new(request)).await
    }

    /// Prepares `query` against the first host in the current query plan
    /// willing to accept it, trying subsequent hosts on failure. Used
    /// directly (outside [`Executor::execute`]'s `UNPREPARED` path) when a
    /// caller asks to prepare a statement up front.
    pub(crate) async fn prepare(&self, query: &str) -> Result<super::prepared::PreparedStatementMetadata> {
        let plan = self.build_plan(None, None);
        if plan.is_empty() {
            return Err(ErrorKind::NoHostsAvailable {
                message: "no hosts available to prepare against".to_string(),
            }
            .into());
        }

        let mut last_error = None;
        for address in plan {
            let Some(connection) = self.pools.find_least_busy(address) else {
                continue;
            };
            match prepare_on_connection(&self.prepared, &connection, query).await {
                Ok(metadata) => return Ok(metadata),
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error.unwrap_or_else(|| {
            ErrorKind::NoHostsAvailable {
                message: "no host could prepare the statement".to_string(),
            }
            .into()
        }))
    }

    fn build_plan(&self, keyspace: Option<&str>, routing_key: Option<&RoutingKey>) -> VecDeque<SocketAddr> {
        let plan_request = PlanRequest {
            keyspace: keyspace.map(str::to_string),
            routing_key: routing_key.cloned(),
        };
        let hosts = self.hosts.lock().unwrap();
        self.load_balancing.plan(&hosts, &plan_request).into()
    }

    /// Races speculative attempts across the plan: a new attempt starts
    /// immediately on the first host, then again every delay the
    /// speculative policy grants until either an attempt succeeds, the plan
    /// is exhausted, or the policy stops granting extra attempts.
    async fn run_plan(&self, mut plan: VecDeque<SocketAddr>, request: Arc<ExecutionRequest>) -> Result<ExecutionOutcome> {
        let is_idempotent = request.is_idempotent;
        let mut spec_plan = if is_idempotent {
            Some(self.speculative.new_plan())
        } else {
            None
        };

        let mut attempts = FuturesUnordered::new();
        let mut last_error = None;

        loop {
            if let Some(address) = plan.pop_front() {
                let request = request.clone();
                attempts.push(self.attempt_host(address, request));
            } else if attempts.is_empty() {
                return Err(last_error.unwrap_or_else(|| {
                    ErrorKind::NoHostsAvailable {
                        message: "query plan exhausted with no successful attempt".to_string(),
                    }
                    .into()
                }));
            }

            let delay = spec_plan
                .as_mut()
                .and_then(|p| p.next_execution(!attempts.is_empty()))
                .filter(|_| !plan.is_empty());

            let next = match delay {
                Some(delay) => {
                    tokio::select! {
                        outcome = attempts.next() => outcome,
                        _ = runtime::sleep(delay) => continue,
                    }
                }
                None => attempts.next().await,
            };

            match next {
                Some(Ok(outcome)) => return Ok(outcome),
                Some(Err(AttemptError::NextHost(e))) => last_error = Some(e),
                Some(Err(AttemptError::Rethrow(e))) => return Err(e),
                None => {
                    if plan.is_empty() {
                        return Err(last_error.unwrap_or_else(|| {
                            ErrorKind::NoHostsAvailable {
                                message: "query plan exhausted with no successful attempt".to_string(),
                            }
                            .into()
                        }));
                    }
                }
            }
        }
    }

    /// Runs the full per-host protocol: acquire a connection, write the
    /// request, and loop on retry-same decisions and transparent
    /// re-prepares without leaving this host.
    async fn attempt_host(
        &self,
        address: SocketAddr,
        request: Arc<ExecutionRequest>,
    ) -> std::result::Result<ExecutionOutcome, AttemptError> {
        let mut attempts: u32 = 0;
        let mut params = request.params.clone();
        let mut statement = request.statement.clone();

        loop {
            attempts += 1;
            let Some(connection) = self.pools.find_least_busy(address) else {
                return Err(AttemptError::NextHost(Error::internal(format!(
                    "no open connection to {address}"
                ))));
            };

            let send_result = match &statement {
                Statement::Query(text) => {
                    let body = QueryRequest {
                        query: text.clone(),
                        params: params.clone(),
                    }
                    .encode()
                    .map_err(AttemptError::Rethrow)?;
                    connection.send_with_timeout(Opcode::Query, body, self.request_timeout).await
                }
                Statement::Execute { id, .. } => {
                    let body = ExecuteRequest {
                        id: id.clone(),
                        params: params.clone(),
                    }
                    .encode()
                    .map_err(AttemptError::Rethrow)?;
                    connection.send_with_timeout(Opcode::Execute, body, self.request_timeout).await
                }
                Statement::Batch(batch) => {
                    let body = batch.encode().map_err(AttemptError::Rethrow)?;
                    connection.send_with_timeout(Opcode::Batch, body, self.request_timeout).await
                }
            };

            let frame = match send_result {
                Ok(frame) => frame,
                Err(e) if e.is_unprepared() => {
                    let Statement::Execute { source_query, .. } = &statement else {
                        return Err(AttemptError::NextHost(e));
                    };
                    match prepare_on_connection(&self.prepared, &connection, source_query).await {
                        Ok(metadata) => {
                            statement = Statement::Execute {
                                id: metadata.id,
                                source_query: source_query.clone(),
                            };
                            continue;
                        }
                        Err(_) => return Err(AttemptError::NextHost(e)),
                    }
                }
                Err(e) if e.is_critical() => return Err(AttemptError::Rethrow(e)),
                Err(e) if e.is_server_error() => {
                    match self.consult_retry_policy(&e, attempts, request.is_idempotent) {
                        RetryDecision::RetrySame { consistency } => {
                            if let Some(consistency) = consistency {
                                params.consistency = consistency;
                            }
                            continue;
                        }
                        RetryDecision::RetryNext { .. } => return Err(AttemptError::NextHost(e)),
                        RetryDecision::Ignore => {
                            return Ok(ExecutionOutcome { result: ResultBody::Void })
                        }
                        RetryDecision::Rethrow => return Err(AttemptError::Rethrow(e)),
                    }
                }
                Err(e) => return Err(AttemptError::NextHost(e)),
            };

            let mut body = frame.body.clone().freeze();
            let result = ResultBody::decode(&mut body).map_err(AttemptError::Rethrow)?;
            match &result {
                ResultBody::Prepared { id, .. } => {
                    if let Statement::Query(text) = &statement {
                        self.prepared.insert(
                            text.clone(),
                            super::prepared::PreparedStatementMetadata {
                                id: id.clone(),
                                bind_metadata: match &result {
                                    ResultBody::Prepared { bind_metadata, .. } => bind_metadata.clone(),
                                    _ => unreachable!(),
                                },
                                result_metadata: match &result {
                                    ResultBody::Prepared { result_metadata, .. } => result_metadata.clone(),
                                    _ => unreachable!(),
                                },
                            },
                        );
                    }
                }
                ResultBody::SetKeyspace(ks) => {
                    self.pools.set_keyspace(ks).await;
                }
                _ => {}
            }
            return Ok(ExecutionOutcome { result });
        }
    }

    fn consult_retry_policy(&self, error: &Error, attempts: u32, is_idempotent: bool) -> RetryDecision {
        let ErrorKind::Server(server_error) = error.kind.as_ref() else {
            return RetryDecision::Rethrow;
        };
        match server_error {
            ServerError::WriteTimeout {
                consistency,
                received,
                required,
                write_type,
                ..
            } => self.retry_policy.on_write_timeout(&RetryContext {
                consistency: *consistency,
                received: *received,
                required: *required,
                write_type: Some(write_type.as_str()),
                attempts,
                is_idempotent,
            }),
            ServerError::ReadTimeout {
                consistency,
                received,
                required,
                ..
            } => self.retry_policy.on_read_timeout(&RetryContext {
                consistency: *consistency,
                received: *received,
                required: *required,
                write_type: None,
                attempts,
                is_idempotent,
            }),
            ServerError::ReadWriteFailure {
                consistency,
                received,
                required,
                ..
            }
            | ServerError::CasWriteUnknown {
                consistency,
                received,
                required,
                ..
            } => self.retry_policy.on_other_error(&RetryContext {
                consistency: *consistency,
                received: *received,
                required: *required,
                write_type: None,
                attempts,
                is_idempotent,
            }),
            _ => RetryDecision::Rethrow,
        }
    }
}

enum AttemptError {
    NextHost(Error),
    Rethrow(Error),
}
