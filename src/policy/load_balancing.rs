//! Query plan construction: base policies that order the whole host map,
//! and decorator policies that wrap an inner policy to reorder or filter
//! its plan.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::{Duration, Instant},
};

use rand::seq::SliceRandom;

use crate::{
    cluster::{
        host::HostMap,
        token::{ReplicationStrategy, Token, TokenMap},
    },
    protocol::RoutingKey,
};

/// The hosts a request may be attempted against, most-preferred first.
pub type QueryPlan = Vec<SocketAddr>;

/// Context a policy may use to bias the plan: the keyspace and routing key
/// of the request being planned, when known.
#[derive(Clone, Debug, Default)]
pub struct PlanRequest {
    /// The keyspace the statement executes against, if known.
    pub keyspace: Option<String>,
    /// The partition key bytes, if the statement carries one.
    pub routing_key: Option<RoutingKey>,
}

/// Produces an ordered list of candidate hosts for one request.
pub trait LoadBalancingPolicy: Send + Sync + std::fmt::Debug {
    /// Builds a query plan given the current host map and request context.
    fn plan(&self, hosts: &HostMap, request: &PlanRequest) -> QueryPlan;
}

/// Visits every up host once per plan, rotating the starting point on each
/// call so load is spread evenly across callers.
#[derive(Debug, Default)]
pub struct RoundRobinPolicy {
    cursor: AtomicUsize,
}

impl RoundRobinPolicy {
    /// Creates a fresh round-robin policy starting at the first host.
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingPolicy for RoundRobinPolicy {
    fn plan(&self, hosts: &HostMap, _request: &PlanRequest) -> QueryPlan {
        let mut up: Vec<SocketAddr> = hosts.up_hosts().into_iter().map(|h| h.address).collect();
        if up.is_empty() {
            return up;
        }
        up.sort();
        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % up.len();
        up.rotate_left(start);
        up
    }
}

/// Prefers hosts in `local_dc`, appending up to `used_hosts_per_remote_dc`
/// hosts from each other datacenter after the local ones.
#[derive(Debug)]
pub struct DcAwarePolicy {
    local_dc: String,
    used_hosts_per_remote_dc: usize,
    cursor: AtomicUsize,
}

impl DcAwarePolicy {
    /// Creates a DC-aware policy local to `local_dc`, including up to
    /// `used_hosts_per_remote_dc` hosts from each other datacenter.
    pub fn new(local_dc: impl Into<String>, used_hosts_per_remote_dc: usize) -> Self {
        Self {
            local_dc: local_dc.into(),
            used_hosts_per_remote_dc,
            cursor: AtomicUsize::new(0),
        }
    }
}

impl LoadBalancingPolicy for DcAwarePolicy {
    fn plan(&self, hosts: &HostMap, _request: &PlanRequest) -> QueryPlan {
        let up = hosts.up_hosts();
        let mut local: Vec<SocketAddr> = up
            .iter()
            .filter(|h| h.datacenter.as_deref() == Some(self.local_dc.as_str()))
            .map(|h| h.address)
            .collect();
        local.sort();
        if !local.is_empty() {
            let start = self.cursor.fetch_add(1, Ordering::Relaxed) % local.len();
            local.rotate_left(start);
        }

        let mut by_remote_dc: HashMap<&str, Vec<SocketAddr>> = HashMap::new();
        for host in &up {
            let Some(dc) = host.datacenter.as_deref() else { continue };
            if dc == self.local_dc {
                continue;
            }
            by_remote_dc.entry(dc).or_default().push(host.address);
        }
        let mut remote_dcs: Vec<&&str> = by_remote_dc.keys().collect();
        remote_dcs.sort();

        let mut plan = local;
        for dc in remote_dcs {
            let addresses = &by_remote_dc[dc];
            plan.extend(addresses.iter().take(self.used_hosts_per_remote_dc));
        }
        plan
    }
}

/// Wraps a base policy: when the request carries a routing key and
/// keyspace whose replica set is known, those replicas are placed first
/// (optionally shuffled to spread load across them), followed by the
/// wrapped policy's plan for everything else.
#[derive(Debug)]
pub struct TokenAwarePolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    token_maps: Arc<Mutex<HashMap<String, (TokenMap, ReplicationStrategy)>>>,
    shuffle_replicas: bool,
    partitioner: crate::cluster::token::Murmur3Partitioner,
}

impl TokenAwarePolicy {
    /// Wraps `inner`, consulting `token_maps` (keyed by keyspace) when a
    /// request carries a routing key.
    pub fn new(
        inner: Arc<dyn LoadBalancingPolicy>,
        token_maps: Arc<Mutex<HashMap<String, (TokenMap, ReplicationStrategy)>>>,
        shuffle_replicas: bool,
    ) -> Self {
        Self {
            inner,
            token_maps,
            shuffle_replicas,
            partitioner: crate::cluster::token::Murmur3Partitioner,
        }
    }

    fn replicas(&self, request: &PlanRequest) -> Vec<SocketAddr> {
        use crate::cluster::token::Partitioner;

        let (Some(keyspace), Some(routing_key)) = (&request.keyspace, &request.routing_key) else {
            return Vec::new();
        };
        let token_maps = self.token_maps.lock().unwrap();
        let Some((token_map, strategy)) = token_maps.get(keyspace) else {
            return Vec::new();
        };
        let token: Token = self.partitioner.hash(routing_key);
        token_map.replicas_for_token(token, strategy)
    }
}

impl LoadBalancingPolicy for TokenAwarePolicy {
    fn plan(&self, hosts: &HostMap, request: &PlanRequest) -> QueryPlan {
        let mut replicas = self.replicas(request);
        if replicas.is_empty() {
            return self.inner.plan(hosts, request);
        }
        if self.shuffle_replicas {
            replicas.shuffle(&mut rand::rng());
        }
        let mut plan = replicas.clone();
        for host in self.inner.plan(hosts, request) {
            if !replicas.contains(&host) {
                plan.push(host);
            }
        }
        plan
    }
}

#[derive(Debug, Default)]
struct LatencyRecord {
    average_nanos: f64,
    samples: u64,
    excluded_until: Option<Instant>,
}

/// Wraps any policy: tracks an exponentially-decayed average latency per
/// host and demotes (moves to the back of the plan) hosts whose average
/// exceeds `exclusion_threshold` times the fastest host's average, once
/// `min_measured` samples have been collected for both. A demoted host is
/// re-admitted after `retry_period`.
#[derive(Debug)]
pub struct LatencyAwarePolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    exclusion_threshold: f64,
    scale: Duration,
    retry_period: Duration,
    min_measured: u64,
    records: Mutex<HashMap<SocketAddr, LatencyRecord>>,
}

impl LatencyAwarePolicy {
    /// Wraps `inner` with latency-based demotion.
    pub fn new(
        inner: Arc<dyn LoadBalancingPolicy>,
        exclusion_threshold: f64,
        scale: Duration,
        retry_period: Duration,
        min_measured: u64,
    ) -> Self {
        Self {
            inner,
            exclusion_threshold,
            scale,
            retry_period,
            min_measured,
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Records one request's observed latency against `host`.
    pub fn record_latency(&self, host: SocketAddr, latency: Duration) {
        let mut records = self.records.lock().unwrap();
        let record = records.entry(host).or_default();
        let sample = latency.as_nanos() as f64;
        if record.samples == 0 {
            record.average_nanos = sample;
        } else {
            let alpha = 1.0 - (-1.0 / self.scale.as_nanos().max(1) as f64).exp();
            record.average_nanos = alpha * sample + (1.0 - alpha) * record.average_nanos;
        }
        record.samples += 1;
    }

    /// Marks `host` as excluded for `retry_period` after it was chosen as
    /// the slowest outlier this round.
    fn exclude(&self, host: SocketAddr) {
        if let Some(record) = self.records.lock().unwrap().get_mut(&host) {
            record.excluded_until = Some(Instant::now() + self.retry_period);
        }
    }
}

impl LoadBalancingPolicy for LatencyAwarePolicy {
    fn plan(&self, hosts: &HostMap, request: &PlanRequest) -> QueryPlan {
        let plan = self.inner.plan(hosts, request);
        let records = self.records.lock().unwrap();
        let now = Instant::now();

        let fastest = records
            .values()
            .filter(|r| r.samples >= self.min_measured)
            .map(|r| r.average_nanos)
            .fold(f64::INFINITY, f64::min);
        if !fastest.is_finite() {
            return plan;
        }

        let (mut preferred, mut demoted) = (Vec::new(), Vec::new());
        for host in plan {
            let record = records.get(&host);
            let currently_excluded = record
                .and_then(|r| r.excluded_until)
                .map(|until| now < until)
                .unwrap_or(false);
            let is_outlier = record
                .filter(|r| r.samples >= self.min_measured)
                .map(|r| r.average_nanos > fastest * self.exclusion_threshold)
                .unwrap_or(false);
            if currently_excluded || is_outlier {
                demoted.push(host);
            } else {
                preferred.push(host);
            }
        }
        drop(records);
        for host in &demoted {
            self.exclude(*host);
        }
        preferred.extend(demoted);
        preferred
    }
}

/// Wraps any policy, filtering its plan to only (or never) the given hosts
/// or datacenters.
#[derive(Debug)]
pub struct WhitelistPolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    allowed: Vec<SocketAddr>,
}

impl WhitelistPolicy {
    /// Wraps `inner`, restricting its plan to `allowed` addresses.
    pub fn new(inner: Arc<dyn LoadBalancingPolicy>, allowed: Vec<SocketAddr>) -> Self {
        Self { inner, allowed }
    }
}

impl LoadBalancingPolicy for WhitelistPolicy {
    fn plan(&self, hosts: &HostMap, request: &PlanRequest) -> QueryPlan {
        self.inner
            .plan(hosts, request)
            .into_iter()
            .filter(|addr| self.allowed.contains(addr))
            .collect()
    }
}

/// Wraps any policy, removing the given hosts from its plan.
#[derive(Debug)]
pub struct BlacklistPolicy {
    inner: Arc<dyn LoadBalancingPolicy>,
    denied: Vec<SocketAddr>,
}

impl BlacklistPolicy {
    /// Wraps `inner`, removing `denied` addresses from its plan.
    pub fn new(inner: Arc<dyn LoadBalancingPolicy>, denied: Vec<SocketAddr>) -> Self {
        Self { inner, denied }
    }
}

impl LoadBalancingPolicy for BlacklistPolicy {
    fn plan(&self, hosts: &HostMap, request: &PlanRequest) -> QueryPlan {
        self.inner
            .plan(hosts, request)
            .into_iter()
            .filter(|addr| !self.denied.contains(addr))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::host::Host;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:9042").parse().unwrap()
    }

    #[test]
    fn round_robin_rotates_across_calls() {
        let mut hosts = HostMap::new();
        hosts.upsert(Host::new(addr(1)));
        hosts.upsert(Host::new(addr(2)));
        hosts.upsert(Host::new(addr(3)));
        let policy = RoundRobinPolicy::new();
        let first = policy.plan(&hosts, &PlanRequest::default());
        let second = policy.plan(&hosts, &PlanRequest::default());
        assert_eq!(first.len(), 3);
        assert_ne!(first, second);
    }

    #[test]
    fn dc_aware_prefers_local_dc() {
        let mut hosts = HostMap::new();
        let mut local = Host::new(addr(1));
        local.datacenter = Some("dc1".into());
        let mut remote = Host::new(addr(2));
        remote.datacenter = Some("dc2".into());
        hosts.upsert(local);
        hosts.upsert(remote);
        let policy = DcAwarePolicy::new("dc1", 1);
        let plan = policy.plan(&hosts, &PlanRequest::default());
        assert_eq!(plan, vec![addr(1), addr(2)]);
    }

    #[test]
    fn whitelist_filters_to_allowed_hosts() {
        let mut hosts = HostMap::new();
        hosts.upsert(Host::new(addr(1)));
        hosts.upsert(Host::new(addr(2)));
        let inner: Arc<dyn LoadBalancingPolicy> = Arc::new(RoundRobinPolicy::new());
        let policy = WhitelistPolicy::new(inner, vec![addr(1)]);
        let plan = policy.plan(&hosts, &PlanRequest::default());
        assert_eq!(plan, vec![addr(1)]);
    }
}
