//! Murmur3 partitioning and the token ring used for token-aware routing.

use std::{collections::HashMap, net::SocketAddr};

use crate::protocol::RoutingKey;

/// A position on the token ring.
pub type Token = i64;

/// Hashes a partition key into a ring position.
pub trait Partitioner: Send + Sync + std::fmt::Debug {
    /// Computes the token for a routing key's raw, already-concatenated
    /// partition key bytes.
    fn hash(&self, routing_key: &RoutingKey) -> Token;
}

/// The default partitioner for modern Cassandra/Scylla clusters: a 128-bit
/// murmur3 hash of the partition key, with the low 64 bits reinterpreted as
/// a signed token, matching the original driver's `Murmur3Partitioner`.
#[derive(Clone, Copy, Debug, Default)]
pub struct Murmur3Partitioner;

impl Partitioner for Murmur3Partitioner {
    fn hash(&self, routing_key: &RoutingKey) -> Token {
        let mut cursor = std::io::Cursor::new(routing_key.as_bytes());
        let hash = murmur3::murmur3_x64_128(&mut cursor, 0)
            .expect("hashing an in-memory Cursor<&[u8]> cannot fail");
        hash as i64
    }
}

/// A keyspace's replication strategy, determining how replicas are chosen
/// by walking the ring clockwise from a token.
#[derive(Clone, Debug)]
pub enum ReplicationStrategy {
    /// `SimpleStrategy`: the next `replication_factor` distinct owning
    /// nodes walking clockwise, ignoring datacenter.
    Simple {
        /// The configured replication factor.
        replication_factor: usize,
    },
    /// `NetworkTopologyStrategy`: `replication_factor` distinct owning
    /// nodes per datacenter, walking clockwise independently per DC.
    NetworkTopology {
        /// Replication factor keyed by datacenter name.
        replication_factor: HashMap<String, usize>,
    },
}

/// A sorted ring of `(token, owning address)` pairs for one keyspace, plus
/// enough host metadata (passed in at build time) to resolve per-DC
/// replication.
#[derive(Clone, Debug, Default)]
pub struct TokenMap {
    ring: Vec<(Token, SocketAddr)>,
    datacenter_of: HashMap<SocketAddr, String>,
}

impl TokenMap {
    /// Builds a ring from each host's primary token(s) and its datacenter,
    /// used for `NetworkTopologyStrategy` replica placement.
    pub fn build(mut tokens: Vec<(Token, SocketAddr)>, datacenter_of: HashMap<SocketAddr, String>) -> Self {
        tokens.sort_by_key(|(token, _)| *token);
        Self {
            ring: tokens,
            datacenter_of,
        }
    }

    /// Whether the ring has not yet been populated (before the first
    /// bootstrap query completes).
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Computes the replica set for `token` under `strategy`, walking the
    /// ring clockwise from the first position at or after `token`.
    pub fn replicas_for_token(&self, token: Token, strategy: &ReplicationStrategy) -> Vec<SocketAddr> {
        if self.ring.is_empty() {
            return Vec::new();
        }
        let start = self
            .ring
            .partition_point(|(ring_token, _)| *ring_token < token);

        match strategy {
            ReplicationStrategy::Simple { replication_factor } => {
                self.walk_distinct(start, *replication_factor, None)
            }
            ReplicationStrategy::NetworkTopology { replication_factor } => {
                let mut out = Vec::new();
                for (dc, rf) in replication_factor {
                    out.extend(self.walk_distinct(start, *rf, Some(dc.as_str())));
                }
                out
            }
        }
    }

    fn walk_distinct(&self, start: usize, count: usize, datacenter: Option<&str>) -> Vec<SocketAddr> {
        let mut seen = Vec::with_capacity(count);
        let ring_len = self.ring.len();
        for offset in 0..ring_len {
            if seen.len() >= count {
                break;
            }
            let (_, address) = self.ring[(start + offset) % ring_len];
            if seen.contains(&address) {
                continue;
            }
            if let Some(dc) = datacenter {
                if self.datacenter_of.get(&address).map(String::as_str) != Some(dc) {
                    continue;
                }
            }
            seen.push(address);
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(last: u8) -> SocketAddr {
        format!("10.0.0.{last}:9042").parse().unwrap()
    }

    #[test]
    fn simple_strategy_walks_clockwise_and_dedupes() {
        let ring = vec![(0, addr(1)), (10, addr(2)), (20, addr(3)), (30, addr(1))];
        let map = TokenMap::build(ring, HashMap::new());
        let replicas = map.replicas_for_token(5, &ReplicationStrategy::Simple { replication_factor: 2 });
        assert_eq!(replicas, vec![addr(2), addr(3)]);
    }

    #[test]
    fn network_topology_strategy_respects_per_dc_factor() {
        let ring = vec![(0, addr(1)), (10, addr(2)), (20, addr(3))];
        let mut dcs = HashMap::new();
        dcs.insert(addr(1), "dc1".to_string());
        dcs.insert(addr(2), "dc2".to_string());
        dcs.insert(addr(3), "dc1".to_string());
        let map = TokenMap::build(ring, dcs);
        let mut rf = HashMap::new();
        rf.insert("dc1".to_string(), 1);
        let replicas = map.replicas_for_token(5, &ReplicationStrategy::NetworkTopology { replication_factor: rf });
        assert_eq!(replicas, vec![addr(3)]);
    }

    #[test]
    fn murmur3_partitioner_is_deterministic() {
        let key = RoutingKey::from_components(&[&[1, 2, 3, 4]]);
        let partitioner = Murmur3Partitioner;
        assert_eq!(partitioner.hash(&key), partitioner.hash(&key));
    }
}
