//! The canonical host map: one row per node the control connection has
//! ever observed, refreshed from bootstrap queries and push events.

use std::{collections::HashMap, net::SocketAddr};

use super::token::Token;

/// A node's liveness as last observed by the control connection or a pool.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum HostState {
    /// Believed reachable.
    Up,
    /// A pool reported `DOWN` or the control connection received a
    /// `STATUS_CHANGE DOWN` event (only acted on when configured to do so).
    Down,
    /// Removed from the cluster (`TOPOLOGY_CHANGE REMOVED_NODE`); retained
    /// in the map briefly so in-flight references can observe the removal
    /// before it is dropped.
    Removed,
}

/// One row of the host map: everything the load-balancing policies and
/// token-aware routing need to know about a node.
#[derive(Clone, Debug)]
pub struct Host {
    /// The node's native-protocol address.
    pub address: SocketAddr,
    /// The datacenter reported in `system.local`/`system.peers`.
    pub datacenter: Option<String>,
    /// The rack reported in `system.local`/`system.peers`.
    pub rack: String,
    /// The Cassandra/Scylla release version string.
    pub release_version: Option<String>,
    /// The tokens this node owns, as reported in `system.local`/`system.peers`.
    pub tokens: Vec<Token>,
    /// The host's current liveness.
    pub state: HostState,
    /// Whether a reconnection attempt toward this host is in progress.
    pub reconnecting: bool,
}

impl Host {
    pub(crate) fn new(address: SocketAddr) -> Self {
        Self {
            address,
            datacenter: None,
            rack: String::new(),
            release_version: None,
            tokens: Vec::new(),
            state: HostState::Up,
            reconnecting: false,
        }
    }

    /// Whether a load-balancing policy should currently consider this host.
    pub fn is_up(&self) -> bool {
        matches!(self.state, HostState::Up)
    }
}

/// The mutex-protected map of known hosts, shared between the control
/// connection (writer) and application-thread readers (load-balancing
/// policies building a query plan).
#[derive(Debug, Default)]
pub struct HostMap {
    hosts: HashMap<SocketAddr, Host>,
}

impl HostMap {
    /// Creates an empty host map.
    pub fn new() -> Self {
        Self { hosts: HashMap::new() }
    }

    /// Inserts or replaces a host row wholesale (bootstrap / refresh).
    pub fn upsert(&mut self, host: Host) {
        self.hosts.insert(host.address, host);
    }

    /// Marks a host removed without dropping its row immediately.
    pub fn mark_removed(&mut self, address: SocketAddr) {
        if let Some(host) = self.hosts.get_mut(&address) {
            host.state = HostState::Removed;
        }
    }

    /// Marks a host's liveness, returning `true` if the state actually
    /// changed (used to decide whether to emit a listener callback).
    pub fn mark_state(&mut self, address: SocketAddr, state: HostState) -> bool {
        if let Some(host) = self.hosts.get_mut(&address) {
            if host.state != state {
                host.state = state;
                return true;
            }
        }
        false
    }

    /// Looks up one host by address.
    pub fn get(&self, address: &SocketAddr) -> Option<&Host> {
        self.hosts.get(address)
    }

    /// A snapshot of every known host, live or not.
    pub fn snapshot(&self) -> Vec<Host> {
        self.hosts.values().cloned().collect()
    }

    /// A snapshot of hosts currently believed up.
    pub fn up_hosts(&self) -> Vec<Host> {
        self.hosts.values().filter(|h| h.is_up()).cloned().collect()
    }

    /// The `(token, address)` pairs for every up host's owned tokens, input
    /// to rebuilding a [`super::token::TokenMap`] ring.
    pub fn token_ring_pairs(&self) -> Vec<(Token, SocketAddr)> {
        self.hosts
            .values()
            .filter(|h| h.is_up())
            .flat_map(|h| h.tokens.iter().map(move |t| (*t, h.address)))
            .collect()
    }

    /// The datacenter of every known host, input to rebuilding a
    /// [`super::token::TokenMap`] ring.
    pub fn datacenter_of(&self) -> HashMap<SocketAddr, String> {
        self.hosts
            .values()
            .filter_map(|h| h.datacenter.clone().map(|dc| (h.address, dc)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mark_state_reports_whether_it_changed() {
        let mut map = HostMap::new();
        let addr: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        map.upsert(Host::new(addr));
        assert!(!map.mark_state(addr, HostState::Up));
        assert!(map.mark_state(addr, HostState::Down));
        assert!(!map.get(&addr).unwrap().is_up());
    }

    #[test]
    fn up_hosts_excludes_down_and_removed() {
        let mut map = HostMap::new();
        let a: SocketAddr = "127.0.0.1:9042".parse().unwrap();
        let b: SocketAddr = "127.0.0.2:9042".parse().unwrap();
        map.upsert(Host::new(a));
        map.upsert(Host::new(b));
        map.mark_state(b, HostState::Down);
        let up = map.up_hosts();
        assert_eq!(up.len(), 1);
        assert_eq!(up[0].address, a);
    }
}
