//! Keyspace replication metadata, parsed from `system_schema.keyspaces`
//! rows and used to size token-ring replica placement.

use std::collections::HashMap;

use crate::{
    cluster::token::ReplicationStrategy,
    error::{Error, ErrorKind, LibraryError, Result},
};

/// One keyspace's schema-affecting metadata. Per-table/view/type/function
/// schema is out of scope (this core has no CQL value codecs, so
/// table-level schema would be meaningless without them); only what the
/// token map needs is modeled.
#[derive(Clone, Debug)]
pub struct KeyspaceMetadata {
    /// The keyspace's replication strategy.
    pub replication: ReplicationStrategy,
}

/// An immutable, recomputed-wholesale map from keyspace name to keyspace
/// metadata.
#[derive(Clone, Debug, Default)]
pub struct SchemaSnapshot {
    keyspaces: HashMap<String, KeyspaceMetadata>,
}

impl SchemaSnapshot {
    /// An empty snapshot, before the first bootstrap query completes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces one keyspace's metadata.
    pub fn insert(&mut self, keyspace: impl Into<String>, metadata: KeyspaceMetadata) {
        self.keyspaces.insert(keyspace.into(), metadata);
    }

    /// Drops a keyspace, e.g. on a `SCHEMA_CHANGE DROPPED KEYSPACE` event.
    pub fn remove(&mut self, keyspace: &str) {
        self.keyspaces.remove(keyspace);
    }

    /// The replication strategy for `keyspace`, if known.
    pub fn replication_of(&self, keyspace: &str) -> Option<&ReplicationStrategy> {
        self.keyspaces.get(keyspace).map(|k| &k.replication)
    }

    /// Every known keyspace name.
    pub fn keyspace_names(&self) -> Vec<String> {
        self.keyspaces.keys().cloned().collect()
    }
}

/// Parses the `replication` map column of `system_schema.keyspaces`, e.g.
/// `{'class': 'SimpleStrategy', 'replication_factor': '3'}` or
/// `{'class': 'NetworkTopologyStrategy', 'dc1': '3', 'dc2': '2'}`.
pub fn parse_replication(raw: &HashMap<String, String>) -> Result<ReplicationStrategy> {
    let class = raw.get("class").ok_or_else(|| {
        Error::from(ErrorKind::Library(LibraryError::Internal {
            message: "replication map missing 'class'".into(),
        }))
    })?;

    if class.ends_with("SimpleStrategy") {
        let replication_factor = raw
            .get("replication_factor")
            .and_then(|v| v.parse().ok())
            .unwrap_or(1);
        Ok(ReplicationStrategy::Simple { replication_factor })
    } else {
        let mut per_dc = HashMap::new();
        for (key, value) in raw {
            if key == "class" {
                continue;
            }
            if let Ok(rf) = value.parse() {
                per_dc.insert(key.clone(), rf);
            }
        }
        Ok(ReplicationStrategy::NetworkTopology {
            replication_factor: per_dc,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_simple_strategy() {
        let mut raw = HashMap::new();
        raw.insert("class".to_string(), "org.apache.cassandra.locator.SimpleStrategy".to_string());
        raw.insert("replication_factor".to_string(), "3".to_string());
        match parse_replication(&raw).unwrap() {
            ReplicationStrategy::Simple { replication_factor } => assert_eq!(replication_factor, 3),
            other => panic!("expected Simple, got {other:?}"),
        }
    }

    #[test]
    fn parses_network_topology_strategy() {
        let mut raw = HashMap::new();
        raw.insert(
            "class".to_string(),
            "org.apache.cassandra.locator.NetworkTopologyStrategy".to_string(),
        );
        raw.insert("dc1".to_string(), "3".to_string());
        raw.insert("dc2".to_string(), "2".to_string());
        match parse_replication(&raw).unwrap() {
            ReplicationStrategy::NetworkTopology { replication_factor } => {
                assert_eq!(replication_factor.get("dc1"), Some(&3));
                assert_eq!(replication_factor.get("dc2"), Some(&2));
            }
            other => panic!("expected NetworkTopology, got {other:?}"),
        }
    }

    #[test]
    fn missing_class_is_an_error() {
        assert!(parse_replication(&HashMap::new()).is_err());
    }
}
