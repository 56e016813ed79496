//! Cluster-wide state: the host map, token rings, schema snapshot, and the
//! control connection that keeps them current.

mod cluster;
pub(crate) mod control;
mod event;
pub(crate) mod host;
mod schema;
pub(crate) mod token;

pub(crate) use cluster::{Cluster, ClusterOptions};
pub(crate) use event::{ClusterEventListener, NoopClusterEventListener, NoopPrepareHostHandler, PrepareHostHandler};
pub(crate) use host::{Host, HostMap, HostState};
pub(crate) use schema::{KeyspaceMetadata, SchemaSnapshot};
pub(crate) use token::{Murmur3Partitioner, Partitioner, ReplicationStrategy, Token, TokenMap};
