//! The control connection: a single [`Connection`] registered for
//! topology/status/schema push events, used to bootstrap and then keep
//! current the canonical host map and schema snapshot.
//!
//! Decoding here is deliberately narrow: only the handful of
//! `system.local`/`system.peers`/`system_schema.keyspaces` columns the
//! token map and host map need are interpreted. General CQL value codecs
//! remain out of scope; this is bootstrap plumbing, not a public decoding
//! surface.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
    sync::{Arc, Mutex},
};

use bytes::{Buf, Bytes};
use tokio::sync::mpsc;

use super::{
    event::ClusterEventListener,
    host::{Host, HostMap, HostState},
    schema::{self, KeyspaceMetadata, SchemaSnapshot},
    token::{ReplicationStrategy, Token, TokenMap},
};
use crate::{
    error::Result,
    pool::{
        conn::{Connection, EventSender},
        options::ConnectionOptions,
    },
    protocol::{CqlValue, EventBody, Frame, Opcode, QueryParams, QueryRequest, ResultBody, RowsMetadata},
    runtime::AsyncStream,
};

/// The map shared between every keyspace's token ring and the
/// token-aware load-balancing policy wrapping it.
pub(crate) type TokenMaps = Arc<Mutex<HashMap<String, (TokenMap, ReplicationStrategy)>>>;

/// A single connection dedicated to metadata queries and server-push
/// events. Reconnection is the owning [`super::cluster::Cluster`]'s
/// responsibility; this type only knows how to establish itself once,
/// bootstrap the shared state, and pump events until it dies.
pub(crate) struct ControlConnection {
    connection: Connection,
    events: mpsc::UnboundedReceiver<Frame>,
    treat_down_as_hint: bool,
}

impl ControlConnection {
    /// Completes the handshake against `address`, registering for every
    /// event type the cluster cares about. `treat_down_as_hint` controls
    /// whether `STATUS_CHANGE DOWN` is forwarded to the listener
    /// (`ClusterConfig::treat_status_change_down_as_hint`, default `false`
    /// matching the original driver).
    pub(crate) async fn connect(
        address: SocketAddr,
        stream: AsyncStream,
        options: &ConnectionOptions,
        treat_down_as_hint: bool,
    ) -> Result<Self> {
        let (events_tx, events_rx): (EventSender, _) = mpsc::unbounded_channel();
        let connection = Connection::establish(address, stream, options, Some(events_tx)).await?;
        Ok(Self {
            connection,
            events: events_rx,
            treat_down_as_hint,
        })
    }

    /// The address this control connection is talking to.
    pub(crate) fn address(&self) -> SocketAddr {
        self.connection.address()
    }

    /// Runs the three bootstrap queries and populates `hosts`, `schema`,
    /// and `token_maps` from their results.
    pub(crate) async fn bootstrap(
        &self,
        native_port: u16,
        hosts: &Mutex<HostMap>,
        schema: &Mutex<SchemaSnapshot>,
        token_maps: &TokenMaps,
    ) -> Result<()> {
        let local_rows = self
            .query("SELECT rpc_address, data_center, rack, release_version, tokens FROM system.local")
            .await?;
        let peer_rows = self
            .query("SELECT peer, rpc_address, data_center, rack, release_version, tokens FROM system.peers")
            .await?;
        let keyspace_rows = self
            .query("SELECT keyspace_name, replication FROM system_schema.keyspaces")
            .await?;

        {
            let mut hosts = hosts.lock().unwrap();
            if let Some((metadata, row)) = local_rows.first_row() {
                if let Some(host) = host_from_row(metadata, row, &["rpc_address"], native_port) {
                    hosts.upsert(host);
                } else {
                    hosts.upsert(Host::new(self.address()));
                }
            }
            for row in peer_rows.rows() {
                if let Some(host) = host_from_row(peer_rows.metadata(), row, &["rpc_address", "peer"], native_port) {
                    hosts.upsert(host);
                }
            }
        }

        {
            let mut snapshot = SchemaSnapshot::new();
            for row in keyspace_rows.rows() {
                let Some(name) = column_text(keyspace_rows.metadata(), row, "keyspace_name") else {
                    continue;
                };
                let Some(replication) = column_text_map(keyspace_rows.metadata(), row, "replication") else {
                    continue;
                };
                let Ok(strategy) = schema::parse_replication(&replication) else {
                    continue;
                };
                snapshot.insert(name, KeyspaceMetadata { replication: strategy });
            }
            *schema.lock().unwrap() = snapshot;
        }

        rebuild_token_maps(hosts, schema, token_maps);
        Ok(())
    }

    async fn query(&self, cql: &str) -> Result<DecodedRows> {
        let request = QueryRequest {
            query: cql.to_string(),
            params: QueryParams::default(),
        };
        let body = request.encode()?;
        let frame = self.connection.send(Opcode::Query, body).await?;
        let mut raw = frame.body.clone().freeze();
        match ResultBody::decode(&mut raw)? {
            ResultBody::Rows { metadata, rows } => Ok(DecodedRows { metadata, rows }),
            _ => Ok(DecodedRows {
                metadata: RowsMetadata::default(),
                rows: Vec::new(),
            }),
        }
    }

    /// Consumes `self`, dispatching `EVENT` frames until the connection
    /// dies (at which point the event channel closes). Returns the reason
    /// the pump stopped, for the cluster's reconnect loop to log.
    pub(crate) async fn run(
        mut self,
        hosts: Arc<Mutex<HostMap>>,
        schema: Arc<Mutex<SchemaSnapshot>>,
        token_maps: TokenMaps,
        listener: Arc<dyn ClusterEventListener>,
    ) {
        while let Some(frame) = self.events.recv().await {
            let mut body = frame.body.clone().freeze();
            let event = match EventBody::decode(&mut body) {
                Ok(event) => event,
                Err(_) => continue,
            };
            self.handle_event(event, &hosts, &schema, &token_maps, &listener).await;
        }
    }

    async fn handle_event(
        &self,
        event: EventBody,
        hosts: &Mutex<HostMap>,
        schema: &Mutex<SchemaSnapshot>,
        token_maps: &TokenMaps,
        listener: &Arc<dyn ClusterEventListener>,
    ) {
        // EVENT addresses already carry the node's real native-protocol
        // port (unlike system.local/system.peers rows, which don't), so
        // they're used verbatim rather than overridden with a configured
        // default port.
        match event {
            EventBody::TopologyChange { change_type, address } => match change_type.as_str() {
                "NEW_NODE" => {
                    hosts.lock().unwrap().upsert(Host::new(address));
                    rebuild_token_maps(hosts, schema, token_maps);
                    listener.on_add(address);
                }
                "REMOVED_NODE" => {
                    hosts.lock().unwrap().mark_removed(address);
                    rebuild_token_maps(hosts, schema, token_maps);
                    listener.on_remove(address);
                }
                _ => {}
            },
            EventBody::StatusChange { change_type, address } => {
                // STATUS_CHANGE DOWN is ignored by default; pool failures,
                // not the control channel, drive down detection, unless the
                // caller opted into treating it as a hint.
                match change_type.as_str() {
                    "UP" => {
                        if hosts.lock().unwrap().mark_state(address, HostState::Up) {
                            listener.on_up(address);
                        }
                    }
                    "DOWN" if self.treat_down_as_hint => {
                        if hosts.lock().unwrap().mark_state(address, HostState::Down) {
                            listener.on_down(address);
                        }
                    }
                    _ => {}
                }
            }
            EventBody::SchemaChange(change) => {
                if change.target == "KEYSPACE" {
                    let mut rebuild = false;
                    match change.change_type.as_str() {
                        "DROPPED" => {
                            schema.lock().unwrap().remove(&change.keyspace);
                            rebuild = true;
                        }
                        "CREATED" | "UPDATED" => {
                            if let Ok(rows) = self
                                .query(&format!(
                                    "SELECT replication FROM system_schema.keyspaces WHERE keyspace_name = '{}'",
                                    change.keyspace.replace('\'', "''")
                                ))
                                .await
                            {
                                if let Some(row) = rows.rows().first() {
                                    if let Some(replication) = column_text_map(rows.metadata(), row, "replication") {
                                        if let Ok(strategy) = schema::parse_replication(&replication) {
                                            schema.lock().unwrap().insert(
                                                change.keyspace.clone(),
                                                KeyspaceMetadata { replication: strategy },
                                            );
                                            rebuild = true;
                                        }
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                    if rebuild {
                        rebuild_token_maps(hosts, schema, token_maps);
                    }
                }
            }
        }
    }
}

struct DecodedRows {
    metadata: RowsMetadata,
    rows: Vec<Vec<CqlValue>>,
}

impl DecodedRows {
    fn metadata(&self) -> &RowsMetadata {
        &self.metadata
    }

    fn rows(&self) -> &[Vec<CqlValue>] {
        &self.rows
    }

    fn first_row(&self) -> Option<(&RowsMetadata, &Vec<CqlValue>)> {
        self.rows.first().map(|row| (&self.metadata, row))
    }
}

fn column_index(metadata: &RowsMetadata, name: &str) -> Option<usize> {
    metadata.columns.iter().position(|c| c.name == name)
}

fn column_text(metadata: &RowsMetadata, row: &[CqlValue], name: &str) -> Option<String> {
    let index = column_index(metadata, name)?;
    decode_text(row.get(index)?)
}

fn decode_text(value: &CqlValue) -> Option<String> {
    value.0.as_ref().and_then(|b| std::str::from_utf8(b).ok()).map(str::to_string)
}

fn decode_inet(value: &CqlValue) -> Option<IpAddr> {
    let bytes = value.0.as_ref()?;
    match bytes.len() {
        4 => Some(IpAddr::V4(Ipv4Addr::new(bytes[0], bytes[1], bytes[2], bytes[3]))),
        16 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(bytes);
            Some(IpAddr::V6(Ipv6Addr::from(octets)))
        }
        _ => None,
    }
}

/// Decodes a `list<text>` collection value: `[count:i32]([len:i32][bytes])*`.
fn decode_text_list(value: &CqlValue) -> Vec<Token> {
    let Some(bytes) = value.0.clone() else { return Vec::new() };
    let mut buf = bytes;
    if buf.len() < 4 {
        return Vec::new();
    }
    let count = buf.get_i32().max(0) as usize;
    let mut tokens = Vec::with_capacity(count);
    for _ in 0..count {
        if buf.len() < 4 {
            break;
        }
        let len = buf.get_i32();
        if len < 0 || buf.len() < len as usize {
            break;
        }
        let element = buf.copy_to_bytes(len as usize);
        if let Ok(text) = std::str::from_utf8(&element) {
            if let Ok(token) = text.parse::<Token>() {
                tokens.push(token);
            }
        }
    }
    tokens
}

/// Decodes a `map<text, text>` collection value: `[count:i32]([len:i32][bytes] [len:i32][bytes])*`.
fn column_text_map(metadata: &RowsMetadata, row: &[CqlValue], name: &str) -> Option<HashMap<String, String>> {
    let index = column_index(metadata, name)?;
    let value = row.get(index)?;
    let bytes = value.0.clone()?;
    let mut buf = bytes;
    if buf.len() < 4 {
        return Some(HashMap::new());
    }
    let count = buf.get_i32().max(0) as usize;
    let mut map = HashMap::with_capacity(count);
    for _ in 0..count {
        let key = read_length_prefixed_text(&mut buf)?;
        let value = read_length_prefixed_text(&mut buf)?;
        map.insert(key, value);
    }
    Some(map)
}

fn read_length_prefixed_text(buf: &mut Bytes) -> Option<String> {
    if buf.len() < 4 {
        return None;
    }
    let len = buf.get_i32();
    if len < 0 || buf.len() < len as usize {
        return None;
    }
    let bytes = buf.copy_to_bytes(len as usize);
    std::str::from_utf8(&bytes).ok().map(str::to_string)
}

/// Builds a [`Host`] from one `system.local`/`system.peers` row, preferring
/// the first column name in `address_columns` that decodes to a non-null
/// address, falling back to the next.
fn host_from_row(
    metadata: &RowsMetadata,
    row: &[CqlValue],
    address_columns: &[&str],
    native_port: u16,
) -> Option<Host> {
    let ip = address_columns.iter().find_map(|name| {
        let index = column_index(metadata, name)?;
        decode_inet(row.get(index)?)
    })?;
    let mut host = Host::new(SocketAddr::new(ip, native_port));
    host.datacenter = column_text(metadata, row, "data_center");
    host.rack = column_text(metadata, row, "rack").unwrap_or_default();
    host.release_version = column_text(metadata, row, "release_version");
    if let Some(index) = column_index(metadata, "tokens") {
        if let Some(value) = row.get(index) {
            host.tokens = decode_text_list(value);
        }
    }
    Some(host)
}

fn rebuild_token_maps(hosts: &Mutex<HostMap>, schema: &Mutex<SchemaSnapshot>, token_maps: &TokenMaps) {
    let hosts = hosts.lock().unwrap();
    let ring = hosts.token_ring_pairs();
    let datacenter_of = hosts.datacenter_of();
    drop(hosts);

    let schema = schema.lock().unwrap();
    let mut maps = token_maps.lock().unwrap();
    maps.clear();
    for keyspace in schema.keyspace_names() {
        if let Some(strategy) = schema.replication_of(&keyspace) {
            let token_map = TokenMap::build(ring.clone(), datacenter_of.clone());
            maps.insert(keyspace, (token_map, strategy.clone()));
        }
    }
}
