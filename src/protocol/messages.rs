//! Request and response bodies for each opcode named in the wire protocol
//! table. Column/argument *types* are carried as opaque CQL type ids rather
//! than fully parsed (per-scalar-type codecs are out of scope), but
//! everything needed for routing, paging, schema discovery, and prepared
//! statement bookkeeping is decoded.

use std::collections::HashMap;

use bitflags::bitflags;
use bytes::{Buf, Bytes, BytesMut};

use super::{consistency::Consistency, envelope, value::CqlValue};
use crate::error::{Error, ErrorKind, Result, ServerError};

bitflags! {
    /// Flags carried in the body of `QUERY`/`EXECUTE`/`BATCH`.
    #[derive(Copy, Clone, Debug, Eq, PartialEq)]
    pub struct QueryFlags: u8 {
        /// Bound values follow.
        const VALUES = 0x01;
        /// Skip returning result set metadata.
        const SKIP_METADATA = 0x02;
        /// A page size is present.
        const PAGE_SIZE = 0x04;
        /// A paging state token is present.
        const PAGING_STATE = 0x08;
        /// A serial consistency is present.
        const SERIAL_CONSISTENCY = 0x10;
        /// A client-supplied timestamp is present.
        const DEFAULT_TIMESTAMP = 0x20;
        /// Bound values are named rather than positional.
        const NAMED_VALUES = 0x40;
    }
}

/// Parameters shared by `QUERY` and `EXECUTE`.
#[derive(Clone, Debug, Default)]
pub struct QueryParams {
    /// The consistency level to execute at.
    pub consistency: Consistency,
    /// Positional bound values.
    pub values: Vec<CqlValue>,
    /// Whether to omit result-set metadata in the response.
    pub skip_metadata: bool,
    /// The requested page size, if paging.
    pub page_size: Option<i32>,
    /// The paging state token from a previous page, if continuing.
    pub paging_state: Option<Bytes>,
    /// The serial consistency level, for conditional updates.
    pub serial_consistency: Option<Consistency>,
    /// A client-supplied microsecond timestamp, if the configured
    /// [`crate::policy::timestamp::TimestampGenerator`] produced one.
    pub timestamp: Option<i64>,
}

impl QueryParams {
    fn flags(&self) -> QueryFlags {
        let mut flags = QueryFlags::empty();
        if !self.values.is_empty() {
            flags |= QueryFlags::VALUES;
        }
        if self.skip_metadata {
            flags |= QueryFlags::SKIP_METADATA;
        }
        if self.page_size.is_some() {
            flags |= QueryFlags::PAGE_SIZE;
        }
        if self.paging_state.is_some() {
            flags |= QueryFlags::PAGING_STATE;
        }
        if self.serial_consistency.is_some() {
            flags |= QueryFlags::SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= QueryFlags::DEFAULT_TIMESTAMP;
        }
        flags
    }

    fn encode_body(&self, buf: &mut BytesMut) -> Result<()> {
        buf.extend_from_slice(&self.consistency.to_wire().to_be_bytes());
        buf.extend_from_slice(&[self.flags().bits()]);
        if !self.values.is_empty() {
            buf.extend_from_slice(&(self.values.len() as u16).to_be_bytes());
            for value in &self.values {
                value.encode(buf)?;
            }
        }
        if let Some(page_size) = self.page_size {
            buf.extend_from_slice(&page_size.to_be_bytes());
        }
        if let Some(ref paging_state) = self.paging_state {
            envelope::put_bytes(buf, Some(paging_state))?;
        }
        if let Some(serial_consistency) = self.serial_consistency {
            buf.extend_from_slice(&serial_consistency.to_wire().to_be_bytes());
        }
        if let Some(timestamp) = self.timestamp {
            buf.extend_from_slice(&timestamp.to_be_bytes());
        }
        Ok(())
    }
}

/// `QUERY` request body: ad-hoc CQL text plus execution parameters.
#[derive(Clone, Debug)]
pub struct QueryRequest {
    /// The CQL statement text.
    pub query: String,
    /// Execution parameters.
    pub params: QueryParams,
}

impl QueryRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_long_string(&mut buf, &self.query)?;
        self.params.encode_body(&mut buf)?;
        Ok(buf)
    }
}

/// `PREPARE` request body: the CQL statement to compile.
#[derive(Clone, Debug)]
pub struct PrepareRequest {
    /// The CQL statement text.
    pub query: String,
}

impl PrepareRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_long_string(&mut buf, &self.query)?;
        Ok(buf)
    }
}

/// `EXECUTE` request body: a previously prepared statement id plus bound
/// values.
#[derive(Clone, Debug)]
pub struct ExecuteRequest {
    /// The server-issued prepared statement id.
    pub id: Bytes,
    /// Execution parameters.
    pub params: QueryParams,
}

impl ExecuteRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_short_bytes(&mut buf, &self.id)?;
        self.params.encode_body(&mut buf)?;
        Ok(buf)
    }
}

/// The kind of a `BATCH` request.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BatchType {
    /// `LOGGED`: atomic across partitions via the batchlog.
    Logged,
    /// `UNLOGGED`: no atomicity guarantee across partitions.
    Unlogged,
    /// `COUNTER`: a batch of counter updates.
    Counter,
}

impl BatchType {
    fn to_wire(self) -> u8 {
        match self {
            BatchType::Logged => 0,
            BatchType::Unlogged => 1,
            BatchType::Counter => 2,
        }
    }
}

/// One statement within a `BATCH`: either ad-hoc CQL text or a prepared id,
/// plus its bound values, per the `kind | statement-or-id | value-count |
/// values…` wire encoding.
#[derive(Clone, Debug)]
pub enum BatchStatement {
    /// An ad-hoc CQL statement.
    Query(String, Vec<CqlValue>),
    /// A prepared statement id.
    Prepared(Bytes, Vec<CqlValue>),
}

/// `BATCH` request body.
#[derive(Clone, Debug)]
pub struct BatchRequest {
    /// The batch type.
    pub batch_type: BatchType,
    /// The statements to execute as one batch.
    pub statements: Vec<BatchStatement>,
    /// The consistency level to execute at.
    pub consistency: Consistency,
    /// The serial consistency level, for conditional batches.
    pub serial_consistency: Option<Consistency>,
    /// A client-supplied microsecond timestamp, if any.
    pub timestamp: Option<i64>,
}

impl BatchRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&[self.batch_type.to_wire()]);
        let count: u16 = self
            .statements
            .len()
            .try_into()
            .map_err(|_| Error::internal("too many statements in batch"))?;
        buf.extend_from_slice(&count.to_be_bytes());
        for statement in &self.statements {
            let (kind, values) = match statement {
                BatchStatement::Query(query, values) => {
                    buf.extend_from_slice(&[0u8]);
                    envelope::put_long_string(&mut buf, query)?;
                    (0u8, values)
                }
                BatchStatement::Prepared(id, values) => {
                    buf.extend_from_slice(&[1u8]);
                    envelope::put_short_bytes(&mut buf, id)?;
                    (1u8, values)
                }
            };
            let _ = kind;
            buf.extend_from_slice(&(values.len() as u16).to_be_bytes());
            for value in values {
                value.encode(&mut buf)?;
            }
        }
        buf.extend_from_slice(&self.consistency.to_wire().to_be_bytes());
        let mut flags = QueryFlags::empty();
        if self.serial_consistency.is_some() {
            flags |= QueryFlags::SERIAL_CONSISTENCY;
        }
        if self.timestamp.is_some() {
            flags |= QueryFlags::DEFAULT_TIMESTAMP;
        }
        buf.extend_from_slice(&[flags.bits()]);
        if let Some(serial_consistency) = self.serial_consistency {
            buf.extend_from_slice(&serial_consistency.to_wire().to_be_bytes());
        }
        if let Some(timestamp) = self.timestamp {
            buf.extend_from_slice(&timestamp.to_be_bytes());
        }
        Ok(buf)
    }
}

/// `REGISTER` request body: the set of event types to subscribe to.
#[derive(Clone, Debug)]
pub struct RegisterRequest {
    /// Event type names, e.g. `TOPOLOGY_CHANGE`, `STATUS_CHANGE`,
    /// `SCHEMA_CHANGE`.
    pub event_types: Vec<String>,
}

impl RegisterRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_string_list(&mut buf, &self.event_types)?;
        Ok(buf)
    }
}

/// `STARTUP` request body: the CQL_VERSION and optional COMPRESSION
/// options.
#[derive(Clone, Debug)]
pub struct StartupRequest {
    /// Startup options, e.g. `{"CQL_VERSION": "3.0.0", "COMPRESSION":
    /// "lz4"}`.
    pub options: HashMap<String, String>,
}

impl StartupRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_string_map(&mut buf, &self.options)?;
        Ok(buf)
    }
}

/// `AUTH_RESPONSE` request body: an opaque SASL token.
#[derive(Clone, Debug)]
pub struct AuthResponseRequest {
    /// The SASL response token.
    pub token: Bytes,
}

impl AuthResponseRequest {
    pub(crate) fn encode(&self) -> Result<BytesMut> {
        let mut buf = BytesMut::new();
        envelope::put_bytes(&mut buf, Some(&self.token))?;
        Ok(buf)
    }
}

/// A decoded column specification: name plus an opaque CQL type id. The
/// full CQL type grammar is out of scope for this core; `type_id` and
/// `custom_class` are preserved so callers that do understand the type
/// system can interpret them.
#[derive(Clone, Debug)]
pub struct ColumnSpec {
    /// The owning keyspace, if per-column metadata (rather than
    /// global-table metadata) is present.
    pub keyspace: Option<String>,
    /// The owning table, if per-column metadata is present.
    pub table: Option<String>,
    /// The column name.
    pub name: String,
    /// The raw CQL option id for this column's type.
    pub type_id: u16,
    /// The custom class name, only present when `type_id` is the "custom"
    /// option (`0x0000`).
    pub custom_class: Option<String>,
}

/// Metadata preceding a `ROWS` result's data.
#[derive(Clone, Debug, Default)]
pub struct RowsMetadata {
    /// Whether column specs carry their own keyspace/table (vs. sharing one
    /// declared once for the whole result).
    pub global_table_spec: bool,
    /// Whether more pages are available.
    pub has_more_pages: bool,
    /// Whether metadata was deliberately omitted (`SKIP_METADATA`).
    pub no_metadata: bool,
    /// The opaque paging state token for fetching the next page, if any.
    pub paging_state: Option<Bytes>,
    /// Per-column specifications, empty if `no_metadata`.
    pub columns: Vec<ColumnSpec>,
}

/// A decoded `RESULT` response, one variant per kind named in the wire
/// protocol table.
#[derive(Clone, Debug)]
pub enum ResultBody {
    /// `VOID`: the request succeeded and returns nothing.
    Void,
    /// `ROWS`: metadata plus raw row data (each row a vector of opaque
    /// values in column order).
    Rows {
        /// The result-set metadata.
        metadata: RowsMetadata,
        /// The row data.
        rows: Vec<Vec<CqlValue>>,
    },
    /// `SET_KEYSPACE`: the new current keyspace.
    SetKeyspace(String),
    /// `PREPARED`: a freshly compiled statement's id plus its bind and
    /// result metadata.
    Prepared {
        /// The server-issued prepared statement id.
        id: Bytes,
        /// Metadata describing the bind variables.
        bind_metadata: RowsMetadata,
        /// Metadata describing the eventual result rows.
        result_metadata: RowsMetadata,
    },
    /// `SCHEMA_CHANGE`: a DDL change occurred as a direct result of this
    /// request.
    SchemaChange(SchemaChangeEvent),
}

/// The `change_type`/`target` pair common to both the `RESULT`
/// `SCHEMA_CHANGE` kind and the standalone `SCHEMA_CHANGE` event.
#[derive(Clone, Debug)]
pub struct SchemaChangeEvent {
    /// `CREATED` | `UPDATED` | `DROPPED`.
    pub change_type: String,
    /// `KEYSPACE` | `TABLE` | `TYPE` | `FUNCTION` | `AGGREGATE`.
    pub target: String,
    /// The affected keyspace.
    pub keyspace: String,
    /// The affected table/type/function/aggregate name, when `target` is
    /// not `KEYSPACE`.
    pub name: Option<String>,
    /// Function/aggregate argument types, when applicable.
    pub arg_types: Vec<String>,
}

fn decode_rows_metadata(buf: &mut Bytes) -> Result<RowsMetadata> {
    let flags = buf.get_i32();
    const GLOBAL_TABLES_SPEC: i32 = 0x0001;
    const HAS_MORE_PAGES: i32 = 0x0002;
    const NO_METADATA: i32 = 0x0004;

    let global_table_spec = flags & GLOBAL_TABLES_SPEC != 0;
    let has_more_pages = flags & HAS_MORE_PAGES != 0;
    let no_metadata = flags & NO_METADATA != 0;

    let column_count = buf.get_i32();
    if column_count < 0 {
        return Err(ErrorKind::Server(ServerError::ProtocolError {
            message: "negative column count in result metadata".into(),
        })
        .into());
    }

    let paging_state = if has_more_pages {
        envelope::get_bytes(buf)?
    } else {
        None
    };

    let mut columns = Vec::new();
    if !no_metadata {
        let (shared_keyspace, shared_table) = if global_table_spec {
            (Some(envelope::get_string(buf)?), Some(envelope::get_string(buf)?))
        } else {
            (None, None)
        };

        for _ in 0..column_count {
            let (keyspace, table) = if global_table_spec {
                (shared_keyspace.clone(), shared_table.clone())
            } else {
                (Some(envelope::get_string(buf)?), Some(envelope::get_string(buf)?))
            };
            let name = envelope::get_string(buf)?;
            let type_id = buf.get_u16();
            let custom_class = if type_id == 0x0000 {
                Some(envelope::get_string(buf)?)
            } else {
                None
            };
            columns.push(ColumnSpec {
                keyspace,
                table,
                name,
                type_id,
                custom_class,
            });
        }
    }

    Ok(RowsMetadata {
        global_table_spec,
        has_more_pages,
        no_metadata,
        paging_state,
        columns,
    })
}

fn decode_schema_change(buf: &mut Bytes) -> Result<SchemaChangeEvent> {
    let change_type = envelope::get_string(buf)?;
    let target = envelope::get_string(buf)?;
    let keyspace = envelope::get_string(buf)?;
    let (name, arg_types) = match target.as_str() {
        "KEYSPACE" => (None, Vec::new()),
        "FUNCTION" | "AGGREGATE" => {
            let name = envelope::get_string(buf)?;
            let arg_types = envelope::get_string_list(buf)?;
            (Some(name), arg_types)
        }
        _ => (Some(envelope::get_string(buf)?), Vec::new()),
    };
    Ok(SchemaChangeEvent {
        change_type,
        target,
        keyspace,
        name,
        arg_types,
    })
}

impl ResultBody {
    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        let kind = buf.get_i32();
        Ok(match kind {
            0x0001 => ResultBody::Void,
            0x0002 => {
                let metadata = decode_rows_metadata(buf)?;
                let row_count = buf.get_i32();
                if row_count < 0 {
                    return Err(ErrorKind::Server(ServerError::ProtocolError {
                        message: "negative row count in ROWS result".into(),
                    })
                    .into());
                }
                let column_count = metadata.columns.len().max(if metadata.no_metadata {
                    0
                } else {
                    metadata.columns.len()
                });
                let mut rows = Vec::with_capacity(row_count as usize);
                for _ in 0..row_count {
                    let mut row = Vec::with_capacity(column_count);
                    let cols = if metadata.no_metadata {
                        // Without metadata we don't know the column count;
                        // the caller is expected to already know it from a
                        // cached prepared statement's result metadata.
                        metadata.columns.len()
                    } else {
                        metadata.columns.len()
                    };
                    for _ in 0..cols {
                        row.push(CqlValue::decode(buf)?);
                    }
                    rows.push(row);
                }
                ResultBody::Rows { metadata, rows }
            }
            0x0003 => ResultBody::SetKeyspace(envelope::get_string(buf)?),
            0x0004 => {
                let id = envelope::get_short_bytes(buf)?;
                let bind_metadata = decode_rows_metadata(buf)?;
                let result_metadata = decode_rows_metadata(buf)?;
                ResultBody::Prepared {
                    id,
                    bind_metadata,
                    result_metadata,
                }
            }
            0x0005 => ResultBody::SchemaChange(decode_schema_change(buf)?),
            other => {
                return Err(ErrorKind::Server(ServerError::ProtocolError {
                    message: format!("unknown RESULT kind {other:#x}"),
                })
                .into())
            }
        })
    }
}

/// A decoded `EVENT` response, one variant per event type the control
/// connection registers for.
#[derive(Clone, Debug)]
pub enum EventBody {
    /// `TOPOLOGY_CHANGE`: `NEW_NODE` or `REMOVED_NODE`.
    TopologyChange {
        /// `NEW_NODE` | `REMOVED_NODE`.
        change_type: String,
        /// The affected node's address.
        address: std::net::SocketAddr,
    },
    /// `STATUS_CHANGE`: `UP` or `DOWN`.
    StatusChange {
        /// `UP` | `DOWN`.
        change_type: String,
        /// The affected node's address.
        address: std::net::SocketAddr,
    },
    /// `SCHEMA_CHANGE`: a DDL change observed by the control connection.
    SchemaChange(SchemaChangeEvent),
}

impl EventBody {
    pub(crate) fn decode(buf: &mut Bytes) -> Result<Self> {
        let event_type = envelope::get_string(buf)?;
        Ok(match event_type.as_str() {
            "TOPOLOGY_CHANGE" => {
                let change_type = envelope::get_string(buf)?;
                let address = envelope::get_inet(buf)?;
                EventBody::TopologyChange {
                    change_type,
                    address,
                }
            }
            "STATUS_CHANGE" => {
                let change_type = envelope::get_string(buf)?;
                let address = envelope::get_inet(buf)?;
                EventBody::StatusChange {
                    change_type,
                    address,
                }
            }
            "SCHEMA_CHANGE" => EventBody::SchemaChange(decode_schema_change(buf)?),
            other => {
                return Err(ErrorKind::Server(ServerError::ProtocolError {
                    message: format!("unknown event type {other}"),
                })
                .into())
            }
        })
    }
}

/// A decoded `ERROR` response body, translated directly into a
/// [`ServerError`].
pub(crate) fn decode_error_body(buf: &mut Bytes) -> Result<ServerError> {
    let code = buf.get_i32();
    let message = envelope::get_string(buf)?;
    Ok(match code {
        0x0000 => ServerError::ServerError { code, message },
        0x1001 => ServerError::Overloaded { message },
        0x1002 => ServerError::IsBootstrapping { message },
        0x1003 => ServerError::TruncateError { message },
        0x1100 => {
            let consistency = read_consistency(buf)?;
            let received = buf.get_i32();
            let required = buf.get_i32();
            let write_type = envelope::get_string(buf)?;
            ServerError::WriteTimeout {
                message,
                consistency,
                received,
                required,
                write_type,
            }
        }
        0x1200 => {
            let consistency = read_consistency(buf)?;
            let received = buf.get_i32();
            let required = buf.get_i32();
            let data_present = buf.get_u8() != 0;
            ServerError::ReadTimeout {
                message,
                consistency,
                received,
                required,
                data_present,
            }
        }
        0x1300 => {
            let consistency = read_consistency(buf)?;
            let received = buf.get_i32();
            let required = buf.get_i32();
            let failures = buf.get_i32();
            ServerError::ReadWriteFailure {
                message,
                consistency,
                received,
                required,
                failures,
            }
        }
        0x1400 => {
            let consistency = read_consistency(buf)?;
            let received = buf.get_i32();
            let required = buf.get_i32();
            let failures = buf.get_i32();
            ServerError::ReadWriteFailure {
                message,
                consistency,
                received,
                required,
                failures,
            }
        }
        0x1500 => {
            let keyspace = envelope::get_string(buf)?;
            let function = envelope::get_string(buf)?;
            let arg_types = envelope::get_string_list(buf)?;
            ServerError::FunctionFailure {
                message,
                keyspace,
                function,
                arg_types,
            }
        }
        0x1600 => {
            let consistency = read_consistency(buf)?;
            let received = buf.get_i32();
            let required = buf.get_i32();
            ServerError::CasWriteUnknown {
                message,
                consistency,
                received,
                required,
            }
        }
        0x2000 => ServerError::SyntaxError { message },
        0x2100 => ServerError::Unauthorized { message },
        0x2200 => ServerError::Invalid { message },
        0x2300 => ServerError::ConfigError { message },
        0x2400 => {
            let keyspace = envelope::get_string(buf)?;
            let table = envelope::get_string(buf)?;
            ServerError::AlreadyExists {
                message,
                keyspace,
                table: if table.is_empty() { None } else { Some(table) },
            }
        }
        0x2500 => {
            let id = envelope::get_short_bytes(buf)?.to_vec();
            ServerError::Unprepared { message, id }
        }
        0x0100 => ServerError::AuthenticationError { message },
        0x000a => ServerError::ProtocolError { message },
        _ => ServerError::ServerError { code, message },
    })
}

fn read_consistency(buf: &mut Bytes) -> Result<Consistency> {
    let raw = buf.get_u16();
    Consistency::from_wire(raw).ok_or_else(|| {
        Error::internal(format!("unknown consistency level on wire: {raw:#x}"))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn void_result_round_trips() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&1i32.to_be_bytes());
        let mut frozen = buf.freeze();
        assert!(matches!(ResultBody::decode(&mut frozen).unwrap(), ResultBody::Void));
    }

    #[test]
    fn set_keyspace_result_round_trips() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&3i32.to_be_bytes());
        envelope::put_string(&mut buf, "my_keyspace").unwrap();
        let mut frozen = buf.freeze();
        match ResultBody::decode(&mut frozen).unwrap() {
            ResultBody::SetKeyspace(ks) => assert_eq!(ks, "my_keyspace"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn unprepared_error_carries_id() {
        let mut buf = BytesMut::new();
        buf.extend_from_slice(&0x2500i32.to_be_bytes());
        envelope::put_string(&mut buf, "unprepared statement").unwrap();
        envelope::put_short_bytes(&mut buf, &[1, 2, 3, 4]).unwrap();
        let mut frozen = buf.freeze();
        match decode_error_body(&mut frozen).unwrap() {
            ServerError::Unprepared { id, .. } => assert_eq!(id, vec![1, 2, 3, 4]),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn query_request_encodes_values_flag_only_when_present() {
        let req = QueryRequest {
            query: "SELECT 1".into(),
            params: QueryParams::default(),
        };
        let encoded = req.encode().unwrap();
        // long-string length (4) + "SELECT 1" (8) + consistency (2) + flags (1)
        assert_eq!(encoded.len(), 4 + 8 + 2 + 1);
    }
}
