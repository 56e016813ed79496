//! The native CQL binary protocol: frame header, stream multiplexing
//! primitives, primitive byte encodings, and the request/response bodies
//! built on top of them.

pub mod codec;
pub mod consistency;
pub mod envelope;
pub mod frame;
pub mod messages;
pub mod value;

pub use codec::{EncodedFrame, FrameCodec, MAX_FRAME_BODY_LEN};
pub use consistency::Consistency;
pub use frame::{max_stream_id, stream_id_width, Frame, FrameFlags, Opcode, DEFAULT_PROTOCOL_VERSION};
pub use messages::{
    AuthResponseRequest, BatchRequest, BatchStatement, BatchType, ColumnSpec, EventBody,
    ExecuteRequest, PrepareRequest, QueryFlags, QueryParams, QueryRequest, RegisterRequest,
    ResultBody, RowsMetadata, SchemaChangeEvent, StartupRequest,
};
pub use value::{CqlValue, RoutingKey};
