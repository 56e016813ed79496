//! The [`Error`] and [`Result`] types used throughout this crate.

use std::sync::Arc;

use thiserror::Error;

use crate::protocol::consistency::Consistency;

/// The result type returned by fallible operations in this crate.
pub type Result<T> = std::result::Result<T, Error>;

/// An error produced by this crate.
///
/// The inner [`ErrorKind`] is boxed to keep `Error` small on the stack, and
/// wrapped such that `Error` remains `Clone` even though some of its
/// variants (notably I/O errors) are not `Clone` by themselves.
#[derive(Clone, Debug, Error)]
#[error("{kind}")]
pub struct Error {
    /// The specific kind of error that occurred.
    pub kind: Box<ErrorKind>,

    /// The host the error originated from, if the error is associated with a
    /// particular server.
    pub host: Option<String>,

    #[source]
    pub(crate) source: Option<Box<Error>>,
}

impl Error {
    pub(crate) fn new(kind: ErrorKind) -> Self {
        Self {
            kind: Box::new(kind),
            host: None,
            source: None,
        }
    }

    pub(crate) fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = Some(host.into());
        self
    }

    pub(crate) fn with_source(mut self, source: Error) -> Self {
        self.source = Some(Box::new(source));
        self
    }

    pub(crate) fn bad_params(message: impl Into<String>) -> Self {
        ErrorKind::Library(LibraryError::BadParams {
            message: message.into(),
        })
        .into()
    }

    pub(crate) fn no_stream_ids() -> Self {
        ErrorKind::Library(LibraryError::NoAvailableStreamIds).into()
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        ErrorKind::Library(LibraryError::Internal {
            message: message.into(),
        })
        .into()
    }

    /// Whether this error represents a connection-level failure (the
    /// connection that produced it should be considered defunct).
    pub fn is_io_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Io(_))
    }

    /// Whether this error originated from a typed `ERROR` response from the
    /// server.
    pub fn is_server_error(&self) -> bool {
        matches!(self.kind.as_ref(), ErrorKind::Server(_))
    }

    /// Whether this is the specific `UNPREPARED` server error that the
    /// execution engine handles transparently.
    pub fn is_unprepared(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Server(ServerError::Unprepared { .. })
        )
    }

    /// Whether this error is classified as critical for the owning pool
    /// (auth failure, protocol mismatch, or another known-fatal condition) —
    /// such an error closes the whole pool rather than scheduling a retry.
    pub fn is_critical(&self) -> bool {
        matches!(
            self.kind.as_ref(),
            ErrorKind::Ssl(_)
                | ErrorKind::Server(ServerError::AuthenticationError { .. })
                | ErrorKind::Server(ServerError::ProtocolError { .. })
        )
    }
}

impl From<ErrorKind> for Error {
    fn from(kind: ErrorKind) -> Self {
        Error::new(kind)
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        ErrorKind::Io(Arc::new(err)).into()
    }
}

/// The top-level classification of an [`Error`]: library-internal errors,
/// typed server errors, TLS errors, and HTTP-client errors (used by the
/// cloud metadata resolver).
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ErrorKind {
    /// An error raised by the driver itself rather than by the server.
    #[error("library error: {0}")]
    Library(LibraryError),

    /// A typed failure reported by the server in an `ERROR` frame.
    #[error("server error: {0}")]
    Server(ServerError),

    /// A TLS-layer failure.
    #[error("tls error: {0}")]
    Ssl(SslError),

    /// A failure while using the HTTPS metadata client (cloud bundle
    /// resolution).
    #[error("http client error: {0}")]
    Http(HttpError),

    /// A transport-level I/O failure. Wrapped in an `Arc` because
    /// `std::io::Error` is not `Clone`.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    /// No host in the query plan could serve the request; carries the last
    /// per-host error observed, if any.
    #[error("no hosts available to serve the request: {message}")]
    NoHostsAvailable {
        /// A human-readable summary of why each attempted host failed.
        message: String,
    },

    /// The request's deadline elapsed before a response was received.
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// The request was explicitly cancelled by the caller.
    #[error("request canceled")]
    Canceled,
}

/// Errors raised internally by the driver rather than reported by a server.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum LibraryError {
    /// An invalid combination of configuration options was supplied.
    #[error("bad parameters: {message}")]
    BadParams {
        /// Description of the invalid combination.
        message: String,
    },

    /// An option value or size was invalid.
    #[error("invalid option: {message}")]
    InvalidOption {
        /// Description of the invalid value.
        message: String,
    },

    /// The driver could not initialize a required resource (TLS context,
    /// event loop, ...).
    #[error("unable to initialize: {message}")]
    UnableToInit {
        /// Description of the failure.
        message: String,
    },

    /// A request could not be encoded onto the wire.
    #[error("failed to encode message: {message}")]
    MessageEncode {
        /// Description of the encoding failure.
        message: String,
    },

    /// A connection had no free stream ids to assign to a new request.
    #[error("no available stream ids")]
    NoAvailableStreamIds,

    /// A write enqueued zero bytes (nothing to flush).
    #[error("no data was written")]
    NoDataWritten,

    /// A callback was already attached to a stream id.
    #[error("callback already set for this stream")]
    CallbackAlreadySet,

    /// An index was out of the valid bounds for the collection being
    /// accessed.
    #[error("index out of bounds")]
    IndexOutOfBounds,

    /// The response carried no custom payload, but one was requested.
    #[error("no custom payload present")]
    NoCustomPayload,

    /// The response carried no tracing id, but one was requested.
    #[error("no tracing id present")]
    NoTracingId,

    /// An internal invariant was violated; this indicates a driver bug.
    #[error("internal error: {message}")]
    Internal {
        /// Description of the violated invariant.
        message: String,
    },

    /// A socket write failed at the transport layer outside of a plain I/O
    /// error (e.g. a short write that could not be recovered).
    #[error("write error: {message}")]
    WriteError {
        /// Description of the write failure.
        message: String,
    },
}

/// A typed failure reported by the server in an `ERROR` response body, one
/// variant per CQL error code.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum ServerError {
    /// Generic server-side failure.
    #[error("server error ({code:#x}): {message}")]
    ServerError {
        /// The raw CQL error code.
        code: i32,
        /// The server-supplied message.
        message: String,
    },

    /// The coordinator is overloaded.
    #[error("overloaded: {message}")]
    Overloaded {
        /// The server-supplied message.
        message: String,
    },

    /// The coordinator is bootstrapping and cannot serve the request.
    #[error("is bootstrapping: {message}")]
    IsBootstrapping {
        /// The server-supplied message.
        message: String,
    },

    /// An internal truncation error occurred on the server.
    #[error("truncate error: {message}")]
    TruncateError {
        /// The server-supplied message.
        message: String,
    },

    /// A write request failed to reach the required consistency level.
    #[error("write timeout: {message}")]
    WriteTimeout {
        /// The server-supplied message.
        message: String,
        /// The consistency level the request was issued at.
        consistency: Consistency,
        /// The number of replicas that acknowledged the write.
        received: i32,
        /// The number of replicas required at this consistency level.
        required: i32,
        /// The kind of write that timed out (`SIMPLE`, `BATCH`, ...).
        write_type: String,
    },

    /// A read request failed to reach the required consistency level.
    #[error("read timeout: {message}")]
    ReadTimeout {
        /// The server-supplied message.
        message: String,
        /// The consistency level the request was issued at.
        consistency: Consistency,
        /// The number of replicas that responded.
        received: i32,
        /// The number of replicas required at this consistency level.
        required: i32,
        /// Whether the data value was among the replies.
        data_present: bool,
    },

    /// A read or write request failed on a subset of the contacted replicas.
    #[error("read/write failure: {message}")]
    ReadWriteFailure {
        /// The server-supplied message.
        message: String,
        /// The consistency level the request was issued at.
        consistency: Consistency,
        /// The number of replicas that responded.
        received: i32,
        /// The number of replicas required at this consistency level.
        required: i32,
        /// The number of replicas that replied with a failure.
        failures: i32,
    },

    /// The request referenced a function that threw during execution.
    #[error("function failure: {message}")]
    FunctionFailure {
        /// The server-supplied message.
        message: String,
        /// The keyspace the function belongs to.
        keyspace: String,
        /// The function name.
        function: String,
        /// The declared argument types of the function.
        arg_types: Vec<String>,
    },

    /// A lightweight-transaction write conflicted with another in-flight
    /// write.
    #[error("cas write unknown: {message}")]
    CasWriteUnknown {
        /// The server-supplied message.
        message: String,
        /// The consistency level the request was issued at.
        consistency: Consistency,
        /// The number of replicas that acknowledged the write.
        received: i32,
        /// The number of replicas required at this consistency level.
        required: i32,
    },

    /// The submitted CQL could not be parsed.
    #[error("syntax error: {message}")]
    SyntaxError {
        /// The server-supplied message.
        message: String,
    },

    /// The client is not authorized to perform the request.
    #[error("unauthorized: {message}")]
    Unauthorized {
        /// The server-supplied message.
        message: String,
    },

    /// The request is invalid for reasons that do not fit another error
    /// code (e.g. bad consistency level for the statement kind).
    #[error("invalid request: {message}")]
    Invalid {
        /// The server-supplied message.
        message: String,
    },

    /// The referenced keyspace does not exist.
    #[error("config error: {message}")]
    ConfigError {
        /// The server-supplied message.
        message: String,
    },

    /// The referenced keyspace, table, or other schema object does not
    /// exist.
    #[error("already exists: keyspace={keyspace}, table={table:?}")]
    AlreadyExists {
        /// The server-supplied message.
        message: String,
        /// The keyspace already in existence.
        keyspace: String,
        /// The table already in existence, if any.
        table: Option<String>,
    },

    /// The client attempted to `EXECUTE` a prepared statement the
    /// coordinator does not recognize; this is handled transparently by the
    /// execution engine's re-prepare logic and is normally never observed by
    /// user code.
    #[error("unprepared: {message}")]
    Unprepared {
        /// The server-supplied message.
        message: String,
        /// The prepared statement id the server failed to recognize.
        id: Vec<u8>,
    },

    /// Authentication failed (bad credentials, unsupported mechanism, ...).
    #[error("authentication error: {message}")]
    AuthenticationError {
        /// The server-supplied or locally-synthesized message.
        message: String,
    },

    /// The negotiated protocol version is not supported by this connection.
    #[error("protocol error: {message}")]
    ProtocolError {
        /// The server-supplied message.
        message: String,
    },
}

/// TLS-layer errors.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum SslError {
    /// The peer did not present a certificate.
    #[error("no peer certificate presented")]
    NoPeerCert,

    /// The peer's certificate could not be validated against the configured
    /// trust anchors.
    #[error("invalid peer certificate: {message}")]
    InvalidPeerCert {
        /// Description of the validation failure.
        message: String,
    },

    /// The peer's certificate was valid but did not match the expected
    /// hostname or SNI name.
    #[error("peer certificate identity does not match: expected {expected}")]
    IdentityMismatch {
        /// The hostname or SNI name that was expected.
        expected: String,
    },

    /// The TLS session was closed unexpectedly.
    #[error("tls session closed")]
    Closed,

    /// A TLS protocol violation occurred.
    #[error("tls protocol error: {message}")]
    ProtocolError {
        /// Description of the violation.
        message: String,
    },

    /// The configured certificate could not be parsed.
    #[error("invalid certificate: {message}")]
    InvalidCert {
        /// Description of the parsing failure.
        message: String,
    },

    /// The configured private key could not be parsed.
    #[error("invalid private key: {message}")]
    InvalidPrivateKey {
        /// Description of the parsing failure.
        message: String,
    },
}

/// Errors from the HTTPS metadata client used by the cloud bundle resolver.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum HttpError {
    /// The request was canceled before completing.
    #[error("http request canceled")]
    Canceled,

    /// A socket-level failure occurred while issuing the request.
    #[error("http socket error: {message}")]
    Socket {
        /// Description of the failure.
        message: String,
    },

    /// The response body could not be parsed as the expected JSON shape.
    #[error("failed to parse http response: {message}")]
    Parsing {
        /// Description of the parsing failure.
        message: String,
    },

    /// The server responded with a non-2xx status.
    #[error("http status {status}: {message}")]
    HttpStatus {
        /// The HTTP status code.
        status: u16,
        /// The server-supplied `message` field, when present, or a generic
        /// description otherwise.
        message: String,
    },

    /// The request's deadline elapsed.
    #[error("http request timed out")]
    Timeout,

    /// The connection was closed before a complete response was received.
    #[error("http connection closed")]
    Closed,

    /// The metadata service reported a `version` field this driver does not
    /// understand. The resolver fails closed rather than guessing at an
    /// unknown response shape.
    #[error("unsupported cloud metadata version: {version}")]
    UnsupportedMetadataVersion {
        /// The `version` field reported by the metadata service.
        version: i64,
    },
}
