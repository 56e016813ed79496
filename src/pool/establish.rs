//! Connection handshake: protocol negotiation, optional authentication,
//! optional `USE <keyspace>`, and optional event registration, performed
//! in that order per the connection lifecycle component design.

use std::collections::HashMap;

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio_util::codec::{FramedRead, FramedWrite};

use super::options::ConnectionOptions;
use crate::{
    compression,
    error::{Error, ErrorKind, Result, ServerError},
    protocol::{
        self, AuthResponseRequest, Consistency, EncodedFrame, Frame, FrameCodec, FrameFlags,
        Opcode, QueryParams, QueryRequest, RegisterRequest, ResultBody, StartupRequest,
    },
    runtime::AsyncStream,
};

/// The framed read/write halves produced by [`handshake`], ready to be
/// handed to [`super::conn::Connection::spawn`].
pub(crate) struct HandshakeIo {
    pub(crate) reader: FramedRead<tokio::io::ReadHalf<AsyncStream>, FrameCodec>,
    pub(crate) writer: FramedWrite<tokio::io::WriteHalf<AsyncStream>, FrameCodec>,
}

async fn write_and_read(
    io: &mut HandshakeIo,
    opcode: Opcode,
    body: bytes::BytesMut,
    compression_algo: Option<compression::Algorithm>,
) -> Result<Frame> {
    let (flags, body) = match compression_algo {
        Some(algo) => (FrameFlags::COMPRESSION, compression::compress(algo, &body)?),
        None => (FrameFlags::empty(), body.freeze()),
    };
    io.writer
        .send(EncodedFrame {
            flags,
            stream_id: 0,
            opcode,
            body,
        })
        .await?;
    io.reader
        .next()
        .await
        .ok_or_else(|| Error::internal("connection closed during handshake"))?
}

fn decompress_if_needed(
    frame: &Frame,
    compression_algo: Option<compression::Algorithm>,
) -> Result<Bytes> {
    if frame.flags.contains(FrameFlags::COMPRESSION) {
        let algo = compression_algo.ok_or_else(|| {
            Error::internal("received compressed frame with no algorithm negotiated")
        })?;
        compression::decompress(algo, &frame.body)
    } else {
        Ok(frame.body.clone().freeze())
    }
}

/// Performs the full connection handshake over an already-connected
/// transport: `STARTUP`, optional `AUTHENTICATE`/`AUTH_RESPONSE`/
/// `AUTH_SUCCESS`, optional `USE <keyspace>`, and optional `REGISTER`.
/// Returns the framed I/O ready for ongoing multiplexed use alongside the
/// compression algorithm actually negotiated (`None` if the connection
/// requested none, or an absent feature made it unavailable).
pub(crate) async fn handshake(
    stream: AsyncStream,
    options: &ConnectionOptions,
) -> Result<(HandshakeIo, Option<compression::Algorithm>)> {
    let (read_half, write_half) = tokio::io::split(stream);
    let mut io = HandshakeIo {
        reader: FramedRead::new(read_half, FrameCodec::new(options.protocol_version)),
        writer: FramedWrite::new(write_half, FrameCodec::new(options.protocol_version)),
    };

    let mut startup_options = HashMap::new();
    startup_options.insert("CQL_VERSION".to_string(), "3.0.0".to_string());
    let negotiated_compression = options.compression.map(|algo| {
        startup_options.insert("COMPRESSION".to_string(), algo.option_name().to_string());
        algo
    });

    let startup_body = StartupRequest {
        options: startup_options,
    }
    .encode()?;
    let response = write_and_read(&mut io, Opcode::Startup, startup_body, None).await?;

    match response.opcode {
        Opcode::Ready => {}
        Opcode::Authenticate => {
            authenticate(&mut io, options).await?;
        }
        Opcode::Error => return Err(decode_frame_error(&response, None)),
        other => {
            return Err(ErrorKind::Server(ServerError::ProtocolError {
                message: format!("unexpected response to STARTUP: {other:?}"),
            })
            .into())
        }
    }

    if let Some(keyspace) = &options.keyspace {
        use_keyspace(&mut io, keyspace, negotiated_compression).await?;
    }

    if !options.register_event_types.is_empty() {
        register_events(&mut io, &options.register_event_types, negotiated_compression).await?;
    }

    Ok((io, negotiated_compression))
}

async fn authenticate(io: &mut HandshakeIo, options: &ConnectionOptions) -> Result<()> {
    let credentials = options.credentials.as_ref().ok_or_else(|| {
        Error::from(ErrorKind::Server(ServerError::AuthenticationError {
            message: "server requires authentication but no credentials were configured".into(),
        }))
    })?;

    let mut token = Vec::with_capacity(credentials.username.len() + credentials.password.len() + 2);
    token.push(0u8);
    token.extend_from_slice(credentials.username.as_bytes());
    token.push(0u8);
    token.extend_from_slice(credentials.password.as_bytes());

    let body = AuthResponseRequest {
        token: Bytes::from(token),
    }
    .encode()?;
    let response = write_and_read(io, Opcode::AuthResponse, body, None).await?;

    match response.opcode {
        Opcode::AuthSuccess => Ok(()),
        Opcode::AuthChallenge => Err(ErrorKind::Server(ServerError::AuthenticationError {
            message: "server issued an AUTH_CHALLENGE but only plain-text authentication is supported".into(),
        })
        .into()),
        Opcode::Error => Err(decode_frame_error(&response, None)),
        other => Err(ErrorKind::Server(ServerError::ProtocolError {
            message: format!("unexpected response to AUTH_RESPONSE: {other:?}"),
        })
        .into()),
    }
}

async fn use_keyspace(
    io: &mut HandshakeIo,
    keyspace: &str,
    compression_algo: Option<compression::Algorithm>,
) -> Result<()> {
    let body = QueryRequest {
        query: format!("USE \"{keyspace}\""),
        params: QueryParams {
            consistency: Consistency::One,
            ..Default::default()
        },
    }
    .encode()?;
    let response = write_and_read(io, Opcode::Query, body, compression_algo).await?;
    match response.opcode {
        Opcode::Result => {
            let mut raw = decompress_if_needed(&response, compression_algo)?;
            ResultBody::decode(&mut raw)?;
            Ok(())
        }
        Opcode::Error => Err(decode_frame_error(&response, compression_algo)),
        other => Err(ErrorKind::Server(ServerError::ProtocolError {
            message: format!("unexpected response to USE: {other:?}"),
        })
        .into()),
    }
}

async fn register_events(
    io: &mut HandshakeIo,
    event_types: &[String],
    compression_algo: Option<compression::Algorithm>,
) -> Result<()> {
    let body = RegisterRequest {
        event_types: event_types.to_vec(),
    }
    .encode()?;
    let response = write_and_read(io, Opcode::Register, body, compression_algo).await?;
    match response.opcode {
        Opcode::Ready => Ok(()),
        Opcode::Error => Err(decode_frame_error(&response, compression_algo)),
        other => Err(ErrorKind::Server(ServerError::ProtocolError {
            message: format!("unexpected response to REGISTER: {other:?}"),
        })
        .into()),
    }
}

fn decode_frame_error(frame: &Frame, compression_algo: Option<compression::Algorithm>) -> Error {
    let mut raw = match decompress_if_needed(frame, compression_algo) {
        Ok(raw) => raw,
        Err(e) => return e,
    };
    match protocol::messages::decode_error_body(&mut raw) {
        Ok(server_error) => ErrorKind::Server(server_error).into(),
        Err(e) => e,
    }
}
