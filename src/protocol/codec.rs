//! A [`tokio_util::codec`] [`Decoder`]/[`Encoder`] pair translating between
//! raw socket bytes and complete [`Frame`]s.

use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::frame::Frame;
use crate::error::Result;

/// Maximum frame body size accepted from the server, guarding against a
/// malformed or malicious length field causing an unbounded allocation.
pub const MAX_FRAME_BODY_LEN: usize = 256 * 1024 * 1024;

/// Stateful frame codec for one connection. The stream-id width used to
/// decode headers depends on the protocol version negotiated during
/// `STARTUP`, so the codec is constructed (or updated) once that is known.
#[derive(Debug)]
pub struct FrameCodec {
    protocol_version: u8,
}

impl FrameCodec {
    /// Creates a codec for the given negotiated protocol version.
    pub fn new(protocol_version: u8) -> Self {
        Self { protocol_version }
    }

    /// Updates the protocol version used to decode subsequent frames. Called
    /// once after `STARTUP`/`SUPPORTED` negotiation completes; never valid
    /// to call once any frame has already been decoded at the old width.
    pub fn set_protocol_version(&mut self, version: u8) {
        self.protocol_version = version;
    }
}

/// A frame ready to be written to the socket: header fields plus an
/// already-encoded (and, if applicable, already-compressed) body.
#[derive(Debug)]
pub struct EncodedFrame {
    /// Per-frame flags.
    pub flags: super::frame::FrameFlags,
    /// The stream id to tag this request with.
    pub stream_id: i16,
    /// The request opcode.
    pub opcode: super::frame::Opcode,
    /// The encoded (and possibly compressed) body.
    pub body: Bytes,
}

impl Encoder<EncodedFrame> for FrameCodec {
    type Error = crate::error::Error;

    fn encode(&mut self, item: EncodedFrame, dst: &mut BytesMut) -> Result<()> {
        let encoded = Frame::encode(
            self.protocol_version,
            item.flags,
            item.stream_id,
            item.opcode,
            &item.body,
        )?;
        dst.extend_from_slice(&encoded);
        Ok(())
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = crate::error::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>> {
        let Some((flags, stream_id, opcode, body_len)) =
            Frame::peek_header(src, self.protocol_version)?
        else {
            return Ok(None);
        };

        if body_len > MAX_FRAME_BODY_LEN {
            return Err(crate::error::ErrorKind::Server(
                crate::error::ServerError::ProtocolError {
                    message: format!(
                        "frame body length {body_len} exceeds maximum of {MAX_FRAME_BODY_LEN}"
                    ),
                },
            )
            .into());
        }

        let header_len = Frame::header_len(self.protocol_version);
        let total_len = header_len + body_len;
        if src.len() < total_len {
            src.reserve(total_len - src.len());
            return Ok(None);
        }

        let mut full = src.split_to(total_len);
        full.advance(header_len);

        Ok(Some(Frame {
            protocol_version: self.protocol_version,
            flags,
            stream_id,
            opcode,
            body: full,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::frame::{FrameFlags, Opcode};

    #[test]
    fn decodes_exactly_one_frame_per_call() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        codec
            .encode(
                EncodedFrame {
                    flags: FrameFlags::empty(),
                    stream_id: 3,
                    opcode: Opcode::Query,
                    body: Bytes::from_static(b"abc"),
                },
                &mut buf,
            )
            .unwrap();
        codec
            .encode(
                EncodedFrame {
                    flags: FrameFlags::empty(),
                    stream_id: 4,
                    opcode: Opcode::Query,
                    body: Bytes::from_static(b"defgh"),
                },
                &mut buf,
            )
            .unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(first.stream_id, 3);
        assert_eq!(&first.body[..], b"abc");

        let second = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(second.stream_id, 4);
        assert_eq!(&second.body[..], b"defgh");

        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn incomplete_frame_yields_none() {
        let mut codec = FrameCodec::new(4);
        let mut buf = BytesMut::new();
        codec
            .encode(
                EncodedFrame {
                    flags: FrameFlags::empty(),
                    stream_id: 1,
                    opcode: Opcode::Options,
                    body: Bytes::from_static(b"0123456789"),
                },
                &mut buf,
            )
            .unwrap();
        let mut partial = buf.split_to(buf.len() - 3);
        assert!(codec.decode(&mut partial).unwrap().is_none());
    }
}
