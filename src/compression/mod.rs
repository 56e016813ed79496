//! Frame-body compression negotiated during `STARTUP`.
//!
//! The wire protocol names two algorithms, `lz4` and `snappy`. This core
//! ships a body compressor for `lz4` only; `snappy` is a recognized name
//! that is simply never offered in the `STARTUP` options, so a server that
//! only supports it falls back to uncompressed frames.

use bytes::Bytes;

use crate::error::{Error, ErrorKind, LibraryError, Result};

/// An algorithm name as it appears in the `COMPRESSION` startup option and
/// `SUPPORTED` response.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum Algorithm {
    /// `lz4`, framed per the original driver's convention: a 4-byte
    /// big-endian uncompressed-length prefix followed by the LZ4 block.
    Lz4,
}

impl Algorithm {
    /// The option value sent in `STARTUP`'s `COMPRESSION` field.
    pub fn option_name(self) -> &'static str {
        match self {
            Algorithm::Lz4 => "lz4",
        }
    }

    /// Parses an algorithm name offered by the server in `SUPPORTED`.
    /// Returns `None` for unrecognized or unsupported names (including
    /// `snappy`), which the caller treats as "do not negotiate
    /// compression".
    pub fn from_option_name(name: &str) -> Option<Self> {
        match name {
            "lz4" => Some(Algorithm::Lz4),
            _ => None,
        }
    }
}

/// Compresses a frame body for an established [`Algorithm`].
#[cfg(feature = "lz4-compression")]
pub fn compress(algorithm: Algorithm, body: &[u8]) -> Result<Bytes> {
    match algorithm {
        Algorithm::Lz4 => {
            let compressed = lz4_flex::block::compress(body);
            let mut framed = Vec::with_capacity(4 + compressed.len());
            framed.extend_from_slice(&(body.len() as u32).to_be_bytes());
            framed.extend_from_slice(&compressed);
            Ok(Bytes::from(framed))
        }
    }
}

/// Decompresses a frame body compressed with [`compress`].
#[cfg(feature = "lz4-compression")]
pub fn decompress(algorithm: Algorithm, body: &[u8]) -> Result<Bytes> {
    match algorithm {
        Algorithm::Lz4 => {
            if body.len() < 4 {
                return Err(decompression_error("lz4 frame body missing length prefix"));
            }
            let mut len_bytes = [0u8; 4];
            len_bytes.copy_from_slice(&body[..4]);
            let uncompressed_len = u32::from_be_bytes(len_bytes) as usize;
            let decompressed = lz4_flex::block::decompress(&body[4..], uncompressed_len)
                .map_err(|e| decompression_error(format!("lz4 decompression failed: {e}")))?;
            Ok(Bytes::from(decompressed))
        }
    }
}

#[cfg(not(feature = "lz4-compression"))]
pub fn compress(_algorithm: Algorithm, _body: &[u8]) -> Result<Bytes> {
    Err(decompression_error(
        "lz4 compression requested but the lz4-compression feature is disabled",
    ))
}

#[cfg(not(feature = "lz4-compression"))]
pub fn decompress(_algorithm: Algorithm, _body: &[u8]) -> Result<Bytes> {
    Err(decompression_error(
        "lz4 decompression requested but the lz4-compression feature is disabled",
    ))
}

fn decompression_error(message: impl Into<String>) -> Error {
    ErrorKind::Library(LibraryError::MessageEncode {
        message: message.into(),
    })
    .into()
}

#[cfg(all(test, feature = "lz4-compression"))]
mod tests {
    use super::*;

    #[test]
    fn lz4_round_trips() {
        let original = b"the quick brown fox jumps over the lazy dog".repeat(8);
        let compressed = compress(Algorithm::Lz4, &original).unwrap();
        let decompressed = decompress(Algorithm::Lz4, &compressed).unwrap();
        assert_eq!(decompressed.as_ref(), original.as_slice());
    }

    #[test]
    fn unsupported_algorithm_name_is_not_recognized() {
        assert_eq!(Algorithm::from_option_name("snappy"), None);
        assert_eq!(Algorithm::from_option_name("lz4"), Some(Algorithm::Lz4));
    }
}
