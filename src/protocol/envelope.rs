//! Primitive wire encodings shared by every request/response body:
//! `[string]`, `[long string]`, `[bytes]`, `[short bytes]`, `[string map]`,
//! `[string multimap]`, `[inet]`, and `[uuid]`, as specified in the wire
//! protocol byte encodings table.

use std::{
    collections::HashMap,
    net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr},
};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, LibraryError, Result};

fn encode_error(message: impl Into<String>) -> Error {
    ErrorKind::Library(LibraryError::MessageEncode {
        message: message.into(),
    })
    .into()
}

fn decode_error(message: impl Into<String>) -> Error {
    ErrorKind::Server(crate::error::ServerError::ProtocolError {
        message: message.into(),
    })
    .into()
}

/// Writes a `[string]`: a `u16` length followed by UTF-8 bytes.
pub(crate) fn put_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len: u16 = value
        .len()
        .try_into()
        .map_err(|_| encode_error("string too long for [string] encoding"))?;
    buf.put_u16(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Reads a `[string]`.
pub(crate) fn get_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 2 {
        return Err(decode_error("truncated [string] length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(decode_error("truncated [string] body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| decode_error(format!("invalid utf-8: {e}")))
}

/// Writes a `[long string]`: an `i32` length followed by UTF-8 bytes.
pub(crate) fn put_long_string(buf: &mut BytesMut, value: &str) -> Result<()> {
    let len: i32 = value
        .len()
        .try_into()
        .map_err(|_| encode_error("string too long for [long string] encoding"))?;
    buf.put_i32(len);
    buf.put_slice(value.as_bytes());
    Ok(())
}

/// Reads a `[long string]`.
pub(crate) fn get_long_string(buf: &mut Bytes) -> Result<String> {
    if buf.remaining() < 4 {
        return Err(decode_error("truncated [long string] length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Err(decode_error("[long string] length is negative"));
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(decode_error("truncated [long string] body"));
    }
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec()).map_err(|e| decode_error(format!("invalid utf-8: {e}")))
}

/// Writes a `[bytes]`: an `i32` length (negative denotes null) followed by
/// raw bytes.
pub(crate) fn put_bytes(buf: &mut BytesMut, value: Option<&[u8]>) -> Result<()> {
    match value {
        None => buf.put_i32(-1),
        Some(bytes) => {
            let len: i32 = bytes
                .len()
                .try_into()
                .map_err(|_| encode_error("value too long for [bytes] encoding"))?;
            buf.put_i32(len);
            buf.put_slice(bytes);
        }
    }
    Ok(())
}

/// Reads a `[bytes]`, returning `None` for the null sentinel.
pub(crate) fn get_bytes(buf: &mut Bytes) -> Result<Option<Bytes>> {
    if buf.remaining() < 4 {
        return Err(decode_error("truncated [bytes] length"));
    }
    let len = buf.get_i32();
    if len < 0 {
        return Ok(None);
    }
    let len = len as usize;
    if buf.remaining() < len {
        return Err(decode_error("truncated [bytes] body"));
    }
    Ok(Some(buf.split_to(len)))
}

/// Writes a `[short bytes]`: a `u16` length followed by raw bytes.
pub(crate) fn put_short_bytes(buf: &mut BytesMut, value: &[u8]) -> Result<()> {
    let len: u16 = value
        .len()
        .try_into()
        .map_err(|_| encode_error("value too long for [short bytes] encoding"))?;
    buf.put_u16(len);
    buf.put_slice(value);
    Ok(())
}

/// Reads a `[short bytes]`.
pub(crate) fn get_short_bytes(buf: &mut Bytes) -> Result<Bytes> {
    if buf.remaining() < 2 {
        return Err(decode_error("truncated [short bytes] length"));
    }
    let len = buf.get_u16() as usize;
    if buf.remaining() < len {
        return Err(decode_error("truncated [short bytes] body"));
    }
    Ok(buf.split_to(len))
}

/// Writes a `[string map]`: a `u16` count followed by `[string][string]`
/// pairs.
pub(crate) fn put_string_map(buf: &mut BytesMut, map: &HashMap<String, String>) -> Result<()> {
    let count: u16 = map
        .len()
        .try_into()
        .map_err(|_| encode_error("too many entries for [string map] encoding"))?;
    buf.put_u16(count);
    for (key, value) in map {
        put_string(buf, key)?;
        put_string(buf, value)?;
    }
    Ok(())
}

/// Reads a `[string map]`.
pub(crate) fn get_string_map(buf: &mut Bytes) -> Result<HashMap<String, String>> {
    if buf.remaining() < 2 {
        return Err(decode_error("truncated [string map] count"));
    }
    let count = buf.get_u16();
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = get_string(buf)?;
        let value = get_string(buf)?;
        map.insert(key, value);
    }
    Ok(map)
}

/// Reads a `[string multimap]`: a `u16` count followed by
/// `[string][string list]` pairs.
pub(crate) fn get_string_multimap(buf: &mut Bytes) -> Result<HashMap<String, Vec<String>>> {
    if buf.remaining() < 2 {
        return Err(decode_error("truncated [string multimap] count"));
    }
    let count = buf.get_u16();
    let mut map = HashMap::with_capacity(count as usize);
    for _ in 0..count {
        let key = get_string(buf)?;
        if buf.remaining() < 2 {
            return Err(decode_error("truncated [string list] count"));
        }
        let list_count = buf.get_u16();
        let mut values = Vec::with_capacity(list_count as usize);
        for _ in 0..list_count {
            values.push(get_string(buf)?);
        }
        map.insert(key, values);
    }
    Ok(map)
}

/// Writes an `[inet]`: a `u8` address length, the raw address bytes, then an
/// `i32` port.
pub(crate) fn put_inet(buf: &mut BytesMut, addr: SocketAddr) -> Result<()> {
    match addr.ip() {
        IpAddr::V4(v4) => {
            buf.put_u8(4);
            buf.put_slice(&v4.octets());
        }
        IpAddr::V6(v6) => {
            buf.put_u8(16);
            buf.put_slice(&v6.octets());
        }
    }
    buf.put_i32(addr.port() as i32);
    Ok(())
}

/// Reads an `[inet]`.
pub(crate) fn get_inet(buf: &mut Bytes) -> Result<SocketAddr> {
    if buf.remaining() < 1 {
        return Err(decode_error("truncated [inet] length"));
    }
    let len = buf.get_u8() as usize;
    if buf.remaining() < len + 4 {
        return Err(decode_error("truncated [inet] body"));
    }
    let ip = match len {
        4 => {
            let mut octets = [0u8; 4];
            buf.copy_to_slice(&mut octets);
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        16 => {
            let mut octets = [0u8; 16];
            buf.copy_to_slice(&mut octets);
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        other => return Err(decode_error(format!("invalid [inet] address length {other}"))),
    };
    let port = buf.get_i32();
    Ok(SocketAddr::new(ip, port as u16))
}

/// Writes a `[uuid]`: 16 raw bytes.
pub(crate) fn put_uuid(buf: &mut BytesMut, uuid: uuid::Uuid) {
    buf.put_slice(uuid.as_bytes());
}

/// Reads a `[uuid]`.
pub(crate) fn get_uuid(buf: &mut Bytes) -> Result<uuid::Uuid> {
    if buf.remaining() < 16 {
        return Err(decode_error("truncated [uuid]"));
    }
    let mut octets = [0u8; 16];
    buf.copy_to_slice(&mut octets);
    Ok(uuid::Uuid::from_bytes(octets))
}

/// Writes a `[string list]`: a `u16` count followed by `[string]`s.
pub(crate) fn put_string_list(buf: &mut BytesMut, values: &[String]) -> Result<()> {
    let count: u16 = values
        .len()
        .try_into()
        .map_err(|_| encode_error("too many entries for [string list] encoding"))?;
    buf.put_u16(count);
    for value in values {
        put_string(buf, value)?;
    }
    Ok(())
}

/// Reads a `[string list]`.
pub(crate) fn get_string_list(buf: &mut Bytes) -> Result<Vec<String>> {
    if buf.remaining() < 2 {
        return Err(decode_error("truncated [string list] count"));
    }
    let count = buf.get_u16();
    let mut values = Vec::with_capacity(count as usize);
    for _ in 0..count {
        values.push(get_string(buf)?);
    }
    Ok(values)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Buf;

    #[test]
    fn string_round_trips() {
        let mut buf = BytesMut::new();
        put_string(&mut buf, "hello world").unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(get_string(&mut frozen).unwrap(), "hello world");
        assert_eq!(frozen.remaining(), 0);
    }

    #[test]
    fn bytes_round_trips_null() {
        let mut buf = BytesMut::new();
        put_bytes(&mut buf, None).unwrap();
        put_bytes(&mut buf, Some(b"abc")).unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(get_bytes(&mut frozen).unwrap(), None);
        assert_eq!(get_bytes(&mut frozen).unwrap().unwrap().as_ref(), b"abc");
    }

    #[test]
    fn inet_round_trips_v4_and_v6() {
        let mut buf = BytesMut::new();
        let v4: SocketAddr = "10.0.0.7:9042".parse().unwrap();
        let v6: SocketAddr = "[::1]:9042".parse().unwrap();
        put_inet(&mut buf, v4).unwrap();
        put_inet(&mut buf, v6).unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(get_inet(&mut frozen).unwrap(), v4);
        assert_eq!(get_inet(&mut frozen).unwrap(), v6);
    }

    #[test]
    fn string_map_round_trips() {
        let mut map = HashMap::new();
        map.insert("CQL_VERSION".to_string(), "3.0.0".to_string());
        let mut buf = BytesMut::new();
        put_string_map(&mut buf, &map).unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(get_string_map(&mut frozen).unwrap(), map);
    }
}
