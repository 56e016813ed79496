//! The generic value envelope.
//!
//! Per-scalar-type CQL codecs are out of scope for this core; callers are
//! responsible for serializing concrete values into the opaque byte
//! envelope the wire protocol actually carries.

use bytes::Bytes;

use crate::protocol::envelope;

/// A single bound value, as carried in `QUERY`/`EXECUTE`/`BATCH` requests
/// and `ROWS` results: a nullable opaque byte string. This is the only
/// variant the core needs — it never interprets the bytes as a concrete CQL
/// type.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CqlValue(pub Option<Bytes>);

impl CqlValue {
    /// The null value.
    pub const NULL: CqlValue = CqlValue(None);

    /// Wraps already-serialized bytes as a non-null value.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        CqlValue(Some(bytes.into()))
    }

    /// Whether this value is the CQL null.
    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub(crate) fn encode(&self, buf: &mut bytes::BytesMut) -> crate::error::Result<()> {
        envelope::put_bytes(buf, self.0.as_deref())
    }

    pub(crate) fn decode(buf: &mut Bytes) -> crate::error::Result<Self> {
        Ok(CqlValue(envelope::get_bytes(buf)?))
    }
}

/// A routing key extracted from one or more bound values, used to place a
/// request on the token ring without understanding CQL types.
///
/// For a single partition-key column the routing key is simply that
/// column's raw bytes. For a composite partition key, the convention is
/// `[len:u16][bytes][0x00]` repeated for each component, matching the
/// original driver's routing key construction.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct RoutingKey(pub Bytes);

impl RoutingKey {
    /// Builds a routing key from one or more partition-key component
    /// values. A single component is used verbatim; multiple components
    /// are joined using the composite-key convention.
    pub fn from_components(components: &[&[u8]]) -> Self {
        if let [single] = components {
            return RoutingKey(Bytes::copy_from_slice(single));
        }

        let mut buf = bytes::BytesMut::new();
        for component in components {
            let len: u16 = component.len().min(u16::MAX as usize) as u16;
            buf.extend_from_slice(&len.to_be_bytes());
            buf.extend_from_slice(component);
            buf.extend_from_slice(&[0u8]);
        }
        RoutingKey(buf.freeze())
    }

    /// The raw bytes to hash when placing this key on the token ring.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_component_routing_key_is_verbatim() {
        let key = RoutingKey::from_components(&[b"abc"]);
        assert_eq!(key.0.as_ref(), b"abc");
    }

    #[test]
    fn composite_routing_key_uses_length_prefixes() {
        let key = RoutingKey::from_components(&[b"a", b"bc"]);
        assert_eq!(key.0.as_ref(), &[0, 1, b'a', 0, 0, 2, b'b', b'c', 0]);
    }

    #[test]
    fn value_encode_decode_round_trips_null_and_some() {
        let mut buf = bytes::BytesMut::new();
        CqlValue::NULL.encode(&mut buf).unwrap();
        CqlValue::from_bytes(&b"xyz"[..]).encode(&mut buf).unwrap();
        let mut frozen = buf.freeze();
        assert_eq!(CqlValue::decode(&mut frozen).unwrap(), CqlValue::NULL);
        assert_eq!(
            CqlValue::decode(&mut frozen).unwrap(),
            CqlValue::from_bytes(&b"xyz"[..])
        );
    }
}
