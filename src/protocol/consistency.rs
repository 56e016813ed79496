//! Consistency levels understood by the native protocol.

use derive_more::Display;

/// A CQL consistency level, encoded on the wire as a big-endian `u16`.
#[derive(Copy, Clone, Debug, Display, Eq, PartialEq, Hash)]
#[non_exhaustive]
pub enum Consistency {
    /// `ANY`
    Any,
    /// `ONE`
    One,
    /// `TWO`
    Two,
    /// `THREE`
    Three,
    /// `QUORUM`
    Quorum,
    /// `ALL`
    All,
    /// `LOCAL_QUORUM`
    LocalQuorum,
    /// `EACH_QUORUM`
    EachQuorum,
    /// `SERIAL`
    Serial,
    /// `LOCAL_SERIAL`
    LocalSerial,
    /// `LOCAL_ONE`
    LocalOne,
}

impl Consistency {
    pub(crate) fn to_wire(self) -> u16 {
        match self {
            Consistency::Any => 0x0000,
            Consistency::One => 0x0001,
            Consistency::Two => 0x0002,
            Consistency::Three => 0x0003,
            Consistency::Quorum => 0x0004,
            Consistency::All => 0x0005,
            Consistency::LocalQuorum => 0x0006,
            Consistency::EachQuorum => 0x0007,
            Consistency::Serial => 0x0008,
            Consistency::LocalSerial => 0x0009,
            Consistency::LocalOne => 0x000a,
        }
    }

    pub(crate) fn from_wire(value: u16) -> Option<Self> {
        Some(match value {
            0x0000 => Consistency::Any,
            0x0001 => Consistency::One,
            0x0002 => Consistency::Two,
            0x0003 => Consistency::Three,
            0x0004 => Consistency::Quorum,
            0x0005 => Consistency::All,
            0x0006 => Consistency::LocalQuorum,
            0x0007 => Consistency::EachQuorum,
            0x0008 => Consistency::Serial,
            0x0009 => Consistency::LocalSerial,
            0x000a => Consistency::LocalOne,
            _ => return None,
        })
    }
}

impl Default for Consistency {
    fn default() -> Self {
        Consistency::LocalOne
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_every_level() {
        let levels = [
            Consistency::Any,
            Consistency::One,
            Consistency::Two,
            Consistency::Three,
            Consistency::Quorum,
            Consistency::All,
            Consistency::LocalQuorum,
            Consistency::EachQuorum,
            Consistency::Serial,
            Consistency::LocalSerial,
            Consistency::LocalOne,
        ];
        for level in levels {
            assert_eq!(Consistency::from_wire(level.to_wire()), Some(level));
        }
    }
}
