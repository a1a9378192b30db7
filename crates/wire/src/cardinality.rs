use crate::buffer::DecodeError;

/// Result-multiplicity codes as they appear on the wire. The byte values
/// are part of the protocol and must never change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Cardinality {
    /// The statement produces no data (config commands, scripts).
    NoResult = 0x6e,
    /// Zero or one.
    AtMostOne = 0x6f,
    /// Exactly one.
    One = 0x41,
    /// Zero or more.
    Many = 0x6d,
    /// One or more.
    AtLeastOne = 0x4d,
}

impl Cardinality {
    pub fn from_u8(val: u8) -> Result<Self, DecodeError> {
        Ok(match val {
            0x6e => Cardinality::NoResult,
            0x6f => Cardinality::AtMostOne,
            0x41 => Cardinality::One,
            0x6d => Cardinality::Many,
            0x4d => Cardinality::AtLeastOne,
            other => return Err(DecodeError::InvalidCardinality(other)),
        })
    }

    pub fn is_single(&self) -> bool {
        matches!(self, Cardinality::One | Cardinality::AtMostOne)
    }

    /// The cardinality of a pointer given its modifiers.
    pub fn from_pointer(required: bool, multi: bool) -> Self {
        match (required, multi) {
            (false, false) => Cardinality::AtMostOne,
            (true, false) => Cardinality::One,
            (false, true) => Cardinality::Many,
            (true, true) => Cardinality::AtLeastOne,
        }
    }
}

/// Protocol version, ordered lexicographically on (major, minor).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProtocolVersion(pub u16, pub u16);

impl ProtocolVersion {
    /// First version where shape elements carry a `u32` flag word plus a
    /// cardinality byte (older layouts used a single flag byte).
    pub const SHAPE_CARDINALITY: ProtocolVersion = ProtocolVersion(0, 11);

    pub const CURRENT: ProtocolVersion = ProtocolVersion(1, 0);

    pub fn has_shape_cardinality(&self) -> bool {
        *self >= Self::SHAPE_CARDINALITY
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_wire_stable() {
        assert_eq!(Cardinality::NoResult as u8, 0x6e);
        assert_eq!(Cardinality::AtMostOne as u8, 0x6f);
        assert_eq!(Cardinality::One as u8, 0x41);
        assert_eq!(Cardinality::Many as u8, 0x6d);
        assert_eq!(Cardinality::AtLeastOne as u8, 0x4d);
    }

    #[test]
    fn version_gate() {
        assert!(!ProtocolVersion(0, 10).has_shape_cardinality());
        assert!(ProtocolVersion(0, 11).has_shape_cardinality());
        assert!(ProtocolVersion::CURRENT.has_shape_cardinality());
    }
}
