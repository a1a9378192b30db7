//! Stable identifiers.
//!
//! Built-in scalar types have ids known to every component that speaks the
//! wire protocol, so they are fixed constants. Composite type ids are
//! derived with UUIDv5 from a canonical string encoding of the type
//! structure; equal structures therefore always get equal ids, across
//! processes and versions.

use uuid::Uuid;

/// Namespace for all derived type ids.
pub const TYPE_ID_NAMESPACE: Uuid = Uuid::from_u128(0x84be_1345_0a19_4e7c_86b7_2c2cb0c6b44e);

/// The null type: "this unit produces no data".
pub const NULL_TYPE_ID: Uuid = Uuid::from_u128(0);

pub const UUID_TYPE_ID: Uuid = Uuid::from_u128(0x100);
pub const STR_TYPE_ID: Uuid = Uuid::from_u128(0x101);
pub const BYTES_TYPE_ID: Uuid = Uuid::from_u128(0x102);
pub const INT16_TYPE_ID: Uuid = Uuid::from_u128(0x103);
pub const INT32_TYPE_ID: Uuid = Uuid::from_u128(0x104);
pub const INT64_TYPE_ID: Uuid = Uuid::from_u128(0x105);
pub const FLOAT32_TYPE_ID: Uuid = Uuid::from_u128(0x106);
pub const FLOAT64_TYPE_ID: Uuid = Uuid::from_u128(0x107);
pub const DECIMAL_TYPE_ID: Uuid = Uuid::from_u128(0x108);
pub const BOOL_TYPE_ID: Uuid = Uuid::from_u128(0x109);
pub const DATETIME_TYPE_ID: Uuid = Uuid::from_u128(0x10a);
pub const DURATION_TYPE_ID: Uuid = Uuid::from_u128(0x10e);
pub const JSON_TYPE_ID: Uuid = Uuid::from_u128(0x10f);

/// The id of the zero-element tuple, the canonical "no inputs" type.
pub const EMPTY_TUPLE_ID: Uuid = Uuid::from_u128(0xff);

/// Derive a stable id from the canonical string encoding of a type.
pub fn stable_type_id(canonical: &str) -> Uuid {
    Uuid::new_v5(&TYPE_ID_NAMESPACE, canonical.as_bytes())
}

/// Derive a stable id from raw bytes (used for parameter shapes, which are
/// identified by their full encoded descriptor).
pub fn stable_type_id_from_bytes(data: &[u8]) -> Uuid {
    Uuid::new_v5(&TYPE_ID_NAMESPACE, data)
}

/// The known id for a `std::` scalar, if it has one.
pub fn known_type_id(name: &str) -> Option<Uuid> {
    Some(match name {
        "uuid" => UUID_TYPE_ID,
        "str" => STR_TYPE_ID,
        "bytes" => BYTES_TYPE_ID,
        "int16" => INT16_TYPE_ID,
        "int32" => INT32_TYPE_ID,
        "int64" => INT64_TYPE_ID,
        "float32" => FLOAT32_TYPE_ID,
        "float64" => FLOAT64_TYPE_ID,
        "decimal" => DECIMAL_TYPE_ID,
        "bool" => BOOL_TYPE_ID,
        "datetime" => DATETIME_TYPE_ID,
        "duration" => DURATION_TYPE_ID,
        "json" => JSON_TYPE_ID,
        _ => return None,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn derivation_is_deterministic() {
        let a = stable_type_id("tuple\0100:101");
        let b = stable_type_id("tuple\0100:101");
        assert_eq!(a, b);
        assert_ne!(a, stable_type_id("tuple\0101:100"));
    }

    #[test]
    fn known_ids_are_distinct() {
        let names = [
            "uuid", "str", "bytes", "int16", "int32", "int64", "float32", "float64", "decimal",
            "bool", "datetime", "duration", "json",
        ];
        let mut seen = std::collections::HashSet::new();
        for n in names {
            assert!(seen.insert(known_type_id(n).unwrap()), "duplicate id for {n}");
        }
    }
}
