//! The standard schema and the reflection schema.
//!
//! Both are process-wide constants, built once and shared read-only across
//! workers. Object ids inside them are fixed (the known type ids) or
//! derived, never random, so every process agrees on them.

use once_cell::sync::Lazy;
use uuid::Uuid;

use crate::ids;
use crate::name::QualName;
use crate::object::{ObjectData, ObjectType, Pointer, PointerKind, ScalarType, SchemaObject};
use crate::snapshot::SchemaSnapshot;

const STD_SCALARS: &[&str] = &[
    "uuid", "str", "bytes", "int16", "int32", "int64", "float32", "float64", "decimal", "bool",
    "datetime", "duration", "json",
];

fn module(name: &str) -> SchemaObject {
    SchemaObject::new(
        ids::stable_type_id(&format!("module\0{name}")),
        QualName::new(name, "__module__"),
        ObjectData::Module,
    )
}

static STD_SCHEMA: Lazy<SchemaSnapshot> = Lazy::new(|| {
    let mut s = SchemaSnapshot::new();
    for m in ["std", "schema", "sys", "cfg"] {
        s = s.inserted(module(m)).expect("std module");
    }
    for name in STD_SCALARS {
        let id = ids::known_type_id(name).expect("known std scalar");
        s = s
            .inserted(SchemaObject::new(
                id,
                QualName::std(name),
                ObjectData::ScalarType(ScalarType::default()),
            ))
            .expect("std scalar");
    }
    s
});

/// The `std` schema layer. Safe to share: snapshots are immutable.
pub fn std_schema() -> &'static SchemaSnapshot {
    &STD_SCHEMA
}

fn reflected_pointer(owner: &str, name: &str, target: Uuid, required: bool) -> Pointer {
    Pointer {
        id: ids::stable_type_id(&format!("ptr\0{owner}\0{name}")),
        name: name.into(),
        kind: PointerKind::Property,
        target,
        required,
        multi: false,
    }
}

static REFLECTION_SCHEMA: Lazy<SchemaSnapshot> = Lazy::new(|| {
    // The shadow schema the reflection fragments compile against: one
    // object type per reflected metaclass, each exposing id/name/data.
    let mut s = std_schema().clone();
    let types = [
        "schema::Module",
        "schema::ScalarType",
        "schema::ObjectType",
        "schema::Global",
        "schema::Migration",
        "sys::Role",
        "sys::Database",
    ];
    for qual in types {
        let name: QualName = qual.parse().expect("reflection type name");
        let mut t = ObjectType::default();
        for ptr in [
            reflected_pointer(qual, "id", ids::UUID_TYPE_ID, true),
            reflected_pointer(qual, "name", ids::STR_TYPE_ID, true),
            reflected_pointer(qual, "data", ids::JSON_TYPE_ID, false),
        ] {
            t.pointers.insert(ptr.name.clone(), ptr);
        }
        s = s
            .inserted(SchemaObject::new(
                ids::stable_type_id(&format!("refl\0{qual}")),
                name,
                ObjectData::ObjectType(t),
            ))
            .expect("reflection type");
    }
    s
});

/// The shadow schema used when compiling reflection fragments.
pub fn reflection_schema() -> &'static SchemaSnapshot {
    &REFLECTION_SCHEMA
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn std_scalars_resolve_with_known_ids() {
        let s = std_schema();
        let uuid_t = s.get_by_name(&QualName::std("uuid")).unwrap();
        assert_eq!(uuid_t.id, ids::UUID_TYPE_ID);
        let str_t = s.get_by_name(&QualName::std("str")).unwrap();
        assert_eq!(str_t.id, ids::STR_TYPE_ID);
    }

    #[test]
    fn reflection_schema_extends_std() {
        let s = reflection_schema();
        assert!(s.get_by_name(&QualName::std("str")).is_some());
        let objtype = s
            .get_by_name(&"schema::ObjectType".parse().unwrap())
            .unwrap();
        assert!(objtype.as_object_type().unwrap().pointer("name").is_some());
    }

    #[test]
    fn builds_are_identical_across_calls() {
        // Fixed ids: two lookups see the same objects.
        let a = std_schema().get_by_name(&QualName::std("json")).unwrap().id;
        let b = std_schema().get_by_name(&QualName::std("json")).unwrap().id;
        assert_eq!(a, b);
    }
}
