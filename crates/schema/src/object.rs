//! Schema objects.
//!
//! The kinds form a closed set: the compiler dispatches on them with
//! exhaustive matches, so adding a kind is a deliberate, compiler-checked
//! event.

use indexmap::IndexMap;
use strum::Display;
use uuid::Uuid;

use crate::name::QualName;

/// The kind of a schema object. Doubles as the "metaclass" recorded in
/// delta commands and migration guidance.
#[derive(Debug, Display, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Metaclass {
    Module,
    ScalarType,
    ObjectType,
    Global,
    Role,
    Database,
    Migration,
}

impl Metaclass {
    /// Human-readable, for prompts: "object type", "scalar type", ...
    pub fn display_lower(&self) -> &'static str {
        match self {
            Metaclass::Module => "module",
            Metaclass::ScalarType => "scalar type",
            Metaclass::ObjectType => "object type",
            Metaclass::Global => "global",
            Metaclass::Role => "role",
            Metaclass::Database => "database",
            Metaclass::Migration => "migration",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointerKind {
    Property,
    Link,
}

/// A property or link of an object type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pointer {
    pub id: Uuid,
    pub name: Box<str>,
    pub kind: PointerKind,
    /// Id of the target type.
    pub target: Uuid,
    pub required: bool,
    pub multi: bool,
}

impl Pointer {
    pub fn is_link(&self) -> bool {
        self.kind == PointerKind::Link
    }
}

/// Scalar types: either a base scalar (no `base`), a subtype of another
/// scalar, or an enum (labels present, base absent).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScalarType {
    pub base: Option<Uuid>,
    pub enum_labels: Option<Vec<Box<str>>>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectType {
    /// Pointers in declaration order. The order is semantic: shape
    /// descriptors emit fields in this order.
    pub pointers: IndexMap<Box<str>, Pointer>,
}

impl ObjectType {
    pub fn pointer(&self, name: &str) -> Option<&Pointer> {
        self.pointers.get(name)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Migration {
    pub parent: Option<Uuid>,
    pub message: Option<String>,
    /// The canonical DDL text of the migration body.
    pub script: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Role {
    pub superuser: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Global {
    pub target: Uuid,
    pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObjectData {
    Module,
    ScalarType(ScalarType),
    ObjectType(ObjectType),
    Global(Global),
    Role(Role),
    Database,
    Migration(Migration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaObject {
    pub id: Uuid,
    pub name: QualName,
    pub data: ObjectData,
}

impl SchemaObject {
    pub fn new(id: Uuid, name: QualName, data: ObjectData) -> Self {
        Self { id, name, data }
    }

    pub fn metaclass(&self) -> Metaclass {
        match &self.data {
            ObjectData::Module => Metaclass::Module,
            ObjectData::ScalarType(_) => Metaclass::ScalarType,
            ObjectData::ObjectType(_) => Metaclass::ObjectType,
            ObjectData::Global(_) => Metaclass::Global,
            ObjectData::Role(_) => Metaclass::Role,
            ObjectData::Database => Metaclass::Database,
            ObjectData::Migration(_) => Metaclass::Migration,
        }
    }

    pub fn as_object_type(&self) -> Option<&ObjectType> {
        match &self.data {
            ObjectData::ObjectType(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_scalar(&self) -> Option<&ScalarType> {
        match &self.data {
            ObjectData::ScalarType(t) => Some(t),
            _ => None,
        }
    }

    pub fn as_migration(&self) -> Option<&Migration> {
        match &self.data {
            ObjectData::Migration(m) => Some(m),
            _ => None,
        }
    }
}
