//! The MeridianDB schema object model.
//!
//! Schemas are values: every mutation produces a new [`SchemaSnapshot`],
//! never updates one in place. Snapshots are backed by persistent maps, so
//! cloning one (which the compiler does on every transaction frame) is a
//! pointer copy.

pub mod delta;
pub mod diff;
pub mod error;
pub mod ids;
pub mod name;
pub mod object;
pub mod reflection;
pub mod snapshot;
pub mod stdlib;

pub use delta::{CommandAnnotations, Delta, DeltaCommand, DeltaGuidance, DeltaOp};
pub use error::SchemaError;
pub use name::QualName;
pub use object::{
    Metaclass, Migration, ObjectData, ObjectType, Pointer, PointerKind, Role, ScalarType,
    SchemaObject,
};
pub use snapshot::{SchemaSnapshot, SchemaView};

pub type Result<T> = std::result::Result<T, SchemaError>;
