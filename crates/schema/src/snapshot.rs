use std::sync::Arc;

use uuid::Uuid;

use crate::delta::Delta;
use crate::error::SchemaError;
use crate::name::QualName;
use crate::object::{Metaclass, Pointer, SchemaObject};
use crate::Result;

/// An immutable snapshot of one schema layer.
///
/// Backed by persistent maps: `clone` is O(1) and mutating operations
/// return a new snapshot sharing structure with the old one. The compiler
/// relies on this to keep a full snapshot in every transaction frame.
#[derive(Debug, Clone, Default)]
pub struct SchemaSnapshot {
    by_id: im::HashMap<Uuid, Arc<SchemaObject>>,
    by_name: im::HashMap<QualName, Uuid>,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&Arc<SchemaObject>> {
        self.by_id.get(&id)
    }

    pub fn get_by_name(&self, name: &QualName) -> Option<&Arc<SchemaObject>> {
        self.by_name.get(name).and_then(|id| self.by_id.get(id))
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.objects_of_kind(Metaclass::Module)
            .any(|o| &*o.name.module == module)
    }

    /// All objects, in arbitrary order.
    pub fn iter_objects(&self) -> impl Iterator<Item = &Arc<SchemaObject>> {
        self.by_id.values()
    }

    /// All objects of one kind, in deterministic (name) order.
    pub fn objects_of_kind(&self, kind: Metaclass) -> impl Iterator<Item = &Arc<SchemaObject>> {
        let mut objs: Vec<_> = self
            .by_id
            .values()
            .filter(move |o| o.metaclass() == kind)
            .collect();
        objs.sort_by(|a, b| a.name.cmp(&b.name));
        objs.into_iter()
    }

    /// Resolve a pointer of an object type by name.
    pub fn resolve_pointer(&self, type_id: Uuid, pointer: &str) -> Option<&Pointer> {
        self.by_id
            .get(&type_id)
            .and_then(|o| o.as_object_type())
            .and_then(|t| t.pointer(pointer))
    }

    /// The tip of the migration chain: the migration no other migration
    /// names as its parent.
    pub fn last_migration(&self) -> Option<&Arc<SchemaObject>> {
        let parents: std::collections::HashSet<Uuid> = self
            .by_id
            .values()
            .filter_map(|o| o.as_migration())
            .filter_map(|m| m.parent)
            .collect();
        self.objects_of_kind(Metaclass::Migration)
            .find(|o| !parents.contains(&o.id))
    }

    pub fn inserted(&self, object: SchemaObject) -> Result<Self> {
        if self.by_name.contains_key(&object.name) {
            return Err(SchemaError::DuplicateName(object.name));
        }
        let mut next = self.clone();
        next.by_name.insert(object.name.clone(), object.id);
        next.by_id.insert(object.id, Arc::new(object));
        Ok(next)
    }

    pub fn replaced(&self, object: SchemaObject) -> Result<Self> {
        let old = self
            .get_by_name(&object.name)
            .ok_or_else(|| SchemaError::NameNotFound(object.name.clone()))?;
        let old_id = old.id;
        let mut next = self.clone();
        next.by_id.remove(&old_id);
        next.by_name.insert(object.name.clone(), object.id);
        next.by_id.insert(object.id, Arc::new(object));
        Ok(next)
    }

    pub fn renamed(&self, name: &QualName, new_name: QualName) -> Result<Self> {
        let obj = self
            .get_by_name(name)
            .ok_or_else(|| SchemaError::NameNotFound(name.clone()))?;
        if self.by_name.contains_key(&new_name) {
            return Err(SchemaError::DuplicateName(new_name));
        }
        let mut renamed = SchemaObject::clone(obj);
        renamed.name = new_name.clone();
        let mut next = self.clone();
        next.by_name.remove(name);
        next.by_name.insert(new_name, renamed.id);
        next.by_id.insert(renamed.id, Arc::new(renamed));
        Ok(next)
    }

    pub fn removed(&self, name: &QualName) -> Result<Self> {
        let obj = self
            .get_by_name(name)
            .ok_or_else(|| SchemaError::NameNotFound(name.clone()))?;
        let id = obj.id;
        let mut next = self.clone();
        next.by_name.remove(name);
        next.by_id.remove(&id);
        Ok(next)
    }

    /// Apply a canonical delta, producing the post-state snapshot. Pure:
    /// `self` is untouched regardless of success or failure.
    pub fn apply(&self, delta: &Delta) -> Result<Self> {
        delta.apply_to(self.clone())
    }

    /// Diff against `other`, producing the delta that turns `self` into
    /// `other`. See [`crate::diff`].
    pub fn diff(
        &self,
        other: &SchemaSnapshot,
        guidance: &crate::delta::DeltaGuidance,
        generate_prompts: bool,
    ) -> Delta {
        crate::diff::diff(self, other, guidance, generate_prompts)
    }
}

/// The layered schema the compiler works against: `std` (process-wide
/// constant), the per-database user schema, and the per-instance global
/// schema. Lookup order: user, global, std.
#[derive(Debug, Clone)]
pub struct SchemaView {
    pub std: SchemaSnapshot,
    pub user: SchemaSnapshot,
    pub global: SchemaSnapshot,
}

impl SchemaView {
    pub fn new(std: SchemaSnapshot, user: SchemaSnapshot, global: SchemaSnapshot) -> Self {
        Self { std, user, global }
    }

    pub fn get_by_name(&self, name: &QualName) -> Option<&Arc<SchemaObject>> {
        self.user
            .get_by_name(name)
            .or_else(|| self.global.get_by_name(name))
            .or_else(|| self.std.get_by_name(name))
    }

    pub fn get_by_id(&self, id: Uuid) -> Option<&Arc<SchemaObject>> {
        self.user
            .get_by_id(id)
            .or_else(|| self.global.get_by_id(id))
            .or_else(|| self.std.get_by_id(id))
    }

    pub fn has_module(&self, module: &str) -> bool {
        self.user.has_module(module) || self.std.has_module(module)
    }

    pub fn resolve_pointer(&self, type_id: Uuid, pointer: &str) -> Option<&Pointer> {
        self.user
            .resolve_pointer(type_id, pointer)
            .or_else(|| self.global.resolve_pointer(type_id, pointer))
            .or_else(|| self.std.resolve_pointer(type_id, pointer))
    }

    /// Look up a scalar type in `std` by local name.
    pub fn std_scalar(&self, local: &str) -> Option<&Arc<SchemaObject>> {
        self.std.get_by_name(&QualName::std(local))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Migration, ObjectData, ObjectType};

    fn obj(name: &str) -> SchemaObject {
        SchemaObject::new(
            Uuid::new_v4(),
            name.parse().unwrap(),
            ObjectData::ObjectType(ObjectType::default()),
        )
    }

    #[test]
    fn insert_then_lookup() {
        let s = SchemaSnapshot::new().inserted(obj("default::User")).unwrap();
        let name: QualName = "default::User".parse().unwrap();
        assert!(s.get_by_name(&name).is_some());
        assert!(SchemaSnapshot::new().get_by_name(&name).is_none());
    }

    #[test]
    fn snapshots_are_values() {
        let s0 = SchemaSnapshot::new();
        let s1 = s0.inserted(obj("default::User")).unwrap();
        assert_eq!(s0.len(), 0);
        assert_eq!(s1.len(), 1);
    }

    #[test]
    fn duplicate_name_rejected() {
        let s = SchemaSnapshot::new().inserted(obj("default::User")).unwrap();
        assert!(matches!(
            s.inserted(obj("default::User")),
            Err(SchemaError::DuplicateName(_))
        ));
    }

    #[test]
    fn rename_moves_the_name_index() {
        let s = SchemaSnapshot::new().inserted(obj("default::User")).unwrap();
        let old: QualName = "default::User".parse().unwrap();
        let new: QualName = "default::Person".parse().unwrap();
        let s = s.renamed(&old, new.clone()).unwrap();
        assert!(s.get_by_name(&old).is_none());
        assert!(s.get_by_name(&new).is_some());
    }

    #[test]
    fn last_migration_follows_the_chain() {
        let m1 = SchemaObject::new(
            Uuid::new_v4(),
            "__migrations__::m1".parse().unwrap(),
            ObjectData::Migration(Migration {
                parent: None,
                message: None,
                script: String::new(),
            }),
        );
        let m2 = SchemaObject::new(
            Uuid::new_v4(),
            "__migrations__::m2".parse().unwrap(),
            ObjectData::Migration(Migration {
                parent: Some(m1.id),
                message: None,
                script: String::new(),
            }),
        );
        let s = SchemaSnapshot::new()
            .inserted(m1)
            .unwrap()
            .inserted(m2.clone())
            .unwrap();
        assert_eq!(s.last_migration().unwrap().id, m2.id);
    }
}
