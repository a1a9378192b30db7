//! Canonical schema deltas.
//!
//! A [`Delta`] is the adapter-friendly representation of a schema mutation:
//! an ordered list of create/alter/delete commands over named objects. It is
//! what the DDL compiler builds from DDL statements and what [`crate::diff`]
//! produces from two snapshots.

use std::collections::BTreeSet;
use std::sync::Arc;

use crate::error::SchemaError;
use crate::name::QualName;
use crate::object::{Metaclass, SchemaObject};
use crate::snapshot::SchemaSnapshot;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeltaOp {
    Create,
    Alter,
    Delete,
}

impl DeltaOp {
    pub fn verb(&self) -> &'static str {
        match self {
            DeltaOp::Create => "CREATE",
            DeltaOp::Alter => "ALTER",
            DeltaOp::Delete => "DROP",
        }
    }
}

/// Annotations attached to commands of a prompt-generating diff. They feed
/// the `proposed` block of DESCRIBE CURRENT MIGRATION AS JSON.
#[derive(Debug, Clone, PartialEq)]
pub struct CommandAnnotations {
    pub confidence: f64,
    pub user_prompt: String,
    pub op_id: String,
    pub data_safe: bool,
    /// `(placeholder, prompt)` pairs the user must fill in.
    pub required_user_input: Vec<(String, String)>,
}

#[derive(Debug, Clone)]
pub struct DeltaCommand {
    pub op: DeltaOp,
    pub metaclass: Metaclass,
    pub classname: QualName,
    /// Rename target, only on Alter.
    pub new_name: Option<QualName>,
    /// The object post-state, for Create and payload-changing Alter.
    pub object: Option<Arc<SchemaObject>>,
    pub annotations: Option<CommandAnnotations>,
}

impl DeltaCommand {
    pub fn create(object: Arc<SchemaObject>) -> Self {
        Self {
            op: DeltaOp::Create,
            metaclass: object.metaclass(),
            classname: object.name.clone(),
            new_name: None,
            object: Some(object),
            annotations: None,
        }
    }

    pub fn delete(metaclass: Metaclass, classname: QualName) -> Self {
        Self {
            op: DeltaOp::Delete,
            metaclass,
            classname,
            new_name: None,
            object: None,
            annotations: None,
        }
    }

    pub fn alter(metaclass: Metaclass, classname: QualName, object: Option<Arc<SchemaObject>>) -> Self {
        Self {
            op: DeltaOp::Alter,
            metaclass,
            classname,
            new_name: None,
            object,
            annotations: None,
        }
    }

    pub fn is_data_safe(&self) -> bool {
        self.annotations.as_ref().map(|a| a.data_safe).unwrap_or(self.op != DeltaOp::Delete)
    }
}

/// Bans accumulated by ALTER CURRENT MIGRATION REJECT PROPOSED. The diff
/// consults these to avoid re-proposing rejected steps.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeltaGuidance {
    pub banned_creations: BTreeSet<(Metaclass, QualName)>,
    /// `(metaclass, (classname, rename_target))`.
    pub banned_alters: BTreeSet<(Metaclass, (QualName, Option<QualName>))>,
    pub banned_deletions: BTreeSet<(Metaclass, QualName)>,
}

impl DeltaGuidance {
    pub fn is_empty(&self) -> bool {
        self.banned_creations.is_empty()
            && self.banned_alters.is_empty()
            && self.banned_deletions.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct Delta {
    pub commands: Vec<DeltaCommand>,
}

impl Delta {
    pub fn new(commands: Vec<DeltaCommand>) -> Self {
        Self { commands }
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    pub fn top_command(&self) -> Option<&DeltaCommand> {
        self.commands.first()
    }

    /// Fold the commands into `snapshot`. Fails atomically: the caller's
    /// snapshot is unaffected on error since snapshots are values.
    pub(crate) fn apply_to(&self, snapshot: SchemaSnapshot) -> Result<SchemaSnapshot> {
        let mut s = snapshot;
        for cmd in &self.commands {
            s = match cmd.op {
                DeltaOp::Create => {
                    let obj = cmd.object.as_deref().ok_or_else(|| SchemaError::BadCommand {
                        op: "CREATE",
                        name: cmd.classname.clone(),
                        reason: "create command carries no object".into(),
                    })?;
                    s.inserted(obj.clone())?
                }
                DeltaOp::Alter => {
                    let mut next = s;
                    if let Some(new_name) = &cmd.new_name {
                        next = next.renamed(&cmd.classname, new_name.clone())?;
                    }
                    if let Some(obj) = cmd.object.as_deref() {
                        next = next.replaced(obj.clone())?;
                    }
                    next
                }
                DeltaOp::Delete => s.removed(&cmd.classname)?,
            };
        }
        Ok(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectData, ObjectType};
    use uuid::Uuid;

    fn obj(name: &str) -> SchemaObject {
        SchemaObject::new(
            Uuid::new_v4(),
            name.parse().unwrap(),
            ObjectData::ObjectType(ObjectType::default()),
        )
    }

    #[test]
    fn apply_is_atomic_in_effect() {
        let base = SchemaSnapshot::new().inserted(obj("default::A")).unwrap();
        let bad = Delta::new(vec![
            DeltaCommand::create(Arc::new(obj("default::B"))),
            // Fails: already exists.
            DeltaCommand::create(Arc::new(obj("default::A"))),
        ]);
        assert!(base.apply(&bad).is_err());
        // The input snapshot never observed the partial application.
        assert_eq!(base.len(), 1);
    }

    #[test]
    fn rename_then_replace_in_one_alter() {
        let a = obj("default::A");
        let base = SchemaSnapshot::new().inserted(a.clone()).unwrap();
        let mut cmd = DeltaCommand::alter(Metaclass::ObjectType, a.name.clone(), None);
        cmd.new_name = Some("default::B".parse().unwrap());
        let out = base.apply(&Delta::new(vec![cmd])).unwrap();
        assert!(out.get_by_name(&"default::B".parse().unwrap()).is_some());
        assert!(out.get_by_name(&a.name).is_none());
    }
}
