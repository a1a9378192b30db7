//! Reflection write fragments.
//!
//! Every delta command has a canonical MQL fragment that records the
//! corresponding change in the schema storage tables. The compiler hashes
//! the fragment text (sha1) and compiles it at most once per connection,
//! wrapping it into a backend helper function; subsequent occurrences only
//! re-bind the arguments. The fragment text must therefore be canonical:
//! same command shape, same text.

use indexmap::IndexMap;
use serde_json::json;

use crate::delta::{Delta, DeltaCommand, DeltaOp};
use crate::object::ObjectData;

#[derive(Debug, Clone, PartialEq)]
pub struct ReflectionFragment {
    /// Canonical MQL text with `<type>$name` parameter placeholders.
    pub mql: String,
    /// Argument values, keyed by parameter name, in placeholder order.
    pub args: IndexMap<String, serde_json::Value>,
}

fn reflection_type(cmd: &DeltaCommand) -> &'static str {
    match cmd.metaclass {
        crate::object::Metaclass::Module => "schema::Module",
        crate::object::Metaclass::ScalarType => "schema::ScalarType",
        crate::object::Metaclass::ObjectType => "schema::ObjectType",
        crate::object::Metaclass::Global => "schema::Global",
        crate::object::Metaclass::Role => "sys::Role",
        crate::object::Metaclass::Database => "sys::Database",
        crate::object::Metaclass::Migration => "schema::Migration",
    }
}

fn object_payload(cmd: &DeltaCommand) -> serde_json::Value {
    match cmd.object.as_deref().map(|o| &o.data) {
        Some(ObjectData::ObjectType(t)) => json!({
            "pointers": t
                .pointers
                .values()
                .map(|p| json!({
                    "name": &*p.name,
                    "kind": if p.is_link() { "link" } else { "property" },
                    "target": p.target.to_string(),
                    "required": p.required,
                    "multi": p.multi,
                }))
                .collect::<Vec<_>>(),
        }),
        Some(ObjectData::ScalarType(s)) => json!({
            "base": s.base.map(|b| b.to_string()),
            "enum_labels": s.enum_labels,
        }),
        Some(ObjectData::Migration(m)) => json!({
            "parent": m.parent.map(|p| p.to_string()),
            "message": m.message,
            "script": m.script,
        }),
        Some(ObjectData::Global(g)) => json!({
            "target": g.target.to_string(),
            "required": g.required,
        }),
        Some(ObjectData::Role(r)) => json!({ "superuser": r.superuser }),
        _ => json!({}),
    }
}

/// Produce the ordered reflection fragments for a delta.
pub fn write_meta(delta: &Delta) -> Vec<ReflectionFragment> {
    delta.commands.iter().map(fragment_for_command).collect()
}

fn fragment_for_command(cmd: &DeltaCommand) -> ReflectionFragment {
    let rtype = reflection_type(cmd);
    let mut args = IndexMap::new();
    let mql = match cmd.op {
        DeltaOp::Create => {
            let obj = cmd.object.as_deref();
            args.insert(
                "id".to_string(),
                json!(obj.map(|o| o.id.to_string()).unwrap_or_default()),
            );
            args.insert("name".to_string(), json!(cmd.classname.to_string()));
            args.insert("data".to_string(), object_payload(cmd));
            format!(
                "INSERT {rtype} {{ id := <uuid>$id, name := <str>$name, data := <json>$data }}"
            )
        }
        DeltaOp::Alter => {
            args.insert("name".to_string(), json!(cmd.classname.to_string()));
            args.insert(
                "new_name".to_string(),
                json!(cmd
                    .new_name
                    .as_ref()
                    .map(|n| n.to_string())
                    .unwrap_or_else(|| cmd.classname.to_string())),
            );
            args.insert("data".to_string(), object_payload(cmd));
            format!(
                "UPDATE {rtype} FILTER .name = <str>$name \
                 SET {{ name := <str>$new_name, data := <json>$data }}"
            )
        }
        DeltaOp::Delete => {
            args.insert("name".to_string(), json!(cmd.classname.to_string()));
            format!("DELETE {rtype} FILTER .name = <str>$name")
        }
    };
    ReflectionFragment { mql, args }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{Metaclass, ObjectType, SchemaObject};
    use std::sync::Arc;
    use uuid::Uuid;

    #[test]
    fn fragment_text_is_canonical_per_shape() {
        let a = SchemaObject::new(
            Uuid::new_v4(),
            "default::A".parse().unwrap(),
            ObjectData::ObjectType(ObjectType::default()),
        );
        let b = SchemaObject::new(
            Uuid::new_v4(),
            "default::B".parse().unwrap(),
            ObjectData::ObjectType(ObjectType::default()),
        );
        let fa = fragment_for_command(&DeltaCommand::create(Arc::new(a)));
        let fb = fragment_for_command(&DeltaCommand::create(Arc::new(b)));
        // Same command shape, same text: only arguments differ.
        assert_eq!(fa.mql, fb.mql);
        assert_ne!(fa.args, fb.args);
    }

    #[test]
    fn delete_fragment_names_only() {
        let f = fragment_for_command(&DeltaCommand::delete(
            Metaclass::ObjectType,
            "default::Gone".parse().unwrap(),
        ));
        assert!(f.mql.starts_with("DELETE schema::ObjectType"));
        assert_eq!(f.args.len(), 1);
    }
}
