//! Schema diffing.
//!
//! `diff(src, tgt)` computes the canonical delta that transforms `src` into
//! `tgt`. The result is deterministic: commands are ordered by (operation,
//! metaclass, name). Renames are detected structurally: a deletion and a
//! creation of the same kind with identical structure collapse into a
//! rename alter, which migration guidance can then ban individually.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;

use itertools::Itertools;

use crate::delta::{CommandAnnotations, Delta, DeltaCommand, DeltaGuidance, DeltaOp};
use crate::name::QualName;
use crate::object::{Metaclass, ObjectData, PointerKind, SchemaObject};
use crate::snapshot::SchemaSnapshot;

/// A canonical description of an object's structure with all ids erased,
/// so that two independently-built schemas compare equal when they agree.
fn structural_signature(obj: &SchemaObject, schema: &SchemaSnapshot) -> String {
    let type_name = |id| {
        schema
            .get_by_id(id)
            .map(|o| o.name.to_string())
            .unwrap_or_else(|| id.to_string())
    };
    let mut sig = String::new();
    match &obj.data {
        ObjectData::Module => sig.push_str("module"),
        ObjectData::ScalarType(s) => {
            write!(sig, "scalar base={:?}", s.base.map(type_name)).unwrap();
            if let Some(labels) = &s.enum_labels {
                write!(sig, " enum={}", labels.iter().join(",")).unwrap();
            }
        }
        ObjectData::ObjectType(t) => {
            sig.push_str("object");
            for (name, ptr) in &t.pointers {
                write!(
                    sig,
                    " {}:{}:{}:{}:{}",
                    name,
                    match ptr.kind {
                        PointerKind::Property => "prop",
                        PointerKind::Link => "link",
                    },
                    type_name(ptr.target),
                    ptr.required,
                    ptr.multi,
                )
                .unwrap();
            }
        }
        ObjectData::Global(g) => {
            write!(sig, "global {}:{}", type_name(g.target), g.required).unwrap()
        }
        ObjectData::Role(r) => write!(sig, "role superuser={}", r.superuser).unwrap(),
        ObjectData::Database => sig.push_str("database"),
        ObjectData::Migration(m) => write!(sig, "migration {}", m.script).unwrap(),
    }
    sig
}

fn annotate(cmd: &mut DeltaCommand, confidence: f64) {
    let prompt = match cmd.op {
        DeltaOp::Create => format!(
            "did you create {} '{}'?",
            cmd.metaclass.display_lower(),
            cmd.classname
        ),
        DeltaOp::Alter => match &cmd.new_name {
            Some(new_name) => format!(
                "did you rename {} '{}' to '{}'?",
                cmd.metaclass.display_lower(),
                cmd.classname,
                new_name
            ),
            None => format!(
                "did you alter {} '{}'?",
                cmd.metaclass.display_lower(),
                cmd.classname
            ),
        },
        DeltaOp::Delete => format!(
            "did you drop {} '{}'?",
            cmd.metaclass.display_lower(),
            cmd.classname
        ),
    };
    let op_id = format!("{} {} {}", cmd.op.verb(), cmd.metaclass, cmd.classname);
    cmd.annotations = Some(CommandAnnotations {
        confidence,
        user_prompt: prompt,
        op_id,
        data_safe: cmd.op != DeltaOp::Delete,
        required_user_input: Vec::new(),
    });
}

/// Compute the delta turning `src` into `tgt`, honoring `guidance` bans.
///
/// `diff(s, s)` is empty for any `s`, and `src.apply(&diff(src, tgt))`
/// reproduces `tgt` up to object ids.
pub fn diff(
    src: &SchemaSnapshot,
    tgt: &SchemaSnapshot,
    guidance: &DeltaGuidance,
    generate_prompts: bool,
) -> Delta {
    // Migrations are history, not state: they never participate in diffs.
    let relevant = |o: &&Arc<SchemaObject>| o.metaclass() != Metaclass::Migration;

    let src_names: BTreeMap<QualName, &Arc<SchemaObject>> = src
        .iter_objects()
        .filter(relevant)
        .map(|o| (o.name.clone(), o))
        .collect();
    let tgt_names: BTreeMap<QualName, &Arc<SchemaObject>> = tgt
        .iter_objects()
        .filter(relevant)
        .map(|o| (o.name.clone(), o))
        .collect();

    let mut created: Vec<&Arc<SchemaObject>> = tgt_names
        .iter()
        .filter(|(name, _)| !src_names.contains_key(*name))
        .map(|(_, o)| *o)
        .collect();
    let mut deleted: Vec<&Arc<SchemaObject>> = src_names
        .iter()
        .filter(|(name, _)| !tgt_names.contains_key(*name))
        .map(|(_, o)| *o)
        .collect();

    let mut commands = Vec::new();

    // Structural rename detection: pair off one deletion with one creation
    // of the same kind and signature.
    let mut rename_pairs = Vec::new();
    deleted.retain(|d| {
        let d_sig = structural_signature(d, src);
        if let Some(pos) = created.iter().position(|c| {
            c.metaclass() == d.metaclass() && structural_signature(c, tgt) == d_sig
        }) {
            let c = created.remove(pos);
            rename_pairs.push((*d, c));
            false
        } else {
            true
        }
    });

    for (old, new) in rename_pairs {
        let key = (old.metaclass(), (old.name.clone(), Some(new.name.clone())));
        if guidance.banned_alters.contains(&key) {
            // Rejected rename: fall back to independent create + delete.
            created.push(new);
            deleted.push(old);
            continue;
        }
        let mut cmd = DeltaCommand::alter(old.metaclass(), old.name.clone(), None);
        cmd.new_name = Some(new.name.clone());
        if generate_prompts {
            annotate(&mut cmd, 0.66);
        }
        commands.push(cmd);
    }

    created.sort_by_key(|o| (o.metaclass(), o.name.clone()));
    deleted.sort_by_key(|o| (o.metaclass(), o.name.clone()));

    for obj in created {
        if guidance
            .banned_creations
            .contains(&(obj.metaclass(), obj.name.clone()))
        {
            continue;
        }
        let mut cmd = DeltaCommand::create(Arc::clone(obj));
        if generate_prompts {
            annotate(&mut cmd, 1.0);
        }
        commands.push(cmd);
    }

    // Same-name structural changes become alters.
    for (name, tgt_obj) in &tgt_names {
        if let Some(src_obj) = src_names.get(name) {
            if structural_signature(src_obj, src) != structural_signature(tgt_obj, tgt) {
                if guidance
                    .banned_alters
                    .contains(&(tgt_obj.metaclass(), (name.clone(), None)))
                {
                    continue;
                }
                let mut cmd = DeltaCommand::alter(
                    tgt_obj.metaclass(),
                    name.clone(),
                    Some(Arc::clone(tgt_obj)),
                );
                if generate_prompts {
                    annotate(&mut cmd, 1.0);
                }
                commands.push(cmd);
            }
        }
    }

    for obj in deleted {
        if guidance
            .banned_deletions
            .contains(&(obj.metaclass(), obj.name.clone()))
        {
            continue;
        }
        let mut cmd = DeltaCommand::delete(obj.metaclass(), obj.name.clone());
        if generate_prompts {
            annotate(&mut cmd, 1.0);
        }
        commands.push(cmd);
    }

    Delta::new(commands)
}

/// Render each command of a delta as canonical DDL text, terminated with a
/// semicolon. Used for migration proposals.
pub fn statements_from_delta(src: &SchemaSnapshot, tgt: &SchemaSnapshot, delta: &Delta) -> Vec<String> {
    delta
        .commands
        .iter()
        .map(|cmd| command_ddl_text(cmd, src, tgt))
        .collect()
}

pub fn command_ddl_text(cmd: &DeltaCommand, src: &SchemaSnapshot, tgt: &SchemaSnapshot) -> String {
    let keyword = match cmd.metaclass {
        Metaclass::Module => "MODULE",
        Metaclass::ScalarType => "SCALAR TYPE",
        Metaclass::ObjectType => "TYPE",
        Metaclass::Global => "GLOBAL",
        Metaclass::Role => "ROLE",
        Metaclass::Database => "DATABASE",
        Metaclass::Migration => "MIGRATION",
    };
    match cmd.op {
        DeltaOp::Create => {
            let obj = cmd.object.as_deref();
            match obj.map(|o| &o.data) {
                Some(ObjectData::ObjectType(t)) if !t.pointers.is_empty() => {
                    let mut body = String::new();
                    for ptr in t.pointers.values() {
                        let target = tgt
                            .get_by_id(ptr.target)
                            .or_else(|| src.get_by_id(ptr.target))
                            .or_else(|| crate::stdlib::std_schema().get_by_id(ptr.target))
                            .map(|o| o.name.to_string())
                            .unwrap_or_else(|| ptr.target.to_string());
                        let _ = writeln!(
                            body,
                            "    CREATE {}{}{} {} -> {};",
                            if ptr.required { "REQUIRED " } else { "" },
                            if ptr.multi { "MULTI " } else { "" },
                            match ptr.kind {
                                PointerKind::Property => "PROPERTY",
                                PointerKind::Link => "LINK",
                            },
                            ptr.name,
                            target,
                        );
                    }
                    format!("CREATE TYPE {} {{\n{}}};", cmd.classname, body)
                }
                Some(ObjectData::ScalarType(s)) => {
                    if let Some(labels) = &s.enum_labels {
                        format!(
                            "CREATE SCALAR TYPE {} EXTENDING enum<{}>;",
                            cmd.classname,
                            labels.iter().join(", ")
                        )
                    } else if let Some(base) = s.base.and_then(|id| {
                        tgt.get_by_id(id)
                            .or_else(|| crate::stdlib::std_schema().get_by_id(id))
                    }) {
                        format!(
                            "CREATE SCALAR TYPE {} EXTENDING {};",
                            cmd.classname, base.name
                        )
                    } else {
                        format!("CREATE SCALAR TYPE {};", cmd.classname)
                    }
                }
                Some(ObjectData::Module) => format!("CREATE MODULE {};", cmd.classname.module),
                _ => format!("CREATE {} {};", keyword, cmd.classname),
            }
        }
        DeltaOp::Alter => match &cmd.new_name {
            Some(new_name) => format!("ALTER {} {} RENAME TO {};", keyword, cmd.classname, new_name),
            None => format!("ALTER {} {};", keyword, cmd.classname),
        },
        DeltaOp::Delete => match cmd.metaclass {
            Metaclass::Module => format!("DROP MODULE {};", cmd.classname.module),
            _ => format!("DROP {} {};", keyword, cmd.classname),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::{ObjectType, Pointer};
    use crate::ids;
    use pretty_assertions::assert_eq;
    use uuid::Uuid;

    fn ty(name: &str, pointers: &[(&str, bool)]) -> SchemaObject {
        let mut t = ObjectType::default();
        for (pname, required) in pointers {
            t.pointers.insert(
                (*pname).into(),
                Pointer {
                    id: Uuid::new_v4(),
                    name: (*pname).into(),
                    kind: PointerKind::Property,
                    target: ids::STR_TYPE_ID,
                    required: *required,
                    multi: false,
                },
            );
        }
        SchemaObject::new(Uuid::new_v4(), name.parse().unwrap(), ObjectData::ObjectType(t))
    }

    fn snap(objs: Vec<SchemaObject>) -> SchemaSnapshot {
        objs.into_iter()
            .fold(SchemaSnapshot::new(), |s, o| s.inserted(o).unwrap())
    }

    #[test]
    fn diff_of_identical_schemas_is_empty() {
        let s = snap(vec![ty("default::User", &[("name", true)])]);
        assert!(diff(&s, &s, &DeltaGuidance::default(), false).is_empty());
    }

    #[test]
    fn create_and_delete_detected() {
        let src = snap(vec![ty("default::Old", &[])]);
        let tgt = snap(vec![ty("default::New", &[("x", false)])]);
        let d = diff(&src, &tgt, &DeltaGuidance::default(), false);
        let ops: Vec<_> = d.commands.iter().map(|c| (c.op, c.classname.to_string())).collect();
        assert_eq!(
            ops,
            vec![
                (DeltaOp::Create, "default::New".to_string()),
                (DeltaOp::Delete, "default::Old".to_string()),
            ]
        );
    }

    #[test]
    fn structural_match_collapses_into_rename() {
        let src = snap(vec![ty("default::User", &[("name", true)])]);
        let tgt = snap(vec![ty("default::Person", &[("name", true)])]);
        let d = diff(&src, &tgt, &DeltaGuidance::default(), true);
        assert_eq!(d.commands.len(), 1);
        let cmd = &d.commands[0];
        assert_eq!(cmd.op, DeltaOp::Alter);
        assert_eq!(cmd.new_name, Some("default::Person".parse().unwrap()));
        assert!(cmd.annotations.as_ref().unwrap().confidence < 1.0);
    }

    #[test]
    fn banned_rename_falls_back_to_create_plus_delete() {
        let src = snap(vec![ty("default::User", &[("name", true)])]);
        let tgt = snap(vec![ty("default::Person", &[("name", true)])]);
        let mut guidance = DeltaGuidance::default();
        guidance.banned_alters.insert((
            Metaclass::ObjectType,
            (
                "default::User".parse().unwrap(),
                Some("default::Person".parse().unwrap()),
            ),
        ));
        let d = diff(&src, &tgt, &guidance, false);
        let ops: Vec<_> = d.commands.iter().map(|c| c.op).collect();
        assert_eq!(ops, vec![DeltaOp::Create, DeltaOp::Delete]);
    }

    #[test]
    fn applying_the_diff_reaches_the_target() {
        let src = snap(vec![ty("default::User", &[("name", true)])]);
        let tgt = snap(vec![
            ty("default::User", &[("name", true), ("email", false)]),
            ty("default::Group", &[]),
        ]);
        let d = diff(&src, &tgt, &DeltaGuidance::default(), false);
        let out = src.apply(&d).unwrap();
        assert!(diff(&out, &tgt, &DeltaGuidance::default(), false).is_empty());
    }
}
