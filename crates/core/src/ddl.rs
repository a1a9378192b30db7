//! The DDL path: canonical deltas from DDL statements, backend DDL
//! generation, and the schema-storage reflection block.

use std::collections::BTreeSet;
use std::sync::Arc;

use sha1::{Digest, Sha1};
use uuid::Uuid;

use meridiandb_schema::reflection::write_meta;
use meridiandb_schema::{
    Delta, DeltaCommand, DeltaOp, Metaclass, Migration, ObjectData, ObjectType, Pointer,
    PointerKind, QualName, Role, ScalarType, SchemaObject, SchemaSnapshot, SchemaView,
};

use crate::compiler::Compiler;
use crate::context::CompileContext;
use crate::dbstate::{CompilerConnectionState, DdlResult, Modaliases};
use crate::enums::{OutputFormat, StatementMode};
use crate::error::{CompilerError, QueryError, Result, Span};
use crate::ir::resolve_name;
use crate::mql::ast::{
    AlterTypeCmd, DdlStatement, PointerDecl, PointerDeclKind, SdlDeclaration, TypeName,
};
use crate::mql::generate_source;
use crate::pg::dbops::{Function, SqlBlock};
use crate::pg::{quote_ident, quote_literal};

/// Pseudo-modules for objects that live outside the user namespace.
const DB_MODULE: &str = "sys::db";
const ROLE_MODULE: &str = "sys::role";
const MIGRATION_MODULE: &str = "__migrations__";

fn query_err(err: impl std::fmt::Display, span: Span) -> CompilerError {
    CompilerError::Query(QueryError::new(err.to_string()).with_span(span))
}

/// Types being created in the same delta, with the pointer kind a
/// reference to them implies.
type SiblingIds = im::HashMap<QualName, (Uuid, PointerKind)>;

fn resolve_pointer_target(
    target: &TypeName,
    schema: &SchemaView,
    sibling_ids: &SiblingIds,
    modaliases: &Modaliases,
    span: Span,
) -> Result<(Uuid, PointerKind)> {
    // Bare scalar names resolve through std.
    if target.element.is_none() {
        if let Some(id) = meridiandb_schema::ids::known_type_id(&target.name) {
            return Ok((id, PointerKind::Property));
        }
    }
    let qual = if target.name.contains("::") {
        target.name.parse::<QualName>().map_err(|e| query_err(e, span))?
    } else {
        resolve_name(&target.name, modaliases, span)?
    };
    if let Some((id, kind)) = sibling_ids.get(&qual) {
        return Ok((*id, *kind));
    }
    let obj = schema
        .get_by_name(&qual)
        .ok_or_else(|| query_err(format!("unknown type {qual}"), span))?;
    let kind = match &obj.data {
        ObjectData::ObjectType(_) => PointerKind::Link,
        ObjectData::ScalarType(_) => PointerKind::Property,
        _ => return Err(query_err(format!("{qual} is not a type"), span)),
    };
    Ok((obj.id, kind))
}

fn build_pointer(
    decl: &PointerDecl,
    schema: &SchemaView,
    sibling_ids: &SiblingIds,
    modaliases: &Modaliases,
    span: Span,
    id: Uuid,
) -> Result<Pointer> {
    let (target, inferred_kind) =
        resolve_pointer_target(&decl.target, schema, sibling_ids, modaliases, span)?;
    let kind = match decl.kind {
        PointerDeclKind::Link => PointerKind::Link,
        PointerDeclKind::Property => inferred_kind,
    };
    Ok(Pointer {
        id,
        name: decl.name.clone().into_boxed_str(),
        kind,
        target,
        required: decl.required,
        multi: decl.multi,
    })
}

/// The pseudo-qualified name under which a pointer's id is pinned by
/// dump/restore: `module::Type.pointer`.
pub(crate) fn pointer_pin_name(owner: &QualName, pointer: &str) -> QualName {
    QualName::new(owner.module.clone(), format!("{}.{pointer}", owner.name))
}

fn object_id_for(
    name: &QualName,
    ctx: &CompileContext,
) -> Uuid {
    ctx.schema_object_ids
        .as_ref()
        .and_then(|ids| ids.get(name).copied())
        .unwrap_or_else(Uuid::new_v4)
}

/// Build a canonical delta from one DDL statement against `schema`.
pub(crate) fn delta_from_ddl(
    stmt: &DdlStatement,
    schema: &SchemaView,
    modaliases: &Modaliases,
    ctx: &CompileContext,
    testmode: bool,
) -> Result<Delta> {
    let span = stmt.span();
    let mut commands = Vec::new();

    let check_not_protected = |qual: &QualName| -> Result<()> {
        if qual.is_std() && !testmode && !ctx.bootstrap_mode && !ctx.internal_schema_mode {
            return Err(query_err(
                format!("cannot modify the standard module ({})", qual.module),
                span,
            ));
        }
        Ok(())
    };

    match stmt {
        DdlStatement::CreateType { name, pointers, .. } => {
            let qual = resolve_name(name, modaliases, span)?;
            check_not_protected(&qual)?;
            let id = object_id_for(&qual, ctx);
            let sibling_ids = SiblingIds::unit(qual.clone(), (id, PointerKind::Link));
            let mut objtype = ObjectType::default();
            for decl in pointers {
                let ptr_id = object_id_for(&pointer_pin_name(&qual, &decl.name), ctx);
                let ptr = build_pointer(decl, schema, &sibling_ids, modaliases, span, ptr_id)?;
                objtype.pointers.insert(ptr.name.clone(), ptr);
            }
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                id,
                qual,
                ObjectData::ObjectType(objtype),
            ))));
        }

        DdlStatement::AlterType {
            name,
            rename_to,
            commands: alter_cmds,
            ..
        } => {
            let qual = resolve_name(name, modaliases, span)?;
            let obj = schema
                .get_by_name(&qual)
                .ok_or_else(|| query_err(format!("unknown type {qual}"), span))?;
            let mut cmd = DeltaCommand::alter(Metaclass::ObjectType, qual.clone(), None);
            if let Some(new_name) = rename_to {
                cmd.new_name = Some(resolve_name(new_name, modaliases, span)?);
            }
            if !alter_cmds.is_empty() {
                let mut objtype = obj
                    .as_object_type()
                    .ok_or_else(|| query_err(format!("{qual} is not an object type"), span))?
                    .clone();
                for alter in alter_cmds {
                    match alter {
                        AlterTypeCmd::CreatePointer(decl) => {
                            if objtype.pointers.contains_key(decl.name.as_str()) {
                                return Err(query_err(
                                    format!("{qual} already has a pointer {:?}", decl.name),
                                    span,
                                ));
                            }
                            let ptr_id =
                                object_id_for(&pointer_pin_name(&qual, &decl.name), ctx);
                            let ptr = build_pointer(
                                decl,
                                schema,
                                &SiblingIds::new(),
                                modaliases,
                                span,
                                ptr_id,
                            )?;
                            objtype.pointers.insert(ptr.name.clone(), ptr);
                        }
                        AlterTypeCmd::DropPointer { name } => {
                            if objtype.pointers.shift_remove(name.as_str()).is_none() {
                                return Err(query_err(
                                    format!("{qual} has no pointer {name:?}"),
                                    span,
                                ));
                            }
                        }
                    }
                }
                let final_name = cmd.new_name.clone().unwrap_or_else(|| qual.clone());
                cmd.object = Some(Arc::new(SchemaObject::new(
                    obj.id,
                    final_name,
                    ObjectData::ObjectType(objtype),
                )));
            }
            commands.push(cmd);
        }

        DdlStatement::DropType { name, .. } => {
            let qual = resolve_name(name, modaliases, span)?;
            commands.push(DeltaCommand::delete(Metaclass::ObjectType, qual));
        }

        DdlStatement::CreateScalarType {
            name,
            extending,
            enum_labels,
            ..
        } => {
            let qual = resolve_name(name, modaliases, span)?;
            let base = match extending {
                Some(target) => {
                    let (id, kind) = resolve_pointer_target(
                        target,
                        schema,
                        &SiblingIds::new(),
                        modaliases,
                        span,
                    )?;
                    if kind != PointerKind::Property {
                        return Err(query_err(
                            format!("scalar type {qual} cannot extend an object type"),
                            span,
                        ));
                    }
                    Some(id)
                }
                None => None,
            };
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                object_id_for(&qual, ctx),
                qual,
                ObjectData::ScalarType(ScalarType {
                    base,
                    enum_labels: enum_labels
                        .as_ref()
                        .map(|labels| labels.iter().map(|l| l.clone().into_boxed_str()).collect()),
                }),
            ))));
        }

        DdlStatement::DropScalarType { name, .. } => {
            let qual = resolve_name(name, modaliases, span)?;
            commands.push(DeltaCommand::delete(Metaclass::ScalarType, qual));
        }

        DdlStatement::CreateModule { name, .. } => {
            let qual = QualName::new(name.clone(), "__module__");
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                object_id_for(&qual, ctx),
                qual,
                ObjectData::Module,
            ))));
        }

        DdlStatement::DropModule { name, .. } => {
            commands.push(DeltaCommand::delete(
                Metaclass::Module,
                QualName::new(name.clone(), "__module__"),
            ));
        }

        DdlStatement::CreateDatabase { name, .. } => {
            let qual = QualName::new(DB_MODULE, name.clone());
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                object_id_for(&qual, ctx),
                qual,
                ObjectData::Database,
            ))));
        }

        DdlStatement::DropDatabase { name, .. } => {
            commands.push(DeltaCommand::delete(
                Metaclass::Database,
                QualName::new(DB_MODULE, name.clone()),
            ));
        }

        DdlStatement::CreateRole {
            name, superuser, ..
        } => {
            let qual = QualName::new(ROLE_MODULE, name.clone());
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                object_id_for(&qual, ctx),
                qual,
                ObjectData::Role(Role {
                    superuser: *superuser,
                }),
            ))));
        }

        DdlStatement::DropRole { name, .. } => {
            commands.push(DeltaCommand::delete(
                Metaclass::Role,
                QualName::new(ROLE_MODULE, name.clone()),
            ));
        }

        DdlStatement::CreateMigration {
            name,
            parent,
            body,
            ..
        } => {
            // Body commands build against the evolving schema so that
            // later statements can reference earlier ones.
            let mut scratch_user = schema.user.clone();
            for sub in body {
                let view =
                    SchemaView::new(schema.std.clone(), scratch_user.clone(), schema.global.clone());
                let sub_delta = delta_from_ddl(sub, &view, modaliases, ctx, testmode)?;
                let (user_delta, _) = split_delta(&sub_delta);
                scratch_user = scratch_user
                    .apply(&user_delta)
                    .map_err(|e| query_err(e, span))?;
                commands.extend(sub_delta.commands);
            }

            let parent_id = match parent {
                Some(parent_name) => {
                    let qual = QualName::new(MIGRATION_MODULE, parent_name.clone());
                    Some(
                        schema
                            .user
                            .get_by_name(&qual)
                            .ok_or_else(|| {
                                query_err(format!("unknown migration {parent_name:?}"), span)
                            })?
                            .id,
                    )
                }
                None => schema.user.last_migration().map(|m| m.id),
            };
            let script = body
                .iter()
                .map(|cmd| generate_source(cmd) + ";")
                .collect::<Vec<_>>()
                .join("\n");
            let mig_name = name.clone().unwrap_or_else(|| {
                // Content-addressed: body plus parent, so an identical
                // body on a new parent still gets a fresh name.
                let mut hasher = Sha1::new();
                hasher.update(script.as_bytes());
                if let Some(parent_id) = parent_id {
                    hasher.update(parent_id.as_bytes());
                }
                format!("m1{}", hex::encode(&hasher.finalize()[..10]))
            });
            let qual = QualName::new(MIGRATION_MODULE, mig_name);
            commands.push(DeltaCommand::create(Arc::new(SchemaObject::new(
                object_id_for(&qual, ctx),
                qual,
                ObjectData::Migration(Migration {
                    parent: parent_id,
                    message: None,
                    script,
                }),
            ))));
        }
    }

    Ok(Delta::new(commands))
}

/// Partition a delta into the user-schema part and the global-schema part
/// (roles and databases live in the global schema).
pub(crate) fn split_delta(delta: &Delta) -> (Delta, Delta) {
    let (global, user): (Vec<_>, Vec<_>) = delta
        .commands
        .iter()
        .cloned()
        .partition(|cmd| matches!(cmd.metaclass, Metaclass::Role | Metaclass::Database));
    (Delta::new(user), Delta::new(global))
}

/// Convert delta commands back into DDL AST, used by POPULATE MIGRATION.
pub(crate) fn ddlast_from_delta(
    delta: &Delta,
    src: &SchemaSnapshot,
    tgt: &SchemaSnapshot,
) -> Vec<DdlStatement> {
    let span = Span::new(0, 0);
    let std_schema = meridiandb_schema::stdlib::std_schema();
    let type_name_of = |id: Uuid| -> TypeName {
        TypeName::plain(
            tgt.get_by_id(id)
                .or_else(|| src.get_by_id(id))
                .or_else(|| std_schema.get_by_id(id))
                .map(|o| {
                    if o.name.is_std() {
                        o.name.local().to_string()
                    } else {
                        o.name.to_string()
                    }
                })
                .unwrap_or_else(|| id.to_string()),
        )
    };
    let pointer_decls = |objtype: &ObjectType| -> Vec<PointerDecl> {
        objtype
            .pointers
            .values()
            .map(|ptr| PointerDecl {
                kind: match ptr.kind {
                    PointerKind::Property => PointerDeclKind::Property,
                    PointerKind::Link => PointerDeclKind::Link,
                },
                name: ptr.name.to_string(),
                target: type_name_of(ptr.target),
                required: ptr.required,
                multi: ptr.multi,
            })
            .collect()
    };

    let mut out = Vec::new();
    for cmd in &delta.commands {
        let stmt = match (cmd.op, cmd.metaclass) {
            (DeltaOp::Create, Metaclass::ObjectType) => {
                let Some(obj) = cmd.object.as_deref() else {
                    continue;
                };
                let Some(objtype) = obj.as_object_type() else {
                    continue;
                };
                DdlStatement::CreateType {
                    name: cmd.classname.to_string(),
                    pointers: pointer_decls(objtype),
                    span,
                }
            }
            (DeltaOp::Create, Metaclass::ScalarType) => {
                let Some(obj) = cmd.object.as_deref() else {
                    continue;
                };
                let Some(scalar) = obj.as_scalar() else {
                    continue;
                };
                DdlStatement::CreateScalarType {
                    name: cmd.classname.to_string(),
                    extending: scalar.base.map(type_name_of),
                    enum_labels: scalar
                        .enum_labels
                        .as_ref()
                        .map(|labels| labels.iter().map(|l| l.to_string()).collect()),
                    span,
                }
            }
            (DeltaOp::Create, Metaclass::Module) => DdlStatement::CreateModule {
                name: cmd.classname.module.to_string(),
                span,
            },
            (DeltaOp::Delete, Metaclass::ObjectType) => DdlStatement::DropType {
                name: cmd.classname.to_string(),
                span,
            },
            (DeltaOp::Delete, Metaclass::ScalarType) => DdlStatement::DropScalarType {
                name: cmd.classname.to_string(),
                span,
            },
            (DeltaOp::Delete, Metaclass::Module) => DdlStatement::DropModule {
                name: cmd.classname.module.to_string(),
                span,
            },
            (DeltaOp::Alter, Metaclass::ObjectType) => {
                if let Some(new_name) = &cmd.new_name {
                    DdlStatement::AlterType {
                        name: cmd.classname.to_string(),
                        rename_to: Some(new_name.to_string()),
                        commands: Vec::new(),
                        span,
                    }
                } else {
                    // Structural alter: emit pointer create/drop commands
                    // by diffing the two payloads.
                    let old = src
                        .get_by_name(&cmd.classname)
                        .and_then(|o| o.as_object_type().cloned())
                        .unwrap_or_default();
                    let new = cmd
                        .object
                        .as_deref()
                        .and_then(|o| o.as_object_type().cloned())
                        .unwrap_or_default();
                    // Pointer ids differ between independently-built
                    // schemas; only structure matters here.
                    let same_pointer = |a: &Pointer, b: &Pointer| {
                        a.kind == b.kind
                            && a.target == b.target
                            && a.required == b.required
                            && a.multi == b.multi
                    };
                    let mut alter_cmds = Vec::new();
                    for (name, ptr) in &new.pointers {
                        if !old.pointers.get(name).is_some_and(|o| same_pointer(o, ptr)) {
                            if old.pointers.contains_key(name) {
                                alter_cmds.push(AlterTypeCmd::DropPointer {
                                    name: name.to_string(),
                                });
                            }
                            alter_cmds.push(AlterTypeCmd::CreatePointer(PointerDecl {
                                kind: match ptr.kind {
                                    PointerKind::Property => PointerDeclKind::Property,
                                    PointerKind::Link => PointerDeclKind::Link,
                                },
                                name: name.to_string(),
                                target: type_name_of(ptr.target),
                                required: ptr.required,
                                multi: ptr.multi,
                            }));
                        }
                    }
                    for name in old.pointers.keys() {
                        if !new.pointers.contains_key(name) {
                            alter_cmds.push(AlterTypeCmd::DropPointer {
                                name: name.to_string(),
                            });
                        }
                    }
                    DdlStatement::AlterType {
                        name: cmd.classname.to_string(),
                        rename_to: None,
                        commands: alter_cmds,
                        span,
                    }
                }
            }
            _ => continue,
        };
        out.push(stmt);
    }
    out
}

/// Apply SDL declarations onto the standard schema, producing the target
/// user schema of a migration. Object ids are preserved for names that
/// already exist in `current`, so unchanged types do not churn.
pub(crate) fn apply_sdl(
    declarations: &[SdlDeclaration],
    current: &SchemaSnapshot,
    std_schema: &SchemaSnapshot,
    span: Span,
) -> Result<SchemaSnapshot> {
    struct FlatDecl<'a> {
        qual: QualName,
        decl: &'a SdlDeclaration,
    }

    fn flatten<'a>(
        decls: &'a [SdlDeclaration],
        module: &str,
        out: &mut Vec<FlatDecl<'a>>,
        modules: &mut BTreeSet<String>,
    ) {
        for decl in decls {
            match decl {
                SdlDeclaration::Module { name, declarations } => {
                    modules.insert(name.clone());
                    flatten(declarations, name, out, modules);
                }
                SdlDeclaration::Type { name, .. } | SdlDeclaration::Scalar { name, .. } => {
                    out.push(FlatDecl {
                        qual: QualName::new(module, name.clone()),
                        decl,
                    });
                }
            }
        }
    }

    let mut flat = Vec::new();
    let mut modules = BTreeSet::new();
    modules.insert(crate::dbstate::DEFAULT_MODULE.to_string());
    flatten(declarations, crate::dbstate::DEFAULT_MODULE, &mut flat, &mut modules);

    let keep_id = |qual: &QualName| {
        current
            .get_by_name(qual)
            .map(|o| o.id)
            .unwrap_or_else(Uuid::new_v4)
    };

    let mut target = SchemaSnapshot::new();
    for module in &modules {
        let qual = QualName::new(module.clone(), "__module__");
        let id = keep_id(&qual);
        target = target
            .inserted(SchemaObject::new(id, qual, ObjectData::Module))
            .map_err(|e| query_err(e, span))?;
    }

    // First pass: allocate ids so that forward references resolve.
    let mut sibling_ids = SiblingIds::new();
    for item in &flat {
        let implied_kind = match item.decl {
            SdlDeclaration::Type { .. } => PointerKind::Link,
            _ => PointerKind::Property,
        };
        sibling_ids.insert(item.qual.clone(), (keep_id(&item.qual), implied_kind));
    }

    let view = SchemaView::new(std_schema.clone(), current.clone(), SchemaSnapshot::new());
    let default_aliases = crate::dbstate::default_modaliases();
    for item in &flat {
        let id = sibling_ids[&item.qual].0;
        let data = match item.decl {
            SdlDeclaration::Type { pointers, .. } => {
                let mut objtype = ObjectType::default();
                for decl in pointers {
                    let mut aliases = default_aliases.clone();
                    aliases.insert(None, item.qual.module.to_string());
                    // Keep the id of a same-named pointer of the current
                    // schema so unchanged pointers do not churn.
                    let ptr_id = current
                        .get_by_name(&item.qual)
                        .and_then(|o| o.as_object_type())
                        .and_then(|t| t.pointer(&decl.name))
                        .map(|p| p.id)
                        .unwrap_or_else(Uuid::new_v4);
                    let ptr = build_pointer(decl, &view, &sibling_ids, &aliases, span, ptr_id)?;
                    objtype.pointers.insert(ptr.name.clone(), ptr);
                }
                ObjectData::ObjectType(objtype)
            }
            SdlDeclaration::Scalar {
                extending,
                enum_labels,
                ..
            } => {
                let base = match extending {
                    Some(target_ty) => {
                        let (base_id, _) = resolve_pointer_target(
                            target_ty,
                            &view,
                            &sibling_ids,
                            &default_aliases,
                            span,
                        )?;
                        Some(base_id)
                    }
                    None => None,
                };
                ObjectData::ScalarType(ScalarType {
                    base,
                    enum_labels: enum_labels
                        .as_ref()
                        .map(|labels| labels.iter().map(|l| l.clone().into_boxed_str()).collect()),
                })
            }
            SdlDeclaration::Module { .. } => unreachable!("modules are flattened away"),
        };
        target = target
            .inserted(SchemaObject::new(id, item.qual.clone(), data))
            .map_err(|e| query_err(e, span))?;
    }

    // Migrations are history: carry them over untouched so the chain
    // survives the target-schema swap.
    for obj in current.objects_of_kind(Metaclass::Migration) {
        target = target
            .inserted(SchemaObject::clone(obj))
            .map_err(|e| query_err(e, span))?;
    }

    Ok(target)
}

/// Backend DDL for one delta command.
fn command_sql(cmd: &DeltaCommand, src: &SchemaSnapshot, tgt: &SchemaSnapshot) -> Vec<String> {
    let table = |name: &QualName| quote_ident(&name.to_string());
    let column_type = |target: Uuid| -> String {
        use meridiandb_schema::ids::*;
        match target {
            x if x == STR_TYPE_ID => return "text".into(),
            x if x == UUID_TYPE_ID => return "uuid".into(),
            x if x == BYTES_TYPE_ID => return "bytea".into(),
            x if x == INT16_TYPE_ID => return "int2".into(),
            x if x == INT32_TYPE_ID => return "int4".into(),
            x if x == INT64_TYPE_ID => return "int8".into(),
            x if x == FLOAT32_TYPE_ID => return "float4".into(),
            x if x == FLOAT64_TYPE_ID => return "float8".into(),
            x if x == DECIMAL_TYPE_ID => return "numeric".into(),
            x if x == BOOL_TYPE_ID => return "bool".into(),
            x if x == DATETIME_TYPE_ID => return "timestamptz".into(),
            x if x == DURATION_TYPE_ID => return "interval".into(),
            x if x == JSON_TYPE_ID => return "jsonb".into(),
            _ => {}
        }
        match tgt.get_by_id(target).or_else(|| src.get_by_id(target)) {
            // Links store target ids; user scalars become domains named
            // after the type.
            Some(obj) if obj.as_object_type().is_some() => "uuid".to_string(),
            Some(obj) => quote_ident(&obj.name.to_string()),
            None => "text".into(),
        }
    };

    match (cmd.op, cmd.metaclass) {
        (DeltaOp::Create, Metaclass::ObjectType) => {
            let Some(objtype) = cmd.object.as_deref().and_then(|o| o.as_object_type()) else {
                return Vec::new();
            };
            let mut cols = vec![format!(
                "{} uuid PRIMARY KEY DEFAULT gen_random_uuid()",
                quote_ident("id")
            )];
            let mut extra = Vec::new();
            for ptr in objtype.pointers.values() {
                if ptr.multi {
                    // Multi pointers get their own link table.
                    extra.push(format!(
                        "CREATE TABLE {} (source uuid NOT NULL, target {} NOT NULL)",
                        quote_ident(&format!("{}.{}", cmd.classname, ptr.name)),
                        column_type(ptr.target),
                    ));
                } else {
                    cols.push(format!(
                        "{} {}{}",
                        quote_ident(&ptr.name),
                        column_type(ptr.target),
                        if ptr.required { " NOT NULL" } else { "" },
                    ));
                }
            }
            let mut stmts = vec![format!(
                "CREATE TABLE {} ({})",
                table(&cmd.classname),
                cols.join(", "),
            )];
            stmts.extend(extra);
            stmts
        }
        (DeltaOp::Delete, Metaclass::ObjectType) => {
            vec![format!("DROP TABLE {}", table(&cmd.classname))]
        }
        (DeltaOp::Alter, Metaclass::ObjectType) => {
            if let Some(new_name) = &cmd.new_name {
                return vec![format!(
                    "ALTER TABLE {} RENAME TO {}",
                    table(&cmd.classname),
                    quote_ident(&new_name.to_string()),
                )];
            }
            let old = src
                .get_by_name(&cmd.classname)
                .and_then(|o| o.as_object_type().cloned())
                .unwrap_or_default();
            let new = cmd
                .object
                .as_deref()
                .and_then(|o| o.as_object_type().cloned())
                .unwrap_or_default();
            let mut stmts = Vec::new();
            for (name, ptr) in &new.pointers {
                if !old.pointers.contains_key(name) && !ptr.multi {
                    stmts.push(format!(
                        "ALTER TABLE {} ADD COLUMN {} {}{}",
                        table(&cmd.classname),
                        quote_ident(name),
                        column_type(ptr.target),
                        if ptr.required { " NOT NULL" } else { "" },
                    ));
                }
            }
            for (name, ptr) in &old.pointers {
                if !new.pointers.contains_key(name) && !ptr.multi {
                    stmts.push(format!(
                        "ALTER TABLE {} DROP COLUMN {}",
                        table(&cmd.classname),
                        quote_ident(name),
                    ));
                }
            }
            stmts
        }
        (DeltaOp::Create, Metaclass::ScalarType) => {
            let Some(scalar) = cmd.object.as_deref().and_then(|o| o.as_scalar()) else {
                return Vec::new();
            };
            match (&scalar.enum_labels, scalar.base) {
                (Some(labels), _) => vec![format!(
                    "CREATE TYPE {} AS ENUM ({})",
                    table(&cmd.classname),
                    labels.iter().map(|l| quote_literal(l)).collect::<Vec<_>>().join(", "),
                )],
                (None, Some(base)) => vec![format!(
                    "CREATE DOMAIN {} AS {}",
                    table(&cmd.classname),
                    column_type(base),
                )],
                (None, None) => Vec::new(),
            }
        }
        (DeltaOp::Delete, Metaclass::ScalarType) => {
            vec![format!("DROP TYPE {}", table(&cmd.classname))]
        }
        (DeltaOp::Create, Metaclass::Database) => {
            vec![format!("CREATE DATABASE {}", quote_ident(&cmd.classname.name))]
        }
        (DeltaOp::Delete, Metaclass::Database) => {
            vec![format!("DROP DATABASE {}", quote_ident(&cmd.classname.name))]
        }
        (DeltaOp::Create, Metaclass::Role) => {
            let superuser = cmd
                .object
                .as_deref()
                .and_then(|o| match &o.data {
                    ObjectData::Role(r) => Some(r.superuser),
                    _ => None,
                })
                .unwrap_or(false);
            vec![format!(
                "CREATE ROLE {}{}",
                quote_ident(&cmd.classname.name),
                if superuser { " SUPERUSER" } else { "" },
            )]
        }
        (DeltaOp::Delete, Metaclass::Role) => {
            vec![format!("DROP ROLE {}", quote_ident(&cmd.classname.name))]
        }
        // Modules and migrations are metadata-only: the reflection block
        // records them.
        _ => Vec::new(),
    }
}

impl Compiler {
    /// Compile one DDL statement, apply it to the transaction's
    /// schema, and emit the backend SQL plus the schema-storage block.
    pub(crate) fn compile_and_apply_ddl_stmt(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        stmt: &DdlStatement,
    ) -> Result<DdlResult> {
        let span = stmt.span();
        let schema = state.current_tx().get_schema(self.std_schema());
        let modaliases = state.current_tx().get_modaliases();
        let testmode = crate::config::lookup_bool(
            "__internal_testmode",
            &state.current_tx().get_session_config(),
        );

        let delta = delta_from_ddl(stmt, &schema, &modaliases, ctx, testmode)?;

        // Inside a migration block, DDL only accumulates.
        if state.current_tx().get_migration_state().is_some() {
            let (user_delta, _) = split_delta(&delta);
            let new_user = schema
                .user
                .apply(&user_delta)
                .map_err(|e| query_err(e, span))?;
            let tx = state.current_tx_mut();
            let mut mstate = tx.get_migration_state().cloned().expect("checked above");
            mstate.accepted_cmds.push(stmt.clone());
            tx.update_migration_state(Some(mstate));
            tx.update_user_schema(new_user);
            return Ok(DdlResult {
                sql: vec![b"SELECT NULL LIMIT 0".to_vec()],
                is_transactional: true,
                single_unit: false,
                new_types: BTreeSet::new(),
                create_db: None,
                drop_db: None,
                has_role_ddl: false,
                ddl_stmt_id: None,
            });
        }

        let (user_delta, global_delta) = split_delta(&delta);

        // Dry-run on copies first: a failure here must not leave partial
        // changes in the transaction.
        let new_user = schema
            .user
            .apply(&user_delta)
            .map_err(|e| query_err(e, span))?;
        let new_global = schema
            .global
            .apply(&global_delta)
            .map_err(|e| query_err(e, span))?;

        let is_db_cmd = stmt.is_database_ddl();
        let mut block = if is_db_cmd {
            SqlBlock::new_plain()
        } else {
            SqlBlock::new_pl()
        };

        let mut new_types: BTreeSet<String> = BTreeSet::new();
        if !is_db_cmd {
            for cmd in &delta.commands {
                if cmd.op == DeltaOp::Create
                    && matches!(cmd.metaclass, Metaclass::ObjectType | Metaclass::ScalarType)
                {
                    if let Some(obj) = cmd.object.as_deref() {
                        new_types.insert(obj.id.to_string());
                    }
                }
            }
        }

        for cmd in &delta.commands {
            for sql in command_sql(cmd, &schema.user, &new_user) {
                block.add_command(sql);
            }
        }

        // Commit the new schema to the transaction before reflection: the
        // reflection block compiles against the post-state.
        state
            .current_tx_mut()
            .update_schema(SchemaView::new(schema.std.clone(), new_user, new_global));

        self.compile_schema_storage_in_delta(state, ctx, &delta, &mut block)?;

        let is_transactional = block.is_transactional();
        let sql: Vec<Vec<u8>> = if is_transactional {
            vec![block.to_sql_string().into_bytes()]
        } else {
            block
                .statements()
                .iter()
                .map(|s| s.clone().into_bytes())
                .collect()
        };

        let create_db = match stmt {
            DdlStatement::CreateDatabase { name, .. } => Some(name.clone()),
            _ => None,
        };
        let drop_db = match stmt {
            DdlStatement::DropDatabase { name, .. } => Some(name.clone()),
            _ => None,
        };

        Ok(DdlResult {
            sql,
            is_transactional,
            single_unit: !is_transactional || drop_db.is_some(),
            ddl_stmt_id: (!new_types.is_empty()).then(|| Uuid::new_v4().to_string()),
            new_types,
            create_db,
            drop_db,
            has_role_ddl: stmt.is_role_ddl(),
        })
    }

    /// For each reflection fragment, look up or create the
    /// backend helper function and append a call with the current
    /// argument values. Newly created helpers accumulate into the
    /// transaction's reflection cache.
    pub(crate) fn compile_schema_storage_in_delta(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        delta: &Delta,
        block: &mut SqlBlock,
    ) -> Result<()> {
        let fragments = write_meta(delta);
        let mut cache = state.current_tx().get_cached_reflection();

        for fragment in &fragments {
            let mut hasher = Sha1::new();
            hasher.update(fragment.mql.as_bytes());
            let hash = hex::encode(hasher.finalize());
            let fname = ("meridian".to_string(), format!("__rh_{hash}"));

            let argnames = match cache.get(&hash) {
                Some(names) => names.clone(),
                None => {
                    let (sql, argnames) = self.compile_schema_storage_stmt(state, ctx, &fragment.mql)?;
                    let function = Function {
                        name: fname.clone(),
                        args: argnames
                            .iter()
                            .map(|name| (name.clone(), "json".to_string()))
                            .collect(),
                        returns: "json".to_string(),
                        body: sql,
                    };
                    function.generate(block, true);
                    cache.insert(hash.clone(), argnames.clone());
                    argnames
                }
            };

            let argvals: Vec<String> = argnames
                .iter()
                .map(|name| {
                    let value = fragment
                        .args
                        .get(name)
                        .cloned()
                        .unwrap_or(serde_json::Value::Null);
                    format!("{}::json", quote_literal(&value.to_string()))
                })
                .collect();
            let call = format!(
                "{} {}.{}({})",
                if block.is_transactional() {
                    "PERFORM"
                } else {
                    "SELECT"
                },
                quote_ident(&fname.0),
                quote_ident(&fname.1),
                argvals.join(", "),
            );
            block.add_command(call);
        }

        state.current_tx_mut().update_cached_reflection(cache);
        Ok(())
    }

    /// Compile one reflection fragment against the shadow reflection
    /// schema. The user schema is restored afterwards even on error.
    pub(crate) fn compile_schema_storage_stmt(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        mql: &str,
    ) -> Result<(String, Vec<String>)> {
        let saved_user = state.current_tx().get_user_schema();
        state
            .current_tx_mut()
            .update_user_schema(self.reflection_schema().clone());

        let newctx = CompileContext {
            stmt_mode: StatementMode::Single,
            json_parameters: true,
            schema_reflection_mode: true,
            output_format: OutputFormat::Json,
            expected_cardinality_one: false,
            bootstrap_mode: ctx.bootstrap_mode,
            ..Default::default()
        };

        let result = (|| {
            let source = crate::mql::Source::from_string(mql);
            let statements = crate::mql::parse_block(source.text())?;
            let [crate::mql::ast::Statement::Query(query)] = statements.as_slice() else {
                return Err(CompilerError::internal(
                    "reflection fragment is not a single query",
                ));
            };
            let compiled =
                self.compile_ql_query(state, &newctx, Some(&source), query, false)?;
            let crate::dbstate::CompiledStatement::Query(q) = compiled else {
                return Err(CompilerError::internal(
                    "reflection fragment did not compile to a query",
                ));
            };
            let sql = String::from_utf8(q.sql.into_iter().next().unwrap_or_default())
                .map_err(|_| CompilerError::internal("reflection SQL is not UTF-8"))?;
            let argnames = q
                .in_type_args
                .unwrap_or_default()
                .into_iter()
                .map(|p| p.name)
                .collect();
            Ok((sql, argnames))
        })();

        state.current_tx_mut().update_user_schema(saved_user);
        result
    }
}
