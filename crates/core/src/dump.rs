//! Database dump and restore descriptions.
//!
//! Dumping never executes anything: it produces the schema DDL text, the
//! id map, and one copy-block descriptor per stored table (object tables
//! plus multi-pointer link tables), each with the wire type descriptor of
//! its row shape. Restore compiles the schema DDL with pinned object ids
//! and re-derives the copy statements, recording columns that newer dump
//! versions no longer emit so the copy stream can skip them.

use std::collections::HashMap;

use uuid::Uuid;

use meridiandb_schema::diff::statements_from_delta;
use meridiandb_schema::{DeltaGuidance, Metaclass, PointerKind, QualName, SchemaSnapshot, SchemaView};
use meridiandb_wire::descriptor::{
    self, DescribeOptions, ShapePointer, TypeExpr, ViewShapeMetadata, ViewShapes,
};
use meridiandb_wire::Cardinality;

use crate::compiler::Compiler;
use crate::context::CompileContext;
use crate::dbstate::CompilerConnectionState;
use crate::enums::StatementMode;
use crate::error::{CompilerError, Result};
use crate::mql::Source;
use crate::pg::quote_ident;
use crate::units::QueryUnit;

/// Dumps produced before this version inline extraneous computable
/// columns into object tables.
pub const DUMP_VER_EXTRANEOUS_COMPUTABLES: u16 = 2;
/// Dumps produced before this version carry a `ptr_item_id` column in
/// link tables.
pub const DUMP_VER_PTR_ITEM_ID: u16 = 3;
/// The version this compiler writes.
pub const CURRENT_DUMP_VER: u16 = 3;

#[derive(Debug, Clone)]
pub struct DumpBlockDescriptor {
    pub schema_object_id: Uuid,
    pub schema_object_class: String,
    /// Ids of the object types this block's data references.
    pub schema_deps: Vec<Uuid>,
    pub type_desc_id: Uuid,
    pub type_desc: Vec<u8>,
    pub sql_copy_stmt: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct DumpDescriptor {
    pub schema_ddl: String,
    /// `(name, ql_class, id)` for every user schema object.
    pub schema_ids: Vec<(String, String, [u8; 16])>,
    pub blocks: Vec<DumpBlockDescriptor>,
}

#[derive(Debug, Clone)]
pub struct RestoreBlockDescriptor {
    pub schema_object_id: Uuid,
    pub sql_copy_stmt: Vec<u8>,
    /// Columns present in the dump stream but absent from the restored
    /// table; the copy reader drops them.
    pub compat_elided_cols: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct RestoreDescriptor {
    pub units: Vec<QueryUnit>,
    pub blocks: Vec<RestoreBlockDescriptor>,
    pub tables: Vec<String>,
}

fn copy_to_stmt(table: &str, cols: &[String]) -> Vec<u8> {
    format!(
        "COPY {} ({}) TO STDOUT WITH BINARY",
        quote_ident(table),
        cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
    )
    .into_bytes()
}

fn copy_from_stmt(table: &str, cols: &[String]) -> Vec<u8> {
    format!(
        "COPY {} ({}) FROM STDIN WITH BINARY",
        quote_ident(table),
        cols.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
    )
    .into_bytes()
}

/// Collect the per-table blocks of a schema: each object type contributes
/// its own table, and every multi pointer a link table.
fn table_blocks(
    user: &SchemaSnapshot,
) -> Vec<(Uuid, String, Vec<Uuid>, String, Vec<String>, ViewShapes)> {
    let mut out = Vec::new();
    for obj in user.objects_of_kind(Metaclass::ObjectType) {
        let Some(objtype) = obj.as_object_type() else {
            continue;
        };
        let table = obj.name.to_string();

        let mut cols = vec!["id".to_string()];
        let mut deps = Vec::new();
        let mut elements = vec![ShapePointer {
            name: "id".into(),
            target: TypeExpr::uuid(),
            cardinality: Cardinality::One,
            is_link: false,
            is_linkprop: false,
        }];
        for ptr in objtype.pointers.values() {
            if ptr.multi {
                continue;
            }
            let is_link = ptr.kind == PointerKind::Link;
            if is_link {
                deps.push(ptr.target);
            }
            cols.push(ptr.name.to_string());
            elements.push(ShapePointer {
                name: ptr.name.clone(),
                target: if is_link {
                    // Dumps never follow links; they store target ids.
                    TypeExpr::uuid()
                } else {
                    TypeExpr::Scalar(ptr.target)
                },
                cardinality: Cardinality::from_pointer(ptr.required, false),
                is_link: false,
                is_linkprop: false,
            });
        }
        let shapes = ViewShapes {
            shapes: HashMap::from([(obj.id, elements)]),
            rptr_shapes: HashMap::new(),
        };
        out.push((
            obj.id,
            "ObjectType".to_string(),
            deps,
            table.clone(),
            cols,
            shapes,
        ));

        for ptr in objtype.pointers.values().filter(|p| p.multi) {
            let link_table = format!("{}.{}", obj.name, ptr.name);
            let cols = vec!["source".to_string(), "target".to_string()];
            let target_scalar = ptr.kind == PointerKind::Property;
            let elements = vec![
                ShapePointer {
                    name: "source".into(),
                    target: TypeExpr::uuid(),
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                },
                ShapePointer {
                    name: "target".into(),
                    target: if target_scalar {
                        TypeExpr::Scalar(ptr.target)
                    } else {
                        TypeExpr::uuid()
                    },
                    cardinality: Cardinality::One,
                    is_link: false,
                    is_linkprop: false,
                },
            ];
            let shapes = ViewShapes {
                shapes: HashMap::from([(ptr.id, elements)]),
                rptr_shapes: HashMap::new(),
            };
            out.push((
                ptr.id,
                "Pointer".to_string(),
                vec![obj.id],
                link_table,
                cols,
                shapes,
            ));
        }
    }
    out
}

impl Compiler {
    /// Describe everything a dump of the current database must contain.
    #[tracing::instrument(skip_all)]
    pub fn describe_database_dump(
        &self,
        state: &CompilerConnectionState,
    ) -> Result<DumpDescriptor> {
        let user = state.current_tx().get_user_schema();
        let view = SchemaView::new(
            self.std_schema().clone(),
            user.clone(),
            state.current_tx().get_global_schema(),
        );

        // The schema DDL is the creation diff from an empty schema.
        let empty = SchemaSnapshot::new();
        let creation = empty.diff(&user, &DeltaGuidance::default(), false);
        let schema_ddl = statements_from_delta(&empty, &user, &creation).join("\n");

        let mut schema_ids = Vec::new();
        for obj in user.iter_objects() {
            schema_ids.push((
                obj.name.to_string(),
                obj.metaclass().to_string(),
                *obj.id.as_bytes(),
            ));
            // Pointers are pinned under `module::Type.pointer` so that a
            // restore reproduces link-table block ids exactly.
            if let Some(objtype) = obj.as_object_type() {
                for ptr in objtype.pointers.values() {
                    schema_ids.push((
                        crate::ddl::pointer_pin_name(&obj.name, &ptr.name).to_string(),
                        "Pointer".to_string(),
                        *ptr.id.as_bytes(),
                    ));
                }
            }
        }
        schema_ids.sort();

        let mut blocks = Vec::new();
        for (object_id, class, deps, table, cols, shapes) in table_blocks(&user) {
            let shape_root = *shapes.shapes.keys().next().expect("one shape per block");
            let (type_desc, type_desc_id) = descriptor::describe(
                &view,
                &TypeExpr::Object(shape_root),
                &shapes,
                &ViewShapeMetadata::default(),
                DescribeOptions::default(),
            )?;
            blocks.push(DumpBlockDescriptor {
                schema_object_id: object_id,
                schema_object_class: class,
                schema_deps: deps,
                type_desc_id,
                type_desc,
                sql_copy_stmt: copy_to_stmt(&table, &cols),
            });
        }

        Ok(DumpDescriptor {
            schema_ddl,
            schema_ids,
            blocks,
        })
    }

    /// Describe how to restore a dump: the schema-DDL units (with object
    /// ids pinned to the dump's) plus per-block copy statements.
    #[tracing::instrument(skip_all)]
    pub fn describe_database_restore(
        &self,
        state: &mut CompilerConnectionState,
        dump_version: u16,
        schema_ddl: &str,
        schema_ids: &[(String, String, [u8; 16])],
        blocks: &[DumpBlockDescriptor],
    ) -> Result<RestoreDescriptor> {
        if dump_version > CURRENT_DUMP_VER {
            return Err(CompilerError::Protocol(format!(
                "unsupported dump version {dump_version} (max {CURRENT_DUMP_VER})"
            )));
        }
        let dump_with_extraneous_computables = dump_version < DUMP_VER_EXTRANEOUS_COMPUTABLES;
        let dump_with_ptr_item_id = dump_version < DUMP_VER_PTR_ITEM_ID;

        let mut pinned_ids = HashMap::new();
        for (name, _class, id) in schema_ids {
            if let Ok(qual) = name.parse::<QualName>() {
                pinned_ids.insert(qual, Uuid::from_bytes(*id));
            }
        }

        let ctx = CompileContext {
            stmt_mode: StatementMode::All,
            schema_object_ids: Some(pinned_ids),
            bootstrap_mode: true,
            ..Default::default()
        };
        let units = self.compile(state, &ctx, &Source::from_string(schema_ddl))?;

        // Validate each block's descriptor against the restored schema
        // and rebuild the copy statements.
        let user = state.current_tx().get_user_schema();
        let restored = table_blocks(&user);
        let by_object: HashMap<Uuid, &(Uuid, String, Vec<Uuid>, String, Vec<String>, ViewShapes)> =
            restored.iter().map(|b| (b.0, b)).collect();

        let mut out_blocks = Vec::new();
        let mut tables = Vec::new();
        for block in blocks {
            let parsed = descriptor::parse(
                &block.type_desc,
                meridiandb_wire::ProtocolVersion::CURRENT,
            )?;
            let dumped_cols: Vec<String> = match parsed {
                meridiandb_wire::descriptor::TypeDesc::Shape { elements, .. } => {
                    elements.into_iter().map(|el| el.name).collect()
                }
                _ => {
                    return Err(CompilerError::Protocol(
                        "dump block descriptor is not a shape".into(),
                    ))
                }
            };

            let Some((_, _, _, table, cols, _)) = by_object.get(&block.schema_object_id) else {
                return Err(CompilerError::Protocol(format!(
                    "dump block references unknown schema object {}",
                    block.schema_object_id
                )));
            };

            // Columns the dump carries that the restored table does not
            // want: version-elided compatibility columns.
            let mut elided: Vec<String> = dumped_cols
                .iter()
                .filter(|c| !cols.contains(c))
                .cloned()
                .collect();
            if dump_with_ptr_item_id && !elided.iter().any(|c| c == "ptr_item_id") {
                elided.push("ptr_item_id".to_string());
            }
            if dump_with_extraneous_computables {
                let extra_computed: Vec<String> = dumped_cols
                    .iter()
                    .filter(|c| c.starts_with("__computed_"))
                    .filter(|c| !elided.contains(*c))
                    .cloned()
                    .collect();
                elided.extend(extra_computed);
            }

            tables.push(table.clone());
            out_blocks.push(RestoreBlockDescriptor {
                schema_object_id: block.schema_object_id,
                sql_copy_stmt: copy_from_stmt(table, cols),
                compat_elided_cols: elided,
            });
        }

        Ok(RestoreDescriptor {
            units,
            blocks: out_blocks,
            tables,
        })
    }
}
