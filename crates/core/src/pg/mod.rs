//! Backend SQL generation from IR.

pub mod dbops;

use indexmap::IndexMap;
use itertools::Itertools;

use meridiandb_schema::ids;
use meridiandb_schema::QualName;
use meridiandb_wire::descriptor::TypeExpr;

use crate::ir::{FieldSel, Ir, Plan, ValueExpr};
use crate::mql::ast::BinOpKind;

/// The output format the generated SQL produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SqlOutputFormat {
    /// Native binary rows.
    Native,
    /// One JSON document for the whole result set.
    Json,
    /// One JSON document per row.
    JsonElements,
    /// Rows are discarded.
    Null,
}

#[derive(Debug, Clone, Copy)]
pub struct SqlCompileOptions {
    pub pretty: bool,
    pub expected_cardinality_one: bool,
    pub output_format: SqlOutputFormat,
}

impl Default for SqlCompileOptions {
    fn default() -> Self {
        Self {
            pretty: false,
            expected_cardinality_one: false,
            output_format: SqlOutputFormat::Native,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlParam {
    pub name: String,
    pub index: usize,
    pub required: bool,
}

/// Parameter name to its backend position, in positional order.
pub type ArgMap = IndexMap<String, SqlParam>;

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

pub fn quote_literal(value: &str) -> String {
    format!("'{}'", value.replace('\'', "''"))
}

fn table_name(name: &QualName) -> String {
    quote_ident(&name.to_string())
}

/// The backend type a scalar or collection maps onto.
pub fn pg_type_name(ty: &TypeExpr) -> &'static str {
    match ty {
        TypeExpr::Scalar(id) => match *id {
            x if x == ids::STR_TYPE_ID => "text",
            x if x == ids::UUID_TYPE_ID => "uuid",
            x if x == ids::BYTES_TYPE_ID => "bytea",
            x if x == ids::INT16_TYPE_ID => "int2",
            x if x == ids::INT32_TYPE_ID => "int4",
            x if x == ids::INT64_TYPE_ID => "int8",
            x if x == ids::FLOAT32_TYPE_ID => "float4",
            x if x == ids::FLOAT64_TYPE_ID => "float8",
            x if x == ids::DECIMAL_TYPE_ID => "numeric",
            x if x == ids::BOOL_TYPE_ID => "bool",
            x if x == ids::DATETIME_TYPE_ID => "timestamptz",
            x if x == ids::DURATION_TYPE_ID => "interval",
            x if x == ids::JSON_TYPE_ID => "jsonb",
            _ => "text",
        },
        TypeExpr::Array(_) => "anyarray",
        _ => "text",
    }
}

struct SqlWriter<'a> {
    ir: &'a Ir,
    argmap: ArgMap,
}

impl<'a> SqlWriter<'a> {
    fn new(ir: &'a Ir) -> Self {
        let mut argmap = ArgMap::new();
        for (idx, param) in ir.params.iter().enumerate() {
            argmap.insert(
                param.name.clone(),
                SqlParam {
                    name: param.name.clone(),
                    index: idx + 1,
                    required: param.required,
                },
            );
        }
        Self { ir, argmap }
    }

    fn param_ref(&self, index: usize) -> String {
        let param = &self.ir.params[index];
        let pg_ty = pg_type_name(&param.ty);
        if self.ir.json_parameters {
            // JSON parameter mode: every argument arrives as a jsonb value.
            format!("(${}::jsonb #>> '{{}}')::{pg_ty}", index + 1)
        } else {
            format!("${}::{pg_ty}", index + 1)
        }
    }

    fn render_value(&self, expr: &ValueExpr) -> String {
        match expr {
            ValueExpr::IntConst(v) => v.to_string(),
            ValueExpr::FloatConst(v) => v.to_string(),
            ValueExpr::StrConst(v) => quote_literal(v),
            ValueExpr::BoolConst(v) => v.to_string(),
            ValueExpr::Param { index, .. } => self.param_ref(*index),
            ValueExpr::Tuple(elements) => {
                format!("ROW({})", elements.iter().map(|e| self.render_value(e)).join(", "))
            }
            ValueExpr::NamedTuple(fields) => format!(
                "ROW({})",
                fields.iter().map(|(_, e)| self.render_value(e)).join(", ")
            ),
            ValueExpr::Array(elements) => format!(
                "ARRAY[{}]",
                elements.iter().map(|e| self.render_value(e)).join(", ")
            ),
            ValueExpr::Set(elements) => format!(
                "unnest(ARRAY[{}])",
                elements.iter().map(|e| self.render_value(e)).join(", ")
            ),
            ValueExpr::FuncCall { name, args } => {
                let args = args.iter().map(|e| self.render_value(e)).join(", ");
                match name.as_str() {
                    "to_json" => format!("to_jsonb({args})"),
                    "count" => format!("count({args})"),
                    "uuid_generate_v4" => "gen_random_uuid()".to_string(),
                    other => format!("{other}({args})"),
                }
            }
            ValueExpr::BinOp { op, lhs, rhs } => {
                let op = match op {
                    BinOpKind::Add => "+",
                    BinOpKind::Sub => "-",
                    BinOpKind::Mul => "*",
                    BinOpKind::Div => "/",
                    BinOpKind::Eq => "=",
                    BinOpKind::Lt => "<",
                    BinOpKind::Gt => ">",
                };
                format!("({} {op} {})", self.render_value(lhs), self.render_value(rhs))
            }
            ValueExpr::FieldRef(field) => quote_ident(field),
        }
    }

    fn render_field_list(
        &self,
        fields: &[FieldSel],
        type_name: &QualName,
        type_id: uuid::Uuid,
    ) -> String {
        if fields.is_empty() {
            return quote_ident("id");
        }
        fields
            .iter()
            .map(|f| match f.name.as_str() {
                // Implicit type metadata fields are constants.
                "__tid__" => format!("'{type_id}'::uuid AS {}", quote_ident("__tid__")),
                "__tname__" => format!(
                    "{}::text AS {}",
                    quote_literal(&type_name.to_string()),
                    quote_ident("__tname__"),
                ),
                other => quote_ident(other),
            })
            .collect::<Vec<_>>()
            .join(", ")
    }

    fn render(&self, opts: &SqlCompileOptions) -> String {
        let sep = if opts.pretty { "\n" } else { " " };
        let core = match &self.ir.plan {
            Plan::SelectValue { expr } => format!("SELECT {}", self.render_value(expr)),
            Plan::SelectShape {
                type_name,
                type_id,
                fields,
                filter,
                limit,
            } => {
                let mut sql = format!(
                    "SELECT {}{sep}FROM {}",
                    self.render_field_list(fields, type_name, *type_id),
                    table_name(type_name),
                );
                if let Some(filter) = filter {
                    sql.push_str(sep);
                    sql.push_str("WHERE ");
                    sql.push_str(&self.render_value(filter));
                }
                if let Some(limit) = limit {
                    sql.push_str(sep);
                    sql.push_str(&format!("LIMIT {limit}"));
                }
                sql
            }
            Plan::Insert {
                type_name,
                assignments,
                ..
            } => {
                if assignments.is_empty() {
                    format!(
                        "INSERT INTO {} DEFAULT VALUES RETURNING {}",
                        table_name(type_name),
                        quote_ident("id"),
                    )
                } else {
                    format!(
                        "INSERT INTO {} ({}){sep}VALUES ({}){sep}RETURNING {}",
                        table_name(type_name),
                        assignments.iter().map(|(f, _)| quote_ident(f)).join(", "),
                        assignments
                            .iter()
                            .map(|(_, v)| self.render_value(v))
                            .join(", "),
                        quote_ident("id"),
                    )
                }
            }
            Plan::Update {
                type_name,
                filter,
                assignments,
                ..
            } => {
                let mut sql = format!(
                    "UPDATE {}{sep}SET {}",
                    table_name(type_name),
                    assignments
                        .iter()
                        .map(|(f, v)| format!("{} = {}", quote_ident(f), self.render_value(v)))
                        .join(", "),
                );
                if let Some(filter) = filter {
                    sql.push_str(sep);
                    sql.push_str("WHERE ");
                    sql.push_str(&self.render_value(filter));
                }
                sql.push_str(sep);
                sql.push_str(&format!("RETURNING {}", quote_ident("id")));
                sql
            }
            Plan::Delete {
                type_name, filter, ..
            } => {
                let mut sql = format!("DELETE FROM {}", table_name(type_name));
                if let Some(filter) = filter {
                    sql.push_str(sep);
                    sql.push_str("WHERE ");
                    sql.push_str(&self.render_value(filter));
                }
                sql.push_str(sep);
                sql.push_str(&format!("RETURNING {}", quote_ident("id")));
                sql
            }
        };

        // DML cannot sit in a FROM subquery; route it through a CTE.
        let is_dml = matches!(
            self.ir.plan,
            Plan::Insert { .. } | Plan::Update { .. } | Plan::Delete { .. }
        );
        let wrap = |projection: &str| {
            if is_dml {
                format!("WITH q AS ({core}){sep}SELECT {projection}{sep}FROM q")
            } else {
                format!("SELECT {projection}{sep}FROM ({core}) AS q")
            }
        };

        match opts.output_format {
            SqlOutputFormat::Native => core,
            SqlOutputFormat::Json => wrap("coalesce(jsonb_agg(q), '[]'::jsonb)::text"),
            SqlOutputFormat::JsonElements => wrap("to_jsonb(q)::text"),
            SqlOutputFormat::Null => wrap("NULL"),
        }
    }
}

/// Generate backend SQL for the IR. Deterministic: equal IR and options
/// produce identical text and argument maps.
pub fn compile_ir_to_sql(ir: &Ir, opts: &SqlCompileOptions) -> (String, ArgMap) {
    let writer = SqlWriter::new(ir);
    let sql = writer.render(opts);
    (sql, writer.argmap)
}
