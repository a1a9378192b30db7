//! The query compiler path: MQL expression statements to fully-described
//! [`QueryResult`]s (or bare [`SimpleQueryResult`]s in script mode).

use sha1::{Digest, Sha1};

use meridiandb_wire::descriptor::{self, DescribeOptions, ParamDesc};

use crate::compiler::Compiler;
use crate::config;
use crate::context::CompileContext;
use crate::dbstate::{CompiledStatement, CompilerConnectionState, Param, QueryResult, SimpleQueryResult};
use crate::enums::OutputFormat;
use crate::error::{CompilerError, Result};
use crate::ir::{self, CompilerOptions};
use crate::mql::ast::QueryStmt;
use crate::mql::Source;
use crate::pg::{self, SqlCompileOptions, SqlOutputFormat};

fn convert_format(format: OutputFormat) -> SqlOutputFormat {
    match format {
        OutputFormat::Binary => SqlOutputFormat::Native,
        OutputFormat::Json => SqlOutputFormat::Json,
        OutputFormat::JsonElements => SqlOutputFormat::JsonElements,
        OutputFormat::None => SqlOutputFormat::Null,
    }
}

/// `sha1~<hex>` over everything that affects the prepared statement.
fn hash_sql(sql: &[u8], mode: &str, in_type_id: &[u8], out_type_id: &[u8]) -> Vec<u8> {
    let mut hasher = Sha1::new();
    hasher.update(sql);
    hasher.update(b"\0mode=");
    hasher.update(mode.as_bytes());
    hasher.update(b"\0intype=");
    hasher.update(in_type_id);
    hasher.update(b"\0outtype=");
    hasher.update(out_type_id);
    format!("sha1~{}", hex::encode(hasher.finalize())).into_bytes()
}

impl Compiler {
    pub(crate) fn compile_ql_query(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        source: Option<&Source>,
        stmt: &QueryStmt,
        cacheable: bool,
    ) -> Result<CompiledStatement> {
        let current_tx = state.current_tx();
        let session_config = current_tx.get_session_config();
        let schema = current_tx.get_schema(self.std_schema());

        let can_have_implicit_fields = ctx.can_have_implicit_fields();
        let disable_constant_folding =
            config::lookup_bool("__internal_no_const_folding", &session_config);

        let options = CompilerOptions {
            modaliases: current_tx.get_modaliases(),
            implicit_tid_in_shapes: can_have_implicit_fields && ctx.inline_typeids,
            implicit_tname_in_shapes: can_have_implicit_fields && ctx.inline_typenames,
            implicit_id_in_shapes: can_have_implicit_fields,
            constant_folding: !disable_constant_folding,
            json_parameters: ctx.json_parameters,
            implicit_limit: ctx.implicit_limit,
            allow_writing_protected_pointers: ctx.schema_reflection_mode,
            apply_query_rewrites: !ctx.bootstrap_mode && !ctx.schema_reflection_mode,
        };

        let ir = ir::compile_ast_to_ir(stmt, &schema, &options)?;

        let cardinality = if ir.is_single() {
            crate::enums::Cardinality::One
        } else {
            if ctx.expected_cardinality_one {
                return Err(CompilerError::ResultCardinalityMismatch { actual: "MANY" });
            }
            crate::enums::Cardinality::Many
        };

        let (sql_text, argmap) = pg::compile_ir_to_sql(
            &ir,
            &SqlCompileOptions {
                pretty: false,
                expected_cardinality_one: ctx.expected_cardinality_one,
                output_format: convert_format(ctx.output_format),
            },
        );
        let sql_bytes = sql_text.into_bytes();

        if !ctx.single_stmt_mode() {
            if !ir.params.is_empty() {
                return Err(CompilerError::query_at(
                    "MQL script queries cannot accept parameters",
                    stmt.span(),
                ));
            }
            return Ok(CompiledStatement::SimpleQuery(SimpleQueryResult {
                sql: vec![sql_bytes],
                is_transactional: true,
                has_dml: ir.has_dml,
                single_unit: false,
            }));
        }

        let (out_type_data, out_type_id) = if ctx.native_out_format() {
            descriptor::describe(
                &schema,
                &ir.stype,
                &ir.view_shapes,
                &ir.view_shapes_metadata,
                DescribeOptions {
                    protocol: ctx.protocol_version,
                    inline_typenames: ctx.inline_typenames,
                    ..Default::default()
                },
            )?
        } else {
            descriptor::describe_json()
        };

        // Server-injected (extracted) parameters are excluded from the
        // client-facing argument list; they occupy the tail positions.
        let first_extracted = source.and_then(|src| src.first_extra());
        let user_params = match first_extracted {
            Some(n) => n.min(ir.params.len()),
            None => ir.params.len(),
        };

        let mut args = Vec::with_capacity(user_params);
        let mut param_descs = Vec::with_capacity(user_params);
        for param in &ir.params[..user_params] {
            let sql_param = argmap.get(&param.name).ok_or_else(|| {
                CompilerError::internal(format!(
                    "parameter ${} missing from the argument map",
                    param.name
                ))
            })?;
            args.push(Param {
                name: param.name.clone(),
                required: sql_param.required,
                array_type_id: if ctx.standalone_mode {
                    None
                } else {
                    param.array_element_type_id
                },
            });
            param_descs.push(ParamDesc {
                name: param.name.clone(),
                ty: param.ty.clone(),
                required: param.required,
            });
        }
        let in_type_args = (!args.is_empty()).then_some(args);

        let (in_type_data, in_type_id) =
            descriptor::describe_params(&schema, &param_descs, ctx.protocol_version)?;

        let sql_hash = hash_sql(
            &sql_bytes,
            &ctx.output_format.to_string(),
            in_type_id.as_bytes(),
            out_type_id.as_bytes(),
        );

        Ok(CompiledStatement::Query(QueryResult {
            sql: vec![sql_bytes],
            sql_hash,
            cardinality,
            in_type_id,
            in_type_data,
            in_type_args,
            out_type_id,
            out_type_data,
            is_transactional: true,
            has_dml: ir.has_dml,
            single_unit: false,
            cacheable,
        }))
    }
}
