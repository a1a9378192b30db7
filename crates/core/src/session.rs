//! SET MODULE / SET ALIAS and CONFIGURE compilation.

use serde_json::json;

use crate::compiler::Compiler;
use crate::config::{self, ConfigScope, OpCode, Operation};
use crate::context::CompileContext;
use crate::dbstate::{CompiledStatement, CompilerConnectionState, SessionStateResult, DEFAULT_MODULE};
use crate::error::{CompilerError, Result};
use crate::mql::ast::{ConfigSetOp, ConfigStmt, Expr, Literal, SessionStmt};
use crate::pg::quote_literal;

/// Upsert one alias row in the session state table.
fn alias_upsert_sql(alias: &str, module: &str) -> Vec<u8> {
    format!(
        "INSERT INTO _meridian_state(name, value, type) \
         VALUES ({alias}, {module}, 'A') \
         ON CONFLICT (name, type) DO UPDATE SET value = {module}",
        alias = quote_literal(alias),
        module = quote_literal(module),
    )
    .into_bytes()
}

impl Compiler {
    pub(crate) fn compile_ql_sess_state(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        stmt: &SessionStmt,
    ) -> Result<CompiledStatement> {
        let schema = state.current_tx().get_schema(self.std_schema());
        let mut aliases = state.current_tx().get_modaliases();
        let mut sqlbuf: Vec<Vec<u8>> = Vec::new();

        match stmt {
            SessionStmt::SetModule { module, span } => {
                if !schema.has_module(module) {
                    return Err(CompilerError::query_at(
                        format!("module {module:?} does not exist"),
                        *span,
                    ));
                }
                aliases.insert(None, module.clone());
                if !ctx.bootstrap_mode {
                    sqlbuf.push(alias_upsert_sql("", module));
                }
            }
            SessionStmt::SetAlias {
                alias,
                module,
                span,
            } => {
                if !schema.has_module(module) {
                    return Err(CompilerError::query_at(
                        format!("module {module:?} does not exist"),
                        *span,
                    ));
                }
                aliases.insert(Some(alias.clone()), module.clone());
                if !ctx.bootstrap_mode {
                    sqlbuf.push(alias_upsert_sql(alias, module));
                }
            }
            SessionStmt::ResetModule { .. } => {
                aliases.insert(None, DEFAULT_MODULE.to_string());
                if !ctx.bootstrap_mode {
                    sqlbuf.push(alias_upsert_sql("", DEFAULT_MODULE));
                }
            }
            SessionStmt::ResetAllAliases { .. } => {
                aliases = crate::dbstate::default_modaliases();
                if !ctx.bootstrap_mode {
                    sqlbuf.push(b"DELETE FROM _meridian_state s WHERE s.type = 'A'".to_vec());
                    sqlbuf.push(alias_upsert_sql("", DEFAULT_MODULE));
                }
            }
            SessionStmt::ResetAlias { alias, .. } => {
                aliases.remove(&Some(alias.clone()));
                if !ctx.bootstrap_mode {
                    sqlbuf.push(
                        format!(
                            "DELETE FROM _meridian_state s \
                             WHERE s.name = {} AND s.type = 'A'",
                            quote_literal(alias),
                        )
                        .into_bytes(),
                    );
                }
            }
        }

        state.current_tx_mut().update_modaliases(aliases);

        let sql = match sqlbuf.len() {
            0 => vec![b"SELECT NULL LIMIT 0".to_vec()],
            1 => vec![sqlbuf.remove(0)],
            _ => {
                // Batch multiple statements into one anonymous block.
                let mut body = String::new();
                for stmt in &sqlbuf {
                    body.push_str(std::str::from_utf8(stmt).expect("alias SQL is UTF-8"));
                    body.push_str(";\n");
                }
                vec![
                    format!("DO LANGUAGE plpgsql $$ BEGIN\n{body}END; $$")
                        .into_bytes(),
                ]
            }
        };

        Ok(CompiledStatement::SessionState(SessionStateResult {
            sql,
            config_scope: None,
            is_backend_setting: false,
            requires_restart: false,
            config_op: None,
        }))
    }

    pub(crate) fn compile_ql_config_op(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        stmt: &ConfigStmt,
    ) -> Result<CompiledStatement> {
        let _ = ctx;
        if stmt.scope == ConfigScope::System && !state.current_tx().is_implicit() {
            return Err(CompilerError::query_at(
                "CONFIGURE SYSTEM cannot be executed in a transaction block",
                stmt.span,
            ));
        }

        let registry = config::get_settings();
        let (name, value) = match &stmt.op {
            ConfigSetOp::Set { name, value } => (name, Some(value)),
            ConfigSetOp::Reset { name } => (name, None),
        };
        let spec = registry.get(name).ok_or_else(|| {
            CompilerError::query_at(format!("unrecognized configuration setting {name:?}"), stmt.span)
        })?;
        if spec.system && stmt.scope != ConfigScope::System {
            return Err(CompilerError::query_at(
                format!("{name:?} is a system-level setting and can only be set with CONFIGURE SYSTEM"),
                stmt.span,
            ));
        }

        // Evaluate the value expression to a constant config operation.
        // Complex expressions compile to backend SQL only.
        let config_op = match value {
            None => Some(Operation {
                opcode: OpCode::Reset,
                scope: stmt.scope,
                name: name.clone(),
                value: serde_json::Value::Null,
            }),
            Some(expr) => evaluate_config_value(expr).map(|value| Operation {
                opcode: OpCode::Set,
                scope: stmt.scope,
                name: name.clone(),
                value,
            }),
        };

        let sql = match (&config_op, spec.backend_setting) {
            (Some(op), Some(guc)) if op.opcode == OpCode::Set => {
                let rendered = match &op.value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                format!(
                    "SELECT pg_catalog.set_config({}, {}, false)",
                    quote_literal(guc),
                    quote_literal(&rendered),
                )
            }
            (Some(op), _) if op.opcode == OpCode::Reset => format!(
                "DELETE FROM _meridian_config WHERE name = {} AND scope = {}",
                quote_literal(name),
                quote_literal(&stmt.scope.to_string()),
            ),
            (Some(op), _) => format!(
                "INSERT INTO _meridian_config(name, value, scope) \
                 VALUES ({}, {}, {}) \
                 ON CONFLICT (name, scope) DO UPDATE SET value = excluded.value",
                quote_literal(name),
                quote_literal(&op.value.to_string()),
                quote_literal(&stmt.scope.to_string()),
            ),
            (None, _) => {
                // Not a simple constant: compile the value expression and
                // let the backend SQL carry the payload.
                let value = value.expect("non-constant op implies a SET value");
                let schema = state.current_tx().get_schema(self.std_schema());
                let select = crate::mql::ast::QueryStmt::Select {
                    expr: value.clone(),
                    filter: None,
                    limit: None,
                    span: stmt.span,
                };
                let ir = crate::ir::compile_ast_to_ir(
                    &select,
                    &schema,
                    &crate::ir::CompilerOptions {
                        modaliases: state.current_tx().get_modaliases(),
                        ..Default::default()
                    },
                )?;
                if !ir.params.is_empty() {
                    return Err(CompilerError::query_at(
                        "configuration values cannot reference parameters",
                        stmt.span,
                    ));
                }
                let (payload_sql, _) =
                    crate::pg::compile_ir_to_sql(&ir, &crate::pg::SqlCompileOptions::default());
                format!(
                    "SELECT meridian._apply_config({}, ({payload_sql}))",
                    quote_literal(name),
                )
            }
        };

        if stmt.scope == ConfigScope::Session {
            if let Some(op) = &config_op {
                let session_config =
                    op.apply(registry, state.current_tx().get_session_config())?;
                state.current_tx_mut().update_session_config(session_config);
            }
        }

        Ok(CompiledStatement::SessionState(SessionStateResult {
            sql: vec![sql.into_bytes()],
            config_scope: Some(stmt.scope),
            is_backend_setting: spec.backend_setting.is_some(),
            requires_restart: spec.requires_restart,
            config_op,
        }))
    }
}

/// Constant-evaluate a config value expression. `None` means the value is
/// not a simple constant and the backend SQL carries the payload instead.
fn evaluate_config_value(expr: &Expr) -> Option<serde_json::Value> {
    match expr {
        Expr::Literal(Literal::Int(v), _) => Some(json!(v)),
        Expr::Literal(Literal::Float(v), _) => Some(json!(v)),
        Expr::Literal(Literal::Str(v), _) => Some(json!(v)),
        Expr::Literal(Literal::Bool(v), _) => Some(json!(v)),
        Expr::SetLit(elements, _) | Expr::Array(elements, _) => elements
            .iter()
            .map(evaluate_config_value)
            .collect::<Option<Vec<_>>>()
            .map(serde_json::Value::Array),
        _ => None,
    }
}
