//! The compiler: statement dispatch, transaction control, and the unit
//! assembler.

use meridiandb_schema::{stdlib, SchemaSnapshot};

use crate::config::ConfigScope;
use crate::context::CompileContext;
use crate::dbstate::{CompiledStatement, CompilerConnectionState, TxControlResult};
use crate::enums::{Capability, StatementMode, TxAction};
use crate::error::{CompilerError, Result};
use crate::mql::ast::{Statement, TxStmt};
use crate::mql::Source;
use crate::pg::quote_ident;
use crate::status::get_status;
use crate::units::QueryUnit;

/// The compiler. Holds only the process-wide schema constants; all
/// per-connection state lives in [`CompilerConnectionState`] and is
/// passed into each call.
pub struct Compiler {
    std_schema: SchemaSnapshot,
    refl_schema: SchemaSnapshot,
}

impl Default for Compiler {
    fn default() -> Self {
        Self::new()
    }
}

impl Compiler {
    pub fn new() -> Self {
        Self {
            std_schema: stdlib::std_schema().clone(),
            refl_schema: stdlib::reflection_schema().clone(),
        }
    }

    pub(crate) fn std_schema(&self) -> &SchemaSnapshot {
        &self.std_schema
    }

    pub(crate) fn reflection_schema(&self) -> &SchemaSnapshot {
        &self.refl_schema
    }

    // ------------------------------------------------------------------
    // Transaction control

    pub(crate) fn compile_ql_transaction(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        stmt: &TxStmt,
    ) -> Result<TxControlResult> {
        let mut result = TxControlResult {
            sql: Vec::new(),
            action: TxAction::Start,
            cacheable: false,
            modaliases: None,
            single_unit: false,
            user_schema: None,
            global_schema: None,
            cached_reflection: None,
        };

        match stmt {
            TxStmt::Start {
                isolation,
                access,
                deferrable,
                ..
            } => {
                state.start_tx()?;
                let mut sql = String::from("START TRANSACTION");
                if let Some(isolation) = isolation {
                    sql.push_str(" ISOLATION LEVEL ");
                    sql.push_str(isolation.as_sql());
                }
                if let Some(access) = access {
                    sql.push(' ');
                    sql.push_str(access.as_sql());
                }
                if let Some(deferrable) = deferrable {
                    sql.push(' ');
                    sql.push_str(if *deferrable { "DEFERRABLE" } else { "NOT DEFERRABLE" });
                }
                result.sql.push(sql.into_bytes());
                result.action = TxAction::Start;
            }

            TxStmt::Commit { .. } => {
                let new_state = state.commit_tx()?;
                result.modaliases = Some(new_state.modaliases.clone());
                result.user_schema = Some(new_state.user_schema.clone());
                result.global_schema = Some(new_state.global_schema.clone());
                result.cached_reflection = Some(new_state.cached_reflection);
                result.sql.push(b"COMMIT".to_vec());
                result.action = TxAction::Commit;
                result.single_unit = true;
            }

            TxStmt::Rollback { .. } => {
                let new_state = state.rollback_tx();
                result.modaliases = Some(new_state.modaliases.clone());
                result.user_schema = Some(new_state.user_schema.clone());
                result.global_schema = Some(new_state.global_schema.clone());
                result.cached_reflection = Some(new_state.cached_reflection);
                result.sql.push(b"ROLLBACK".to_vec());
                result.action = TxAction::Rollback;
                result.single_unit = true;
            }

            TxStmt::DeclareSavepoint { name, .. } => {
                let sp_id = state.declare_savepoint(name)?;
                if !ctx.bootstrap_mode {
                    result.sql.push(
                        format!(
                            "INSERT INTO _meridian_current_savepoint(sp_id) \
                             VALUES ({sp_id}) \
                             ON CONFLICT (_sentinel) DO UPDATE SET sp_id = {sp_id}",
                        )
                        .into_bytes(),
                    );
                }
                result
                    .sql
                    .push(format!("SAVEPOINT {}", quote_ident(name)).into_bytes());
                result.action = TxAction::DeclareSavepoint;
            }

            TxStmt::ReleaseSavepoint { name, .. } => {
                state.release_savepoint(name)?;
                result
                    .sql
                    .push(format!("RELEASE SAVEPOINT {}", quote_ident(name)).into_bytes());
                result.action = TxAction::ReleaseSavepoint;
            }

            TxStmt::RollbackToSavepoint { name, .. } => {
                let new_state = state.rollback_to_savepoint(name)?;
                result.modaliases = Some(new_state.modaliases.clone());
                result
                    .sql
                    .push(format!("ROLLBACK TO SAVEPOINT {}", quote_ident(name)).into_bytes());
                result.action = TxAction::RollbackToSavepoint;
                result.single_unit = true;
            }
        }

        Ok(result)
    }

    // ------------------------------------------------------------------
    // Statement dispatch

    pub(crate) fn compile_dispatch_ql(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        source: Option<&Source>,
        stmt: &Statement,
    ) -> Result<(CompiledStatement, Capability)> {
        match stmt {
            Statement::Migration(m) => {
                let query = self.compile_ql_migration(state, ctx, m)?;
                let caps = match &query {
                    CompiledStatement::MigrationControl(_) => Capability::DDL,
                    // DESCRIBE CURRENT MIGRATION (and the ABORT rollback
                    // passthrough) consume nothing.
                    _ => Capability::empty(),
                };
                Ok((query, caps))
            }
            Statement::Ddl(ddl) => Ok((
                CompiledStatement::Ddl(self.compile_and_apply_ddl_stmt(state, ctx, ddl)?),
                Capability::DDL,
            )),
            Statement::Transaction(tx) => Ok((
                CompiledStatement::TxControl(self.compile_ql_transaction(state, ctx, tx)?),
                Capability::TRANSACTION,
            )),
            Statement::Session(s) => Ok((
                self.compile_ql_sess_state(state, ctx, s)?,
                Capability::SESSION_CONFIG,
            )),
            Statement::Config(c) => {
                let caps = if c.scope == ConfigScope::Session {
                    Capability::SESSION_CONFIG
                } else {
                    Capability::PERSISTENT_CONFIG
                };
                Ok((self.compile_ql_config_op(state, ctx, c)?, caps))
            }
            Statement::Query(q) => {
                let query = self.compile_ql_query(state, ctx, source, q, true)?;
                let has_dml = match &query {
                    CompiledStatement::Query(q) => q.has_dml,
                    CompiledStatement::SimpleQuery(q) => q.has_dml,
                    _ => false,
                };
                let caps = if has_dml {
                    Capability::MODIFICATIONS
                } else {
                    Capability::empty()
                };
                Ok((query, caps))
            }
        }
    }

    // ------------------------------------------------------------------
    // The unit assembler

    fn try_compile(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        source: &Source,
    ) -> Result<Vec<QueryUnit>> {
        let single_stmt_mode = ctx.single_stmt_mode();

        let mut statements = crate::mql::parse_block(source.text())?;
        let statements_len = statements.len();

        match ctx.stmt_mode {
            StatementMode::SkipFirst => {
                if statements.is_empty() {
                    return Err(CompilerError::Protocol(
                        "no statements to compile in SKIP_FIRST mode".into(),
                    ));
                }
                statements.remove(0);
            }
            StatementMode::Single if statements_len != 1 => {
                return Err(CompilerError::Protocol(format!(
                    "expected one statement, got {statements_len}"
                )));
            }
            _ => {}
        }
        if statements.is_empty() {
            return Err(CompilerError::Protocol("nothing to compile".into()));
        }

        let mut units: Vec<QueryUnit> = Vec::new();
        let mut unit: Option<QueryUnit> = None;

        for stmt in &statements {
            let (comp, capabilities) = self.compile_dispatch_ql(state, ctx, Some(source), stmt)?;

            if let Some(current) = unit.take() {
                if comp.single_unit() {
                    units.push(current);
                } else {
                    unit = Some(current);
                }
            }
            let u = unit.get_or_insert_with(QueryUnit::default);
            u.status = get_status(stmt);
            u.capabilities |= capabilities;

            if !comp.is_transactional() {
                if !comp.single_unit() {
                    return Err(CompilerError::internal(
                        "non-transactional compilation units must be single-unit",
                    ));
                }
                u.is_transactional = false;
            }

            let close = comp.single_unit();
            match comp {
                CompiledStatement::Query(q) => {
                    if single_stmt_mode {
                        u.sql = q.sql;
                        u.sql_hash = q.sql_hash;
                        u.out_type_data = q.out_type_data;
                        u.out_type_id = q.out_type_id;
                        u.in_type_data = q.in_type_data;
                        u.in_type_args = q.in_type_args;
                        u.in_type_id = q.in_type_id;
                        u.cacheable = q.cacheable;
                        u.cardinality = q.cardinality;
                    } else {
                        u.sql.extend(q.sql);
                    }
                }

                CompiledStatement::SimpleQuery(q) => {
                    debug_assert!(!single_stmt_mode);
                    u.sql.extend(q.sql);
                }

                CompiledStatement::Ddl(q) => {
                    u.sql.extend(q.sql);
                    u.new_types.extend(q.new_types);
                    u.create_db = q.create_db;
                    // A dropped database closes the unit via single_unit.
                    u.drop_db = q.drop_db;
                    u.has_role_ddl |= q.has_role_ddl;
                    if q.ddl_stmt_id.is_some() {
                        u.ddl_stmt_id = q.ddl_stmt_id;
                    }
                }

                CompiledStatement::TxControl(q) => {
                    u.sql.extend(q.sql);
                    u.cacheable = q.cacheable;
                    if let Some(modaliases) = q.modaliases {
                        u.modaliases = Some(modaliases);
                    }
                    if q.user_schema.is_some() {
                        u.user_schema = q.user_schema;
                        u.global_schema = q.global_schema;
                        u.cached_reflection = q.cached_reflection;
                    }
                    match q.action {
                        TxAction::Start => {
                            if u.tx_id.is_some() {
                                return Err(CompilerError::internal("already in transaction"));
                            }
                            u.tx_id = Some(state.current_tx().id());
                        }
                        TxAction::Commit => u.tx_commit = true,
                        TxAction::Rollback => u.tx_rollback = true,
                        TxAction::RollbackToSavepoint => u.tx_savepoint_rollback = true,
                        TxAction::DeclareSavepoint | TxAction::ReleaseSavepoint => {}
                    }
                }

                CompiledStatement::MigrationControl(q) => {
                    u.sql.extend(q.sql);
                    u.cacheable = q.cacheable;
                    u.new_types.extend(q.new_types);
                    if q.ddl_stmt_id.is_some() {
                        u.ddl_stmt_id = q.ddl_stmt_id;
                    }
                    if let Some(modaliases) = q.modaliases {
                        u.modaliases = Some(modaliases);
                    }
                    match q.tx_action {
                        Some(TxAction::Start) => {
                            if u.tx_id.is_some() {
                                return Err(CompilerError::internal("already in transaction"));
                            }
                            u.tx_id = Some(state.current_tx().id());
                        }
                        Some(TxAction::Commit) => u.tx_commit = true,
                        Some(TxAction::Rollback) => u.tx_rollback = true,
                        Some(TxAction::RollbackToSavepoint) => u.tx_savepoint_rollback = true,
                        _ => {}
                    }
                }

                CompiledStatement::SessionState(q) => {
                    u.sql.extend(q.sql);
                    match q.config_scope {
                        Some(ConfigScope::System) => {
                            if !state.current_tx().is_implicit() || statements_len > 1 {
                                return Err(CompilerError::query(
                                    "CONFIGURE SYSTEM cannot be executed in a transaction block",
                                ));
                            }
                            u.system_config = true;
                        }
                        Some(ConfigScope::Database) => u.database_config = true,
                        _ => {}
                    }
                    if q.is_backend_setting {
                        u.backend_config = true;
                    }
                    if q.requires_restart {
                        u.config_requires_restart = true;
                    }
                    if state.current_tx().is_implicit() {
                        u.modaliases = Some(state.current_tx().get_modaliases());
                    }
                    if let Some(op) = q.config_op {
                        u.config_ops.push(op);
                    }
                    u.has_set = true;
                }
            }

            if close {
                if let Some(current) = unit.take() {
                    units.push(current);
                }
            }
        }

        if let Some(current) = unit.take() {
            units.push(current);
        }

        if single_stmt_mode && units.len() != 1 {
            return Err(CompilerError::internal(format!(
                "expected 1 compiled unit; got {}",
                units.len()
            )));
        }

        for unit in &units {
            unit.sanity_check()?;
        }

        Ok(units)
    }

    /// Compile a source into executable units.
    ///
    /// When a normalized source fails with a syntax error, the compile is
    /// retried once against the original text; a retry that *succeeds*
    /// means normalization broke the query, which is our bug.
    #[tracing::instrument(skip_all)]
    pub fn compile(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        source: &Source,
    ) -> Result<Vec<QueryUnit>> {
        // Failed compiles must not leave partial state mutations behind.
        let saved = state.clone();
        match self.try_compile(state, ctx, source) {
            Ok(units) => Ok(units),
            Err(original_err) => {
                *state = saved;
                if original_err.is_syntax_error() && source.is_normalized() {
                    let saved = state.clone();
                    let original = source.denormalized();
                    match self.try_compile(state, ctx, &original) {
                        Err(denorm_err) if denorm_err.is_syntax_error() => {
                            *state = saved;
                            Err(denorm_err)
                        }
                        Err(_) => {
                            *state = saved;
                            Err(CompilerError::internal(
                                "normalized and non-normalized query errors differ",
                            ))
                        }
                        Ok(_) => {
                            *state = saved;
                            Err(CompilerError::internal(
                                "normalized query is broken while original is valid",
                            ))
                        }
                    }
                } else {
                    Err(original_err)
                }
            }
        }
    }

    /// Fast path for the server's failure handling: compile a script
    /// whose first statement is a ROLLBACK / ROLLBACK TO SAVEPOINT
    /// without entering the full pipeline. Returns the units plus the
    /// total statement count of the script.
    pub fn try_compile_rollback(
        &self,
        state: &mut CompilerConnectionState,
        text: &str,
    ) -> Result<(Vec<QueryUnit>, usize)> {
        let statements = crate::mql::parse_block(text)?;
        let Some(Statement::Transaction(tx)) = statements.first() else {
            return Err(CompilerError::Protocol(
                "expected a ROLLBACK statement".into(),
            ));
        };
        if !matches!(tx, TxStmt::Rollback { .. } | TxStmt::RollbackToSavepoint { .. }) {
            return Err(CompilerError::Protocol(
                "expected a ROLLBACK statement".into(),
            ));
        }
        let ctx = CompileContext::default();
        let result = self.compile_ql_transaction(state, &ctx, tx)?;
        let mut unit = QueryUnit {
            status: get_status(&statements[0]),
            capabilities: Capability::TRANSACTION,
            ..Default::default()
        };
        unit.sql.extend(result.sql);
        unit.tx_rollback = matches!(result.action, TxAction::Rollback);
        unit.tx_savepoint_rollback = matches!(result.action, TxAction::RollbackToSavepoint);
        unit.modaliases = result.modaliases;
        unit.sanity_check()?;
        Ok((vec![unit], statements.len()))
    }

    /// Map a backend error (SQLSTATE plus message) onto the compiler
    /// taxonomy. Catalog and authentication failures at connect time are
    /// rewrapped as authentication errors.
    pub fn interpret_backend_error(&self, sqlstate: &str, message: &str) -> CompilerError {
        match sqlstate.get(..2) {
            // invalid_authorization_specification, invalid_password
            Some("28") => CompilerError::Authentication(message.to_string()),
            // invalid_catalog_name: the database is gone or was never there
            Some("3D") => CompilerError::Authentication(format!(
                "cannot connect: {message}"
            )),
            // syntax_error_or_access_rule_violation against SQL we
            // generated is our bug, not the user's
            Some("42") => CompilerError::internal(format!(
                "backend rejected compiled SQL: {message} ({sqlstate})"
            )),
            _ => CompilerError::internal(format!("backend error {sqlstate}: {message}")),
        }
    }
}
