//! The migration state machine: START / POPULATE / DESCRIBE / ALTER
//! (reject proposed) / COMMIT / ABORT.

use std::collections::BTreeSet;

use uuid::Uuid;

use meridiandb_schema::diff::statements_from_delta;
use meridiandb_schema::{DeltaGuidance, DeltaOp};

use crate::compiler::Compiler;
use crate::context::CompileContext;
use crate::dbstate::{
    CompiledStatement, CompilerConnectionState, MigrationControlResult, MigrationState,
    ProposedMigrationStep,
};
use crate::ddl::{apply_sdl, ddlast_from_delta};
use crate::enums::MigrationAction;
use crate::error::{CompilerError, QueryError, Result, Span};
use crate::mql::ast::{DdlStatement, DescribeLanguage, MigrationStmt, QueryStmt, Statement, TxStmt};
use crate::mql::{generate_source, quote_literal};

const EMPTY_RESULT_SQL: &[u8] = b"SELECT NULL LIMIT 0";

fn not_in_migration(command: &str, span: Span) -> CompilerError {
    CompilerError::Query(
        QueryError::new(format!(
            "unexpected {command}: not currently in a migration block"
        ))
        .with_span(span),
    )
}

fn parse_describe_query(text: &str) -> Result<QueryStmt> {
    match crate::mql::parse(text)? {
        Statement::Query(q) => Ok(q),
        _ => Err(CompilerError::internal(
            "DESCRIBE payload did not parse as a query",
        )),
    }
}

impl Compiler {
    pub(crate) fn compile_ql_migration(
        &self,
        state: &mut CompilerConnectionState,
        ctx: &CompileContext,
        stmt: &MigrationStmt,
    ) -> Result<CompiledStatement> {
        match stmt {
            MigrationStmt::StartMigration { target, span } => {
                let user_schema = state.current_tx().get_user_schema();

                let (savepoint_name, tx_cmd) = if state.current_tx().is_implicit() {
                    (
                        None,
                        TxStmt::Start {
                            isolation: None,
                            access: None,
                            deferrable: None,
                            span: *span,
                        },
                    )
                } else {
                    let name = Uuid::new_v4().to_string();
                    (
                        Some(name.clone()),
                        TxStmt::DeclareSavepoint { name, span: *span },
                    )
                };
                let tx_query = self.compile_ql_transaction(state, ctx, &tx_cmd)?;

                let target_schema =
                    apply_sdl(target, &user_schema, self.std_schema(), *span)?;

                state.current_tx_mut().update_migration_state(Some(MigrationState {
                    parent_migration: user_schema.last_migration().cloned(),
                    initial_schema: user_schema,
                    initial_savepoint: savepoint_name,
                    target_schema,
                    guidance: DeltaGuidance::default(),
                    accepted_cmds: Vec::new(),
                    last_proposed: None,
                }));

                Ok(CompiledStatement::MigrationControl(MigrationControlResult {
                    sql: tx_query.sql,
                    action: MigrationAction::Start,
                    tx_action: Some(tx_query.action),
                    cacheable: false,
                    modaliases: None,
                    single_unit: tx_query.single_unit,
                    new_types: BTreeSet::new(),
                    ddl_stmt_id: None,
                }))
            }

            MigrationStmt::PopulateMigration { span } => {
                let Some(mstate) = state.current_tx().get_migration_state().cloned() else {
                    return Err(not_in_migration("POPULATE MIGRATION", *span));
                };
                let user_schema = state.current_tx().get_user_schema();

                let diff = user_schema.diff(&mstate.target_schema, &mstate.guidance, false);
                let new_ddl = ddlast_from_delta(&diff, &user_schema, &mstate.target_schema);
                tracing::debug!(commands = new_ddl.len(), "populate migration diff");

                let new_user = user_schema
                    .apply(&diff)
                    .map_err(|e| CompilerError::Query(QueryError::new(e.to_string()).with_span(*span)))?;

                let mut mstate = mstate;
                mstate.accepted_cmds.extend(new_ddl);
                mstate.last_proposed = None;
                let tx = state.current_tx_mut();
                tx.update_migration_state(Some(mstate));
                tx.update_user_schema(new_user);

                Ok(CompiledStatement::MigrationControl(MigrationControlResult {
                    sql: vec![EMPTY_RESULT_SQL.to_vec()],
                    action: MigrationAction::Populate,
                    tx_action: None,
                    cacheable: false,
                    modaliases: None,
                    single_unit: false,
                    new_types: BTreeSet::new(),
                    ddl_stmt_id: None,
                }))
            }

            MigrationStmt::DescribeCurrentMigration { language, span } => {
                let Some(mstate) = state.current_tx().get_migration_state().cloned() else {
                    return Err(not_in_migration("DESCRIBE CURRENT MIGRATION", *span));
                };

                match language {
                    DescribeLanguage::Ddl => {
                        let text = mstate
                            .accepted_cmds
                            .iter()
                            .map(generate_source)
                            .collect::<Vec<_>>()
                            .join(";\n");
                        let description = if text.is_empty() {
                            text
                        } else {
                            format!("{text};")
                        };
                        let query =
                            parse_describe_query(&format!("SELECT {}", quote_literal(&description)))?;
                        self.compile_ql_query(state, ctx, None, &query, false)
                    }
                    DescribeLanguage::Json => {
                        let user_schema = state.current_tx().get_user_schema();

                        let confirmed: Vec<String> = mstate
                            .accepted_cmds
                            .iter()
                            .map(|cmd| generate_source(cmd) + ";")
                            .collect();

                        let guided_diff =
                            user_schema.diff(&mstate.target_schema, &mstate.guidance, true);
                        let auto_diff = user_schema.diff(
                            &mstate.target_schema,
                            &DeltaGuidance::default(),
                            false,
                        );
                        let proposed_ddl = statements_from_delta(
                            &user_schema,
                            &mstate.target_schema,
                            &guided_diff,
                        );

                        let proposed_desc = if let (Some(first), Some(top)) =
                            (proposed_ddl.first(), guided_diff.top_command())
                        {
                            let annotations = top.annotations.clone().ok_or_else(|| {
                                CompilerError::internal(
                                    "guided diff command is missing its annotations",
                                )
                            })?;
                            let step = ProposedMigrationStep {
                                statements: vec![first.clone()],
                                confidence: annotations.confidence,
                                prompt: annotations.user_prompt,
                                prompt_id: annotations.op_id.clone(),
                                data_safe: top.is_data_safe(),
                                required_user_input: annotations.required_user_input,
                            };
                            let desc = serde_json::json!({
                                "statements": [{"text": first}],
                                "confidence": step.confidence,
                                "prompt": step.prompt,
                                "operation_id": annotations.op_id,
                                "data_safe": step.data_safe,
                            });
                            let mut mstate = mstate.clone();
                            mstate.last_proposed = Some(vec![step]);
                            state.current_tx_mut().update_migration_state(Some(mstate));
                            Some(desc)
                        } else {
                            None
                        };

                        let desc = serde_json::json!({
                            "parent": mstate
                                .parent_migration
                                .as_ref()
                                .map(|m| m.name.local().to_string())
                                .unwrap_or_else(|| "initial".to_string()),
                            "complete": auto_diff.is_empty(),
                            "confirmed": confirmed,
                            "proposed": proposed_desc,
                        });
                        let query = parse_describe_query(&format!(
                            "SELECT to_json({})",
                            quote_literal(&desc.to_string()),
                        ))?;
                        self.compile_ql_query(state, ctx, None, &query, false)
                    }
                }
            }

            MigrationStmt::AlterCurrentMigrationRejectProposed { span } => {
                let Some(mstate) = state.current_tx().get_migration_state().cloned() else {
                    return Err(not_in_migration("ALTER CURRENT MIGRATION", *span));
                };
                let user_schema = state.current_tx().get_user_schema();

                let diff = user_schema.diff(&mstate.target_schema, &mstate.guidance, true);
                let mut guidance = mstate.guidance.clone();
                if let Some(top) = diff.top_command() {
                    match top.op {
                        DeltaOp::Alter => {
                            guidance.banned_alters.insert((
                                top.metaclass,
                                (top.classname.clone(), top.new_name.clone()),
                            ));
                        }
                        DeltaOp::Create => {
                            guidance
                                .banned_creations
                                .insert((top.metaclass, top.classname.clone()));
                        }
                        DeltaOp::Delete => {
                            guidance
                                .banned_deletions
                                .insert((top.metaclass, top.classname.clone()));
                        }
                    }
                }

                let mut mstate = mstate;
                mstate.guidance = guidance;
                mstate.last_proposed = None;
                state.current_tx_mut().update_migration_state(Some(mstate));

                Ok(CompiledStatement::MigrationControl(MigrationControlResult {
                    sql: vec![EMPTY_RESULT_SQL.to_vec()],
                    action: MigrationAction::RejectProposed,
                    tx_action: None,
                    cacheable: false,
                    modaliases: None,
                    single_unit: false,
                    new_types: BTreeSet::new(),
                    ddl_stmt_id: None,
                }))
            }

            MigrationStmt::CommitMigration { span } => {
                let Some(mstate) = state.current_tx().get_migration_state().cloned() else {
                    return Err(not_in_migration("COMMIT MIGRATION", *span));
                };
                let user_schema = state.current_tx().get_user_schema();

                let outstanding =
                    user_schema.diff(&mstate.target_schema, &DeltaGuidance::default(), false);
                if !outstanding.is_empty() {
                    return Err(CompilerError::Query(
                        QueryError::new("cannot commit incomplete migration")
                            .with_span(*span)
                            .with_hint(
                                "Please finish the migration by specifying the remaining DDL \
                                 operations or run POPULATE MIGRATION to let the system populate \
                                 the outstanding DDL automatically.",
                            ),
                    ));
                }

                let create_migration = DdlStatement::CreateMigration {
                    name: None,
                    parent: mstate
                        .parent_migration
                        .as_ref()
                        .map(|m| m.name.local().to_string()),
                    body: mstate.accepted_cmds.clone(),
                    span: *span,
                };

                // Roll the schema back to the pre-migration snapshot; the
                // synthesized CREATE MIGRATION replays the accepted DDL.
                {
                    let tx = state.current_tx_mut();
                    tx.update_user_schema(mstate.initial_schema.clone());
                    tx.update_migration_state(None);
                }

                let ddl_query = self.compile_and_apply_ddl_stmt(state, ctx, &create_migration)?;

                let tx_cmd = if mstate.initial_savepoint.is_some() {
                    TxStmt::DeclareSavepoint {
                        name: Uuid::new_v4().to_string(),
                        span: *span,
                    }
                } else {
                    TxStmt::Commit { span: *span }
                };
                let tx_query = self.compile_ql_transaction(state, ctx, &tx_cmd)?;

                let mut sql = ddl_query.sql;
                sql.extend(tx_query.sql);

                Ok(CompiledStatement::MigrationControl(MigrationControlResult {
                    sql,
                    action: MigrationAction::Commit,
                    tx_action: Some(tx_query.action),
                    cacheable: false,
                    modaliases: None,
                    single_unit: true,
                    new_types: ddl_query.new_types,
                    ddl_stmt_id: ddl_query.ddl_stmt_id,
                }))
            }

            MigrationStmt::AbortMigration { span } => {
                let Some(mstate) = state.current_tx().get_migration_state().cloned() else {
                    return Err(not_in_migration("ABORT MIGRATION", *span));
                };

                let tx_cmd = match &mstate.initial_savepoint {
                    Some(name) => TxStmt::RollbackToSavepoint {
                        name: name.clone(),
                        span: *span,
                    },
                    None => TxStmt::Rollback { span: *span },
                };

                state.current_tx_mut().update_migration_state(None);
                let tx_query = self.compile_ql_transaction(state, ctx, &tx_cmd)?;
                Ok(CompiledStatement::TxControl(tx_query))
            }
        }
    }
}
