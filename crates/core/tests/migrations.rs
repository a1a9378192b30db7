mod common;

use common::*;

use meridiandb::error::CompilerError;
use meridiandb::mql::Source;
use meridiandb::Compiler;

const TARGET: &str = "START MIGRATION TO { \
    module default { \
        type User { required property name -> str; multi link friends -> User; } \
        type Team { required property title -> str; } \
    } \
};";

#[test]
fn full_migration_flow_from_implicit_tx() {
    let compiler = Compiler::new();
    let mut state = new_state();

    let script = format!("{TARGET} POPULATE MIGRATION; COMMIT MIGRATION;");
    let units = compile_script(&compiler, &mut state, &script);

    // START MIGRATION opens a backend transaction and accumulates with
    // POPULATE; COMMIT MIGRATION closes its own unit.
    assert_eq!(units.len(), 2);
    let first = &units[0];
    assert!(first.tx_id.is_some());
    assert_eq!(first.sql[0], b"START TRANSACTION".to_vec());

    let commit = &units[1];
    assert!(commit.tx_commit);
    let ddl_sql = String::from_utf8(commit.sql[0].clone()).unwrap();
    assert!(ddl_sql.contains("CREATE TABLE \"default::Team\""));
    assert_eq!(commit.sql.last().unwrap(), &b"COMMIT".to_vec());
    assert!(!commit.new_types.is_empty());

    // The migration is recorded and the schema reached the target.
    let user = state.current_tx().get_user_schema();
    assert!(user.last_migration().is_some());
    assert!(user
        .get_by_name(&"default::Team".parse().unwrap())
        .is_some());
    assert!(state.current_tx().is_implicit());
    assert!(state.current_tx().get_migration_state().is_none());
}

#[test]
fn populate_is_idempotent_once_complete() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);
    compile_script(&compiler, &mut state, "POPULATE MIGRATION;");
    let accepted = state
        .current_tx()
        .get_migration_state()
        .unwrap()
        .accepted_cmds
        .len();
    assert!(accepted > 0);

    compile_script(&compiler, &mut state, "POPULATE MIGRATION;");
    assert_eq!(
        state
            .current_tx()
            .get_migration_state()
            .unwrap()
            .accepted_cmds
            .len(),
        accepted,
        "populate on an empty diff must be a no-op"
    );
}

#[test]
fn commit_of_incomplete_migration_is_rejected_with_hint() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);

    let err = compiler
        .compile(
            &mut state,
            &script_ctx(),
            &Source::from_string("COMMIT MIGRATION;"),
        )
        .unwrap_err();
    let CompilerError::Query(err) = err else {
        panic!("expected QueryError, got {err:?}");
    };
    assert_eq!(err.message, "cannot commit incomplete migration");
    assert!(err.hint.as_deref().unwrap().contains("POPULATE MIGRATION"));
    assert!(err.span.is_some());
}

#[test]
fn migration_commands_outside_a_block_are_rejected() {
    let compiler = Compiler::new();
    for command in [
        "POPULATE MIGRATION;",
        "DESCRIBE CURRENT MIGRATION AS DDL;",
        "ALTER CURRENT MIGRATION REJECT PROPOSED;",
        "COMMIT MIGRATION;",
        "ABORT MIGRATION;",
    ] {
        let mut state = new_state();
        let err = compiler
            .compile(&mut state, &script_ctx(), &Source::from_string(command))
            .unwrap_err();
        assert!(
            err.to_string().contains("not currently in a migration block"),
            "{command}: {err}"
        );
        assert!(err.span().is_some(), "{command} must carry its span");
    }
}

#[test]
fn describe_as_ddl_returns_the_accepted_commands() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);
    compile_script(&compiler, &mut state, "POPULATE MIGRATION;");

    let units = compile_script(&compiler, &mut state, "DESCRIBE CURRENT MIGRATION AS DDL;");
    assert_eq!(units.len(), 1);
    let sql = String::from_utf8(units[0].sql[0].clone()).unwrap();
    assert!(sql.contains("CREATE TYPE default::Team"));
}

#[test]
fn describe_as_json_reports_completeness_and_proposals() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);

    // Before populating: incomplete, with a proposed step.
    let units = compile_script(&compiler, &mut state, "DESCRIBE CURRENT MIGRATION AS JSON;");
    let sql = String::from_utf8(units[0].sql[0].clone()).unwrap();
    assert!(sql.contains("\"complete\":false"));
    assert!(sql.contains("\"proposed\":{"));
    assert!(sql.contains("operation_id"));
    assert!(state
        .current_tx()
        .get_migration_state()
        .unwrap()
        .last_proposed
        .is_some());

    compile_script(&compiler, &mut state, "POPULATE MIGRATION;");
    let units = compile_script(&compiler, &mut state, "DESCRIBE CURRENT MIGRATION AS JSON;");
    let sql = String::from_utf8(units[0].sql[0].clone()).unwrap();
    assert!(sql.contains("\"complete\":true"));
    assert!(sql.contains("\"proposed\":null"));
}

#[test]
fn reject_proposed_bans_the_step() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);

    compile_script(
        &compiler,
        &mut state,
        "ALTER CURRENT MIGRATION REJECT PROPOSED;",
    );
    let mstate = state.current_tx().get_migration_state().unwrap().clone();
    let banned = mstate.guidance.banned_creations.len() + mstate.guidance.banned_alters.len();
    assert_eq!(banned, 1);

    // The rejected step is no longer proposed.
    let units = compile_script(&compiler, &mut state, "DESCRIBE CURRENT MIGRATION AS JSON;");
    let sql = String::from_utf8(units[0].sql[0].clone()).unwrap();
    let mstate = state.current_tx().get_migration_state().unwrap();
    if let Some(proposed) = &mstate.last_proposed {
        for step in proposed {
            assert!(!step.prompt_id.contains("Team") || !sql.contains("\"complete\":true"));
        }
    }
}

#[test]
fn migration_in_explicit_tx_brackets_with_savepoints() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "START TRANSACTION;");

    let units = compile_script(&compiler, &mut state, TARGET);
    // Bracketed by an auto-declared savepoint, not a new transaction.
    let sql = String::from_utf8(units[0].sql.last().unwrap().clone()).unwrap();
    assert!(sql.starts_with("SAVEPOINT "));
    let savepoint = state
        .current_tx()
        .get_migration_state()
        .unwrap()
        .initial_savepoint
        .clone()
        .expect("savepoint bracket");

    let units = compile_script(&compiler, &mut state, "ABORT MIGRATION;");
    let sql = String::from_utf8(units[0].sql[0].clone()).unwrap();
    assert!(sql.starts_with("ROLLBACK TO SAVEPOINT"));
    assert!(sql.contains(&savepoint));
    assert!(state.current_tx().get_migration_state().is_none());
}

#[test]
fn abort_from_implicit_start_emits_rollback() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);
    let units = compile_script(&compiler, &mut state, "ABORT MIGRATION;");
    assert!(units[0].tx_rollback);
    assert!(state.current_tx().is_implicit());
    assert!(state.current_tx().get_migration_state().is_none());
}

#[test]
fn ddl_inside_a_migration_block_accumulates() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, TARGET);

    let units = compile_script(
        &compiler,
        &mut state,
        "CREATE TYPE default::Team { CREATE REQUIRED PROPERTY title -> std::str; };",
    );
    // Accumulated, not executed: an empty-result unit.
    assert_eq!(units[0].sql, vec![b"SELECT NULL LIMIT 0".to_vec()]);
    let mstate = state.current_tx().get_migration_state().unwrap();
    assert_eq!(mstate.accepted_cmds.len(), 1);

    // The tentative schema already sees the new type, so the remaining
    // diff shrinks accordingly.
    assert!(state
        .current_tx()
        .get_user_schema()
        .get_by_name(&"default::Team".parse().unwrap())
        .is_some());
}
