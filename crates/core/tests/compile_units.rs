mod common;

use common::*;

use meridiandb::enums::{Capability, Cardinality};
use meridiandb::error::CompilerError;
use meridiandb::mql::Source;
use meridiandb::Compiler;
use meridiandb_schema::ids::NULL_TYPE_ID;

#[test]
fn select_literal_single_mode() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let unit = compile_one(&compiler, &mut state, "SELECT 1");

    assert_eq!(unit.cardinality, Cardinality::One);
    assert!(unit.cacheable);
    assert!(!unit.sql_hash.is_empty());
    assert_eq!(unit.capabilities, Capability::empty());
    assert_eq!(unit.sql.len(), 1);
    assert_ne!(unit.out_type_id, NULL_TYPE_ID);
}

#[test]
fn insert_consumes_modifications() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let unit = compile_one(&compiler, &mut state, "INSERT User { name := 'ada' }");

    assert!(unit.capabilities.contains(Capability::MODIFICATIONS));
    assert_eq!(unit.cardinality, Cardinality::One);
    assert!(unit.cacheable);
}

#[test]
fn transaction_script_splits_on_commit() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let units = compile_script(&compiler, &mut state, "START TRANSACTION; SELECT 1; COMMIT;");

    // START TRANSACTION does not demand its own unit, so the SELECT joins
    // it; COMMIT always stands alone.
    assert_eq!(units.len(), 2);

    let first = &units[0];
    assert!(first.tx_id.is_some());
    assert!(!first.cacheable);
    assert!(first.capabilities.contains(Capability::TRANSACTION));
    assert_eq!(first.cardinality, Cardinality::NoResult);
    assert_eq!(first.sql.len(), 2);

    let commit = &units[1];
    assert!(commit.tx_commit);
    assert!(!commit.tx_rollback);
    assert_eq!(commit.sql, vec![b"COMMIT".to_vec()]);
    // The committed post-state travels with the unit.
    assert!(commit.user_schema.is_some());
}

#[test]
fn savepoint_roundtrip_restores_the_declared_state() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "START TRANSACTION;");

    let units = compile_script(&compiler, &mut state, "DECLARE SAVEPOINT s1;");
    assert_eq!(units.len(), 1);
    let declared_aliases = state.current_tx().get_modaliases();

    // Mutate session state past the savepoint.
    compile_script(&compiler, &mut state, "SET ALIAS d AS MODULE default;");
    assert_ne!(state.current_tx().get_modaliases(), declared_aliases);

    let units = compile_script(&compiler, &mut state, "ROLLBACK TO SAVEPOINT s1;");
    assert_eq!(units.len(), 1);
    assert!(units[0].tx_savepoint_rollback);
    assert_eq!(state.current_tx().get_modaliases(), declared_aliases);
}

#[test]
fn configure_system_in_transaction_is_rejected() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "START TRANSACTION;");

    let err = compiler
        .compile(
            &mut state,
            &script_ctx(),
            &Source::from_string("CONFIGURE SYSTEM SET listen_port := 5656;"),
        )
        .unwrap_err();
    let CompilerError::Query(err) = err else {
        panic!("expected a query error, got {err:?}");
    };
    assert_eq!(
        err.message,
        "CONFIGURE SYSTEM cannot be executed in a transaction block"
    );
}

#[test]
fn configure_session_applies_to_the_frame() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let units = compile_script(
        &compiler,
        &mut state,
        "CONFIGURE SESSION SET apply_access_policies := false;",
    );
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert!(unit.has_set);
    assert_eq!(unit.config_ops.len(), 1);
    assert!(!unit.cacheable);
    assert_eq!(
        state
            .current_tx()
            .get_session_config()
            .get("apply_access_policies"),
        Some(&serde_json::json!(false))
    );
}

#[test]
fn backend_settings_are_flagged() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let units = compile_script(
        &compiler,
        &mut state,
        "CONFIGURE SESSION SET query_work_mem := '64MB';",
    );
    assert!(units[0].backend_config);
    assert!(!units[0].config_requires_restart);

    let units = compile_script(
        &compiler,
        &mut state,
        "CONFIGURE SYSTEM SET listen_port := 5656;",
    );
    assert!(units[0].system_config);
    assert!(units[0].config_requires_restart);
}

#[test]
fn set_module_validates_the_module() {
    let compiler = Compiler::new();
    let mut state = new_state();

    let err = compiler
        .compile(
            &mut state,
            &script_ctx(),
            &Source::from_string("SET MODULE nosuch;"),
        )
        .unwrap_err();
    assert!(err.to_string().contains("does not exist"));

    let units = compile_script(&compiler, &mut state, "SET ALIAS d AS MODULE default;");
    assert!(units[0].modaliases.is_some());
    assert!(units[0].has_set);
    assert!(!units[0].cacheable);
}

#[test]
fn ddl_unit_carries_new_types_and_updates_the_schema() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let before = state.current_tx().get_user_schema().len();

    let units = compile_script(
        &compiler,
        &mut state,
        "CREATE TYPE default::Widget { CREATE REQUIRED PROPERTY label -> std::str; };",
    );
    assert_eq!(units.len(), 1);
    let unit = &units[0];
    assert!(unit.capabilities.contains(Capability::DDL));
    assert!(unit.has_ddl());
    assert_eq!(unit.new_types.len(), 1);
    assert!(unit.ddl_stmt_id.is_some());
    let sql = String::from_utf8(unit.sql[0].clone()).unwrap();
    assert!(sql.contains("CREATE TABLE \"default::Widget\""));
    // The reflection helper for CREATE is defined and invoked.
    assert!(sql.contains("__rh_"));
    assert!(sql.contains("PERFORM"));

    assert_eq!(state.current_tx().get_user_schema().len(), before + 1);
    assert!(state.current_tx().get_cached_reflection_if_updated().is_some());
}

#[test]
fn reflection_helpers_are_cached_per_fragment_shape() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "CREATE TYPE default::A;");
    let first = state.current_tx().get_cached_reflection();
    compile_script(&compiler, &mut state, "CREATE TYPE default::B;");
    let second = state.current_tx().get_cached_reflection();
    // Same fragment shape: the second CREATE reuses the cached helper.
    assert_eq!(first.len(), 1);
    assert_eq!(second.len(), 1);
}

#[test]
fn drop_database_is_non_transactional_and_single_unit() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "CREATE DATABASE staging;");

    let units = compile_script(
        &compiler,
        &mut state,
        "SELECT 1; DROP DATABASE staging; SELECT 2;",
    );
    assert_eq!(units.len(), 3);
    let drop = &units[1];
    assert!(!drop.is_transactional);
    assert_eq!(drop.drop_db.as_deref(), Some("staging"));
    assert!(drop.capabilities.contains(Capability::DDL));
}

#[test]
fn role_ddl_is_marked() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let units = compile_script(&compiler, &mut state, "CREATE SUPERUSER ROLE admin;");
    assert!(units[0].has_role_ddl);
}

#[test]
fn single_mode_rejects_scripts() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let err = compiler
        .compile(
            &mut state,
            &single_ctx(),
            &Source::from_string("SELECT 1; SELECT 2;"),
        )
        .unwrap_err();
    assert!(matches!(err, CompilerError::Protocol(_)));
    assert!(err.to_string().contains("expected one statement, got 2"));
}

#[test]
fn scripts_with_parameters_are_rejected() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let err = compiler
        .compile(
            &mut state,
            &script_ctx(),
            &Source::from_string("SELECT <str>$who; SELECT 2;"),
        )
        .unwrap_err();
    assert!(err.to_string().contains("cannot accept parameters"));
}

#[test]
fn skip_first_compiles_the_tail() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let units = compiler
        .compile(
            &mut state,
            &skip_first_ctx(),
            &Source::from_string("SELECT 1; SELECT 2; SELECT 3;"),
        )
        .unwrap();
    let total_statements: usize = units.iter().map(|u| u.sql.len()).sum();
    assert_eq!(total_statements, 2);
}

#[test]
fn skip_first_requires_statements() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let err = compiler
        .compile(&mut state, &skip_first_ctx(), &Source::from_string(""))
        .unwrap_err();
    assert!(matches!(err, CompilerError::Protocol(_)));
}

#[test]
fn normalized_sources_share_prepared_statements() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let a = compiler
        .compile(
            &mut state,
            &single_ctx(),
            &Source::from_string_normalized("SELECT 1"),
        )
        .unwrap();
    let b = compiler
        .compile(
            &mut state,
            &single_ctx(),
            &Source::from_string_normalized("SELECT 2"),
        )
        .unwrap();
    assert_eq!(a[0].sql, b[0].sql);
    assert_eq!(a[0].sql_hash, b[0].sql_hash);
    // The extracted constant is not part of the client-facing arguments.
    assert!(a[0].in_type_args.is_none());
}

#[test]
fn syntax_errors_on_normalized_sources_retry_the_original() {
    let compiler = Compiler::new();
    let mut state = new_state();
    let tx_before = state.current_tx().id();
    let err = compiler
        .compile(
            &mut state,
            &single_ctx(),
            &Source::from_string_normalized("SELECT 'a' +"),
        )
        .unwrap_err();
    assert!(err.is_syntax_error());
    // Failed compiles leave no state mutations behind.
    assert_eq!(state.current_tx().id(), tx_before);
}

#[test]
fn rollback_fast_path() {
    let compiler = Compiler::new();
    let mut state = new_state();
    compile_script(&compiler, &mut state, "START TRANSACTION;");

    let (units, total) = compiler
        .try_compile_rollback(&mut state, "ROLLBACK; SELECT 1;")
        .unwrap();
    assert_eq!(total, 2);
    assert_eq!(units.len(), 1);
    assert!(units[0].tx_rollback);
    assert!(state.current_tx().is_implicit());

    let err = compiler
        .try_compile_rollback(&mut state, "SELECT 1;")
        .unwrap_err();
    assert!(matches!(err, CompilerError::Protocol(_)));
}

#[test]
fn capability_titles_cover_every_unit_flag() {
    // The rejection message names the first violating member.
    let used = Capability::TRANSACTION | Capability::PERSISTENT_CONFIG;
    let msg = used
        .violation_message(Capability::TRANSACTION, "blocked by policy")
        .unwrap();
    assert_eq!(msg, "cannot execute configuration commands: blocked by policy");
}
