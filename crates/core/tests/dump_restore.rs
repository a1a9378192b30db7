mod common;

use common::*;

use meridiandb::dump::CURRENT_DUMP_VER;
use meridiandb::Compiler;
use meridiandb_wire::descriptor::{parse, TypeDesc};
use meridiandb_wire::ProtocolVersion;

#[test]
fn dump_describes_every_stored_table() {
    let compiler = Compiler::new();
    let state = new_state();
    let dump = compiler.describe_database_dump(&state).unwrap();

    assert!(dump.schema_ddl.contains("CREATE TYPE default::User"));
    assert!(dump
        .schema_ids
        .iter()
        .any(|(name, class, _)| name == "default::User" && class == "ObjectType"));

    // One block for the object table, one for the multi link.
    assert_eq!(dump.blocks.len(), 2);
    let main = &dump.blocks[0];
    let copy = String::from_utf8(main.sql_copy_stmt.clone()).unwrap();
    assert!(copy.starts_with("COPY \"default::User\""));
    assert!(copy.contains("TO STDOUT"));

    // Dump descriptors parse and agree with their recorded ids.
    for block in &dump.blocks {
        let parsed = parse(&block.type_desc, ProtocolVersion::CURRENT).unwrap();
        assert_eq!(parsed.type_id(), block.type_desc_id);
        let TypeDesc::Shape { elements, .. } = parsed else {
            panic!("block descriptors are shapes");
        };
        assert!(!elements.is_empty());
    }

    let link = &dump.blocks[1];
    assert_eq!(link.schema_deps, vec![main.schema_object_id]);
}

#[test]
fn restore_pins_object_ids_and_rebuilds_copy_statements() {
    let compiler = Compiler::new();
    let source_state = new_state();
    let dump = compiler.describe_database_dump(&source_state).unwrap();

    // Restore into a fresh, empty database.
    let mut target_state = empty_state();
    let restore = compiler
        .describe_database_restore(
            &mut target_state,
            CURRENT_DUMP_VER,
            &dump.schema_ddl,
            &dump.schema_ids,
            &dump.blocks,
        )
        .unwrap();

    assert!(!restore.units.is_empty());
    assert_eq!(restore.blocks.len(), dump.blocks.len());
    assert_eq!(restore.tables, vec!["default::User", "default::User.friends"]);

    let copy = String::from_utf8(restore.blocks[0].sql_copy_stmt.clone()).unwrap();
    assert!(copy.contains("FROM STDIN"));

    // Ids were pinned: the restored type has the dumped id.
    let restored = target_state.current_tx().get_user_schema();
    let user = restored
        .get_by_name(&"default::User".parse().unwrap())
        .unwrap();
    let dumped_id = dump
        .schema_ids
        .iter()
        .find(|(name, _, _)| name == "default::User")
        .map(|(_, _, id)| uuid::Uuid::from_bytes(*id))
        .unwrap();
    assert_eq!(user.id, dumped_id);
}

#[test]
fn old_dump_versions_record_elided_columns() {
    let compiler = Compiler::new();
    let source_state = new_state();
    let dump = compiler.describe_database_dump(&source_state).unwrap();

    let mut target_state = empty_state();
    let restore = compiler
        .describe_database_restore(
            &mut target_state,
            1,
            &dump.schema_ddl,
            &dump.schema_ids,
            &dump.blocks,
        )
        .unwrap();
    for block in &restore.blocks {
        assert!(block
            .compat_elided_cols
            .iter()
            .any(|c| c == "ptr_item_id"));
    }
}

#[test]
fn future_dump_versions_are_rejected() {
    let compiler = Compiler::new();
    let mut state = empty_state();
    let err = compiler
        .describe_database_restore(&mut state, CURRENT_DUMP_VER + 1, "", &[], &[])
        .unwrap_err();
    assert!(err.to_string().contains("unsupported dump version"));
}

fn empty_state() -> meridiandb::CompilerConnectionState {
    use meridiandb::dbstate::{default_modaliases, ConfigMap, ReflectionCache};
    meridiandb::CompilerConnectionState::new(
        meridiandb_schema::SchemaSnapshot::new(),
        meridiandb_schema::SchemaSnapshot::new(),
        default_modaliases(),
        ConfigMap::new(),
        ConfigMap::new(),
        ConfigMap::new(),
        ReflectionCache::new(),
    )
}
