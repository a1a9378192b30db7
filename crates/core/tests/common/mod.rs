#![allow(dead_code)]

use uuid::Uuid;

use meridiandb::context::CompileContext;
use meridiandb::dbstate::{default_modaliases, CompilerConnectionState, ConfigMap, ReflectionCache};
use meridiandb::enums::{OutputFormat, StatementMode};
use meridiandb::mql::Source;
use meridiandb::units::QueryUnit;
use meridiandb::Compiler;
use meridiandb_schema::ids;
use meridiandb_schema::{ObjectData, ObjectType, Pointer, PointerKind, SchemaObject, SchemaSnapshot};

/// A user schema with the `default` module and a `default::User` type.
pub fn user_schema() -> SchemaSnapshot {
    let user_id = Uuid::from_u128(0xa1);
    let mut t = ObjectType::default();
    for (name, target, required, multi, kind) in [
        ("name", ids::STR_TYPE_ID, true, false, PointerKind::Property),
        ("age", ids::INT64_TYPE_ID, false, false, PointerKind::Property),
        ("friends", user_id, false, true, PointerKind::Link),
    ] {
        t.pointers.insert(
            name.into(),
            Pointer {
                id: Uuid::new_v4(),
                name: name.into(),
                kind,
                target,
                required,
                multi,
            },
        );
    }
    SchemaSnapshot::new()
        .inserted(SchemaObject::new(
            Uuid::from_u128(0xd0),
            "default::__module__".parse().unwrap(),
            ObjectData::Module,
        ))
        .unwrap()
        .inserted(SchemaObject::new(
            user_id,
            "default::User".parse().unwrap(),
            ObjectData::ObjectType(t),
        ))
        .unwrap()
}

pub fn new_state() -> CompilerConnectionState {
    CompilerConnectionState::new(
        user_schema(),
        SchemaSnapshot::new(),
        default_modaliases(),
        ConfigMap::new(),
        ConfigMap::new(),
        ConfigMap::new(),
        ReflectionCache::new(),
    )
}

pub fn single_ctx() -> CompileContext {
    CompileContext::single(OutputFormat::Binary)
}

pub fn script_ctx() -> CompileContext {
    CompileContext::script()
}

pub fn skip_first_ctx() -> CompileContext {
    CompileContext {
        stmt_mode: StatementMode::SkipFirst,
        ..CompileContext::script()
    }
}

pub fn compile_one(
    compiler: &Compiler,
    state: &mut CompilerConnectionState,
    text: &str,
) -> QueryUnit {
    let units = compiler
        .compile(state, &single_ctx(), &Source::from_string(text))
        .unwrap();
    assert_eq!(units.len(), 1, "SINGLE mode yields exactly one unit");
    units.into_iter().next().unwrap()
}

pub fn compile_script(
    compiler: &Compiler,
    state: &mut CompilerConnectionState,
    text: &str,
) -> Vec<QueryUnit> {
    compiler
        .compile(state, &script_ctx(), &Source::from_string(text))
        .unwrap()
}
