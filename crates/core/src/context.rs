//! Per-request compilation context.

use std::collections::HashMap;

use uuid::Uuid;

use meridiandb_schema::QualName;
use meridiandb_wire::ProtocolVersion;

use crate::enums::{InputFormat, InputLanguage, OutputFormat, StatementMode};

/// Settings for one compile request. The connection state is passed
/// alongside, not inside: the state is mutated in place while the context
/// stays immutable for the duration of the call.
#[derive(Debug, Clone)]
pub struct CompileContext {
    pub output_format: OutputFormat,
    pub input_format: InputFormat,
    pub input_language: InputLanguage,
    pub expected_cardinality_one: bool,
    pub stmt_mode: StatementMode,
    pub json_parameters: bool,
    pub schema_reflection_mode: bool,
    pub implicit_limit: u64,
    pub inline_typeids: bool,
    pub inline_typenames: bool,
    pub inline_objectids: bool,
    /// Fixed object ids, used by dump/restore to recreate a schema with
    /// identical ids.
    pub schema_object_ids: Option<HashMap<QualName, Uuid>>,
    /// Compatibility version of the client that produced the statement.
    pub compat_ver: Option<(u16, u16)>,
    pub bootstrap_mode: bool,
    pub internal_schema_mode: bool,
    pub standalone_mode: bool,
    pub protocol_version: ProtocolVersion,
}

impl Default for CompileContext {
    fn default() -> Self {
        Self {
            output_format: OutputFormat::Binary,
            input_format: InputFormat::Binary,
            input_language: InputLanguage::Mql,
            expected_cardinality_one: false,
            stmt_mode: StatementMode::All,
            json_parameters: false,
            schema_reflection_mode: false,
            implicit_limit: 0,
            inline_typeids: false,
            inline_typenames: false,
            inline_objectids: true,
            schema_object_ids: None,
            compat_ver: None,
            bootstrap_mode: false,
            internal_schema_mode: false,
            standalone_mode: false,
            protocol_version: ProtocolVersion::CURRENT,
        }
    }
}

impl CompileContext {
    /// The context for a single fully-described query.
    pub fn single(output_format: OutputFormat) -> Self {
        Self {
            output_format,
            stmt_mode: StatementMode::Single,
            ..Default::default()
        }
    }

    /// The context for a script.
    pub fn script() -> Self {
        Self::default()
    }

    pub fn native_out_format(&self) -> bool {
        self.output_format == OutputFormat::Binary
    }

    pub fn single_stmt_mode(&self) -> bool {
        self.stmt_mode == StatementMode::Single
    }

    /// Implicit id/__tid__/__tname__ fields are only injected for native
    /// binary output of a single statement.
    pub fn can_have_implicit_fields(&self) -> bool {
        self.native_out_format() && self.single_stmt_mode()
    }
}
