//! The executable unit model.

use std::collections::BTreeSet;

use uuid::Uuid;

use meridiandb_schema::ids::{EMPTY_TUPLE_ID, NULL_TYPE_ID};
use meridiandb_schema::SchemaSnapshot;
use meridiandb_wire::descriptor::empty_tuple_descriptor;
use meridiandb_wire::Cardinality;

use crate::config::Operation;
use crate::dbstate::{Modaliases, Param, ReflectionCache};
use crate::enums::Capability;
use crate::error::{CompilerError, Result};

/// One executable unit: a group of backend statements that the host runs
/// as a whole, plus everything it needs to know about them.
#[derive(Debug, Clone)]
pub struct QueryUnit {
    pub sql: Vec<Vec<u8>>,

    /// Status line of the last statement in the unit, returned to the
    /// front end on successful completion.
    pub status: Vec<u8>,

    /// Content hash, set only when the unit is cacheable as a backend
    /// prepared statement.
    pub sql_hash: Vec<u8>,

    /// When false, every statement executes outside of any backend
    /// transaction.
    pub is_transactional: bool,

    pub capabilities: Capability,

    /// This unit contains SET commands.
    pub has_set: bool,

    /// This unit contains CREATE/ALTER/DROP ROLE.
    pub has_role_ddl: bool,

    /// Set when the unit opens a new transaction.
    pub tx_id: Option<u64>,

    /// COMMIT and ROLLBACK are always compiled into their own unit; at
    /// most one of these three is set.
    pub tx_commit: bool,
    pub tx_rollback: bool,
    pub tx_savepoint_rollback: bool,

    pub cacheable: bool,

    /// Database about to be created/dropped; side effects for the fleet.
    pub create_db: Option<String>,
    pub drop_db: Option<String>,

    /// Set when the DDL statement will emit data packets marked with this
    /// id.
    pub ddl_stmt_id: Option<String>,

    /// Ids of types introduced by DDL in this unit.
    pub new_types: BTreeSet<String>,

    /// NO_RESULT when the unit represents multiple queries compiled as
    /// one script.
    pub cardinality: Cardinality,

    pub out_type_id: Uuid,
    pub out_type_data: Vec<u8>,
    pub in_type_id: Uuid,
    pub in_type_data: Vec<u8>,
    pub in_type_args: Option<Vec<Param>>,

    /// CONFIGURE SYSTEM / CONFIGURE DATABASE markers.
    pub system_config: bool,
    pub database_config: bool,
    /// A changed setting maps onto a backend setting.
    pub backend_config: bool,
    pub config_requires_restart: bool,
    pub config_ops: Vec<Operation>,
    pub modaliases: Option<Modaliases>,

    /// The future schema state after the unit runs, when the host needs
    /// to ship it across a worker boundary.
    pub user_schema: Option<SchemaSnapshot>,
    pub global_schema: Option<SchemaSnapshot>,
    pub cached_reflection: Option<ReflectionCache>,
}

impl Default for QueryUnit {
    fn default() -> Self {
        let (in_type_data, in_type_id) = empty_tuple_descriptor();
        Self {
            sql: Vec::new(),
            status: Vec::new(),
            sql_hash: Vec::new(),
            is_transactional: true,
            capabilities: Capability::empty(),
            has_set: false,
            has_role_ddl: false,
            tx_id: None,
            tx_commit: false,
            tx_rollback: false,
            tx_savepoint_rollback: false,
            cacheable: false,
            create_db: None,
            drop_db: None,
            ddl_stmt_id: None,
            new_types: BTreeSet::new(),
            cardinality: Cardinality::NoResult,
            out_type_id: NULL_TYPE_ID,
            out_type_data: Vec::new(),
            in_type_id: EMPTY_TUPLE_ID,
            in_type_data,
            in_type_args: None,
            system_config: false,
            database_config: false,
            backend_config: false,
            config_requires_restart: false,
            config_ops: Vec::new(),
            modaliases: None,
            user_schema: None,
            global_schema: None,
            cached_reflection: None,
        }
    }
}

impl QueryUnit {
    pub fn has_ddl(&self) -> bool {
        self.capabilities.contains(Capability::DDL)
    }

    /// The assembly-time sanity gate. A violation here is a compiler bug,
    /// never the user's fault.
    pub fn sanity_check(&self) -> Result<()> {
        if self.cacheable && (!self.config_ops.is_empty() || self.modaliases.is_some()) {
            return Err(CompilerError::internal(format!(
                "QueryUnit {:?} is cacheable but has config/aliases",
                self.status
            )));
        }
        if self.sql.is_empty() {
            return Err(CompilerError::internal(format!(
                "QueryUnit {:?} has no SQL commands in it",
                self.status
            )));
        }
        if self.cardinality != Cardinality::NoResult
            && (self.sql.len() > 1
                || self.tx_commit
                || self.tx_rollback
                || self.tx_savepoint_rollback
                || self.out_type_id == NULL_TYPE_ID
                || self.system_config
                || !self.config_ops.is_empty()
                || self.modaliases.is_some()
                || self.has_set
                || self.has_ddl()
                || self.sql_hash.is_empty())
        {
            return Err(CompilerError::internal(format!(
                "unit has invalid cardinality: {:?}",
                self.status
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data_unit() -> QueryUnit {
        QueryUnit {
            sql: vec![b"SELECT 1".to_vec()],
            status: b"SELECT".to_vec(),
            sql_hash: b"abc".to_vec(),
            cardinality: Cardinality::One,
            out_type_id: Uuid::from_u128(0x101),
            cacheable: true,
            ..Default::default()
        }
    }

    #[test]
    fn defaults_use_the_canonical_descriptors() {
        let unit = QueryUnit::default();
        assert_eq!(unit.out_type_id, NULL_TYPE_ID);
        assert!(unit.out_type_data.is_empty());
        assert_eq!(unit.in_type_id, EMPTY_TUPLE_ID);
        assert_eq!(unit.in_type_data, empty_tuple_descriptor().0);
    }

    #[test]
    fn data_unit_passes_the_gate() {
        assert!(data_unit().sanity_check().is_ok());
    }

    #[test]
    fn cacheable_unit_must_not_carry_config() {
        let mut unit = data_unit();
        unit.modaliases = Some(crate::dbstate::default_modaliases());
        assert!(unit.sanity_check().is_err());
    }

    #[test]
    fn data_unit_requires_a_hash_and_single_statement() {
        let mut unit = data_unit();
        unit.sql_hash.clear();
        assert!(unit.sanity_check().is_err());

        let mut unit = data_unit();
        unit.sql.push(b"SELECT 2".to_vec());
        assert!(unit.sanity_check().is_err());
    }

    #[test]
    fn tx_flags_force_no_result() {
        let mut unit = data_unit();
        unit.tx_commit = true;
        assert!(unit.sanity_check().is_err());
    }

    #[test]
    fn empty_sql_is_rejected() {
        let unit = QueryUnit::default();
        assert!(unit.sanity_check().is_err());
    }
}
