//! Per-connection transactional compilation state.
//!
//! A connection owns a stack of transaction/savepoint frames, each carrying
//! full snapshots of the schema, module aliases, configuration, cached
//! reflection, and any in-progress migration. All of these are persistent
//! values: cloning a frame shares structure instead of copying, which is
//! what makes a frame per savepoint affordable.
//!
//! Invariants, mirrored by the tests at the bottom:
//!   - frame ids are monotonically increasing within a connection, and
//!     (because the counter is seeded from a wall-clock-derived value)
//!     unique across sequentially-created transactions;
//!   - an implicit transaction is promoted to explicit at most once;
//!   - savepoints exist only in explicit transactions;
//!   - rolling back to savepoint S drops every frame with id > S from both
//!     the transaction's map and the connection's global savepoints log.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use uuid::Uuid;

use meridiandb_schema::{DeltaGuidance, SchemaObject, SchemaSnapshot, SchemaView};
use meridiandb_wire::Cardinality;

use crate::config::{ConfigScope, Operation};
use crate::enums::{MigrationAction, TxAction};
use crate::error::TransactionError;
use crate::mql::ast::DdlStatement;

/// Alias name (`None` is the default module) to module name.
pub type Modaliases = im::HashMap<Option<String>, String>;
/// Setting name to value.
pub type ConfigMap = im::HashMap<String, serde_json::Value>;
/// Hex sha1 of a reflection fragment to the argument names of its helper.
pub type ReflectionCache = im::HashMap<String, Vec<String>>;

pub const DEFAULT_MODULE: &str = "default";

pub fn default_modaliases() -> Modaliases {
    im::HashMap::unit(None, DEFAULT_MODULE.to_string())
}

/// One proposed step of a guided migration diff.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedMigrationStep {
    pub statements: Vec<String>,
    pub confidence: f64,
    pub prompt: String,
    pub prompt_id: String,
    pub data_safe: bool,
    pub required_user_input: Vec<(String, String)>,
}

impl ProposedMigrationStep {
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::json!({
            "statements": self.statements.iter().map(|s| serde_json::json!({"text": s})).collect::<Vec<_>>(),
            "confidence": self.confidence,
            "prompt": self.prompt,
            "prompt_id": self.prompt_id,
            "data_safe": self.data_safe,
            "required_user_input": self.required_user_input.iter().map(|(name, desc)| serde_json::json!({
                "placeholder": name,
                "prompt": desc,
            })).collect::<Vec<_>>(),
        })
    }
}

/// Present only while a migration block is open.
#[derive(Debug, Clone)]
pub struct MigrationState {
    pub parent_migration: Option<Arc<SchemaObject>>,
    /// The user schema at START MIGRATION, for rollback.
    pub initial_schema: SchemaSnapshot,
    /// Auto-created when START MIGRATION ran inside an explicit tx.
    pub initial_savepoint: Option<String>,
    pub target_schema: SchemaSnapshot,
    pub guidance: DeltaGuidance,
    /// DDL accepted so far, user-written plus auto-proposed.
    pub accepted_cmds: Vec<DdlStatement>,
    pub last_proposed: Option<Vec<ProposedMigrationStep>>,
}

/// One frame of the transaction/savepoint stack. Flat, not chained: a
/// frame is self-contained and restoring it needs no parent walk.
#[derive(Debug, Clone)]
pub struct TransactionState {
    pub id: u64,
    pub name: Option<String>,
    pub user_schema: SchemaSnapshot,
    pub global_schema: SchemaSnapshot,
    pub modaliases: Modaliases,
    pub session_config: ConfigMap,
    pub database_config: ConfigMap,
    pub system_config: ConfigMap,
    pub cached_reflection: ReflectionCache,
    pub migration_state: Option<MigrationState>,
}

#[derive(Debug, Clone)]
pub struct Transaction {
    id: u64,
    implicit: bool,
    current: TransactionState,
    state0: TransactionState,
    savepoints: IndexMap<u64, TransactionState>,
}

impl Transaction {
    fn new(id: u64, state: TransactionState) -> Self {
        Self {
            id,
            implicit: true,
            state0: state.clone(),
            current: state,
            savepoints: IndexMap::new(),
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_implicit(&self) -> bool {
        self.implicit
    }

    fn make_explicit(&mut self) -> Result<(), TransactionError> {
        if self.implicit {
            self.implicit = false;
            Ok(())
        } else {
            Err(TransactionError::AlreadyInTransaction)
        }
    }

    pub fn current(&self) -> &TransactionState {
        &self.current
    }

    pub fn state0(&self) -> &TransactionState {
        &self.state0
    }

    pub fn get_schema(&self, std_schema: &SchemaSnapshot) -> SchemaView {
        SchemaView::new(
            std_schema.clone(),
            self.current.user_schema.clone(),
            self.current.global_schema.clone(),
        )
    }

    pub fn get_user_schema(&self) -> SchemaSnapshot {
        self.current.user_schema.clone()
    }

    pub fn get_global_schema(&self) -> SchemaSnapshot {
        self.current.global_schema.clone()
    }

    pub fn get_modaliases(&self) -> Modaliases {
        self.current.modaliases.clone()
    }

    pub fn get_session_config(&self) -> ConfigMap {
        self.current.session_config.clone()
    }

    pub fn get_database_config(&self) -> ConfigMap {
        self.current.database_config.clone()
    }

    pub fn get_system_config(&self) -> ConfigMap {
        self.current.system_config.clone()
    }

    pub fn get_cached_reflection(&self) -> ReflectionCache {
        self.current.cached_reflection.clone()
    }

    /// The reflection cache, but only if it changed since the transaction
    /// started; hosts use this to skip no-op state shipping.
    pub fn get_cached_reflection_if_updated(&self) -> Option<ReflectionCache> {
        if self.current.cached_reflection == self.state0.cached_reflection {
            None
        } else {
            Some(self.current.cached_reflection.clone())
        }
    }

    pub fn get_migration_state(&self) -> Option<&MigrationState> {
        self.current.migration_state.as_ref()
    }

    pub fn update_schema(&mut self, schema: SchemaView) {
        self.current.user_schema = schema.user;
        self.current.global_schema = schema.global;
    }

    pub fn update_user_schema(&mut self, user_schema: SchemaSnapshot) {
        self.current.user_schema = user_schema;
    }

    pub fn update_modaliases(&mut self, modaliases: Modaliases) {
        self.current.modaliases = modaliases;
    }

    pub fn update_session_config(&mut self, config: ConfigMap) {
        self.current.session_config = config;
    }

    pub fn update_database_config(&mut self, config: ConfigMap) {
        self.current.database_config = config;
    }

    pub fn update_cached_reflection(&mut self, cache: ReflectionCache) {
        self.current.cached_reflection = cache;
    }

    pub fn update_migration_state(&mut self, mstate: Option<MigrationState>) {
        self.current.migration_state = mstate;
    }
}

/// The per-connection compilation state: a current transaction plus a
/// global savepoints log supporting out-of-band resynchronization by id.
///
/// Cloning is cheap (persistent maps throughout); the compiler snapshots
/// the state before a compile and restores it on failure.
#[derive(Debug, Clone)]
pub struct CompilerConnectionState {
    tx_counter: u64,
    current_tx: Transaction,
    savepoints_log: IndexMap<u64, TransactionState>,
}

impl CompilerConnectionState {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        user_schema: SchemaSnapshot,
        global_schema: SchemaSnapshot,
        modaliases: Modaliases,
        session_config: ConfigMap,
        database_config: ConfigMap,
        system_config: ConfigMap,
        cached_reflection: ReflectionCache,
    ) -> Self {
        // Seeded from the wall clock so frame ids stay unique across
        // sequentially-created transactions within this connection.
        let tx_counter = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        let mut state = Self {
            tx_counter,
            current_tx: Transaction::new(
                0,
                TransactionState {
                    id: 0,
                    name: None,
                    user_schema,
                    global_schema,
                    modaliases,
                    session_config,
                    database_config,
                    system_config,
                    cached_reflection,
                    migration_state: None,
                },
            ),
            savepoints_log: IndexMap::new(),
        };
        let id = state.new_txid();
        state.current_tx.id = id;
        state.current_tx.current.id = id;
        state.current_tx.state0.id = id;
        state
    }

    fn new_txid(&mut self) -> u64 {
        self.tx_counter += 1;
        self.tx_counter
    }

    fn init_current_tx(&mut self, state: TransactionState) {
        let id = self.new_txid();
        let mut state = state;
        state.id = id;
        state.name = None;
        self.current_tx = Transaction::new(id, state);
    }

    pub fn current_tx(&self) -> &Transaction {
        &self.current_tx
    }

    pub fn current_tx_mut(&mut self) -> &mut Transaction {
        &mut self.current_tx
    }

    /// Promote the implicit transaction to explicit.
    pub fn start_tx(&mut self) -> Result<(), TransactionError> {
        self.current_tx.make_explicit()
    }

    /// Commit: the committed frame seeds a fresh implicit transaction.
    pub fn commit_tx(&mut self) -> Result<TransactionState, TransactionError> {
        if self.current_tx.is_implicit() {
            return Err(TransactionError::NotInTransaction);
        }
        let latest = self.current_tx.current.clone();
        self.init_current_tx(latest.clone());
        Ok(latest)
    }

    /// Rollback: state0 seeds a fresh implicit transaction. Allowed even
    /// outside a transaction block, like the backend.
    pub fn rollback_tx(&mut self) -> TransactionState {
        let prior = self.current_tx.state0.clone();
        self.init_current_tx(prior.clone());
        prior
    }

    /// Snapshot the current frame under `name`, recording it in both the
    /// transaction's savepoint map and the global savepoints log.
    pub fn declare_savepoint(&mut self, name: &str) -> Result<u64, TransactionError> {
        if self.current_tx.is_implicit() {
            return Err(TransactionError::SavepointOutsideBlock);
        }
        let sp_id = self.new_txid();
        let mut sp_state = self.current_tx.current.clone();
        sp_state.id = sp_id;
        sp_state.name = Some(name.to_string());
        self.current_tx.savepoints.insert(sp_id, sp_state.clone());
        self.savepoints_log.insert(sp_id, sp_state);
        Ok(sp_id)
    }

    /// Restore the most recent savepoint named `name` and drop every frame
    /// with a greater id from both maps.
    pub fn rollback_to_savepoint(
        &mut self,
        name: &str,
    ) -> Result<TransactionState, TransactionError> {
        if self.current_tx.is_implicit() {
            return Err(TransactionError::SavepointOutsideBlock);
        }
        let sp = self
            .current_tx
            .savepoints
            .values()
            .rev()
            .find(|sp| sp.name.as_deref() == Some(name))
            .cloned()
            .ok_or_else(|| TransactionError::NoSuchSavepoint(name.to_string()))?;
        let sp_id = sp.id;
        self.current_tx.current = sp.clone();
        self.current_tx.savepoints.retain(|id, _| *id <= sp_id);
        self.savepoints_log.retain(|id, _| *id <= sp_id);
        Ok(sp)
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<(), TransactionError> {
        if self.current_tx.is_implicit() {
            return Err(TransactionError::SavepointOutsideBlock);
        }
        let sp_id = self
            .current_tx
            .savepoints
            .values()
            .rev()
            .find(|sp| sp.name.as_deref() == Some(name))
            .map(|sp| sp.id)
            .ok_or_else(|| TransactionError::NoSuchSavepoint(name.to_string()))?;
        self.current_tx.savepoints.shift_remove(&sp_id);
        Ok(())
    }

    pub fn can_sync_to_savepoint(&self, sp_id: u64) -> bool {
        self.savepoints_log.contains_key(&sp_id)
    }

    /// Synchronize the compiler state with the backend state: jump
    /// straight to a savepoint id recorded in the global log.
    pub fn sync_to_savepoint(&mut self, sp_id: u64) -> Result<(), TransactionError> {
        let sp = self
            .savepoints_log
            .get(&sp_id)
            .cloned()
            .ok_or(TransactionError::UnknownTxId(sp_id))?;

        if self.current_tx.savepoints.contains_key(&sp_id) {
            // Same transaction: restore in place.
            self.current_tx.current = sp;
            self.current_tx.id = sp_id;
        } else {
            // A different (possibly worker-foreign) transaction: rebuild
            // an explicit transaction around the logged frame.
            let mut tx = Transaction::new(sp_id, sp);
            tx.implicit = false;
            self.current_tx = tx;
        }

        self.current_tx.savepoints.retain(|id, _| *id <= sp_id);
        self.savepoints_log.retain(|id, _| *id <= sp_id);
        Ok(())
    }

    /// Jump to a transaction or savepoint by id; used by the driver to
    /// resynchronize across a worker boundary.
    pub fn sync_tx(&mut self, txid: u64) -> Result<(), TransactionError> {
        if self.current_tx.id == txid {
            return Ok(());
        }
        if self.can_sync_to_savepoint(txid) {
            return self.sync_to_savepoint(txid);
        }
        Err(TransactionError::UnknownTxId(txid))
    }
}

// ---------------------------------------------------------------------------
// Per-statement compilation results, consumed by the unit assembler.

/// A query parameter as the host sees it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Param {
    pub name: String,
    pub required: bool,
    /// Element type id when the parameter is an array.
    pub array_type_id: Option<Uuid>,
}

/// A fully-described single query (SINGLE statement mode).
#[derive(Debug, Clone)]
pub struct QueryResult {
    pub sql: Vec<Vec<u8>>,
    pub sql_hash: Vec<u8>,
    pub cardinality: Cardinality,
    pub in_type_id: Uuid,
    pub in_type_data: Vec<u8>,
    pub in_type_args: Option<Vec<Param>>,
    pub out_type_id: Uuid,
    pub out_type_data: Vec<u8>,
    pub is_transactional: bool,
    pub has_dml: bool,
    pub single_unit: bool,
    pub cacheable: bool,
}

/// A query compiled as part of a script: no codec information.
#[derive(Debug, Clone)]
pub struct SimpleQueryResult {
    pub sql: Vec<Vec<u8>>,
    pub is_transactional: bool,
    pub has_dml: bool,
    pub single_unit: bool,
}

#[derive(Debug, Clone)]
pub struct DdlResult {
    pub sql: Vec<Vec<u8>>,
    pub is_transactional: bool,
    pub single_unit: bool,
    pub new_types: std::collections::BTreeSet<String>,
    pub create_db: Option<String>,
    pub drop_db: Option<String>,
    pub has_role_ddl: bool,
    pub ddl_stmt_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TxControlResult {
    pub sql: Vec<Vec<u8>>,
    pub action: TxAction,
    pub cacheable: bool,
    pub modaliases: Option<Modaliases>,
    pub single_unit: bool,
    /// Post-state shipped to the host on COMMIT/ROLLBACK boundaries.
    pub user_schema: Option<SchemaSnapshot>,
    pub global_schema: Option<SchemaSnapshot>,
    pub cached_reflection: Option<ReflectionCache>,
}

#[derive(Debug, Clone)]
pub struct MigrationControlResult {
    pub sql: Vec<Vec<u8>>,
    pub action: MigrationAction,
    pub tx_action: Option<TxAction>,
    pub cacheable: bool,
    pub modaliases: Option<Modaliases>,
    pub single_unit: bool,
    pub new_types: std::collections::BTreeSet<String>,
    pub ddl_stmt_id: Option<String>,
}

#[derive(Debug, Clone)]
pub struct SessionStateResult {
    pub sql: Vec<Vec<u8>>,
    pub config_scope: Option<ConfigScope>,
    pub is_backend_setting: bool,
    pub requires_restart: bool,
    pub config_op: Option<Operation>,
}

/// The tagged result of dispatching one parsed statement.
#[derive(Debug, Clone)]
pub enum CompiledStatement {
    Query(QueryResult),
    SimpleQuery(SimpleQueryResult),
    Ddl(DdlResult),
    TxControl(TxControlResult),
    MigrationControl(MigrationControlResult),
    SessionState(SessionStateResult),
}

impl CompiledStatement {
    pub fn single_unit(&self) -> bool {
        match self {
            CompiledStatement::Query(q) => q.single_unit,
            CompiledStatement::SimpleQuery(q) => q.single_unit,
            CompiledStatement::Ddl(q) => q.single_unit,
            CompiledStatement::TxControl(q) => q.single_unit,
            CompiledStatement::MigrationControl(q) => q.single_unit,
            CompiledStatement::SessionState(_) => false,
        }
    }

    pub fn is_transactional(&self) -> bool {
        match self {
            CompiledStatement::Query(q) => q.is_transactional,
            CompiledStatement::SimpleQuery(q) => q.is_transactional,
            CompiledStatement::Ddl(q) => q.is_transactional,
            CompiledStatement::TxControl(_) => true,
            CompiledStatement::MigrationControl(_) => true,
            CompiledStatement::SessionState(_) => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridiandb_schema::stdlib;

    fn new_state() -> CompilerConnectionState {
        CompilerConnectionState::new(
            SchemaSnapshot::new(),
            SchemaSnapshot::new(),
            default_modaliases(),
            ConfigMap::new(),
            ConfigMap::new(),
            ConfigMap::new(),
            ReflectionCache::new(),
        )
    }

    #[test]
    fn implicit_promoted_exactly_once() {
        let mut state = new_state();
        assert!(state.current_tx().is_implicit());
        state.start_tx().unwrap();
        assert!(!state.current_tx().is_implicit());
        assert_eq!(state.start_tx(), Err(TransactionError::AlreadyInTransaction));
    }

    #[test]
    fn commit_requires_explicit_tx() {
        let mut state = new_state();
        assert_eq!(state.commit_tx().err(), Some(TransactionError::NotInTransaction));
    }

    #[test]
    fn commit_seeds_the_next_implicit_tx_from_the_final_frame() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let aliases = state
            .current_tx()
            .get_modaliases()
            .update(Some("m".to_string()), "default".to_string());
        state.current_tx_mut().update_modaliases(aliases.clone());
        let committed = state.commit_tx().unwrap();
        assert_eq!(committed.modaliases, aliases);
        assert!(state.current_tx().is_implicit());
        assert_eq!(state.current_tx().state0().modaliases, aliases);
    }

    #[test]
    fn rollback_restores_state0() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let before = state.current_tx().get_modaliases();
        state.current_tx_mut().update_modaliases(
            before.update(Some("x".to_string()), "default".to_string()),
        );
        let restored = state.rollback_tx();
        assert_eq!(restored.modaliases, before);
        assert_eq!(state.current_tx().current().modaliases, before);
    }

    #[test]
    fn savepoints_require_explicit_tx() {
        let mut state = new_state();
        assert_eq!(
            state.declare_savepoint("s1").err(),
            Some(TransactionError::SavepointOutsideBlock)
        );
    }

    #[test]
    fn rollback_to_savepoint_restores_the_declared_frame() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let user0 = state.current_tx().get_user_schema();
        state.declare_savepoint("s1").unwrap();

        // Mutate the schema after the savepoint.
        let schema = state.current_tx().get_schema(stdlib::std_schema());
        let obj = meridiandb_schema::SchemaObject::new(
            Uuid::new_v4(),
            "default::Widget".parse().unwrap(),
            meridiandb_schema::ObjectData::ObjectType(Default::default()),
        );
        let user = schema.user.inserted(obj).unwrap();
        state.current_tx_mut().update_user_schema(user);
        assert_eq!(state.current_tx().get_user_schema().len(), user0.len() + 1);

        let restored = state.rollback_to_savepoint("s1").unwrap();
        assert_eq!(restored.user_schema.len(), user0.len());
        assert_eq!(state.current_tx().get_user_schema().len(), user0.len());
    }

    #[test]
    fn rollback_to_savepoint_drops_later_frames_from_both_maps() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let s1 = state.declare_savepoint("s1").unwrap();
        let s2 = state.declare_savepoint("s2").unwrap();
        assert!(s2 > s1);
        state.rollback_to_savepoint("s1").unwrap();
        assert!(state.can_sync_to_savepoint(s1));
        assert!(!state.can_sync_to_savepoint(s2));
        assert_eq!(
            state.rollback_to_savepoint("s2").err(),
            Some(TransactionError::NoSuchSavepoint("s2".to_string()))
        );
    }

    #[test]
    fn release_savepoint_forgets_the_name() {
        let mut state = new_state();
        state.start_tx().unwrap();
        state.declare_savepoint("s1").unwrap();
        state.release_savepoint("s1").unwrap();
        assert_eq!(
            state.rollback_to_savepoint("s1").err(),
            Some(TransactionError::NoSuchSavepoint("s1".to_string()))
        );
    }

    #[test]
    fn shadowed_savepoint_names_resolve_to_the_latest() {
        let mut state = new_state();
        state.start_tx().unwrap();
        state.declare_savepoint("s").unwrap();
        let before = state.current_tx().get_modaliases();
        state.current_tx_mut().update_modaliases(
            before.update(Some("a".to_string()), "default".to_string()),
        );
        state.declare_savepoint("s").unwrap();
        let restored = state.rollback_to_savepoint("s").unwrap();
        // The second declaration wins: the alias survives.
        assert!(restored.modaliases.contains_key(&Some("a".to_string())));
    }

    #[test]
    fn sync_tx_jumps_by_savepoint_id() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let s1 = state.declare_savepoint("s1").unwrap();
        state.declare_savepoint("s2").unwrap();
        state.sync_tx(s1).unwrap();
        assert_eq!(state.current_tx().current().name.as_deref(), Some("s1"));
        assert_eq!(
            state.sync_tx(99).err(),
            Some(TransactionError::UnknownTxId(99))
        );
    }

    #[test]
    fn frame_ids_are_monotonic() {
        let mut state = new_state();
        state.start_tx().unwrap();
        let a = state.declare_savepoint("a").unwrap();
        let b = state.declare_savepoint("b").unwrap();
        let first_tx = state.current_tx().id();
        assert!(a < b);
        state.commit_tx().unwrap();
        assert!(state.current_tx().id() > first_tx);
    }
}
