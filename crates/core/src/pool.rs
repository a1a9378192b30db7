//! Worker-pool client state.
//!
//! Each compile worker keeps an immutable cache of per-client schema
//! state. Updates are copy-on-write: `synced` returns a new cache value
//! which the worker swaps in; compiles already in flight keep observing
//! the snapshot they captured. The standard and reflection schemas are
//! process-wide constants and never live here.

use std::sync::Arc;

use meridiandb_schema::SchemaSnapshot;

use crate::dbstate::{
    default_modaliases, CompilerConnectionState, ConfigMap, Modaliases, ReflectionCache,
};

pub type ClientId = u64;

/// Everything the compiler must know about one client's database.
#[derive(Debug, Clone, Default)]
pub struct ClientSchemaState {
    pub user_schema: SchemaSnapshot,
    pub global_schema: SchemaSnapshot,
    pub modaliases: Modaliases,
    pub session_config: ConfigMap,
    pub database_config: ConfigMap,
    pub system_config: ConfigMap,
    pub cached_reflection: ReflectionCache,
}

#[derive(Debug, Clone, Default)]
pub struct ClientStateCache {
    clients: im::HashMap<ClientId, Arc<ClientSchemaState>>,
}

impl ClientStateCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    pub fn get(&self, client_id: ClientId) -> Option<Arc<ClientSchemaState>> {
        self.clients.get(&client_id).cloned()
    }

    /// A new cache with `client_id`'s state replaced.
    pub fn synced(&self, client_id: ClientId, state: ClientSchemaState) -> Self {
        let mut next = self.clone();
        next.clients.insert(client_id, Arc::new(state));
        next
    }

    /// A new cache without `client_id`.
    pub fn evicted(&self, client_id: ClientId) -> Self {
        let mut next = self.clone();
        next.clients.remove(&client_id);
        next
    }

    /// Seed a fresh connection state from the cached client state.
    pub fn new_connection_state(&self, client_id: ClientId) -> Option<CompilerConnectionState> {
        let state = self.get(client_id)?;
        let modaliases = if state.modaliases.is_empty() {
            default_modaliases()
        } else {
            state.modaliases.clone()
        };
        Some(CompilerConnectionState::new(
            state.user_schema.clone(),
            state.global_schema.clone(),
            modaliases,
            state.session_config.clone(),
            state.database_config.clone(),
            state.system_config.clone(),
            state.cached_reflection.clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sync_is_copy_on_write() {
        let cache = ClientStateCache::new();
        let synced = cache.synced(7, ClientSchemaState::default());
        assert!(cache.get(7).is_none());
        assert!(synced.get(7).is_some());
    }

    #[test]
    fn inflight_snapshots_survive_eviction() {
        let cache = ClientStateCache::new().synced(7, ClientSchemaState::default());
        let captured = cache.get(7).unwrap();
        let evicted = cache.evicted(7);
        assert!(evicted.get(7).is_none());
        // The captured Arc is still fully usable.
        assert!(captured.user_schema.is_empty());
    }

    #[test]
    fn connection_state_seeds_default_aliases() {
        let cache = ClientStateCache::new().synced(1, ClientSchemaState::default());
        let state = cache.new_connection_state(1).unwrap();
        assert_eq!(
            state.current_tx().get_modaliases().get(&None).map(String::as_str),
            Some("default")
        );
        assert!(cache.new_connection_state(2).is_none());
    }
}
