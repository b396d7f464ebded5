//! StateStore: redb-backed persistence for states and the processing graph.
//!
//! States are split into a header record and one record per row. Saving a
//! state writes only its dirty rows, overlaying each onto the persisted row
//! field by field, and checks the optimistic version token. The row count is
//! never written by a save; `refresh_count` recomputes it from the rows table.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use redb::{Database, ReadableDatabase, ReadableTable};
use serde::{Deserialize, Serialize};
use tracing::debug;

use statesync_core::{
    Processor, ProcessorProvider, ProcessorStateDirection, ProcessorStateRoute, Row, State,
    StateConfig,
};

use crate::error::{StoreError, StoreResult};
use crate::tables::*;

/// Convert any `Display` error into a `StoreError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| StoreError::$variant(e.to_string())
    };
}

/// Everything about a state except its rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StateHeader {
    id: String,
    config: StateConfig,
    #[serde(default)]
    columns: Vec<String>,
    #[serde(default)]
    count: u64,
    #[serde(default)]
    version: u64,
    #[serde(default)]
    next_row_seq: u64,
}

impl StateHeader {
    fn of(state: &State) -> Self {
        Self {
            id: state.id.clone(),
            config: state.config.clone(),
            columns: state.columns.clone(),
            count: state.count,
            version: state.version,
            next_row_seq: state.next_row_seq,
        }
    }

    fn into_state(self) -> State {
        let mut state = State::new(&self.id, self.config);
        state.columns = self.columns;
        state.count = self.count;
        state.version = self.version;
        state.next_row_seq = self.next_row_seq;
        state
    }
}

/// Thread-safe state store backed by redb.
#[derive(Clone)]
pub struct StateStore {
    db: Arc<Database>,
}

impl StateStore {
    /// Open (or create) a persistent state store at the given path.
    pub fn open(path: &Path) -> StoreResult<Self> {
        let db = Database::create(path).map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!(?path, "state store opened");
        Ok(store)
    }

    /// Create an ephemeral in-memory state store (for testing).
    pub fn open_in_memory() -> StoreResult<Self> {
        let backend = redb::backends::InMemoryBackend::new();
        let db = Database::builder()
            .create_with_backend(backend)
            .map_err(map_err!(Open))?;
        let store = Self { db: Arc::new(db) };
        store.ensure_tables()?;
        debug!("in-memory state store opened");
        Ok(store)
    }

    /// Create all tables if they don't exist yet.
    fn ensure_tables(&self) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        // Opening a table in a write transaction creates it if absent.
        txn.open_table(STATES).map_err(map_err!(Table))?;
        txn.open_table(STATE_ROWS).map_err(map_err!(Table))?;
        txn.open_table(ROUTES).map_err(map_err!(Table))?;
        txn.open_table(PROCESSORS).map_err(map_err!(Table))?;
        txn.open_table(PROVIDERS).map_err(map_err!(Table))?;
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    // ── States ─────────────────────────────────────────────────────

    /// Register a state. A new state is created empty; an existing one only
    /// has its config replaced, keeping rows, count and version.
    pub fn register_state(&self, id: &str, config: &StateConfig) -> StoreResult<()> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(STATES).map_err(map_err!(Table))?;
            let existing: Option<StateHeader> = match table.get(id).map_err(map_err!(Read))? {
                Some(guard) => {
                    Some(serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?)
                }
                None => None,
            };
            let header = match existing {
                Some(mut header) => {
                    header.config = config.clone();
                    header
                }
                None => StateHeader::of(&State::new(id, config.clone())),
            };
            let value = serde_json::to_vec(&header).map_err(map_err!(Serialize))?;
            table
                .insert(id, value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(state_id = %id, "state registered");
        Ok(())
    }

    /// Load a state. With `load_data = false` only the header is read.
    pub fn get_state(&self, id: &str, load_data: bool) -> StoreResult<Option<State>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATES).map_err(map_err!(Table))?;
        let header: StateHeader = match table.get(id).map_err(map_err!(Read))? {
            Some(guard) => serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
            None => return Ok(None),
        };
        let mut state = header.into_state();

        if load_data {
            let rows = txn.open_table(STATE_ROWS).map_err(map_err!(Table))?;
            let (start, end) = row_range(id);
            let mut body = BTreeMap::new();
            for entry in rows
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                let (key, value) = entry.map_err(map_err!(Read))?;
                let row: Row =
                    serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
                let row_id = key.value()[start.len()..].to_string();
                body.insert(row_id, row);
            }
            state.rows = body;
        }
        Ok(Some(state))
    }

    /// Persist the dirty rows and header of a state.
    ///
    /// Fails with `VersionConflict` when the persisted version differs from
    /// `state.version`. Returns the saved state with its version bumped and
    /// no dirty rows. The count is left untouched.
    pub fn commit_state(&self, state: &State) -> StoreResult<State> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let saved = {
            let mut states = txn.open_table(STATES).map_err(map_err!(Table))?;
            let persisted: Option<StateHeader> =
                match states.get(state.id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => Some(
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?,
                    ),
                    None => None,
                };
            let found = persisted.as_ref().map(|h| h.version).unwrap_or(0);
            if found != state.version {
                return Err(StoreError::VersionConflict {
                    state_id: state.id.clone(),
                    expected: state.version,
                    found,
                });
            }

            let mut rows = txn.open_table(STATE_ROWS).map_err(map_err!(Table))?;
            for (row_id, row) in state.dirty_rows() {
                let key = row_key(&state.id, row_id);
                let mut merged: Row = match rows.get(key.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => {
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                    }
                    None => Row::new(),
                };
                for (column, value) in row {
                    merged.insert(column.clone(), value.clone());
                }
                let value = serde_json::to_vec(&merged).map_err(map_err!(Serialize))?;
                rows.insert(key.as_str(), value.as_slice())
                    .map_err(map_err!(Write))?;
            }

            let mut saved = state.clone();
            saved.version += 1;
            saved.dirty.clear();
            if let Some(persisted) = persisted {
                // The count is owned by refresh_count.
                saved.count = persisted.count;
            }
            let value = serde_json::to_vec(&StateHeader::of(&saved)).map_err(map_err!(Serialize))?;
            states
                .insert(state.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
            saved
        };
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(state_id = %saved.id, version = saved.version, "state saved");
        Ok(saved)
    }

    /// Recompute the row count of a state from the rows table and persist it.
    pub fn refresh_count(&self, state: &State) -> StoreResult<State> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let count = {
            let rows = txn.open_table(STATE_ROWS).map_err(map_err!(Table))?;
            let (start, end) = row_range(&state.id);
            let mut count = 0u64;
            for entry in rows
                .range(start.as_str()..end.as_str())
                .map_err(map_err!(Read))?
            {
                entry.map_err(map_err!(Read))?;
                count += 1;
            }
            count
        };
        {
            let mut states = txn.open_table(STATES).map_err(map_err!(Table))?;
            let mut header: StateHeader =
                match states.get(state.id.as_str()).map_err(map_err!(Read))? {
                    Some(guard) => {
                        serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?
                    }
                    None => return Err(StoreError::NotFound(state.id.clone())),
                };
            header.count = count;
            let value = serde_json::to_vec(&header).map_err(map_err!(Serialize))?;
            states
                .insert(state.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;

        let mut refreshed = state.clone();
        refreshed.count = count;
        debug!(state_id = %state.id, count, "state count refreshed");
        Ok(refreshed)
    }

    /// List the ids of all registered states.
    pub fn list_state_ids(&self) -> StoreResult<Vec<String>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(STATES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (key, _) = entry.map_err(map_err!(Read))?;
            results.push(key.value().to_string());
        }
        Ok(results)
    }

    // ── Routes ─────────────────────────────────────────────────────

    /// Insert or update a processor↔state route.
    pub fn put_route(&self, route: &ProcessorStateRoute) -> StoreResult<()> {
        let key = route.table_key();
        let value = serde_json::to_vec(route).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
            table
                .insert(key.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        debug!(%key, route_id = %route.id, "route stored");
        Ok(())
    }

    /// All routes carrying the given route id. A consistent graph has one.
    pub fn routes_by_id(&self, route_id: &str) -> StoreResult<Vec<ProcessorStateRoute>> {
        self.scan_routes(|route| route.id == route_id)
    }

    /// All routes attaching a state in the given direction.
    pub fn routes_for_state(
        &self,
        state_id: &str,
        direction: ProcessorStateDirection,
    ) -> StoreResult<Vec<ProcessorStateRoute>> {
        self.scan_routes(|route| route.state_id == state_id && route.direction == direction)
    }

    fn scan_routes(
        &self,
        predicate: impl Fn(&ProcessorStateRoute) -> bool,
    ) -> StoreResult<Vec<ProcessorStateRoute>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(ROUTES).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in table.iter().map_err(map_err!(Read))? {
            let (_, value) = entry.map_err(map_err!(Read))?;
            let route: ProcessorStateRoute =
                serde_json::from_slice(value.value()).map_err(map_err!(Deserialize))?;
            if predicate(&route) {
                results.push(route);
            }
        }
        Ok(results)
    }

    // ── Processors ─────────────────────────────────────────────────

    /// Insert or update a processor.
    pub fn put_processor(&self, processor: &Processor) -> StoreResult<()> {
        let value = serde_json::to_vec(processor).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROCESSORS).map_err(map_err!(Table))?;
            table
                .insert(processor.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a processor by ID.
    pub fn get_processor(&self, processor_id: &str) -> StoreResult<Option<Processor>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROCESSORS).map_err(map_err!(Table))?;
        match table.get(processor_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let processor: Processor =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(processor))
            }
            None => Ok(None),
        }
    }

    // ── Providers ──────────────────────────────────────────────────

    /// Insert or update a processor provider.
    pub fn put_provider(&self, provider: &ProcessorProvider) -> StoreResult<()> {
        let value = serde_json::to_vec(provider).map_err(map_err!(Serialize))?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROVIDERS).map_err(map_err!(Table))?;
            table
                .insert(provider.id.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    /// Get a processor provider by ID.
    pub fn get_provider(&self, provider_id: &str) -> StoreResult<Option<ProcessorProvider>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROVIDERS).map_err(map_err!(Table))?;
        match table.get(provider_id).map_err(map_err!(Read))? {
            Some(guard) => {
                let provider: ProcessorProvider =
                    serde_json::from_slice(guard.value()).map_err(map_err!(Deserialize))?;
                Ok(Some(provider))
            }
            None => Ok(None),
        }
    }
}
