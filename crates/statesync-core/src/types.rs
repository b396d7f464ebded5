//! Domain types shared across the state sync crates.
//!
//! A [`State`] is the unit of synchronized data: a configuration block, a
//! keyed row body, and the authoritative row count. Routes, processors and
//! providers describe the processing graph the state lives in.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Opaque identifier of a state.
pub type StateId = String;

/// Identifier of a processor↔state edge.
pub type RouteId = String;

/// One persisted row: column name → value.
pub type Row = BTreeMap<String, Value>;

fn default_storage_class() -> String {
    "database".to_string()
}

// ── State ─────────────────────────────────────────────────────────

/// Configuration block of a state.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StateConfig {
    pub name: String,
    /// Storage class identifier (e.g. "database").
    #[serde(default = "default_storage_class")]
    pub storage_class: String,
    /// Forward merged updates to downstream processors after each save.
    #[serde(default)]
    pub flag_auto_route_output_state_after_save: bool,
    /// Columns identifying a row. Empty means every update appends a row.
    #[serde(default)]
    pub primary_key: Vec<String>,
    /// Columns stamped from the merge scope (column → binding).
    #[serde(default)]
    pub scope_columns: BTreeMap<String, ScopeBinding>,
}

impl StateConfig {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            storage_class: default_storage_class(),
            flag_auto_route_output_state_after_save: false,
            primary_key: Vec::new(),
            scope_columns: BTreeMap::new(),
        }
    }
}

/// The versioned, persisted record being synchronized.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct State {
    pub id: StateId,
    pub config: StateConfig,
    /// Column names in first-seen order.
    #[serde(default)]
    pub columns: Vec<String>,
    /// Row count as last computed by the store.
    #[serde(default)]
    pub count: u64,
    /// Optimistic concurrency token, bumped by every save.
    #[serde(default)]
    pub version: u64,
    /// Next sequence number for keyless (append-only) rows.
    #[serde(default)]
    pub next_row_seq: u64,
    /// Loaded row body keyed by row key. Partial when loaded lightweight.
    #[serde(default)]
    pub rows: BTreeMap<String, Row>,
    /// Row keys modified in memory since the last save.
    #[serde(skip)]
    pub dirty: BTreeSet<String>,
}

impl State {
    /// A fresh, empty state.
    pub fn new(id: &str, config: StateConfig) -> Self {
        Self {
            id: id.to_string(),
            config,
            columns: Vec::new(),
            count: 0,
            version: 0,
            next_row_seq: 0,
            rows: BTreeMap::new(),
            dirty: BTreeSet::new(),
        }
    }

    /// Whether successful merges propagate downstream.
    pub fn auto_forward(&self) -> bool {
        self.config.flag_auto_route_output_state_after_save
    }

    /// Rows touched since the last save, in key order.
    pub fn dirty_rows(&self) -> impl Iterator<Item = (&String, &Row)> {
        self.dirty
            .iter()
            .filter_map(|key| self.rows.get(key).map(|row| (key, row)))
    }

    pub fn is_dirty(&self) -> bool {
        !self.dirty.is_empty()
    }

    /// Record a column name if not seen before.
    pub fn track_column(&mut self, column: &str) {
        if !self.columns.iter().any(|c| c == column) {
            self.columns.push(column.to_string());
        }
    }

    /// Drop the in-memory row body, keeping header fields.
    pub fn release_rows(&mut self) {
        self.rows.clear();
        self.dirty.clear();
    }
}

// ── Updates ───────────────────────────────────────────────────────

/// One partial update: column name → value.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct QueryStateEntry(pub serde_json::Map<String, Value>);

impl QueryStateEntry {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.0.get(column)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }
}

impl<K: Into<String>> FromIterator<(K, Value)> for QueryStateEntry {
    fn from_iter<I: IntoIterator<Item = (K, Value)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

// ── Graph ─────────────────────────────────────────────────────────

/// Direction of a processor↔state edge, seen from the processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProcessorStateDirection {
    Input,
    Output,
}

impl ProcessorStateDirection {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProcessorStateDirection::Input => "INPUT",
            ProcessorStateDirection::Output => "OUTPUT",
        }
    }
}

/// An edge of the processing graph linking a state to a processor.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorStateRoute {
    /// Route id.
    pub id: RouteId,
    pub state_id: StateId,
    pub processor_id: String,
    pub direction: ProcessorStateDirection,
}

impl ProcessorStateRoute {
    /// Composite key: `{state_id}:{direction}:{processor_id}`.
    pub fn table_key(&self) -> String {
        format!(
            "{}:{}:{}",
            self.state_id,
            self.direction.as_str(),
            self.processor_id
        )
    }
}

/// A processing unit attached to the graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Processor {
    pub id: String,
    pub provider_id: String,
    #[serde(default)]
    pub name: Option<String>,
}

/// The implementation backing one or more processors.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessorProvider {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub class_name: Option<String>,
}

// ── Scope ─────────────────────────────────────────────────────────

/// A value a state column can be stamped with from the merge scope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeBinding {
    StateId,
    RouteId,
    ProcessorId,
    ProviderId,
    ProviderName,
    ProviderVersion,
}

/// Who produced an update. Direct mode carries only the state id.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ScopeVariableMapping {
    pub state_id: StateId,
    pub route_id: Option<RouteId>,
    pub processor: Option<Processor>,
    pub provider: Option<ProcessorProvider>,
    pub route: Option<ProcessorStateRoute>,
}

impl ScopeVariableMapping {
    pub fn direct(state_id: &str) -> Self {
        Self {
            state_id: state_id.to_string(),
            ..Default::default()
        }
    }

    pub fn routed(
        route: ProcessorStateRoute,
        processor: Processor,
        provider: ProcessorProvider,
    ) -> Self {
        Self {
            state_id: route.state_id.clone(),
            route_id: Some(route.id.clone()),
            processor: Some(processor),
            provider: Some(provider),
            route: Some(route),
        }
    }

    /// Resolve a binding against this scope.
    pub fn value(&self, binding: ScopeBinding) -> Option<Value> {
        let text = match binding {
            ScopeBinding::StateId => Some(self.state_id.clone()),
            ScopeBinding::RouteId => self.route_id.clone(),
            ScopeBinding::ProcessorId => self.processor.as_ref().map(|p| p.id.clone()),
            ScopeBinding::ProviderId => self.provider.as_ref().map(|p| p.id.clone()),
            ScopeBinding::ProviderName => self.provider.as_ref().map(|p| p.name.clone()),
            ScopeBinding::ProviderVersion => self.provider.as_ref().and_then(|p| p.version.clone()),
        };
        text.map(Value::String)
    }
}
