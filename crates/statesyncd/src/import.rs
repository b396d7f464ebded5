//! Graph import: loads a [`GraphDocument`] into the store.

use tracing::debug;

use statesync_core::GraphDocument;
use statesync_store::{StateStore, StoreResult};

#[derive(Debug, Default, PartialEq, Eq)]
pub struct ImportSummary {
    pub states: usize,
    pub providers: usize,
    pub processors: usize,
    pub routes: usize,
}

/// Register every declared state and upsert the graph records.
///
/// Re-importing is safe: existing states keep their rows, count and
/// version, only their configuration is replaced.
pub fn import_graph(store: &StateStore, doc: &GraphDocument) -> StoreResult<ImportSummary> {
    for state in &doc.states {
        store.register_state(&state.id, &state.config)?;
    }
    for provider in &doc.providers {
        store.put_provider(provider)?;
    }
    for processor in &doc.processors {
        store.put_processor(processor)?;
    }
    for route in &doc.routes {
        debug!(route_id = %route.id, key = %route.table_key(), "importing route");
        store.put_route(route)?;
    }

    Ok(ImportSummary {
        states: doc.states.len(),
        providers: doc.providers.len(),
        processors: doc.processors.len(),
        routes: doc.routes.len(),
    })
}
