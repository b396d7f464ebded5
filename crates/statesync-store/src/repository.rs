//! The store port consumed by the sync engine.

use async_trait::async_trait;

use statesync_core::{Processor, ProcessorProvider, ProcessorStateDirection, ProcessorStateRoute, State};

use crate::error::StoreResult;
use crate::store::StateStore;

/// How to look up processor↔state routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteQuery<'a> {
    /// Every route carrying this route id.
    ById(&'a str),
    /// Every route attaching this state in the given direction.
    ByState {
        state_id: &'a str,
        direction: ProcessorStateDirection,
    },
}

/// Load/save/count-refresh access to durable states, plus graph lookups.
#[async_trait]
pub trait StateRepository: Send + Sync {
    /// Load a state, with or without its row body.
    async fn load_state(&self, state_id: &str, load_data: bool) -> StoreResult<Option<State>>;

    /// Persist a merged state; returns the post-save instance.
    async fn save_state(&self, state: &State) -> StoreResult<State>;

    /// Recompute the authoritative row count.
    async fn update_state_count(&self, state: &State) -> StoreResult<State>;

    async fn fetch_processor_state_route(
        &self,
        query: RouteQuery<'_>,
    ) -> StoreResult<Vec<ProcessorStateRoute>>;

    async fn fetch_processor(&self, processor_id: &str) -> StoreResult<Option<Processor>>;

    async fn fetch_processor_provider(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<ProcessorProvider>>;
}

#[async_trait]
impl StateRepository for StateStore {
    async fn load_state(&self, state_id: &str, load_data: bool) -> StoreResult<Option<State>> {
        self.get_state(state_id, load_data)
    }

    async fn save_state(&self, state: &State) -> StoreResult<State> {
        self.commit_state(state)
    }

    async fn update_state_count(&self, state: &State) -> StoreResult<State> {
        self.refresh_count(state)
    }

    async fn fetch_processor_state_route(
        &self,
        query: RouteQuery<'_>,
    ) -> StoreResult<Vec<ProcessorStateRoute>> {
        match query {
            RouteQuery::ById(route_id) => self.routes_by_id(route_id),
            RouteQuery::ByState {
                state_id,
                direction,
            } => self.routes_for_state(state_id, direction),
        }
    }

    async fn fetch_processor(&self, processor_id: &str) -> StoreResult<Option<Processor>> {
        self.get_processor(processor_id)
    }

    async fn fetch_processor_provider(
        &self,
        provider_id: &str,
    ) -> StoreResult<Option<ProcessorProvider>> {
        self.get_provider(provider_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use statesync_core::StateConfig;

    #[tokio::test]
    async fn repository_delegates_to_store() {
        let store = StateStore::open_in_memory().unwrap();
        store.register_state("S1", &StateConfig::new("s")).unwrap();
        store
            .put_route(&ProcessorStateRoute {
                id: "R2".to_string(),
                state_id: "S1".to_string(),
                processor_id: "P2".to_string(),
                direction: ProcessorStateDirection::Input,
            })
            .unwrap();

        let repo: &dyn StateRepository = &store;
        let state = repo.load_state("S1", false).await.unwrap().unwrap();
        assert_eq!(state.config.name, "s");

        let downstream = repo
            .fetch_processor_state_route(RouteQuery::ByState {
                state_id: "S1",
                direction: ProcessorStateDirection::Input,
            })
            .await
            .unwrap();
        assert_eq!(downstream.len(), 1);

        let outputs = repo
            .fetch_processor_state_route(RouteQuery::ByState {
                state_id: "S1",
                direction: ProcessorStateDirection::Output,
            })
            .await
            .unwrap();
        assert!(outputs.is_empty());
        assert!(repo.fetch_processor("P2").await.unwrap().is_none());
    }
}
