//! Sync dispatcher: one message through classify, resolve, merge, persist
//! and forward.
//!
//! The dispatcher never settles messages itself. It returns an [`Outcome`]
//! and the consumer acknowledges or requeues accordingly.
//!
//! Once a save has succeeded the message is always reported as synced:
//! merges are not idempotent, so nothing after the save may cause a
//! redelivery.

use std::sync::Arc;

use tracing::{debug, error, info, warn};

use statesync_core::{ScopeVariableMapping, State};
use statesync_store::{RouteQuery, StateRepository};

use crate::cache::{CacheKey, Resolution, StateCache, TtlStateCache};
use crate::error::{Disposition, SyncError};
use crate::forward::{ForwardOutcome, ForwardRouter};
use crate::merge::MergeEngine;
use crate::message::InboundMessage;

#[derive(Debug, Clone, Copy)]
pub struct DispatchOptions {
    /// Load states without their row body and keep cached copies bodiless.
    pub lightweight: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self { lightweight: true }
    }
}

/// Summary of a completed cycle.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub state_id: String,
    /// Version after the save, or the loaded version if nothing was saved.
    pub version: u64,
    pub count: u64,
    pub accepted: usize,
    pub rejected: usize,
    pub persisted: bool,
    /// `None` when nothing was persisted or the downstream lookup failed.
    pub forward: Option<ForwardOutcome>,
}

#[derive(Debug)]
pub enum Outcome {
    Synced(SyncReport),
    /// Non-retryable failure: acknowledge and log.
    Dropped(SyncError),
    /// Transient failure: requeue.
    Retry(SyncError),
}

pub struct Dispatcher<C: StateCache = TtlStateCache> {
    store: Arc<dyn StateRepository>,
    merge: MergeEngine,
    forwarder: ForwardRouter,
    cache: C,
    options: DispatchOptions,
}

impl<C: StateCache> Dispatcher<C> {
    pub fn new(
        store: Arc<dyn StateRepository>,
        forwarder: ForwardRouter,
        cache: C,
        options: DispatchOptions,
    ) -> Self {
        Self {
            store,
            merge: MergeEngine::new(),
            forwarder,
            cache,
            options,
        }
    }

    pub fn cache(&self) -> &C {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut C {
        &mut self.cache
    }

    /// Run one message through the full cycle.
    pub async fn handle(&mut self, payload: &[u8]) -> Outcome {
        match self.sync(payload).await {
            Ok(report) => Outcome::Synced(report),
            Err(e) => match e.disposition() {
                Disposition::Drop => Outcome::Dropped(e),
                Disposition::Retry => Outcome::Retry(e),
            },
        }
    }

    async fn sync(&mut self, payload: &[u8]) -> Result<SyncReport, SyncError> {
        let message = InboundMessage::parse(payload)?;
        let resolution = self.resolve(&message).await?;
        let loaded = resolution.state.as_ref().map(|s| (s.version, s.count));

        let merged = self
            .merge
            .apply(resolution.state, message.entries(), &resolution.scope)?;
        let state_id = merged.state.id.clone();

        if merged.accepted.is_empty() {
            debug!(%state_id, rejected = merged.rejected, "no entries to persist");
            let (version, count) = loaded.unwrap_or_default();
            return Ok(SyncReport {
                state_id,
                version,
                count,
                accepted: 0,
                rejected: merged.rejected,
                persisted: false,
                forward: None,
            });
        }

        let state = self.persist(merged.state).await?;

        let forward = match self.forwarder.route(&state, &merged.accepted).await {
            Ok(outcome) => Some(outcome),
            Err(e) => {
                error!(
                    %state_id,
                    error = %e,
                    "failed to look up downstream routes, update not forwarded"
                );
                None
            }
        };

        info!(
            %state_id,
            version = state.version,
            count = state.count,
            accepted = merged.accepted.len(),
            rejected = merged.rejected,
            "state synced"
        );
        Ok(SyncReport {
            state_id,
            version: state.version,
            count: state.count,
            accepted: merged.accepted.len(),
            rejected: merged.rejected,
            persisted: true,
            forward,
        })
    }

    /// Serve the target from the cache, or load it and cache it. Absent
    /// states are never cached.
    async fn resolve(&mut self, message: &InboundMessage) -> Result<Resolution, SyncError> {
        let key = match message {
            InboundMessage::Direct { state_id, .. } => CacheKey::State(state_id.clone()),
            InboundMessage::Routed { route_id, .. } => CacheKey::Route(route_id.clone()),
        };
        if let Some(hit) = self.cache.lookup(&key) {
            return Ok(hit);
        }

        let load_data = !self.options.lightweight;
        let resolution = match &key {
            CacheKey::State(state_id) => {
                resolve_state(self.store.as_ref(), state_id, load_data).await?
            }
            CacheKey::Route(route_id) => {
                resolve_route(self.store.as_ref(), route_id, load_data).await?
            }
        };
        self.cache.insert(key, resolution.clone());
        Ok(resolution)
    }

    /// Save, then refresh the count. Returns the post-save instance.
    async fn persist(&mut self, state: State) -> Result<State, SyncError> {
        let saved = match self.store.save_state(&state).await {
            Ok(saved) => saved,
            Err(e) => {
                self.cache.invalidate_state(&state.id);
                return Err(e.into());
            }
        };

        let mut current = match self.store.update_state_count(&saved).await {
            Ok(refreshed) => refreshed,
            Err(e) => {
                // The next load recomputes the count.
                warn!(
                    state_id = %saved.id,
                    error = %e,
                    "state saved but count refresh failed"
                );
                self.cache.invalidate_state(&saved.id);
                return Ok(saved);
            }
        };

        if self.options.lightweight {
            current.release_rows();
        }
        self.cache.refresh_state(&current);
        Ok(current)
    }
}

async fn resolve_state(
    store: &dyn StateRepository,
    state_id: &str,
    load_data: bool,
) -> Result<Resolution, SyncError> {
    let state = store.load_state(state_id, load_data).await?;
    Ok(Resolution {
        state,
        scope: ScopeVariableMapping::direct(state_id),
    })
}

/// Resolve a route id to its state plus the processor and provider behind it.
async fn resolve_route(
    store: &dyn StateRepository,
    route_id: &str,
    load_data: bool,
) -> Result<Resolution, SyncError> {
    let routes = store
        .fetch_processor_state_route(RouteQuery::ById(route_id))
        .await?;
    let route = match <[_; 1]>::try_from(routes) {
        Ok([route]) => route,
        Err(routes) => {
            return Err(SyncError::RouteResolution {
                route_id: route_id.to_string(),
                found: routes.len(),
            });
        }
    };

    let processor = store
        .fetch_processor(&route.processor_id)
        .await?
        .ok_or_else(|| SyncError::ProcessorNotFound {
            route_id: route_id.to_string(),
            processor_id: route.processor_id.clone(),
        })?;
    let provider = store
        .fetch_processor_provider(&processor.provider_id)
        .await?
        .ok_or_else(|| SyncError::ProviderNotFound {
            processor_id: processor.id.clone(),
            provider_id: processor.provider_id.clone(),
        })?;

    let state = store.load_state(&route.state_id, load_data).await?;
    debug!(%route_id, state_id = %route.state_id, processor_id = %processor.id, "route resolved");
    Ok(Resolution {
        state,
        scope: ScopeVariableMapping::routed(route, processor, provider),
    })
}
