//! Per-consumer state cache with a sliding freshness window.
//!
//! Resolutions are keyed two ways: direct messages look up by state id,
//! routed messages by route id. Both keyspaces can hold the same state, so
//! saves refresh and failures invalidate by state id across both.
//!
//! The cache is owned by a single consumer instance and is not shared.
//! Another instance saving the same state is only noticed once the entry
//! expires, or when the store rejects a stale version on save.

use std::collections::HashMap;
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use statesync_core::{RouteId, ScopeVariableMapping, State, StateId};

/// How a resolution was requested.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum CacheKey {
    State(StateId),
    Route(RouteId),
}

/// A resolved target state together with the scope that produced it.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    /// `None` when the store has no such state.
    pub state: Option<State>,
    pub scope: ScopeVariableMapping,
}

impl Resolution {
    fn state_id(&self) -> &str {
        &self.scope.state_id
    }
}

pub trait StateCache: Send {
    /// A fresh entry for `key`. Hits extend the entry's lifetime; expired
    /// entries are evicted.
    fn lookup(&mut self, key: &CacheKey) -> Option<Resolution>;

    /// Cache a resolution. Resolutions without a state are ignored.
    fn insert(&mut self, key: CacheKey, resolution: Resolution);

    /// Replace every cached copy of `state` with the given instance.
    fn refresh_state(&mut self, state: &State);

    /// Drop every entry holding `state_id`.
    fn invalidate_state(&mut self, state_id: &str);

    /// Evict expired entries. Returns how many were removed.
    fn purge_expired(&mut self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    resolution: Resolution,
    refreshed_at: Instant,
}

/// [`StateCache`] that keeps entries for `freshness` after their last use.
///
/// A zero freshness disables caching: every lookup misses.
#[derive(Debug)]
pub struct TtlStateCache {
    freshness: Duration,
    by_state: HashMap<StateId, CacheEntry>,
    by_route: HashMap<RouteId, CacheEntry>,
}

impl TtlStateCache {
    pub fn new(freshness: Duration) -> Self {
        Self {
            freshness,
            by_state: HashMap::new(),
            by_route: HashMap::new(),
        }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    fn entries_mut<'k>(
        &mut self,
        key: &'k CacheKey,
    ) -> (&mut HashMap<String, CacheEntry>, &'k str) {
        match key {
            CacheKey::State(id) => (&mut self.by_state, id.as_str()),
            CacheKey::Route(id) => (&mut self.by_route, id.as_str()),
        }
    }
}

impl StateCache for TtlStateCache {
    fn lookup(&mut self, key: &CacheKey) -> Option<Resolution> {
        let freshness = self.freshness;
        let (entries, id) = self.entries_mut(key);
        let entry = entries.get_mut(id)?;
        if entry.refreshed_at.elapsed() < freshness {
            entry.refreshed_at = Instant::now();
            return Some(entry.resolution.clone());
        }
        entries.remove(id);
        debug!(?key, "cache entry expired");
        None
    }

    fn insert(&mut self, key: CacheKey, resolution: Resolution) {
        if resolution.state.is_none() {
            return;
        }
        let entry = CacheEntry {
            resolution,
            refreshed_at: Instant::now(),
        };
        match key {
            CacheKey::State(id) => self.by_state.insert(id, entry),
            CacheKey::Route(id) => self.by_route.insert(id, entry),
        };
    }

    fn refresh_state(&mut self, state: &State) {
        let now = Instant::now();
        for entry in self.by_state.values_mut().chain(self.by_route.values_mut()) {
            if entry.resolution.state_id() == state.id {
                entry.resolution.state = Some(state.clone());
                entry.refreshed_at = now;
            }
        }
        self.by_state
            .entry(state.id.clone())
            .or_insert_with(|| CacheEntry {
                resolution: Resolution {
                    state: Some(state.clone()),
                    scope: ScopeVariableMapping::direct(&state.id),
                },
                refreshed_at: now,
            });
    }

    fn invalidate_state(&mut self, state_id: &str) {
        self.by_state.retain(|_, e| e.resolution.state_id() != state_id);
        self.by_route.retain(|_, e| e.resolution.state_id() != state_id);
        debug!(%state_id, "cache entries invalidated");
    }

    fn purge_expired(&mut self) -> usize {
        let before = self.len();
        let freshness = self.freshness;
        self.by_state.retain(|_, e| e.refreshed_at.elapsed() < freshness);
        self.by_route.retain(|_, e| e.refreshed_at.elapsed() < freshness);
        before - self.len()
    }

    fn len(&self) -> usize {
        self.by_state.len() + self.by_route.len()
    }
}
