//! Route table: resolves logical route names to publishable destinations.

use std::collections::HashMap;

/// Maps a route name (e.g. `processor/state/router`) to zero or more
/// destination subjects.
pub trait RouteTable: Send + Sync {
    fn destinations(&self, route_name: &str) -> Vec<String>;
}

/// A route table fixed at startup.
#[derive(Debug, Clone, Default)]
pub struct StaticRouteTable {
    routes: HashMap<String, Vec<String>>,
}

impl StaticRouteTable {
    pub fn new(routes: HashMap<String, Vec<String>>) -> Self {
        Self { routes }
    }

    /// Register destinations for a route name, replacing earlier ones.
    pub fn with_route<I, S>(mut self, route_name: &str, destinations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.routes.insert(
            route_name.to_string(),
            destinations.into_iter().map(Into::into).collect(),
        );
        self
    }

    /// All route names with at least one destination.
    pub fn route_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .routes
            .iter()
            .filter(|(_, dests)| !dests.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }
}

impl RouteTable for StaticRouteTable {
    fn destinations(&self, route_name: &str) -> Vec<String> {
        self.routes.get(route_name).cloned().unwrap_or_default()
    }
}
