//! Forward router: multicasts merged entries to downstream processors.
//!
//! Downstream edges are the routes that attach the saved state as an
//! `INPUT`. Each edge gets one `query_state_route` message carrying the
//! edge's route id, published to every destination of the forward route.
//! Edges are independent: a failed publish is recorded and the remaining
//! edges are still attempted.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use statesync_bus::{MessageSink, RouteTable, TransportError};
use statesync_core::{ProcessorStateDirection, QueryStateEntry, RouteId, State};
use statesync_store::{RouteQuery, StateRepository, StoreError};

use crate::message::ForwardMessage;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum EdgeError {
    #[error("no destination configured for forward route {0}")]
    NoDestination(String),

    #[error("failed to encode forward message: {0}")]
    Encode(String),

    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One downstream edge that could not be published.
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeFailure {
    pub route_id: RouteId,
    pub error: EdgeError,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ForwardReport {
    /// Route ids published to every destination.
    pub delivered: Vec<RouteId>,
    pub failed: Vec<EdgeFailure>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ForwardOutcome {
    /// The state does not auto-forward.
    Disabled,
    /// Auto-forward is on but nothing consumes the state.
    NoDownstream,
    Published(ForwardReport),
}

pub struct ForwardRouter {
    store: Arc<dyn StateRepository>,
    sink: Arc<dyn MessageSink>,
    routes: Arc<dyn RouteTable>,
    forward_route: String,
}

impl ForwardRouter {
    pub fn new(
        store: Arc<dyn StateRepository>,
        sink: Arc<dyn MessageSink>,
        routes: Arc<dyn RouteTable>,
        forward_route: &str,
    ) -> Self {
        Self {
            store,
            sink,
            routes,
            forward_route: forward_route.to_string(),
        }
    }

    /// Forward `entries` merged into `state` to every downstream edge.
    ///
    /// Only the edge lookup can fail the call; publish failures are
    /// reported per edge.
    pub async fn route(
        &self,
        state: &State,
        entries: &[QueryStateEntry],
    ) -> Result<ForwardOutcome, StoreError> {
        if !state.auto_forward() {
            debug!(state_id = %state.id, "auto-forward disabled");
            return Ok(ForwardOutcome::Disabled);
        }

        let edges = self
            .store
            .fetch_processor_state_route(RouteQuery::ByState {
                state_id: &state.id,
                direction: ProcessorStateDirection::Input,
            })
            .await?;
        if edges.is_empty() {
            debug!(state_id = %state.id, "no downstream routes");
            return Ok(ForwardOutcome::NoDownstream);
        }

        let destinations = self.routes.destinations(&self.forward_route);
        let mut report = ForwardReport::default();
        for edge in &edges {
            match self.publish_edge(&edge.id, entries, &destinations).await {
                Ok(()) => report.delivered.push(edge.id.clone()),
                Err(error) => {
                    warn!(
                        state_id = %state.id,
                        route_id = %edge.id,
                        %error,
                        "failed to forward state update"
                    );
                    report.failed.push(EdgeFailure {
                        route_id: edge.id.clone(),
                        error,
                    });
                }
            }
        }

        info!(
            state_id = %state.id,
            delivered = report.delivered.len(),
            failed = report.failed.len(),
            entries = entries.len(),
            "state update forwarded"
        );
        Ok(ForwardOutcome::Published(report))
    }

    async fn publish_edge(
        &self,
        route_id: &str,
        entries: &[QueryStateEntry],
        destinations: &[String],
    ) -> Result<(), EdgeError> {
        if destinations.is_empty() {
            return Err(EdgeError::NoDestination(self.forward_route.clone()));
        }
        let payload = ForwardMessage::new(route_id, entries)
            .encode()
            .map_err(|e| EdgeError::Encode(e.to_string()))?;

        let mut first_error = None;
        for destination in destinations {
            if let Err(e) = self.sink.publish(destination, payload.clone()).await {
                if first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
