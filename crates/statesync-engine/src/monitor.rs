//! Failure telemetry published to the monitor route.
//!
//! Events are best effort: a monitor that cannot publish logs and moves on,
//! it never changes how the failed message is settled.

use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use statesync_bus::{MessageSink, RouteTable};

use crate::error::SyncError;

/// Event type tag of a failed sync cycle.
pub const STATE_SYNC_FAILURE: &str = "state_sync_failure";

#[derive(Debug, Serialize)]
struct FailureEvent<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    /// Error category, see [`SyncError::kind`].
    category: &'static str,
    error: String,
    /// The offending payload, lossily decoded.
    payload: &'a str,
    redeliveries: u32,
}

#[derive(Clone)]
pub struct Monitor {
    sink: Arc<dyn MessageSink>,
    routes: Arc<dyn RouteTable>,
    monitor_route: String,
}

impl Monitor {
    pub fn new(sink: Arc<dyn MessageSink>, routes: Arc<dyn RouteTable>, monitor_route: &str) -> Self {
        Self {
            sink,
            routes,
            monitor_route: monitor_route.to_string(),
        }
    }

    /// Report a message that was dropped or gave up retrying.
    pub async fn report_failure(&self, error: &SyncError, payload: &str, redeliveries: u32) {
        let destinations = self.routes.destinations(&self.monitor_route);
        if destinations.is_empty() {
            debug!(route = %self.monitor_route, "no monitor destination, failure not reported");
            return;
        }

        let event = FailureEvent {
            kind: STATE_SYNC_FAILURE,
            category: error.kind(),
            error: error.to_string(),
            payload,
            redeliveries,
        };
        let body = match serde_json::to_vec(&event) {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "failed to encode monitor event");
                return;
            }
        };

        for destination in &destinations {
            if let Err(e) = self.sink.publish(destination, body.clone()).await {
                warn!(%destination, error = %e, "failed to publish monitor event");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Value;
    use statesync_bus::{InMemoryBus, StaticRouteTable};

    #[tokio::test]
    async fn failure_event_shape() {
        let bus = InMemoryBus::new();
        let events = bus.subscribe("monitor");
        let table = StaticRouteTable::default().with_route("processor/monitor", ["monitor"]);
        let monitor = Monitor::new(Arc::new(bus.clone()), Arc::new(table), "processor/monitor");

        monitor
            .report_failure(&SyncError::MissingType, "{\"state_id\":\"S1\"}", 0)
            .await;

        let delivery = events.try_receive().expect("monitor event");
        let value: Value = serde_json::from_slice(&delivery.payload).unwrap();
        assert_eq!(value["type"], STATE_SYNC_FAILURE);
        assert_eq!(value["category"], "malformed");
        assert_eq!(value["payload"], "{\"state_id\":\"S1\"}");
        assert!(value["error"].as_str().unwrap().contains("message type"));
    }

    #[tokio::test]
    async fn unrouted_monitor_is_silent() {
        let bus = InMemoryBus::new();
        let monitor = Monitor::new(
            Arc::new(bus.clone()),
            Arc::new(StaticRouteTable::default()),
            "processor/monitor",
        );
        monitor.report_failure(&SyncError::MissingPayload, "{}", 0).await;
        assert_eq!(bus.published(), 0);
    }
}
