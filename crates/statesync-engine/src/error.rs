//! Dispatcher error taxonomy.

use thiserror::Error;

use statesync_store::StoreError;

use crate::merge::MergeError;

/// What the consumer does with a message whose cycle failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Acknowledge and log. Redelivery would fail the same way.
    Drop,
    /// Reject and requeue with backoff.
    Retry,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("message is not a JSON object: {0}")]
    InvalidJson(String),

    #[error("unable to identify message type, must be one of: [query_state_route, query_state_direct]")]
    MissingType,

    #[error("invalid message type: {0}")]
    UnknownType(String),

    #[error("no query state information found in message")]
    MissingPayload,

    #[error("query state entry {index} is not an object")]
    InvalidEntry { index: usize },

    #[error("no state id defined in message")]
    MissingStateId,

    #[error("no route id defined in message")]
    MissingRouteId,

    #[error("unable to identify route id {route_id}, expected 1 result, received {found}")]
    RouteResolution { route_id: String, found: usize },

    #[error("processor {processor_id} referenced by route {route_id} not found")]
    ProcessorNotFound {
        route_id: String,
        processor_id: String,
    },

    #[error("provider {provider_id} of processor {processor_id} not found")]
    ProviderNotFound {
        processor_id: String,
        provider_id: String,
    },

    #[error(transparent)]
    Merge(#[from] MergeError),

    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    pub fn disposition(&self) -> Disposition {
        match self {
            SyncError::Store(e) if e.is_transient() => Disposition::Retry,
            _ => Disposition::Drop,
        }
    }

    /// Short category name for logs and monitor events.
    pub fn kind(&self) -> &'static str {
        match self {
            SyncError::InvalidJson(_)
            | SyncError::MissingType
            | SyncError::UnknownType(_)
            | SyncError::MissingPayload
            | SyncError::InvalidEntry { .. }
            | SyncError::MissingStateId
            | SyncError::MissingRouteId => "malformed",
            SyncError::RouteResolution { .. }
            | SyncError::ProcessorNotFound { .. }
            | SyncError::ProviderNotFound { .. } => "routing",
            SyncError::Merge(_) => "merge",
            SyncError::Store(_) => "store",
        }
    }
}
