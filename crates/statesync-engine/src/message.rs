//! Inbound and outbound message envelopes.
//!
//! Inbound payloads are loosely typed JSON. They are validated once here
//! and turned into an [`InboundMessage`]; nothing downstream touches raw
//! JSON fields again.

use serde::Serialize;
use serde_json::{Map, Value};

use statesync_core::{QueryStateEntry, RouteId, StateId};

use crate::error::SyncError;

/// Type tag of a message addressed by state id.
pub const QUERY_STATE_DIRECT: &str = "query_state_direct";
/// Type tag of a message addressed by route id.
pub const QUERY_STATE_ROUTE: &str = "query_state_route";

/// A validated inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundMessage {
    Direct {
        state_id: StateId,
        entries: Vec<QueryStateEntry>,
    },
    Routed {
        route_id: RouteId,
        entries: Vec<QueryStateEntry>,
    },
}

impl InboundMessage {
    /// Classify and validate a raw payload.
    ///
    /// Checks run in a fixed order: `type` present, payload present and
    /// well formed, `type` known, id field present.
    pub fn parse(payload: &[u8]) -> Result<Self, SyncError> {
        let value: Value =
            serde_json::from_slice(payload).map_err(|e| SyncError::InvalidJson(e.to_string()))?;
        let Value::Object(mut fields) = value else {
            return Err(SyncError::InvalidJson("expected an object".to_string()));
        };

        let kind = match fields.get("type") {
            None | Some(Value::Null) => return Err(SyncError::MissingType),
            Some(Value::String(kind)) => kind.clone(),
            Some(other) => return Err(SyncError::UnknownType(other.to_string())),
        };

        let payload = take_non_null(&mut fields, "query_state")
            .or_else(|| take_non_null(&mut fields, "query_state_list"));
        let entries = parse_entries(payload)?;

        match kind.as_str() {
            QUERY_STATE_DIRECT => Ok(InboundMessage::Direct {
                state_id: required_id(&fields, "state_id").ok_or(SyncError::MissingStateId)?,
                entries,
            }),
            QUERY_STATE_ROUTE => Ok(InboundMessage::Routed {
                route_id: required_id(&fields, "route_id").ok_or(SyncError::MissingRouteId)?,
                entries,
            }),
            _ => Err(SyncError::UnknownType(kind)),
        }
    }

    pub fn entries(&self) -> &[QueryStateEntry] {
        match self {
            InboundMessage::Direct { entries, .. } | InboundMessage::Routed { entries, .. } => {
                entries
            }
        }
    }
}

fn take_non_null(fields: &mut Map<String, Value>, key: &str) -> Option<Value> {
    fields.remove(key).filter(|v| !v.is_null())
}

fn parse_entries(payload: Option<Value>) -> Result<Vec<QueryStateEntry>, SyncError> {
    match payload {
        None => Err(SyncError::MissingPayload),
        Some(Value::Array(items)) if items.is_empty() => Err(SyncError::MissingPayload),
        Some(Value::Array(items)) => items
            .into_iter()
            .enumerate()
            .map(|(index, item)| match item {
                Value::Object(map) => Ok(QueryStateEntry(map)),
                _ => Err(SyncError::InvalidEntry { index }),
            })
            .collect(),
        Some(Value::Object(map)) if map.is_empty() => Err(SyncError::MissingPayload),
        Some(Value::Object(map)) => Ok(vec![QueryStateEntry(map)]),
        Some(_) => Err(SyncError::InvalidEntry { index: 0 }),
    }
}

fn required_id(fields: &Map<String, Value>, key: &str) -> Option<String> {
    match fields.get(key)? {
        Value::String(id) if !id.trim().is_empty() => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// A merged update multicast to one downstream route.
#[derive(Debug, Serialize)]
pub struct ForwardMessage<'a> {
    #[serde(rename = "type")]
    pub kind: &'static str,
    pub route_id: &'a str,
    pub query_state: &'a [QueryStateEntry],
}

impl<'a> ForwardMessage<'a> {
    pub fn new(route_id: &'a str, query_state: &'a [QueryStateEntry]) -> Self {
        Self {
            kind: QUERY_STATE_ROUTE,
            route_id,
            query_state,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}
