//! Merge engine: applies ordered query state entries onto a state.
//!
//! Each entry becomes one row update. With a primary key configured, rows
//! are upserted by key and fields are last-write-wins; without one, every
//! entry appends a row under the next sequence number. Scope columns are
//! stamped from the [`ScopeVariableMapping`] and take precedence over the
//! entry's own values.
//!
//! Merging is not idempotent: applying the same entry twice is two updates.

use thiserror::Error;
use tracing::{debug, warn};

use statesync_core::{QueryStateEntry, Row, ScopeVariableMapping, State, StateId};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum MergeError {
    #[error("unable to merge into state {0}: state not resolved")]
    AbsentState(StateId),
}

/// Result of one merge call.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    /// The state with merged rows marked dirty.
    pub state: State,
    /// Entries that produced a row update, in arrival order.
    pub accepted: Vec<QueryStateEntry>,
    /// Entries dropped for lacking a primary key column.
    pub rejected: usize,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MergeEngine;

impl MergeEngine {
    pub fn new() -> Self {
        Self
    }

    /// Apply `entries` in order onto `state`.
    pub fn apply(
        &self,
        state: Option<State>,
        entries: &[QueryStateEntry],
        scope: &ScopeVariableMapping,
    ) -> Result<MergeOutcome, MergeError> {
        let mut state = state.ok_or_else(|| MergeError::AbsentState(scope.state_id.clone()))?;
        let mut accepted = Vec::with_capacity(entries.len());
        let mut rejected = 0;

        for (index, entry) in entries.iter().enumerate() {
            if entry.is_empty() {
                debug!(state_id = %state.id, index, "skipping empty query state entry");
                continue;
            }
            match apply_entry(&mut state, entry, scope) {
                Ok(()) => accepted.push(entry.clone()),
                Err(column) => {
                    warn!(
                        state_id = %state.id,
                        index,
                        %column,
                        "query state entry is missing a primary key column"
                    );
                    rejected += 1;
                }
            }
        }

        Ok(MergeOutcome {
            state,
            accepted,
            rejected,
        })
    }
}

/// Merge one entry. Returns the missing primary key column on failure.
fn apply_entry(
    state: &mut State,
    entry: &QueryStateEntry,
    scope: &ScopeVariableMapping,
) -> Result<(), String> {
    let mut fields: Row = entry
        .iter()
        .map(|(column, value)| (column.clone(), value.clone()))
        .collect();
    for (column, binding) in &state.config.scope_columns {
        if let Some(value) = scope.value(*binding) {
            fields.insert(column.clone(), value);
        }
    }

    let key = row_key(state, &fields)?;
    for column in fields.keys() {
        state.track_column(column);
    }
    state.rows.entry(key.clone()).or_default().extend(fields);
    state.dirty.insert(key);
    Ok(())
}

fn row_key(state: &mut State, fields: &Row) -> Result<String, String> {
    if state.config.primary_key.is_empty() {
        let key = format!("{:020}", state.next_row_seq);
        state.next_row_seq += 1;
        return Ok(key);
    }

    let mut parts = Vec::with_capacity(state.config.primary_key.len());
    for column in &state.config.primary_key {
        match fields.get(column) {
            Some(value) if !value.is_null() => parts.push(value.to_string()),
            _ => return Err(column.clone()),
        }
    }
    // JSON array encoding keeps composite keys unambiguous.
    Ok(format!("[{}]", parts.join(",")))
}
