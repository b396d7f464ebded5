//! redb table definitions for the state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized records).

use redb::TableDefinition;

/// State headers keyed by `{state_id}`.
pub const STATES: TableDefinition<&str, &[u8]> = TableDefinition::new("states");

/// State rows keyed by `{state_id}\x1f{row_key}`.
pub const STATE_ROWS: TableDefinition<&str, &[u8]> = TableDefinition::new("state_rows");

/// Processor↔state routes keyed by `{state_id}:{direction}:{processor_id}`.
pub const ROUTES: TableDefinition<&str, &[u8]> = TableDefinition::new("routes");

/// Processors keyed by `{processor_id}`.
pub const PROCESSORS: TableDefinition<&str, &[u8]> = TableDefinition::new("processors");

/// Processor providers keyed by `{provider_id}`.
pub const PROVIDERS: TableDefinition<&str, &[u8]> = TableDefinition::new("providers");

/// Separator between state id and row key.
pub const ROW_KEY_SEPARATOR: char = '\x1f';

/// Build the rows table key for one row of a state.
pub fn row_key(state_id: &str, row: &str) -> String {
    format!("{state_id}{ROW_KEY_SEPARATOR}{row}")
}

/// Half-open key range covering every row of a state.
pub fn row_range(state_id: &str) -> (String, String) {
    (
        format!("{state_id}{ROW_KEY_SEPARATOR}"),
        format!("{state_id}\x20"),
    )
}
