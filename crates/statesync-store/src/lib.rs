//! statesync-store: durable state storage for the sync node.
//!
//! Defines the [`StateRepository`] port the dispatcher talks to, and
//! [`StateStore`], an implementation backed by [redb](https://docs.rs/redb).
//!
//! # Layout
//!
//! State headers (config, columns, count, version) and state rows are kept
//! in separate tables so a state can be loaded without its body. Rows are
//! keyed `{state_id}\x1f{row_key}`, which makes the per-state row count a
//! single range scan. Graph records (routes, processors, providers) are
//! JSON-serialized into their own tables.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;

pub use error::{StoreError, StoreResult};
pub use repository::{RouteQuery, StateRepository};
pub use store::StateStore;
