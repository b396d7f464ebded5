//! statesync-engine: the state sync consumer engine.
//!
//! Per message the [`Dispatcher`] runs
//! `classify → resolve → merge → persist → forward`, and the
//! [`SyncConsumer`] loop acknowledges or requeues the message depending on
//! the outcome.
//!
//! - [`message`] validates the inbound JSON envelope once, at the boundary.
//! - [`cache`] memoizes resolved states per consumer instance.
//! - [`merge`] applies ordered query state entries onto a state.
//! - [`forward`] multicasts merged entries to downstream input routes.
//! - [`consumer`] drives a subscription until shutdown.

pub mod cache;
pub mod consumer;
pub mod dispatcher;
pub mod error;
pub mod forward;
pub mod merge;
pub mod message;
pub mod monitor;

pub use cache::{CacheKey, Resolution, StateCache, TtlStateCache};
pub use consumer::{ConsumerStats, RetryPolicy, SyncConsumer};
pub use dispatcher::{DispatchOptions, Dispatcher, Outcome, SyncReport};
pub use error::{Disposition, SyncError};
pub use forward::{EdgeError, EdgeFailure, ForwardOutcome, ForwardReport, ForwardRouter};
pub use merge::{MergeEngine, MergeError, MergeOutcome};
pub use message::{ForwardMessage, InboundMessage, QUERY_STATE_DIRECT, QUERY_STATE_ROUTE};
pub use monitor::Monitor;
