//! statesync-bus: message transport for the state sync node.
//!
//! The engine only sees two capabilities: a [`MessageSource`] it receives,
//! acknowledges and rejects messages on, and a [`MessageSink`] it publishes
//! to. Logical route names are mapped to publishable destinations by a
//! [`RouteTable`].
//!
//! [`InMemoryBus`] implements both sides in-process with bounded queues and
//! competing consumers, which is what the daemon runs on and what the tests
//! drive.

pub mod memory;
pub mod route_table;
pub mod transport;

pub use memory::{InMemoryBus, Subscription};
pub use route_table::{RouteTable, StaticRouteTable};
pub use transport::{Delivery, MessageSink, MessageSource, TransportError, TransportResult};

/// Default capacity of each in-memory subject queue.
pub const DEFAULT_QUEUE_CAPACITY: usize = 1024;
