pub mod config;
pub mod graph;
pub mod types;

pub use config::{ConfigError, SyncConfig};
pub use graph::GraphDocument;
pub use types::*;
