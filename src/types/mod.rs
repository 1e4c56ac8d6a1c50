//! Core types for the runtime.
//!
//! This module provides foundational types used throughout the system:
//! - **IDs**: Object, correlation and peer identifiers plus the id minter
//! - **Kinds**: Object kind tags
//! - **Errors**: Application error types with thiserror derives
//! - **Config**: Configuration structures for nodes, transport and fabric
//! - **Status**: Host-API status codes

mod config;
mod errors;
mod ids;
mod kinds;
pub mod status;

pub use config::{
    load_node_list, parse_node_list, Config, FabricConfig, NodeAddress, NodeConfig,
    ObservabilityConfig, ReconnectPolicy, TransportConfig, DEFAULT_PORT,
};
pub use errors::{Error, Result};
pub use ids::{CorrelationId, IdMinter, NodePrefix, ObjectId, PeerId, COUNTER_BITS};
pub use kinds::ObjectKind;
