//! # dcl-core - distributed compute object runtime
//!
//! Lets one client program use the compute devices of several networked
//! nodes as if they were local:
//! - Cluster-unique object identifiers minted without coordination
//! - A framed, correlated request/response and notification protocol over TCP
//! - Proxy and backing object registries
//! - An event fabric that replicates event state to every interested node
//! - Context error and program build listeners
//!
//! ## Architecture
//!
//! ```text
//!   ClusterClient ──┐                       ┌── ComputeNode (prefix 1)
//!    Registry       │   frames over TCP     │    Registry ── ComputeDriver
//!    Fabric         ├──────────────────────►│    Fabric
//!    Peer per node  │                       └── ComputeNode (prefix 2) ...
//!                   └── EventStatusChanged / ContextError / ProgramBuildComplete
//! ```

// Enforce strict safety at compile time
#![deny(unsafe_code)]
#![warn(missing_debug_implementations)]
#![warn(rust_2018_idioms)]

pub mod client;
pub mod driver;
pub mod fabric;
pub mod node;
pub mod protocol;
pub mod registry;
pub mod transport;
pub mod types;

// Internal utilities
pub mod observability;

pub use client::ClusterClient;
pub use node::ComputeNode;
pub use types::{Config, Error, ObjectId, ObjectKind, Result};
