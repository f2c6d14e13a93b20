//! Distributed graph-store backend for unichat.

pub mod adapter;
pub mod client;
pub mod error;
pub mod memory;
pub mod node;

pub const BACKEND_NAME: &str = "graph";

pub use adapter::{graph_capabilities, GraphAdapter, GraphShim};
pub use client::{GraphClient, GraphIdentity, GraphListener, GraphPaths, GraphWatch};
pub use error::GraphError;
pub use memory::MemoryGraph;
