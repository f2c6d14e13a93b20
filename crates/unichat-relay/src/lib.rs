//! Gossip-relay backend for unichat.
//!
//! Channels and messages are signed relay events; delivery is pushed through
//! relay subscriptions. The network itself sits behind [`RelayClient`].

pub mod adapter;
pub mod client;
pub mod convert;
pub mod error;
pub mod memory;

/// Backend name used in channels, capabilities and error contexts.
pub const BACKEND_NAME: &str = "relay";

pub use adapter::{relay_capabilities, RelayAdapter, RelayShim};
pub use client::{RelayClient, RelayEvent, RelayFilter, RelaySubscription, UnsignedEvent};
pub use error::RelayError;
pub use memory::MemoryRelay;
