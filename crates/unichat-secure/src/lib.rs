//! Forward-secret channel service backend for unichat.
//!
//! The service exposes no push delivery; subscriptions poll (see
//! [`adapter`]). Encryption happens inside the [`SecureClient`]
//! implementation; this crate only ever sees plaintext envelopes.

pub mod adapter;
pub mod client;
pub mod error;
pub mod memory;

pub const BACKEND_NAME: &str = "secure";

pub use adapter::{secure_capabilities, SecureAdapter, SecureShim};
pub use client::{Envelope, FetchRange, SecureChannelInfo, SecureClient, StoredBlob};
pub use error::SecureError;
pub use memory::MemorySecure;
