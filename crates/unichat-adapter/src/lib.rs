//! Base adapter skeleton shared by every unichat backend.
//!
//! A backend crate implements [`BackendShim`]; wrapping it in [`Adapter`]
//! yields a [`ChatAdapter`] with connection checks, capability gating, error
//! classification and per-channel subscription bookkeeping.

pub mod adapter;
pub mod shim;
pub mod subscription;

pub use adapter::{Adapter, ChatAdapter};
pub use shim::{BackendShim, DeliveryGate, MessageSink, PresenceSink, Sink, SubscriptionCleanup};
pub use subscription::Subscription;
