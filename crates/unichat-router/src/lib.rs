//! Unified router: one messaging API over every configured backend.
//!
//! Channel-scoped operations are dispatched to the adapter that owns the
//! channel's kind; unscoped ones fan out to every healthy adapter.

pub mod builder;
pub mod events;
pub mod fanout;
pub mod registry;
pub mod router;

pub use builder::RouterBuilder;
pub use events::RouterEvent;
pub use fanout::FanOut;
pub use registry::ChannelRegistry;
pub use router::Router;
