use unichat_core::{ChannelKind, ChatError, ConnectionState};

/// Notifications broadcast by the [`Router`](crate::Router).
///
/// Delivered through a `tokio::sync::broadcast` channel; slow receivers may
/// observe `RecvError::Lagged` and miss events.
#[derive(Debug, Clone)]
pub enum RouterEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },

    /// A critical failure took every kind routed to `backend` out of service
    /// until the next connect.
    Degraded {
        backend: String,
        kinds: Vec<ChannelKind>,
        error: ChatError,
    },

    /// An adapter failed to connect or failed during a fan-out.
    AdapterFailed { backend: String, error: ChatError },
}

impl RouterEvent {
    pub fn backend(&self) -> Option<&str> {
        match self {
            RouterEvent::StateChanged { .. } => None,
            RouterEvent::Degraded { backend, .. } | RouterEvent::AdapterFailed { backend, .. } => {
                Some(backend)
            }
        }
    }
}
