use unichat_core::{classify::transport_failure, BackendFailure, ChatError, ErrorCode};

/// Errors produced by a graph store client.
#[derive(Debug, thiserror::Error)]
pub enum GraphError {
    #[error("peer connection failed: {0}")]
    Peer(String),

    #[error("graph write timed out after {0} ms")]
    Timeout(u64),

    /// Negative write acknowledgement from a peer, passed through verbatim.
    #[error("{0}")]
    Ack(String),

    #[error("not connected to any peer")]
    NotConnected,

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("message not found: {0}")]
    MessageNotFound(String),

    #[error("permission denied: {0}")]
    NotPermitted(String),

    #[error("malformed node at {path}: {reason}")]
    Malformed { path: String, reason: String },
}

impl From<GraphError> for BackendFailure {
    fn from(err: GraphError) -> Self {
        let code = match err {
            GraphError::Peer(_) | GraphError::Timeout(_) => return transport_failure(err),
            GraphError::Ack(reason) => return BackendFailure::opaque(reason),
            GraphError::NotConnected => {
                return BackendFailure::Classified(ChatError::not_connected("graph client"))
            }
            GraphError::ChannelNotFound(_) => ErrorCode::InvalidChannel,
            GraphError::MessageNotFound(_) => ErrorCode::InvalidMessage,
            GraphError::NotPermitted(_) => ErrorCode::PermissionDenied,
            GraphError::Malformed { .. } => ErrorCode::BackendInternalError,
        };
        BackendFailure::Classified(ChatError::new(code, err.to_string()).with_source(err))
    }
}
