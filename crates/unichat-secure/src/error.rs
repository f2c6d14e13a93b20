use unichat_core::{classify::transport_failure, BackendFailure, ChatError, ErrorCode};

/// Errors produced by a secure channel service client.
#[derive(Debug, thiserror::Error)]
pub enum SecureError {
    #[error("secure service network error: {0}")]
    Transport(String),

    #[error("secure service request timed out")]
    Timeout,

    #[error("no open session")]
    NoSession,

    #[error("session keys expired")]
    SessionExpired,

    #[error("device is not registered with the service")]
    Unregistered,

    #[error("{member} is not a member of {channel}")]
    NotMember { channel: String, member: String },

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("envelope not found: {0}")]
    EnvelopeNotFound(String),

    #[error("unknown member: {0}")]
    MemberNotFound(String),

    #[error("blob of {size} bytes exceeds the {max} byte limit")]
    TooLarge { size: u64, max: u64 },

    /// Non-success HTTP status from the service.
    #[error("service returned {status}: {body}")]
    Status { status: u16, body: String },
}

impl From<SecureError> for BackendFailure {
    fn from(err: SecureError) -> Self {
        let code = match err {
            SecureError::Transport(_) | SecureError::Timeout => return transport_failure(err),
            SecureError::NoSession => {
                return BackendFailure::Classified(ChatError::not_connected("secure session"))
            }
            SecureError::Status { status, ref body } => match status {
                429 => ErrorCode::RateLimited,
                503 => ErrorCode::ServiceUnavailable,
                500..=599 => ErrorCode::BackendInternalError,
                _ => return BackendFailure::opaque(body.clone()),
            },
            SecureError::SessionExpired => ErrorCode::AuthExpired,
            SecureError::Unregistered => ErrorCode::AuthFailed,
            SecureError::NotMember { .. } => ErrorCode::PermissionDenied,
            SecureError::ChannelNotFound(_) => ErrorCode::InvalidChannel,
            SecureError::EnvelopeNotFound(_) | SecureError::TooLarge { .. } => {
                ErrorCode::InvalidMessage
            }
            SecureError::MemberNotFound(_) => ErrorCode::InvalidUser,
        };
        let mut chat = ChatError::new(code, err.to_string());
        if code == ErrorCode::RateLimited {
            chat = chat.with_retry_after(unichat_core::classify::DEFAULT_RATE_LIMIT_RETRY_AFTER);
        }
        BackendFailure::Classified(chat.with_source(err))
    }
}

#[cfg(test)]
mod tests {
    use unichat_core::{classify, ErrorContext, Severity};

    use super::*;

    fn classified(err: SecureError) -> ChatError {
        classify(err.into(), ErrorContext::new("secure", "test"))
    }

    #[test]
    fn status_codes_map_onto_the_taxonomy() {
        let limited = classified(SecureError::Status {
            status: 429,
            body: "slow down".into(),
        });
        assert_eq!(limited.code, ErrorCode::RateLimited);
        assert!(limited.retry_after.is_some());

        let down = classified(SecureError::Status {
            status: 503,
            body: String::new(),
        });
        assert_eq!(down.code, ErrorCode::ServiceUnavailable);
        assert_eq!(down.severity, Severity::High);

        let forbidden = classified(SecureError::Status {
            status: 403,
            body: "Forbidden".into(),
        });
        assert_eq!(forbidden.code, ErrorCode::PermissionDenied);
    }

    #[test]
    fn session_errors_are_auth_errors() {
        assert_eq!(classified(SecureError::SessionExpired).code, ErrorCode::AuthExpired);
        assert!(classified(SecureError::SessionExpired).recoverable);
        assert_eq!(classified(SecureError::Unregistered).code, ErrorCode::AuthFailed);
    }

    #[test]
    fn transport_errors_are_retryable() {
        assert_eq!(
            classified(SecureError::Transport("dns".into())).code,
            ErrorCode::NetworkError
        );
        assert_eq!(
            classified(SecureError::Transport("connection refused".into())).code,
            ErrorCode::ConnectionRefused
        );
        assert_eq!(classified(SecureError::Timeout).code, ErrorCode::ConnectionTimeout);
    }
}
