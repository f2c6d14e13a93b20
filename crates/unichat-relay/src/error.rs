use std::time::Duration;

use unichat_core::{
    classify::{transport_failure, DEFAULT_RATE_LIMIT_RETRY_AFTER},
    BackendFailure, ChatError, ErrorCode,
};

/// Errors produced by a relay client.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("relay connection failed: {0}")]
    Connection(String),

    #[error("relay request timed out")]
    Timeout,

    /// `OK false` from a relay; the reason string is the relay's own prefix
    /// and text (`"blocked: ..."`, `"rate-limited: ..."`).
    #[error("{0}")]
    Rejected(String),

    #[error("relay rate limit exceeded")]
    RateLimited(Option<Duration>),

    #[error("not connected to any relay")]
    NotConnected,

    #[error("channel not found: {0}")]
    ChannelNotFound(String),

    #[error("event not found: {0}")]
    EventNotFound(String),

    #[error("event {0} was not signed by this author")]
    NotAuthor(String),

    #[error("malformed event: {0}")]
    Malformed(String),
}

impl From<RelayError> for BackendFailure {
    fn from(err: RelayError) -> Self {
        match err {
            RelayError::Connection(_) | RelayError::Timeout => transport_failure(err),
            RelayError::Rejected(reason) => BackendFailure::opaque(reason),
            RelayError::RateLimited(after) => BackendFailure::Classified(
                ChatError::new(ErrorCode::RateLimited, "relay rate limit exceeded")
                    .with_retry_after(after.unwrap_or(DEFAULT_RATE_LIMIT_RETRY_AFTER)),
            ),
            RelayError::NotConnected => {
                BackendFailure::Classified(ChatError::not_connected("relay client"))
            }
            RelayError::ChannelNotFound(_) => {
                classified(ErrorCode::InvalidChannel, err)
            }
            RelayError::EventNotFound(_) => classified(ErrorCode::InvalidMessage, err),
            RelayError::NotAuthor(_) => classified(ErrorCode::PermissionDenied, err),
            RelayError::Malformed(_) => classified(ErrorCode::BackendInternalError, err),
        }
    }
}

fn classified(code: ErrorCode, err: RelayError) -> BackendFailure {
    BackendFailure::Classified(ChatError::new(code, err.to_string()).with_source(err))
}

#[cfg(test)]
mod tests {
    use unichat_core::{classify, ErrorContext};

    use super::*;

    fn code_of(err: RelayError) -> ErrorCode {
        classify(err.into(), ErrorContext::new("relay", "test")).code
    }

    #[test]
    fn transport_errors_are_network_errors_unless_more_specific() {
        assert_eq!(
            code_of(RelayError::Connection("socket closed".into())),
            ErrorCode::NetworkError
        );
        assert_eq!(
            code_of(RelayError::Connection("refused".into())),
            ErrorCode::ConnectionRefused
        );
        assert_eq!(code_of(RelayError::Timeout), ErrorCode::ConnectionTimeout);
    }

    #[test]
    fn rejection_reasons_are_classified_by_prefix() {
        assert_eq!(
            code_of(RelayError::Rejected("rate-limited: slow down".into())),
            ErrorCode::RateLimited
        );
        assert_eq!(
            code_of(RelayError::Rejected("blocked: spam".into())),
            ErrorCode::Unknown
        );
    }

    #[test]
    fn rate_limit_keeps_the_relay_hint() {
        let err = classify(
            RelayError::RateLimited(Some(Duration::from_secs(5))).into(),
            ErrorContext::new("relay", "send_message"),
        );
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.retry_after, Some(Duration::from_secs(5)));
        assert_eq!(err.backend(), "relay");
    }

    #[test]
    fn authorship_violations_are_permission_errors() {
        assert_eq!(
            code_of(RelayError::NotAuthor("ev1".into())),
            ErrorCode::PermissionDenied
        );
    }
}
