//! Mapping of arbitrary backend failures onto the [`ErrorCode`] taxonomy.

use std::time::Duration;

use crate::error::{BackendFailure, ChatError, ErrorCode, ErrorContext};

/// Retry hint attached to rate-limit failures that did not carry their own.
pub const DEFAULT_RATE_LIMIT_RETRY_AFTER: Duration = Duration::from_secs(60);

/// Substring heuristics, checked in order against the lowercased message.
const HEURISTICS: &[(&[&str], ErrorCode)] = &[
    (&["rate limit", "rate-limit", "too many requests"], ErrorCode::RateLimited),
    (&["timed out", "timeout"], ErrorCode::ConnectionTimeout),
    (&["refused"], ErrorCode::ConnectionRefused),
    (&["network", "connection"], ErrorCode::ConnectionFailed),
    (&["unauthorized", "authentication"], ErrorCode::AuthFailed),
    (&["expired"], ErrorCode::AuthExpired),
    (&["forbidden", "permission"], ErrorCode::PermissionDenied),
    (&["quota"], ErrorCode::QuotaExceeded),
    (&["unavailable"], ErrorCode::ServiceUnavailable),
];

/// Match a failure message against the substring heuristics.
pub fn code_from_message(message: &str) -> Option<ErrorCode> {
    let lower = message.to_lowercase();
    HEURISTICS
        .iter()
        .find(|(needles, _)| needles.iter().any(|n| lower.contains(n)))
        .map(|(_, code)| *code)
}

/// Classify a backend failure and attribute it to `context`.
///
/// Already-classified errors keep their code, severity and recoverability;
/// only a missing context is filled in. Everything else goes through the
/// message heuristics and falls back to `backend-internal-error` (when an
/// error object exists, wrapped as the source) or `unknown`.
pub fn classify(failure: BackendFailure, context: ErrorContext) -> ChatError {
    match failure {
        BackendFailure::Classified(err) => {
            if err.context.is_unattributed() {
                err.with_context(context)
            } else {
                err
            }
        }
        BackendFailure::Error(source) => {
            let message = source.to_string();
            let err = match code_from_message(&message) {
                Some(code) => from_heuristic(code, message),
                None => ChatError::new(ErrorCode::BackendInternalError, message),
            };
            ChatError {
                source: Some(source.into()),
                ..err.with_context(context)
            }
        }
        BackendFailure::Opaque(message) => match code_from_message(&message) {
            Some(code) => from_heuristic(code, message).with_context(context),
            None => ChatError::new(ErrorCode::Unknown, message).with_context(context),
        },
    }
}

/// Classify a transport failure raised at a backend's network boundary.
///
/// A specific code in the message (refused, timed out, rate limited) wins;
/// anything else is a retryable `network-error` with `source` attached.
pub fn transport_failure(source: impl std::error::Error + Send + Sync + 'static) -> BackendFailure {
    let message = source.to_string();
    let code = match code_from_message(&message) {
        Some(ErrorCode::ConnectionFailed) | None => ErrorCode::NetworkError,
        Some(code) => code,
    };
    BackendFailure::Classified(from_heuristic(code, message).with_source(source))
}

fn from_heuristic(code: ErrorCode, message: String) -> ChatError {
    let err = ChatError::new(code, message);
    if code == ErrorCode::RateLimited {
        err.with_retry_after(DEFAULT_RATE_LIMIT_RETRY_AFTER)
    } else {
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Severity;

    fn ctx() -> ErrorContext {
        ErrorContext::new("relay", "send_message").with_channel("global-1")
    }

    #[test]
    fn network_text_maps_to_connection_failed() {
        let err = classify(BackendFailure::opaque("Network unreachable"), ctx());
        assert_eq!(err.code, ErrorCode::ConnectionFailed);
        assert_eq!(err.context.backend, "relay");
        assert_eq!(err.context.channel_id.as_deref(), Some("global-1"));
    }

    #[test]
    fn rate_limit_text_gets_default_retry_after() {
        let err = classify(BackendFailure::opaque("blocked: rate limit exceeded"), ctx());
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert_eq!(err.retry_after, Some(DEFAULT_RATE_LIMIT_RETRY_AFTER));
        assert!(err.recoverable);
    }

    #[test]
    fn unmatched_error_object_becomes_internal_with_source() {
        let io = std::io::Error::new(std::io::ErrorKind::InvalidData, "bad frame header");
        let err = classify(BackendFailure::error(io), ctx());
        assert_eq!(err.code, ErrorCode::BackendInternalError);
        assert!(err.source.is_some());
        assert_eq!(err.operation(), "send_message");
    }

    #[test]
    fn unmatched_bare_failure_is_unknown() {
        let err = classify(BackendFailure::opaque("something odd"), ctx());
        assert_eq!(err.code, ErrorCode::Unknown);
        assert!(err.source.is_none());
    }

    #[test]
    fn classified_error_passes_through_and_gains_context() {
        let original = ChatError::new(ErrorCode::NetworkError, "socket reset")
            .with_severity(Severity::High);
        let err = classify(BackendFailure::Classified(original), ctx());
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(err.severity, Severity::High);
        assert_eq!(err.backend(), "relay");
    }

    #[test]
    fn classified_error_keeps_existing_context() {
        let original = ChatError::new(ErrorCode::Timeout, "slow")
            .with_context(ErrorContext::new("graph", "get_messages"));
        let err = classify(BackendFailure::Classified(original), ctx());
        assert_eq!(err.backend(), "graph");
    }

    #[test]
    fn heuristics_are_ordered() {
        // "connection timed out" must be a timeout, not a generic connection failure
        assert_eq!(
            code_from_message("Connection timed out"),
            Some(ErrorCode::ConnectionTimeout)
        );
        assert_eq!(
            code_from_message("Connection refused (os error 111)"),
            Some(ErrorCode::ConnectionRefused)
        );
        assert_eq!(code_from_message("403 Forbidden"), Some(ErrorCode::PermissionDenied));
        assert_eq!(code_from_message("all good"), None);
    }

    #[test]
    fn refused_connections_are_critical() {
        let err = classify(BackendFailure::opaque("Connection refused (os error 111)"), ctx());
        assert_eq!(err.code, ErrorCode::ConnectionRefused);
        assert_eq!(err.severity, Severity::Critical);
    }

    #[test]
    fn transport_failures_are_retryable_network_errors() {
        let reset = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "connection reset by peer");
        let err = classify(transport_failure(reset), ctx());
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert!(err.recoverable);
        assert!(err.source.is_some());
        assert_eq!(err.backend(), "relay");

        let refused = std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused");
        assert_eq!(
            classify(transport_failure(refused), ctx()).code,
            ErrorCode::ConnectionRefused
        );

        let slow = std::io::Error::new(std::io::ErrorKind::TimedOut, "request timed out");
        assert_eq!(
            classify(transport_failure(slow), ctx()).code,
            ErrorCode::ConnectionTimeout
        );
    }
}
