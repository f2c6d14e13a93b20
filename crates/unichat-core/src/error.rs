use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Backend name used in contexts of errors that have not been attributed yet.
pub const UNATTRIBUTED: &str = "unattributed";

/// Closed set of failure codes every backend failure is mapped onto.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorCode {
    ConnectionFailed,
    ConnectionTimeout,
    ConnectionRefused,
    AuthFailed,
    AuthExpired,
    PermissionDenied,
    FeatureNotSupported,
    FeatureDeprecated,
    RateLimited,
    QuotaExceeded,
    InvalidMessage,
    InvalidChannel,
    InvalidUser,
    NetworkError,
    Timeout,
    BackendInternalError,
    ServiceUnavailable,
    Unknown,
}

impl ErrorCode {
    /// Stable machine-readable code string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::ConnectionFailed => "connection-failed",
            ErrorCode::ConnectionTimeout => "connection-timeout",
            ErrorCode::ConnectionRefused => "connection-refused",
            ErrorCode::AuthFailed => "auth-failed",
            ErrorCode::AuthExpired => "auth-expired",
            ErrorCode::PermissionDenied => "permission-denied",
            ErrorCode::FeatureNotSupported => "feature-not-supported",
            ErrorCode::FeatureDeprecated => "feature-deprecated",
            ErrorCode::RateLimited => "rate-limited",
            ErrorCode::QuotaExceeded => "quota-exceeded",
            ErrorCode::InvalidMessage => "invalid-message",
            ErrorCode::InvalidChannel => "invalid-channel",
            ErrorCode::InvalidUser => "invalid-user",
            ErrorCode::NetworkError => "network-error",
            ErrorCode::Timeout => "timeout",
            ErrorCode::BackendInternalError => "backend-internal-error",
            ErrorCode::ServiceUnavailable => "service-unavailable",
            ErrorCode::Unknown => "unknown",
        }
    }

    pub fn default_severity(&self) -> Severity {
        match self {
            ErrorCode::FeatureNotSupported | ErrorCode::FeatureDeprecated => Severity::Low,
            ErrorCode::ConnectionFailed
            | ErrorCode::AuthFailed
            | ErrorCode::QuotaExceeded
            | ErrorCode::BackendInternalError
            | ErrorCode::ServiceUnavailable => Severity::High,
            ErrorCode::ConnectionRefused => Severity::Critical,
            _ => Severity::Medium,
        }
    }

    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorCode::ConnectionFailed
                | ErrorCode::ConnectionTimeout
                | ErrorCode::AuthExpired
                | ErrorCode::RateLimited
                | ErrorCode::NetworkError
                | ErrorCode::Timeout
                | ErrorCode::ServiceUnavailable
        )
    }

    /// Codes the retry policy is allowed to retry (when also recoverable).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCode::RateLimited
                | ErrorCode::ConnectionTimeout
                | ErrorCode::NetworkError
                | ErrorCode::ServiceUnavailable
        )
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// How the failure should surface to the user.
    pub fn notice(&self) -> Notice {
        match self {
            Severity::Low => Notice::Silent,
            Severity::Medium => Notice::Toast,
            Severity::High => Notice::Blocking,
            Severity::Critical => Notice::Degraded,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Low => write!(f, "low"),
            Severity::Medium => write!(f, "medium"),
            Severity::High => write!(f, "high"),
            Severity::Critical => write!(f, "critical"),
        }
    }
}

/// User-visible treatment derived from [`Severity`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Notice {
    /// Log only.
    Silent,
    /// Non-blocking notice.
    Toast,
    /// Blocking error shown to the user.
    Blocking,
    /// Disable the affected channel kind instead of retrying.
    Degraded,
}

/// Where an error came from: which backend, which logical operation, and the
/// ids involved.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorContext {
    pub backend: String,
    pub operation: String,
    pub channel_id: Option<String>,
    pub message_id: Option<String>,
    pub user_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl ErrorContext {
    pub fn new(backend: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            backend: backend.into(),
            operation: operation.into(),
            channel_id: None,
            message_id: None,
            user_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Placeholder context for errors raised before any backend is involved.
    pub fn unattributed() -> Self {
        Self::new(UNATTRIBUTED, UNATTRIBUTED)
    }

    pub fn is_unattributed(&self) -> bool {
        self.backend == UNATTRIBUTED
    }

    pub fn with_channel(mut self, channel_id: impl Into<String>) -> Self {
        self.channel_id = Some(channel_id.into());
        self
    }

    pub fn with_message(mut self, message_id: impl Into<String>) -> Self {
        self.message_id = Some(message_id.into());
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }
}

/// The one error type that crosses adapter and router boundaries.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct ChatError {
    pub code: ErrorCode,
    pub message: String,
    pub severity: Severity,
    pub recoverable: bool,
    pub context: ErrorContext,
    /// Wait requested by the backend before the next attempt.
    pub retry_after: Option<Duration>,
    #[source]
    pub source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl ChatError {
    /// Create an error with the code's default severity and recoverability.
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            severity: code.default_severity(),
            recoverable: code.default_recoverable(),
            context: ErrorContext::unattributed(),
            retry_after: None,
            source: None,
        }
    }

    /// Raised when a capability path is absent. Always low and non-recoverable.
    pub fn feature_not_supported(path: &str) -> Self {
        Self::new(
            ErrorCode::FeatureNotSupported,
            format!("backend does not support '{}'", path),
        )
        .with_severity(Severity::Low)
        .with_recoverable(false)
    }

    /// Raised when an operation reaches a component that is not connected.
    pub fn not_connected(component: &str) -> Self {
        Self::new(
            ErrorCode::ConnectionFailed,
            format!("{} is not connected", component),
        )
        .with_recoverable(false)
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_context(mut self, context: ErrorContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_retry_after(mut self, retry_after: Duration) -> Self {
        self.retry_after = Some(retry_after);
        self
    }

    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }

    pub fn backend(&self) -> &str {
        &self.context.backend
    }

    pub fn operation(&self) -> &str {
        &self.context.operation
    }
}

/// A failure as reported by a backend client, before classification.
///
/// Adapters convert their backend-native errors into this type at the
/// boundary; `classify` then turns it into a [`ChatError`].
#[derive(Debug)]
pub enum BackendFailure {
    /// The adapter already knows the exact taxonomy code.
    Classified(ChatError),
    /// An error object the classifier has to inspect.
    Error(Box<dyn std::error::Error + Send + Sync>),
    /// A bare failure report with no error object (status text, rejection reason).
    Opaque(String),
}

impl BackendFailure {
    pub fn error(err: impl std::error::Error + Send + Sync + 'static) -> Self {
        BackendFailure::Error(Box::new(err))
    }

    pub fn opaque(message: impl Into<String>) -> Self {
        BackendFailure::Opaque(message.into())
    }

    pub fn message(&self) -> String {
        match self {
            BackendFailure::Classified(err) => err.message.clone(),
            BackendFailure::Error(err) => err.to_string(),
            BackendFailure::Opaque(message) => message.clone(),
        }
    }
}

impl From<ChatError> for BackendFailure {
    fn from(err: ChatError) -> Self {
        BackendFailure::Classified(err)
    }
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message())
    }
}

/// Every failure collected by a fan-out that failed on all backends.
#[derive(Debug, Clone, Error)]
#[error("{} backend(s) failed", failures.len())]
pub struct FanOutFailure {
    pub failures: Vec<ChatError>,
}

pub type Result<T> = std::result::Result<T, ChatError>;
