use unichat_core::{ChatError, ErrorCode, ErrorContext, FanOutFailure, Severity};

/// Result of an operation sent to several adapters.
///
/// `items` concatenates the successful results in route order; `failures`
/// holds the classified error of every adapter that failed.
#[derive(Debug, Clone)]
pub struct FanOut<T> {
    pub items: Vec<T>,
    pub failures: Vec<ChatError>,
}

impl<T> FanOut<T> {
    pub fn is_partial(&self) -> bool {
        !self.failures.is_empty()
    }

    pub fn into_items(self) -> Vec<T> {
        self.items
    }
}

impl<T> Default for FanOut<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Fold the failures of a fan-out where every adapter failed into one error.
///
/// Code is service-unavailable, severity the highest seen, recoverable if
/// any single failure was. The individual errors stay reachable through the
/// [`FanOutFailure`] source.
pub fn aggregate(operation: &str, failures: Vec<ChatError>) -> ChatError {
    let severity = failures
        .iter()
        .map(|e| e.severity)
        .max()
        .unwrap_or(Severity::High);
    let recoverable = failures.iter().any(|e| e.recoverable);
    let summary = failures
        .iter()
        .map(|e| format!("{} ({}): {}", e.backend(), e.code, e.message))
        .collect::<Vec<_>>()
        .join("; ");

    ChatError::new(
        ErrorCode::ServiceUnavailable,
        format!("{} failed on every backend: {}", operation, summary),
    )
    .with_severity(severity)
    .with_recoverable(recoverable)
    .with_context(ErrorContext::new(crate::router::ROUTER, operation))
    .with_source(FanOutFailure { failures })
}
