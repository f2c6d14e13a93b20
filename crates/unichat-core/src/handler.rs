use tracing::{debug, error, warn};

use crate::error::{ChatError, Severity};

/// Receives every classified error an adapter raises, before it is returned.
pub trait ErrorHandler: Send + Sync {
    fn handle(&self, error: &ChatError);
}

impl<F> ErrorHandler for F
where
    F: Fn(&ChatError) + Send + Sync,
{
    fn handle(&self, error: &ChatError) {
        self(error)
    }
}

/// Default handler: logs through `tracing` at a level picked by severity.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingErrorHandler;

impl ErrorHandler for TracingErrorHandler {
    fn handle(&self, err: &ChatError) {
        let ctx = &err.context;
        match err.severity {
            Severity::Low => debug!(
                backend = %ctx.backend,
                operation = %ctx.operation,
                channel = ?ctx.channel_id,
                code = %err.code,
                "{}",
                err.message
            ),
            Severity::Medium => warn!(
                backend = %ctx.backend,
                operation = %ctx.operation,
                channel = ?ctx.channel_id,
                code = %err.code,
                recoverable = err.recoverable,
                "{}",
                err.message
            ),
            Severity::High | Severity::Critical => error!(
                backend = %ctx.backend,
                operation = %ctx.operation,
                channel = ?ctx.channel_id,
                code = %err.code,
                severity = %err.severity,
                recoverable = err.recoverable,
                "{}",
                err.message
            ),
        }
    }
}
