//! Retry policy and the cancellable retry loop.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::RetryConfig;
use crate::error::{ChatError, Result};

/// Jitter fraction added on top of each computed delay (up to 10 %).
const JITTER_FRACTION: f64 = 0.10;

/// Decides whether a failed attempt is retried and how long to wait.
///
/// Pure: holds only its limits, no per-call state. Attempts are 1-based.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn should_retry(&self, error: &ChatError, attempt: u32) -> bool {
        if !error.recoverable || attempt >= self.max_attempts {
            return false;
        }
        error.code.is_retryable()
    }

    /// Jitter-free backoff: `base * 2^(attempt-1)`, capped at `max_delay`.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.saturating_sub(1).min(20);
        let multiplier = 1_u32 << shift;
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Wait before the next attempt. A backend-supplied retry-after wins.
    pub fn delay(&self, error: &ChatError, attempt: u32) -> Duration {
        if let Some(retry_after) = error.retry_after {
            return retry_after.min(self.max_delay);
        }
        let base = self.base_delay_for(attempt);
        (base + jitter(base)).min(self.max_delay)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetryConfig::default())
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self::new(
            config.max_attempts,
            Duration::from_millis(config.base_delay_ms),
            Duration::from_millis(config.max_delay_ms),
        )
    }
}

/// Run `op` until it succeeds, the policy gives up, or `cancel` fires.
///
/// Each failed attempt has already been classified and reported to the
/// adapter's error handler; the loop only decides and waits. A cancellation
/// during a wait ends the loop with the last error marked non-recoverable.
pub async fn retry_with<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    operation: &str,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => {
                if attempt > 1 {
                    info!(operation, attempt, "operation succeeded after retry");
                }
                return Ok(value);
            }
            Err(err) if !policy.should_retry(&err, attempt) => return Err(err),
            Err(err) => {
                let delay = policy.delay(&err, attempt);
                warn!(
                    operation,
                    attempt,
                    max = policy.max_attempts(),
                    backend = %err.backend(),
                    error = %err,
                    retry_after_ms = delay.as_millis() as u64,
                    "operation failed, retrying with backoff"
                );
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        info!(operation, attempt, "retry wait cancelled");
                        return Err(err.with_recoverable(false));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
        }
    }
}

/// Jitter offset between 0 and `JITTER_FRACTION * base`.
///
/// Derived from the sub-second clock, which is random enough for spreading
/// reconnect storms.
fn jitter(base: Duration) -> Duration {
    let max_jitter_ms = (base.as_millis() as f64 * JITTER_FRACTION) as u64;
    if max_jitter_ms == 0 {
        return Duration::ZERO;
    }
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.subsec_nanos())
        .unwrap_or(0);
    Duration::from_millis(nanos as u64 % (max_jitter_ms + 1))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::ErrorCode;

    fn policy() -> RetryPolicy {
        RetryPolicy::new(3, Duration::from_millis(100), Duration::from_millis(1_000))
    }

    #[test]
    fn retries_only_retryable_codes() {
        let p = policy();
        assert!(p.should_retry(&ChatError::new(ErrorCode::NetworkError, "x"), 1));
        assert!(p.should_retry(&ChatError::new(ErrorCode::RateLimited, "x"), 2));
        // recoverable but not in the retry set
        assert!(!p.should_retry(&ChatError::new(ErrorCode::ConnectionFailed, "x"), 1));
        assert!(!p.should_retry(&ChatError::new(ErrorCode::AuthFailed, "x"), 1));
    }

    #[test]
    fn never_retries_at_or_past_max_attempts() {
        let p = policy();
        let err = ChatError::new(ErrorCode::NetworkError, "x");
        for attempt in 3..10 {
            assert!(!p.should_retry(&err, attempt));
        }
    }

    #[test]
    fn never_retries_non_recoverable() {
        let p = RetryPolicy::new(100, Duration::from_millis(1), Duration::from_millis(10));
        let err = ChatError::new(ErrorCode::NetworkError, "x").with_recoverable(false);
        for attempt in 0..50 {
            assert!(!p.should_retry(&err, attempt));
        }
    }

    #[test]
    fn backoff_is_monotonic_and_capped() {
        let p = policy();
        let mut last = Duration::ZERO;
        for attempt in 1..40 {
            let d = p.base_delay_for(attempt);
            assert!(d >= last);
            assert!(d <= p.max_delay());
            last = d;
        }
        assert_eq!(p.base_delay_for(1), Duration::from_millis(100));
        assert_eq!(p.base_delay_for(3), Duration::from_millis(400));
        assert_eq!(p.base_delay_for(30), Duration::from_millis(1_000));
    }

    #[test]
    fn jittered_delay_stays_within_bounds() {
        let p = policy();
        let err = ChatError::new(ErrorCode::NetworkError, "x");
        for attempt in 1..10 {
            let d = p.delay(&err, attempt);
            let base = p.base_delay_for(attempt);
            assert!(d >= base);
            assert!(d <= p.max_delay());
            assert!(d <= base + base / 10 + Duration::from_millis(1));
        }
    }

    #[test]
    fn retry_after_wins_but_is_capped() {
        let p = policy();
        let err = ChatError::new(ErrorCode::RateLimited, "x")
            .with_retry_after(Duration::from_millis(250));
        assert_eq!(p.delay(&err, 1), Duration::from_millis(250));

        let err = err.with_retry_after(Duration::from_secs(60));
        assert_eq!(p.delay(&err, 1), Duration::from_millis(1_000));
    }

    #[tokio::test(start_paused = true)]
    async fn loop_stops_after_max_attempts_with_original_error() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();
        let result: Result<()> = retry_with(&policy(), &cancel, "send_message", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ChatError::new(ErrorCode::NetworkError, "socket reset"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 3);
        assert_eq!(err.code, ErrorCode::NetworkError);
        assert_eq!(err.message, "socket reset");
    }

    #[tokio::test(start_paused = true)]
    async fn loop_returns_first_success() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();
        let result = retry_with(&policy(), &cancel, "get_messages", || async move {
            let n = attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n < 2 {
                Err(ChatError::new(ErrorCode::ServiceUnavailable, "busy"))
            } else {
                Ok(n)
            }
        })
        .await;
        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test]
    async fn non_retryable_error_is_returned_immediately() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();
        let result: Result<()> = retry_with(&policy(), &cancel, "join_channel", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ChatError::new(ErrorCode::InvalidChannel, "nope"))
        })
        .await;
        assert_eq!(result.unwrap_err().code, ErrorCode::InvalidChannel);
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn cancelled_wait_ends_the_loop() {
        let counter = AtomicU32::new(0);
        let attempts = &counter;
        let cancel = CancellationToken::new();
        cancel.cancel();
        let slow = RetryPolicy::new(5, Duration::from_secs(3600), Duration::from_secs(3600));
        let result: Result<()> = retry_with(&slow, &cancel, "send_message", || async move {
            attempts.fetch_add(1, Ordering::SeqCst);
            Err(ChatError::new(ErrorCode::RateLimited, "slow down"))
        })
        .await;

        let err = result.unwrap_err();
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert_eq!(err.code, ErrorCode::RateLimited);
        assert!(!err.recoverable);
    }
}
