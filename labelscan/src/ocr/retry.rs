use std::future::Future;
use std::time::Duration;

use tracing::{debug, warn};

use crate::config::OcrConfig;
use crate::error::{ErrorClass, OcrError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Retry(Duration),
    GiveUp,
}

/// Exponential backoff around a single backend call.
///
/// The policy only retries what the backend classified as transient; it has
/// no notion of other backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    base_delay: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, base_delay: Duration) -> Self {
        Self {
            max_retries,
            base_delay,
        }
    }

    pub fn from_config(config: &OcrConfig) -> Self {
        Self::new(config.max_retries(), config.retry_base_delay())
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// `base_delay * 2^attempt`, saturating instead of overflowing.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        2u32.checked_pow(attempt)
            .and_then(|factor| self.base_delay.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    /// What to do after `attempt` (zero-based) failed with `error`.
    pub fn decide(&self, attempt: u32, error: &OcrError) -> RetryDecision {
        match error.class() {
            ErrorClass::Transient if attempt < self.max_retries => {
                RetryDecision::Retry(self.delay_for(attempt))
            }
            _ => RetryDecision::GiveUp,
        }
    }

    /// Run `operation` until it succeeds or the policy gives up, returning
    /// the last error in the latter case.
    pub async fn run<T, F, Fut>(&self, backend: &str, mut operation: F) -> Result<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => match self.decide(attempt, &error) {
                    RetryDecision::Retry(delay) => {
                        warn!(
                            backend = %backend,
                            attempt = attempt + 1,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "OCR attempt failed, retrying"
                        );
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                    }
                    RetryDecision::GiveUp => {
                        debug!(backend = %backend, attempts = attempt + 1, error = %error, "Giving up on backend");
                        return Err(error);
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::time::Instant;

    fn transient() -> OcrError {
        OcrError::Transient("connection reset".to_string())
    }

    #[test]
    fn test_decide_transient_until_budget_spent() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        assert_eq!(
            policy.decide(0, &transient()),
            RetryDecision::Retry(Duration::from_secs(1))
        );
        assert_eq!(
            policy.decide(1, &transient()),
            RetryDecision::Retry(Duration::from_secs(2))
        );
        assert_eq!(
            policy.decide(2, &transient()),
            RetryDecision::Retry(Duration::from_secs(4))
        );
        assert_eq!(policy.decide(3, &transient()), RetryDecision::GiveUp);
    }

    #[test]
    fn test_decide_never_retries_permanent_or_fatal() {
        let policy = RetryPolicy::new(5, Duration::from_secs(1));
        let permanent = OcrError::Permanent("unsupported format".to_string());
        let validation = OcrError::Validation("empty".to_string());
        assert_eq!(policy.decide(0, &permanent), RetryDecision::GiveUp);
        assert_eq!(policy.decide(0, &validation), RetryDecision::GiveUp);
    }

    #[test]
    fn test_local_rate_limit_is_retried() {
        let policy = RetryPolicy::new(1, Duration::from_millis(250));
        let err = OcrError::RateLimitExceeded {
            backend: "cloud".to_string(),
            wait: Duration::from_secs(3),
        };
        assert_eq!(
            policy.decide(0, &err),
            RetryDecision::Retry(Duration::from_millis(250))
        );
    }

    #[test]
    fn test_delay_saturates() {
        let policy = RetryPolicy::new(u32::MAX, Duration::from_secs(1));
        assert_eq!(policy.delay_for(64), Duration::MAX);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backoff_sequence_one_two_four() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let stamps = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&stamps);
        let result: Result<()> = policy
            .run("cloud", move |_| {
                let recorded = Arc::clone(&recorded);
                async move {
                    recorded.lock().unwrap().push(Instant::now());
                    Err(transient())
                }
            })
            .await;

        assert!(matches!(result, Err(OcrError::Transient(_))));
        let stamps = stamps.lock().unwrap();
        assert_eq!(stamps.len(), 4);
        let gaps: Vec<Duration> = stamps.windows(2).map(|w| w[1] - w[0]).collect();
        assert_eq!(
            gaps,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4)
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_permanent_error_is_not_retried() {
        let policy = RetryPolicy::new(3, Duration::from_secs(1));
        let calls = AtomicU32::new(0);
        let start = Instant::now();

        let result: Result<()> = policy
            .run("cloud", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OcrError::Permanent("unauthenticated".to_string())) }
            })
            .await;

        assert!(matches!(result, Err(OcrError::Permanent(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(start.elapsed(), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failure() {
        let policy = RetryPolicy::new(2, Duration::from_millis(100));

        let result = policy
            .run("local", |attempt| async move {
                if attempt == 0 {
                    Err(transient())
                } else {
                    Ok(attempt)
                }
            })
            .await;

        assert_eq!(result.unwrap(), 1);
    }
}
