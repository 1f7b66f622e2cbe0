use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::time::Instant;
use tracing::debug;

use crate::config::OcrConfig;
use crate::error::{OcrError, Result};

struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket guarding one backend.
///
/// Refill is lazy: every call tops the bucket up from the wall-clock time
/// elapsed since the previous call, so no background timer is needed. The
/// lock is only held for that arithmetic, never across a sleep.
pub struct RateLimiter {
    backend: String,
    capacity: f64,
    refill_rate: f64,
    bucket: Mutex<Bucket>,
}

impl RateLimiter {
    /// `capacity` is the burst size, `refill_rate` is in tokens per second.
    /// Both must be positive and finite.
    pub fn new(backend: impl Into<String>, capacity: u32, refill_rate: f64) -> Result<Self> {
        let backend = backend.into();
        if capacity == 0 {
            return Err(OcrError::Config(format!(
                "rate limiter for '{backend}' needs a capacity of at least one token"
            )));
        }
        if !refill_rate.is_finite() || refill_rate <= 0.0 {
            return Err(OcrError::Config(format!(
                "rate limiter for '{backend}' has invalid refill rate {refill_rate}"
            )));
        }

        let capacity = f64::from(capacity);
        Ok(Self {
            backend,
            capacity,
            refill_rate,
            bucket: Mutex::new(Bucket {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        })
    }

    pub fn backend(&self) -> &str {
        &self.backend
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    pub fn refill_rate(&self) -> f64 {
        self.refill_rate
    }

    /// Tokens currently in the bucket after a lazy refill.
    pub fn available_tokens(&self) -> f64 {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);
        bucket.tokens
    }

    /// Take a token, or report how long until one is available.
    fn reserve(&self) -> std::result::Result<(), Duration> {
        let mut bucket = self.bucket.lock().unwrap_or_else(PoisonError::into_inner);
        self.refill(&mut bucket);

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let missing = 1.0 - bucket.tokens;
            Err(Duration::try_from_secs_f64(missing / self.refill_rate).unwrap_or(Duration::MAX))
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.saturating_duration_since(bucket.last_refill);
        bucket.tokens = (bucket.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.capacity);
        bucket.last_refill = now;
    }

    /// Non-blocking admission; fails with `RateLimitExceeded` when empty.
    pub fn try_acquire(&self) -> Result<()> {
        self.reserve().map_err(|wait| OcrError::RateLimitExceeded {
            backend: self.backend.clone(),
            wait,
        })
    }

    /// Wait as long as it takes for a token.
    pub async fn acquire(&self) {
        while let Err(wait) = self.reserve() {
            debug!(backend = %self.backend, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
            tokio::time::sleep(wait).await;
        }
    }

    /// Wait for a token unless the wait would overrun `max_wait`, in which
    /// case fail straight away without consuming anything.
    pub async fn acquire_within(&self, max_wait: Duration) -> Result<()> {
        let deadline = Instant::now().checked_add(max_wait);
        loop {
            match self.reserve() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let ready_at = Instant::now().checked_add(wait);
                    let too_late = match (ready_at, deadline) {
                        (Some(ready_at), Some(deadline)) => ready_at > deadline,
                        (None, Some(_)) => true,
                        (_, None) => false,
                    };
                    if too_late {
                        return Err(OcrError::RateLimitExceeded {
                            backend: self.backend.clone(),
                            wait,
                        });
                    }
                    debug!(backend = %self.backend, wait_ms = wait.as_millis() as u64, "Waiting for rate limit token");
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// One limiter per backend id, shared by every clone of the registry.
#[derive(Clone, Default)]
pub struct RateLimiterRegistry {
    limiters: HashMap<String, Arc<RateLimiter>>,
}

impl RateLimiterRegistry {
    /// Give every backend in `backends` that has no limiter yet one built
    /// from the configured budget. Existing limiters are left alone.
    pub fn fill_from_config<'a>(
        &mut self,
        config: &OcrConfig,
        backends: impl IntoIterator<Item = &'a str>,
    ) -> Result<()> {
        for id in backends {
            if !self.limiters.contains_key(id) {
                let limiter =
                    RateLimiter::new(id, config.rate_limit_requests(), config.refill_rate())?;
                self.limiters.insert(id.to_string(), Arc::new(limiter));
            }
        }
        Ok(())
    }

    pub fn insert(&mut self, limiter: RateLimiter) {
        self.limiters
            .insert(limiter.backend().to_string(), Arc::new(limiter));
    }

    pub fn get(&self, backend: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(backend).cloned()
    }
}
