use std::fmt;
use std::time::Duration;

use thiserror::Error;

/// A single backend's failure, recorded by the orchestrator while walking
/// the fallback chain.
#[derive(Debug, Clone)]
pub struct BackendFailure {
    pub backend: String,
    pub error: OcrError,
}

impl fmt::Display for BackendFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.backend, self.error)
    }
}

/// How the retry policy and orchestrator must treat an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth another attempt on the same backend.
    Transient,
    /// This backend cannot handle the request; move on without retrying.
    Permanent,
    /// Stop the whole request.
    Fatal,
}

#[derive(Error, Debug, Clone)]
pub enum OcrError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Transient backend error: {0}")]
    Transient(String),

    #[error("Provider rate limit exceeded, retry after {retry_after:?} seconds")]
    ProviderRateLimited { retry_after: Option<u64> },

    #[error("Permanent backend error: {0}")]
    Permanent(String),

    #[error("OCR backend unavailable: {0}")]
    Unavailable(String),

    #[error("Rate limit exceeded for backend '{backend}', next slot in {wait:?}")]
    RateLimitExceeded { backend: String, wait: Duration },

    #[error("All OCR backends exhausted: {}", summarize(.failures))]
    AllBackendsExhausted { failures: Vec<BackendFailure> },

    #[error("OCR request timed out after {0:?}")]
    TimedOut(Duration),

    #[error("OCR request cancelled")]
    Cancelled,

    #[error("Configuration error: {0}")]
    Config(String),
}

impl OcrError {
    pub fn class(&self) -> ErrorClass {
        match self {
            OcrError::Transient(_)
            | OcrError::ProviderRateLimited { .. }
            | OcrError::RateLimitExceeded { .. } => ErrorClass::Transient,
            OcrError::Permanent(_) | OcrError::Unavailable(_) => ErrorClass::Permanent,
            OcrError::Validation(_)
            | OcrError::AllBackendsExhausted { .. }
            | OcrError::TimedOut(_)
            | OcrError::Cancelled
            | OcrError::Config(_) => ErrorClass::Fatal,
        }
    }

    /// Per-backend causes when the whole chain failed, in chain order.
    pub fn failures(&self) -> Option<&[BackendFailure]> {
        match self {
            OcrError::AllBackendsExhausted { failures } => Some(failures),
            _ => None,
        }
    }
}

fn summarize(failures: &[BackendFailure]) -> String {
    if failures.is_empty() {
        return "no backends configured".to_string();
    }
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

pub type Result<T> = std::result::Result<T, OcrError>;
