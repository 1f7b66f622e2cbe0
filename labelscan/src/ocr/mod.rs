//! Label text extraction.
//!
//! The module follows a provider pattern: `OcrBackend` is the trait every
//! provider implements, and `OcrService` orchestrates them.
//!
//! # Architecture
//!
//! - `CloudVisionBackend` calls a metered cloud vision API over HTTP
//! - `TesseractBackend` runs Tesseract locally via leptess
//! - `RateLimiter` is a lazily refilled token bucket, one per backend
//! - `ContentCache` maps the SHA-256 of the image bytes to a result, with TTL
//! - `RetryPolicy` retries transient failures with exponential backoff
//!
//! A call flows validate → cache lookup → (per backend) rate limit → call
//! with retry → cache write. When every backend fails the caller gets
//! `OcrError::AllBackendsExhausted` with one cause per backend.
//!
//! # Usage
//!
//! ```rust,ignore
//! let service = OcrService::from_config(&Config::from_env()?)?;
//! let result = service.extract_text(&image_bytes).await?;
//! ```

mod backend;
mod cache;
mod cloud;
mod local;
mod rate_limit;
mod result;
mod retry;
mod service;
mod validate;

pub use backend::OcrBackend;
pub use cache::{content_key, CacheStats, ContentCache};
pub use cloud::CloudVisionBackend;
pub use local::TesseractBackend;
pub use rate_limit::{RateLimiter, RateLimiterRegistry};
pub use result::{BoundingBox, OcrResult};
pub use retry::{RetryDecision, RetryPolicy};
pub use service::{BackendStatus, ExtractOptions, OcrService};
pub use validate::{validate_image, ImageInfo};
