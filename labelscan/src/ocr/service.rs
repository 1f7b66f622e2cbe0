use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{Config, OcrConfig};
use crate::error::{BackendFailure, ErrorClass, OcrError, Result};

use super::backend::OcrBackend;
use super::cache::{content_key, ContentCache};
use super::cloud::CloudVisionBackend;
use super::local::TesseractBackend;
use super::rate_limit::RateLimiterRegistry;
use super::result::OcrResult;
use super::retry::RetryPolicy;
use super::validate::validate_image;

/// Per-call knobs for `OcrService::extract_text_with`.
#[derive(Debug, Clone, Default)]
pub struct ExtractOptions {
    /// Deadline for the whole call, overriding `request_timeout`.
    pub timeout: Option<Duration>,
    pub cancel: Option<CancellationToken>,
    /// Skip both the cache lookup and the write-back.
    pub bypass_cache: bool,
    /// Replacement fallback chain for this call only.
    pub backends: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendStatus {
    pub id: String,
    pub available: bool,
    pub reason: Option<String>,
}

struct Inner {
    config: OcrConfig,
    backends: HashMap<String, Arc<dyn OcrBackend>>,
    limiters: RateLimiterRegistry,
    cache: ContentCache,
    retry: RetryPolicy,
}

/// Entry point for label text extraction.
///
/// Checks the content-addressed cache, then walks the configured fallback
/// chain, admitting each attempt through that backend's token bucket and
/// retrying transient failures with exponential backoff. The first success
/// is written back to the cache. Concurrent calls for the same uncached
/// image may each reach a backend; there is no request coalescing.
#[derive(Clone)]
pub struct OcrService {
    inner: Arc<Inner>,
}

impl OcrService {
    pub fn new(
        config: OcrConfig,
        backends: Vec<Arc<dyn OcrBackend>>,
        cache: ContentCache,
    ) -> Result<Self> {
        Self::with_rate_limiters(config, backends, cache, RateLimiterRegistry::default())
    }

    /// Like `new`, but with pre-built limiters. Backends without one get a
    /// limiter derived from the configuration.
    pub fn with_rate_limiters(
        config: OcrConfig,
        backends: Vec<Arc<dyn OcrBackend>>,
        cache: ContentCache,
        mut limiters: RateLimiterRegistry,
    ) -> Result<Self> {
        let mut by_id: HashMap<String, Arc<dyn OcrBackend>> = HashMap::new();
        for backend in backends {
            let id = backend.id().to_string();
            if by_id.insert(id.clone(), backend).is_some() {
                return Err(OcrError::Config(format!(
                    "backend '{id}' registered more than once"
                )));
            }
        }

        for id in config.backend_order() {
            if !by_id.contains_key(id) {
                return Err(OcrError::Config(format!(
                    "backend_order names unknown backend '{id}'"
                )));
            }
        }

        limiters.fill_from_config(&config, by_id.keys().map(String::as_str))?;

        let retry = RetryPolicy::from_config(&config);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                backends: by_id,
                limiters,
                cache,
                retry,
            }),
        })
    }

    /// Wire up the cloud and local backends described by `config`.
    pub fn from_config(config: &Config) -> Result<Self> {
        let capacity = NonZeroUsize::new(config.ocr.cache_capacity())
            .ok_or_else(|| OcrError::Config("cache_capacity must be non-zero".to_string()))?;

        let backends: Vec<Arc<dyn OcrBackend>> = vec![
            Arc::new(CloudVisionBackend::new(&config.cloud)?),
            Arc::new(TesseractBackend::new(&config.local)),
        ];

        Self::new(config.ocr.clone(), backends, ContentCache::new(capacity))
    }

    pub fn config(&self) -> &OcrConfig {
        &self.inner.config
    }

    pub fn cache(&self) -> &ContentCache {
        &self.inner.cache
    }

    /// Availability of every backend in chain order.
    pub fn backend_status(&self) -> Vec<BackendStatus> {
        self.inner
            .config
            .backend_order()
            .iter()
            .filter_map(|id| self.inner.backends.get(id).map(|b| (id, b)))
            .map(|(id, backend)| BackendStatus {
                id: id.clone(),
                available: backend.is_available(),
                reason: backend.unavailable_reason(),
            })
            .collect()
    }

    /// Whether `result` clears the configured confidence threshold. The
    /// threshold is advisory: results below it are still returned.
    pub fn is_confident(&self, result: &OcrResult) -> bool {
        result.meets_threshold(self.inner.config.confidence_threshold())
    }

    pub async fn extract_text(&self, image: &[u8]) -> Result<OcrResult> {
        self.extract_text_with(image, ExtractOptions::default())
            .await
    }

    pub async fn extract_text_with(
        &self,
        image: &[u8],
        options: ExtractOptions,
    ) -> Result<OcrResult> {
        let image_info = validate_image(image)?;

        if let Some(order) = &options.backends {
            if order.is_empty() {
                return Err(OcrError::Config(
                    "backend override must name at least one backend".to_string(),
                ));
            }
            if let Some(unknown) = order.iter().find(|id| !self.inner.backends.contains_key(*id)) {
                return Err(OcrError::Config(format!("unknown backend '{unknown}'")));
            }
        }

        debug!(
            format = ?image_info.format,
            width = image_info.width,
            height = image_info.height,
            "Extracting label text"
        );

        let cancelled = async {
            match &options.cancel {
                Some(token) => token.cancelled().await,
                None => std::future::pending().await,
            }
        };

        let work = async {
            tokio::select! {
                biased;
                _ = cancelled => Err(OcrError::Cancelled),
                result = self.run_chain(image, &options) => result,
            }
        };

        match options.timeout.or(self.inner.config.request_timeout()) {
            Some(limit) => tokio::time::timeout(limit, work)
                .await
                .unwrap_or(Err(OcrError::TimedOut(limit))),
            None => work.await,
        }
    }

    async fn run_chain(&self, image: &[u8], options: &ExtractOptions) -> Result<OcrResult> {
        let inner = &self.inner;
        let use_cache = inner.config.cache_enabled() && !options.bypass_cache;
        let key = use_cache.then(|| content_key(image));

        if let Some(key) = &key {
            if let Some(hit) = inner.cache.get(key) {
                debug!(key = %key, backend = %hit.backend_used(), "OCR cache hit");
                return Ok(hit);
            }
        }

        let order = options
            .backends
            .as_deref()
            .unwrap_or(inner.config.backend_order());
        let mut failures = Vec::with_capacity(order.len());

        for id in order {
            let Some(backend) = inner.backends.get(id) else {
                continue;
            };

            if !backend.is_available() {
                let reason = backend
                    .unavailable_reason()
                    .unwrap_or_else(|| "backend reported unavailable".to_string());
                debug!(backend = %id, reason = %reason, "Skipping unavailable OCR backend");
                failures.push(BackendFailure {
                    backend: id.clone(),
                    error: OcrError::Unavailable(reason),
                });
                continue;
            }

            match self.call_backend(id, backend, image).await {
                Ok(result) => {
                    if !self.is_confident(&result) {
                        warn!(
                            backend = %id,
                            confidence = result.confidence(),
                            threshold = inner.config.confidence_threshold(),
                            "OCR result below confidence threshold"
                        );
                    }
                    if !failures.is_empty() {
                        info!(backend = %id, failed = failures.len(), "OCR succeeded on fallback backend");
                    }
                    if let Some(key) = key {
                        inner.cache.put(key, &result, inner.config.cache_ttl());
                    }
                    return Ok(result);
                }
                Err(error) if error.class() == ErrorClass::Fatal => return Err(error),
                Err(error) => {
                    warn!(backend = %id, error = %error, "OCR backend failed, falling back");
                    failures.push(BackendFailure {
                        backend: id.clone(),
                        error,
                    });
                }
            }
        }

        error!(failures = failures.len(), "All OCR backends exhausted");
        Err(OcrError::AllBackendsExhausted { failures })
    }

    async fn call_backend(
        &self,
        id: &str,
        backend: &Arc<dyn OcrBackend>,
        image: &[u8],
    ) -> Result<OcrResult> {
        let limiter = self.inner.limiters.get(id);
        let max_wait = self.inner.config.rate_limit_max_wait();

        self.inner
            .retry
            .run(id, |attempt| {
                let limiter = limiter.clone();
                async move {
                    if let Some(limiter) = &limiter {
                        limiter.acquire_within(max_wait).await?;
                    }
                    debug!(backend = %id, attempt = attempt + 1, "Calling OCR backend");
                    backend.extract_text(image).await
                }
            })
            .await
    }
}
