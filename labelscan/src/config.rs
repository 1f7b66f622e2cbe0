use std::collections::HashSet;
use std::env;
use std::time::Duration;

use crate::error::{OcrError, Result};

pub const CLOUD_BACKEND: &str = "cloud";
pub const LOCAL_BACKEND: &str = "local";

pub const DEFAULT_CLOUD_BASE_URL: &str = "https://vision.googleapis.com/v1";

fn parse_env_or<T: std::str::FromStr>(var: &str, default: T) -> T
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => match val.parse() {
            Ok(parsed) => parsed,
            Err(e) => {
                tracing::warn!("Invalid value '{}' for {}: {}. Using default.", val, var, e);
                default
            }
        },
        Err(_) => default,
    }
}

/// Like `parse_env_or`, but an unparsable value is a configuration error.
fn parse_env_strict<T: std::str::FromStr>(var: &str, default: T) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    Ok(parse_env_strict_opt(var)?.unwrap_or(default))
}

fn parse_env_strict_opt<T: std::str::FromStr>(var: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match env::var(var) {
        Ok(val) => val
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| OcrError::Config(format!("Invalid value '{val}' for {var}: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Parse a comma-separated backend chain, e.g. `cloud,local`.
pub fn parse_backend_order(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty())
        .collect()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub ocr: OcrConfig,
    pub cloud: CloudConfig,
    pub local: LocalConfig,
}

impl Config {
    /// Build the full configuration from the environment, failing on any
    /// out-of-range orchestrator setting.
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            ocr: OcrConfig::try_from(OcrSettings::from_env()?)?,
            cloud: CloudConfig::from_env(),
            local: LocalConfig::from_env(),
        })
    }
}

/// Unvalidated orchestrator settings as read from the environment.
#[derive(Debug, Clone)]
pub struct OcrSettings {
    pub confidence_threshold: f32,
    pub cache_enabled: bool,
    pub cache_ttl_seconds: u64,
    pub cache_capacity: usize,
    pub max_retries: u32,
    pub retry_base_delay: f64,
    pub rate_limit_requests: u32,
    pub rate_limit_period: f64,
    /// Ceiling on the local token wait; defaults to one retry cycle.
    pub rate_limit_max_wait: Option<f64>,
    pub request_timeout: Option<f64>,
    pub backend_order: Vec<String>,
}

impl Default for OcrSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            cache_enabled: true,
            cache_ttl_seconds: 86400,
            cache_capacity: 1024,
            max_retries: 3,
            retry_base_delay: 1.0,
            rate_limit_requests: 60,
            rate_limit_period: 60.0,
            rate_limit_max_wait: None,
            request_timeout: None,
            backend_order: vec![CLOUD_BACKEND.to_string(), LOCAL_BACKEND.to_string()],
        }
    }
}

impl OcrSettings {
    /// Read every `OCR_*` orchestrator key. A value that does not parse is
    /// an error rather than a silent default.
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            confidence_threshold: parse_env_strict(
                "OCR_CONFIDENCE_THRESHOLD",
                defaults.confidence_threshold,
            )?,
            cache_enabled: parse_env_strict("OCR_CACHE_ENABLED", defaults.cache_enabled)?,
            cache_ttl_seconds: parse_env_strict(
                "OCR_CACHE_TTL_SECONDS",
                defaults.cache_ttl_seconds,
            )?,
            cache_capacity: parse_env_strict("OCR_CACHE_CAPACITY", defaults.cache_capacity)?,
            max_retries: parse_env_strict("OCR_MAX_RETRIES", defaults.max_retries)?,
            retry_base_delay: parse_env_strict("OCR_RETRY_BASE_DELAY", defaults.retry_base_delay)?,
            rate_limit_requests: parse_env_strict(
                "OCR_RATE_LIMIT_REQUESTS",
                defaults.rate_limit_requests,
            )?,
            rate_limit_period: parse_env_strict(
                "OCR_RATE_LIMIT_PERIOD",
                defaults.rate_limit_period,
            )?,
            rate_limit_max_wait: parse_env_strict_opt("OCR_RATE_LIMIT_MAX_WAIT")?,
            request_timeout: parse_env_strict_opt("OCR_REQUEST_TIMEOUT")?,
            backend_order: env::var("OCR_BACKEND_ORDER")
                .map(|value| parse_backend_order(&value))
                .unwrap_or(defaults.backend_order),
        })
    }
}

/// Validated orchestrator configuration. Only obtainable through
/// `OcrConfig::try_from`, so every instance satisfies its invariants.
#[derive(Debug, Clone)]
pub struct OcrConfig {
    confidence_threshold: f32,
    cache_enabled: bool,
    cache_ttl: Duration,
    cache_capacity: usize,
    max_retries: u32,
    retry_base_delay: Duration,
    rate_limit_requests: u32,
    rate_limit_period: Duration,
    rate_limit_max_wait: Duration,
    request_timeout: Option<Duration>,
    backend_order: Vec<String>,
}

fn positive_secs(name: &str, value: f64) -> Result<Duration> {
    if !value.is_finite() || value <= 0.0 {
        return Err(OcrError::Config(format!(
            "{name} must be a positive number of seconds, got {value}"
        )));
    }
    match Duration::try_from_secs_f64(value) {
        Ok(duration) if duration.is_zero() => Err(OcrError::Config(format!(
            "{name} of {value} seconds rounds down to zero"
        ))),
        Ok(duration) => Ok(duration),
        Err(e) => Err(OcrError::Config(format!("{name} is out of range: {e}"))),
    }
}

impl TryFrom<OcrSettings> for OcrConfig {
    type Error = OcrError;

    fn try_from(settings: OcrSettings) -> Result<Self> {
        let threshold = settings.confidence_threshold;
        if !(0.0..=1.0).contains(&threshold) {
            return Err(OcrError::Config(format!(
                "confidence_threshold must be within [0, 1], got {threshold}"
            )));
        }

        if settings.cache_ttl_seconds == 0 {
            return Err(OcrError::Config(
                "cache_ttl_seconds must be greater than zero".to_string(),
            ));
        }

        if settings.cache_capacity == 0 {
            return Err(OcrError::Config(
                "cache_capacity must be greater than zero".to_string(),
            ));
        }

        let retry_base_delay = positive_secs("retry_base_delay", settings.retry_base_delay)?;

        if settings.rate_limit_requests == 0 {
            return Err(OcrError::Config(
                "rate_limit_requests must be greater than zero".to_string(),
            ));
        }
        let rate_limit_period = positive_secs("rate_limit_period", settings.rate_limit_period)?;

        let rate_limit_max_wait = match settings.rate_limit_max_wait {
            Some(secs) if !secs.is_finite() || secs < 0.0 => {
                return Err(OcrError::Config(format!(
                    "rate_limit_max_wait must be a non-negative number of seconds, got {secs}"
                )));
            }
            Some(secs) => Duration::try_from_secs_f64(secs).map_err(|e| {
                OcrError::Config(format!("rate_limit_max_wait is out of range: {e}"))
            })?,
            None => retry_base_delay,
        };

        let request_timeout = settings
            .request_timeout
            .map(|secs| positive_secs("request_timeout", secs))
            .transpose()?;

        if settings.backend_order.is_empty() {
            return Err(OcrError::Config(
                "backend_order must name at least one backend".to_string(),
            ));
        }
        let mut seen = HashSet::new();
        for id in &settings.backend_order {
            if id.trim().is_empty() {
                return Err(OcrError::Config(
                    "backend_order contains an empty backend id".to_string(),
                ));
            }
            if !seen.insert(id.as_str()) {
                return Err(OcrError::Config(format!(
                    "backend_order lists '{id}' more than once"
                )));
            }
        }

        Ok(Self {
            confidence_threshold: threshold,
            cache_enabled: settings.cache_enabled,
            cache_ttl: Duration::from_secs(settings.cache_ttl_seconds),
            cache_capacity: settings.cache_capacity,
            max_retries: settings.max_retries,
            retry_base_delay,
            rate_limit_requests: settings.rate_limit_requests,
            rate_limit_period,
            rate_limit_max_wait,
            request_timeout,
            backend_order: settings.backend_order,
        })
    }
}

impl OcrConfig {
    pub fn confidence_threshold(&self) -> f32 {
        self.confidence_threshold
    }

    pub fn cache_enabled(&self) -> bool {
        self.cache_enabled
    }

    pub fn cache_ttl(&self) -> Duration {
        self.cache_ttl
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn retry_base_delay(&self) -> Duration {
        self.retry_base_delay
    }

    pub fn rate_limit_requests(&self) -> u32 {
        self.rate_limit_requests
    }

    pub fn rate_limit_period(&self) -> Duration {
        self.rate_limit_period
    }

    /// Tokens per second added back to each backend's bucket.
    pub fn refill_rate(&self) -> f64 {
        f64::from(self.rate_limit_requests) / self.rate_limit_period.as_secs_f64()
    }

    pub fn rate_limit_max_wait(&self) -> Duration {
        self.rate_limit_max_wait
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    pub fn backend_order(&self) -> &[String] {
        &self.backend_order
    }
}

#[derive(Debug, Clone)]
pub struct CloudConfig {
    pub api_key: Option<String>,
    pub base_url: Option<String>,
    pub timeout_secs: u64,
    /// Language hints forwarded to the provider, e.g. `["en", "fr"]`.
    pub language_hints: Vec<String>,
}

impl Default for CloudConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: None,
            timeout_secs: 30,
            language_hints: Vec::new(),
        }
    }
}

impl CloudConfig {
    pub fn from_env() -> Self {
        Self {
            api_key: env::var("OCR_CLOUD_API_KEY").ok().filter(|k| !k.is_empty()),
            base_url: env::var("OCR_CLOUD_BASE_URL").ok(),
            timeout_secs: parse_env_or("OCR_CLOUD_TIMEOUT", 30),
            language_hints: env::var("OCR_CLOUD_LANGUAGE_HINTS")
                .map(|v| {
                    v.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or_default(),
        }
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_deref().unwrap_or(DEFAULT_CLOUD_BASE_URL)
    }
}

#[derive(Debug, Clone)]
pub struct LocalConfig {
    /// `+`-separated Tesseract language codes (ISO 639-2), e.g. `eng+fra`.
    pub languages: String,
    pub data_path: Option<String>,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            languages: "eng".to_string(),
            data_path: None,
        }
    }
}

impl LocalConfig {
    pub fn from_env() -> Self {
        Self {
            languages: env::var("OCR_LANGUAGES").unwrap_or_else(|_| "eng".to_string()),
            data_path: env::var("OCR_TESSDATA_PATH").ok(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn settings() -> OcrSettings {
        OcrSettings::default()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = OcrConfig::try_from(settings()).unwrap();
        assert!(config.cache_enabled());
        assert_eq!(config.max_retries(), 3);
        assert_eq!(config.retry_base_delay(), Duration::from_secs(1));
        assert_eq!(config.rate_limit_max_wait(), config.retry_base_delay());
        assert_eq!(config.backend_order(), ["cloud", "local"]);
        assert!((config.refill_rate() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_threshold_out_of_range_rejected() {
        let mut s = settings();
        s.confidence_threshold = 1.5;
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));

        let mut s = settings();
        s.confidence_threshold = -0.1;
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));
    }

    #[test]
    fn test_zero_durations_rejected() {
        let mut s = settings();
        s.cache_ttl_seconds = 0;
        assert!(OcrConfig::try_from(s).is_err());

        let mut s = settings();
        s.retry_base_delay = 0.0;
        assert!(OcrConfig::try_from(s).is_err());

        let mut s = settings();
        s.rate_limit_period = f64::NAN;
        assert!(OcrConfig::try_from(s).is_err());

        let mut s = settings();
        s.rate_limit_requests = 0;
        assert!(OcrConfig::try_from(s).is_err());
    }

    #[test]
    fn test_zero_retries_allowed() {
        let mut s = settings();
        s.max_retries = 0;
        assert_eq!(OcrConfig::try_from(s).unwrap().max_retries(), 0);
    }

    #[test]
    fn test_backend_order_validation() {
        let mut s = settings();
        s.backend_order = vec![];
        assert!(OcrConfig::try_from(s).is_err());

        let mut s = settings();
        s.backend_order = vec!["cloud".into(), "local".into(), "cloud".into()];
        let err = OcrConfig::try_from(s).unwrap_err();
        assert!(err.to_string().contains("more than once"));
    }

    #[test]
    fn test_negative_max_wait_rejected() {
        let mut s = settings();
        s.rate_limit_max_wait = Some(-1.0);
        assert!(OcrConfig::try_from(s).is_err());

        let mut s = settings();
        s.rate_limit_max_wait = Some(0.0);
        assert_eq!(
            OcrConfig::try_from(s).unwrap().rate_limit_max_wait(),
            Duration::ZERO
        );
    }

    #[test]
    fn test_huge_max_wait_rejected() {
        let mut s = settings();
        s.rate_limit_max_wait = Some(1e20);
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));

        let mut s = settings();
        s.request_timeout = Some(1e20);
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));
    }

    #[test]
    fn test_sub_nanosecond_durations_rejected() {
        let mut s = settings();
        s.retry_base_delay = 1e-10;
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));

        let mut s = settings();
        s.rate_limit_period = 1e-10;
        assert!(matches!(OcrConfig::try_from(s), Err(OcrError::Config(_))));

        let mut s = settings();
        s.rate_limit_period = 1e-6;
        let config = OcrConfig::try_from(s).unwrap();
        assert!(config.refill_rate().is_finite());
    }

    #[test]
    fn test_parse_backend_order() {
        assert_eq!(parse_backend_order(" Cloud, local ,,"), vec!["cloud", "local"]);
        assert!(parse_backend_order("").is_empty());
    }

    #[test]
    #[serial]
    fn test_settings_from_env() {
        std::env::set_var("OCR_MAX_RETRIES", "5");
        std::env::set_var("OCR_BACKEND_ORDER", "local");
        std::env::set_var("OCR_CACHE_ENABLED", "false");
        std::env::set_var("OCR_REQUEST_TIMEOUT", "12.5");

        let s = OcrSettings::from_env().unwrap();
        assert_eq!(s.max_retries, 5);
        assert_eq!(s.backend_order, vec!["local"]);
        assert!(!s.cache_enabled);
        assert_eq!(s.request_timeout, Some(12.5));

        std::env::remove_var("OCR_MAX_RETRIES");
        std::env::remove_var("OCR_BACKEND_ORDER");
        std::env::remove_var("OCR_CACHE_ENABLED");
        std::env::remove_var("OCR_REQUEST_TIMEOUT");
    }

    #[test]
    #[serial]
    fn test_unparsable_env_value_is_rejected() {
        std::env::set_var("OCR_CACHE_TTL_SECONDS", "forever");
        let err = OcrSettings::from_env().unwrap_err();
        assert!(err.to_string().contains("OCR_CACHE_TTL_SECONDS"));
        std::env::remove_var("OCR_CACHE_TTL_SECONDS");

        std::env::set_var("OCR_MAX_RETRIES", "-1");
        assert!(matches!(Config::from_env(), Err(OcrError::Config(_))));
        std::env::remove_var("OCR_MAX_RETRIES");

        std::env::set_var("OCR_CONFIDENCE_THRESHOLD", "high");
        assert!(matches!(Config::from_env(), Err(OcrError::Config(_))));
        std::env::remove_var("OCR_CONFIDENCE_THRESHOLD");

        std::env::set_var("OCR_REQUEST_TIMEOUT", "soon");
        assert!(matches!(Config::from_env(), Err(OcrError::Config(_))));
        std::env::remove_var("OCR_REQUEST_TIMEOUT");
    }

    #[test]
    #[serial]
    fn test_config_from_env_fails_fast() {
        std::env::set_var("OCR_CONFIDENCE_THRESHOLD", "2.0");
        let result = Config::from_env();
        assert!(matches!(result, Err(OcrError::Config(_))));
        std::env::remove_var("OCR_CONFIDENCE_THRESHOLD");
    }

    #[test]
    #[serial]
    fn test_cloud_config_defaults() {
        std::env::remove_var("OCR_CLOUD_API_KEY");
        std::env::remove_var("OCR_CLOUD_BASE_URL");
        let cloud = CloudConfig::from_env();
        assert!(cloud.api_key.is_none());
        assert_eq!(cloud.base_url(), DEFAULT_CLOUD_BASE_URL);
        assert_eq!(cloud.timeout_secs, 30);
    }
}
