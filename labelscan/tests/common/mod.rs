#![allow(dead_code)]

use std::collections::VecDeque;
use std::io::Cursor;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use image::{ImageBuffer, ImageFormat, Luma};
use tokio::time::Instant;

use labelscan::config::{OcrConfig, OcrSettings};
use labelscan::error::{OcrError, Result};
use labelscan::ocr::{ContentCache, OcrBackend, OcrResult};

static INIT: Once = Once::new();

/// Initialize tracing subscriber once for tests
pub fn init_test_logger() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init();
    });
}

/// A small grayscale PNG; different `shade`s give different content hashes.
pub fn png(shade: u8) -> Vec<u8> {
    let img = ImageBuffer::from_pixel(16, 16, Luma([shade]));
    let mut out = Vec::new();
    img.write_to(&mut Cursor::new(&mut out), ImageFormat::Png)
        .expect("encode test PNG");
    out
}

pub fn settings(order: &[&str]) -> OcrSettings {
    OcrSettings {
        backend_order: order.iter().map(|s| s.to_string()).collect(),
        ..OcrSettings::default()
    }
}

pub fn config(order: &[&str]) -> OcrConfig {
    OcrConfig::try_from(settings(order)).expect("valid test config")
}

pub fn cache() -> ContentCache {
    ContentCache::new(NonZeroUsize::new(64).unwrap())
}

pub fn result(text: &str, confidence: f32, backend: &str) -> OcrResult {
    OcrResult::new(text, confidence, vec![], vec!["en".to_string()], 0.01, backend)
}

/// Backend ids in the order their `extract_text` was entered, shared
/// between several `ScriptedBackend`s.
pub type CallLog = Arc<Mutex<Vec<String>>>;

pub fn call_log() -> CallLog {
    Arc::new(Mutex::new(Vec::new()))
}

/// Backend double that replays queued outcomes, then repeats a default one,
/// recording when it was called.
pub struct ScriptedBackend {
    id: String,
    available: bool,
    delay: Option<Duration>,
    queued: Mutex<VecDeque<Result<OcrResult>>>,
    default: Result<OcrResult>,
    calls: AtomicUsize,
    call_times: Mutex<Vec<Instant>>,
    log: Option<CallLog>,
}

impl ScriptedBackend {
    pub fn succeeding(id: &str, text: &str, confidence: f32) -> Self {
        Self::with_default(id, Ok(result(text, confidence, id)))
    }

    pub fn failing(id: &str, error: OcrError) -> Self {
        Self::with_default(id, Err(error))
    }

    fn with_default(id: &str, default: Result<OcrResult>) -> Self {
        Self {
            id: id.to_string(),
            available: true,
            delay: None,
            queued: Mutex::new(VecDeque::new()),
            default,
            calls: AtomicUsize::new(0),
            call_times: Mutex::new(Vec::new()),
            log: None,
        }
    }

    /// Queue a one-off outcome ahead of the default.
    pub fn then(self, outcome: Result<OcrResult>) -> Self {
        self.queued.lock().unwrap().push_back(outcome);
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Append this backend's id to `log` on every call.
    pub fn logging_to(mut self, log: &CallLog) -> Self {
        self.log = Some(Arc::clone(log));
        self
    }

    pub fn unavailable(mut self) -> Self {
        self.available = false;
        self
    }

    pub fn into_arc(self) -> Arc<Self> {
        Arc::new(self)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.call_times.lock().unwrap().clone()
    }
}

#[async_trait]
impl OcrBackend for ScriptedBackend {
    fn id(&self) -> &str {
        &self.id
    }

    async fn extract_text(&self, _image: &[u8]) -> Result<OcrResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.call_times.lock().unwrap().push(Instant::now());
        if let Some(log) = &self.log {
            log.lock().unwrap().push(self.id.clone());
        }

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let queued = self.queued.lock().unwrap().pop_front();
        queued.unwrap_or_else(|| self.default.clone())
    }

    fn is_available(&self) -> bool {
        self.available
    }

    fn unavailable_reason(&self) -> Option<String> {
        (!self.available).then(|| format!("{} switched off", self.id))
    }
}

pub fn dyn_backend(backend: &Arc<ScriptedBackend>) -> Arc<dyn OcrBackend> {
    Arc::clone(backend) as Arc<dyn OcrBackend>
}
