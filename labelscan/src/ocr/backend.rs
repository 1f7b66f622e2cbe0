use async_trait::async_trait;

use crate::error::Result;

use super::result::OcrResult;

/// A single OCR provider.
///
/// Implementations classify their own failures: a transport hiccup is
/// `OcrError::Transient`, a rejected credential or unreadable image is
/// `OcrError::Permanent`. They never hand back a partial result.
#[async_trait]
pub trait OcrBackend: Send + Sync {
    /// Identifier used in `backend_order`, limiter keys and `backend_used`.
    fn id(&self) -> &str;

    async fn extract_text(&self, image: &[u8]) -> Result<OcrResult>;

    /// Cheap local check of configuration and credentials. `true` does not
    /// guarantee the next call succeeds.
    fn is_available(&self) -> bool;

    fn unavailable_reason(&self) -> Option<String> {
        None
    }
}
