use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use leptess::LepTess;
use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::config::{LocalConfig, LOCAL_BACKEND};
use crate::error::{OcrError, Result};

use super::backend::OcrBackend;
use super::result::{BoundingBox, OcrResult};

/// Tesseract's word level in TSV output.
const TSV_WORD_LEVEL: u32 = 5;

enum Engine {
    Ready { tesseract: Arc<Mutex<LepTess>> },
    Unavailable { reason: String },
}

/// On-device OCR through Tesseract. Free and unmetered, but less accurate
/// than the cloud backend; runs on the blocking thread pool.
pub struct TesseractBackend {
    engine: Engine,
    languages: Vec<String>,
}

fn create_tesseract(config: &LocalConfig) -> std::result::Result<LepTess, String> {
    LepTess::new(config.data_path.as_deref(), &config.languages).map_err(|e| e.to_string())
}

impl TesseractBackend {
    pub fn new(config: &LocalConfig) -> Self {
        let engine = match create_tesseract(config) {
            Ok(lt) => {
                info!(languages = %config.languages, "Tesseract OCR initialized");
                Engine::Ready {
                    tesseract: Arc::new(Mutex::new(lt)),
                }
            }
            Err(e) => {
                let reason = format!("Tesseract not available: {e}");
                warn!("{}", reason);
                Engine::Unavailable { reason }
            }
        };

        Self {
            engine,
            languages: iso_languages(&config.languages),
        }
    }

    #[cfg(test)]
    fn unavailable(reason: &str) -> Self {
        Self {
            engine: Engine::Unavailable {
                reason: reason.to_string(),
            },
            languages: vec![],
        }
    }
}

#[async_trait]
impl OcrBackend for TesseractBackend {
    fn id(&self) -> &str {
        LOCAL_BACKEND
    }

    async fn extract_text(&self, image: &[u8]) -> Result<OcrResult> {
        let tesseract = match &self.engine {
            Engine::Ready { tesseract } => Arc::clone(tesseract),
            Engine::Unavailable { reason } => return Err(OcrError::Unavailable(reason.clone())),
        };

        let started = Instant::now();
        let bytes = image.to_vec();
        let (text, mean_conf, tsv) = tokio::task::spawn_blocking(move || {
            let mut lt = tesseract.blocking_lock();
            lt.set_image_from_mem(&bytes)
                .map_err(|e| OcrError::Permanent(format!("Failed to set image: {e}")))?;
            let text = lt
                .get_utf8_text()
                .map_err(|e| OcrError::Permanent(format!("Failed to extract text: {e}")))?;
            let mean_conf = lt.mean_text_conf();
            let tsv = lt
                .get_tsv_text(0)
                .map_err(|e| OcrError::Permanent(format!("Failed to read word boxes: {e}")))?;
            Ok::<_, OcrError>((text, mean_conf, tsv))
        })
        .await
        .map_err(|e| OcrError::Permanent(format!("OCR task panicked: {e}")))??;

        let text = text.trim().to_string();
        let (confidence, languages) = if text.is_empty() {
            (0.0, Vec::new())
        } else {
            (mean_conf.clamp(0, 100) as f32 / 100.0, self.languages.clone())
        };

        Ok(OcrResult::new(
            text,
            confidence,
            parse_tsv_words(&tsv),
            languages,
            started.elapsed().as_secs_f64(),
            LOCAL_BACKEND,
        ))
    }

    fn is_available(&self) -> bool {
        matches!(self.engine, Engine::Ready { .. })
    }

    fn unavailable_reason(&self) -> Option<String> {
        match &self.engine {
            Engine::Ready { .. } => None,
            Engine::Unavailable { reason } => Some(reason.clone()),
        }
    }
}

/// Word boxes from Tesseract TSV output:
/// `level page block par line word left top width height conf text`.
fn parse_tsv_words(tsv: &str) -> Vec<BoundingBox> {
    tsv.lines()
        .filter_map(|line| {
            let cols: Vec<&str> = line.splitn(12, '\t').collect();
            if cols.len() < 12 || cols[0].parse::<u32>().ok()? != TSV_WORD_LEVEL {
                return None;
            }
            let num = |i: usize| cols[i].trim().parse::<u32>().ok();
            let conf: f32 = cols[10].trim().parse().ok()?;
            if conf < 0.0 {
                return None;
            }
            BoundingBox::new(num(6)?, num(7)?, num(8)?, num(9)?, cols[11].trim(), conf / 100.0).ok()
        })
        .collect()
}

/// Tesseract language codes (`eng+fra`) to ISO 639-1 where known.
fn iso_languages(languages: &str) -> Vec<String> {
    languages
        .split('+')
        .map(str::trim)
        .filter(|l| !l.is_empty() && *l != "osd")
        .map(|l| {
            match l {
                "eng" => "en",
                "fra" => "fr",
                "deu" => "de",
                "spa" => "es",
                "ita" => "it",
                "nld" => "nl",
                "por" => "pt",
                "pol" => "pl",
                "jpn" => "ja",
                "chi_sim" | "chi_tra" => "zh",
                other => other,
            }
            .to_string()
        })
        .collect()
}
