use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use reqwest::{header::RETRY_AFTER, Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::{CloudConfig, CLOUD_BACKEND};
use crate::error::{OcrError, Result};

use super::backend::OcrBackend;
use super::result::{BoundingBox, OcrResult};

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct AnnotateRequest<'a> {
    requests: Vec<ImageRequest<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageRequest<'a> {
    image: ImageContent,
    features: Vec<Feature>,
    #[serde(skip_serializing_if = "Option::is_none")]
    image_context: Option<ImageContext<'a>>,
}

#[derive(Debug, Serialize)]
struct ImageContent {
    content: String,
}

#[derive(Debug, Serialize)]
struct Feature {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageContext<'a> {
    language_hints: &'a [String],
}

#[derive(Debug, Deserialize)]
struct AnnotateResponse {
    #[serde(default)]
    responses: Vec<ImageResponse>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ImageResponse {
    #[serde(default)]
    text_annotations: Vec<TextAnnotation>,
    full_text_annotation: Option<FullTextAnnotation>,
    error: Option<RpcStatus>,
}

#[derive(Debug, Deserialize)]
struct TextAnnotation {
    #[serde(default)]
    locale: Option<String>,
    #[serde(default)]
    description: String,
}

#[derive(Debug, Default, Deserialize)]
struct FullTextAnnotation {
    #[serde(default)]
    text: String,
    #[serde(default)]
    pages: Vec<Page>,
}

#[derive(Debug, Deserialize)]
struct Page {
    #[serde(default)]
    property: Option<TextProperty>,
    #[serde(default)]
    confidence: Option<f32>,
    #[serde(default)]
    blocks: Vec<Block>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TextProperty {
    #[serde(default)]
    detected_languages: Vec<DetectedLanguage>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DetectedLanguage {
    language_code: String,
}

#[derive(Debug, Deserialize)]
struct Block {
    #[serde(default)]
    paragraphs: Vec<Paragraph>,
}

#[derive(Debug, Deserialize)]
struct Paragraph {
    #[serde(default)]
    words: Vec<Word>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Word {
    bounding_box: Option<BoundingPoly>,
    #[serde(default)]
    symbols: Vec<Symbol>,
    #[serde(default)]
    confidence: Option<f32>,
}

#[derive(Debug, Deserialize)]
struct Symbol {
    #[serde(default)]
    text: String,
}

#[derive(Debug, Deserialize)]
struct BoundingPoly {
    #[serde(default)]
    vertices: Vec<Vertex>,
}

#[derive(Debug, Deserialize)]
struct Vertex {
    #[serde(default)]
    x: i64,
    #[serde(default)]
    y: i64,
}

#[derive(Debug, Deserialize)]
struct RpcStatus {
    #[serde(default)]
    code: i32,
    #[serde(default)]
    message: String,
}

/// Metered cloud vision API (Google Cloud Vision `images:annotate`).
#[derive(Clone, Debug)]
pub struct CloudVisionBackend {
    client: Client,
    api_key: Option<String>,
    base_url: String,
    language_hints: Vec<String>,
}

impl CloudVisionBackend {
    pub fn new(config: &CloudConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| OcrError::Config(format!("Failed to create HTTP client: {e}")))?;

        if config.api_key.is_some() {
            info!(base_url = %config.base_url(), "Cloud vision OCR backend initialized");
        } else {
            warn!("Cloud vision OCR backend has no API key and will be skipped");
        }

        Ok(Self {
            client,
            api_key: config.api_key.clone(),
            base_url: config.base_url().trim_end_matches('/').to_string(),
            language_hints: config.language_hints.clone(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn annotate(&self, api_key: &str, image: &[u8]) -> Result<ImageResponse> {
        let request = AnnotateRequest {
            requests: vec![ImageRequest {
                image: ImageContent {
                    content: STANDARD.encode(image),
                },
                features: vec![Feature {
                    kind: "DOCUMENT_TEXT_DETECTION",
                }],
                image_context: (!self.language_hints.is_empty()).then(|| ImageContext {
                    language_hints: &self.language_hints,
                }),
            }],
        };

        let resp = self
            .client
            .post(format!("{}/images:annotate", self.base_url))
            .query(&[("key", api_key)])
            .json(&request)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = resp.status();
        if !status.is_success() {
            let retry_after = resp
                .headers()
                .get(RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|s| s.parse().ok());
            let body = resp.text().await.unwrap_or_default();
            return Err(classify_status(status, retry_after, &body));
        }

        let body: AnnotateResponse = resp
            .json()
            .await
            .map_err(|e| OcrError::Transient(format!("Failed to parse response: {e}")))?;

        body.responses
            .into_iter()
            .next()
            .ok_or_else(|| OcrError::Transient("No response from API".to_string()))
    }
}

#[async_trait]
impl OcrBackend for CloudVisionBackend {
    fn id(&self) -> &str {
        CLOUD_BACKEND
    }

    async fn extract_text(&self, image: &[u8]) -> Result<OcrResult> {
        let api_key = self
            .api_key
            .as_deref()
            .ok_or_else(|| OcrError::Unavailable("API key required for cloud OCR".to_string()))?;

        let started = Instant::now();
        let response = self.annotate(api_key, image).await?;
        let result = into_result(response, started.elapsed().as_secs_f64())?;
        debug!(
            boxes = result.bounding_boxes().len(),
            confidence = result.confidence(),
            "Cloud OCR completed"
        );
        Ok(result)
    }

    fn is_available(&self) -> bool {
        self.api_key.is_some()
    }

    fn unavailable_reason(&self) -> Option<String> {
        self.api_key
            .is_none()
            .then(|| "API key required for cloud OCR".to_string())
    }
}

fn classify_transport_error(e: reqwest::Error) -> OcrError {
    if e.is_builder() {
        OcrError::Permanent(format!("Invalid API request: {e}"))
    } else if e.is_timeout() {
        OcrError::Transient(format!("API request timed out: {e}"))
    } else {
        OcrError::Transient(format!("API request failed: {e}"))
    }
}

fn classify_status(status: StatusCode, retry_after: Option<u64>, body: &str) -> OcrError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => OcrError::ProviderRateLimited { retry_after },
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            OcrError::Permanent(format!("API authentication failed: {status} - {body}"))
        }
        StatusCode::REQUEST_TIMEOUT => {
            OcrError::Transient(format!("API request timed out: {status}"))
        }
        s if s.is_server_error() => OcrError::Transient(format!("Server error {s}: {body}")),
        s => OcrError::Permanent(format!("API request rejected: {s} - {body}")),
    }
}

/// Map a per-image `google.rpc.Status` onto the error taxonomy.
fn classify_rpc_error(status: &RpcStatus) -> OcrError {
    let message = format!("API error {}: {}", status.code, status.message);
    match status.code {
        // DEADLINE_EXCEEDED, RESOURCE_EXHAUSTED, ABORTED, INTERNAL, UNAVAILABLE
        4 | 8 | 10 | 13 | 14 => OcrError::Transient(message),
        _ => OcrError::Permanent(message),
    }
}

fn into_result(response: ImageResponse, processing_time: f64) -> Result<OcrResult> {
    if let Some(status) = &response.error {
        return Err(classify_rpc_error(status));
    }

    let full = response.full_text_annotation.unwrap_or_default();
    let raw_text = if full.text.is_empty() {
        response
            .text_annotations
            .first()
            .map(|a| a.description.clone())
            .unwrap_or_default()
    } else {
        full.text
    };

    let mut languages: BTreeSet<String> = response
        .text_annotations
        .iter()
        .filter_map(|a| a.locale.clone())
        .filter(|l| !l.is_empty())
        .collect();

    let mut boxes = Vec::new();
    let mut page_confidences = Vec::new();
    for page in &full.pages {
        if let Some(c) = page.confidence {
            page_confidences.push(c);
        }
        if let Some(property) = &page.property {
            languages.extend(
                property
                    .detected_languages
                    .iter()
                    .map(|l| l.language_code.clone())
                    .filter(|l| !l.is_empty()),
            );
        }
        for word in page
            .blocks
            .iter()
            .flat_map(|b| &b.paragraphs)
            .flat_map(|p| &p.words)
        {
            if let Some(bbox) = word_box(word) {
                boxes.push(bbox);
            }
        }
    }

    let confidence = if raw_text.trim().is_empty() {
        0.0
    } else if !page_confidences.is_empty() {
        mean(&page_confidences)
    } else {
        let word_confidences: Vec<f32> = boxes.iter().map(BoundingBox::confidence).collect();
        if word_confidences.is_empty() {
            0.0
        } else {
            mean(&word_confidences)
        }
    };

    Ok(OcrResult::new(
        raw_text,
        confidence,
        boxes,
        languages,
        processing_time,
        CLOUD_BACKEND,
    ))
}

fn word_box(word: &Word) -> Option<BoundingBox> {
    let text: String = word.symbols.iter().map(|s| s.text.as_str()).collect();
    let vertices = &word.bounding_box.as_ref()?.vertices;
    if vertices.is_empty() {
        return None;
    }

    let clamp = |v: i64| u32::try_from(v.max(0)).unwrap_or(u32::MAX);
    let min_x = vertices.iter().map(|v| v.x).min().unwrap_or(0);
    let max_x = vertices.iter().map(|v| v.x).max().unwrap_or(0);
    let min_y = vertices.iter().map(|v| v.y).min().unwrap_or(0);
    let max_y = vertices.iter().map(|v| v.y).max().unwrap_or(0);

    BoundingBox::new(
        clamp(min_x),
        clamp(min_y),
        clamp(max_x - min_x.max(0)),
        clamp(max_y - min_y.max(0)),
        text,
        word.confidence.unwrap_or(0.0),
    )
    .ok()
}

fn mean(values: &[f32]) -> f32 {
    values.iter().sum::<f32>() / values.len() as f32
}
