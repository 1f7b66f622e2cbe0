use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::error::{OcrError, Result};

/// One recognized text region, in image pixel coordinates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    text: String,
    confidence: f32,
}

impl BoundingBox {
    pub fn new(
        x: u32,
        y: u32,
        width: u32,
        height: u32,
        text: impl Into<String>,
        confidence: f32,
    ) -> Result<Self> {
        let text = text.into();
        if text.trim().is_empty() {
            return Err(OcrError::Validation(
                "bounding box text must not be empty".to_string(),
            ));
        }
        Ok(Self {
            x,
            y,
            width,
            height,
            text,
            confidence: clamp_unit(confidence),
        })
    }

    pub fn x(&self) -> u32 {
        self.x
    }

    pub fn y(&self) -> u32 {
        self.y
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn text(&self) -> &str {
        &self.text
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }
}

/// Structured output of a successful extraction, handed to the
/// product-data stage as is.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrResult {
    raw_text: String,
    confidence: f32,
    bounding_boxes: Vec<BoundingBox>,
    detected_languages: BTreeSet<String>,
    processing_time: f64,
    backend_used: String,
}

impl OcrResult {
    pub fn new(
        raw_text: impl Into<String>,
        confidence: f32,
        bounding_boxes: Vec<BoundingBox>,
        detected_languages: impl IntoIterator<Item = String>,
        processing_time: f64,
        backend_used: impl Into<String>,
    ) -> Self {
        let processing_time = if processing_time.is_finite() {
            processing_time.max(0.0)
        } else {
            0.0
        };
        Self {
            raw_text: raw_text.into(),
            confidence: clamp_unit(confidence),
            bounding_boxes,
            detected_languages: detected_languages.into_iter().collect(),
            processing_time,
            backend_used: backend_used.into(),
        }
    }

    pub fn raw_text(&self) -> &str {
        &self.raw_text
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn bounding_boxes(&self) -> &[BoundingBox] {
        &self.bounding_boxes
    }

    pub fn detected_languages(&self) -> &BTreeSet<String> {
        &self.detected_languages
    }

    pub fn processing_time(&self) -> f64 {
        self.processing_time
    }

    pub fn backend_used(&self) -> &str {
        &self.backend_used
    }

    pub fn meets_threshold(&self, threshold: f32) -> bool {
        self.confidence >= threshold
    }
}

fn clamp_unit(value: f32) -> f32 {
    if value.is_nan() {
        0.0
    } else {
        value.clamp(0.0, 1.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_bounding_box_rejects_empty_text() {
        assert!(BoundingBox::new(0, 0, 10, 10, "  ", 0.9).is_err());
    }

    #[test]
    fn test_confidence_is_clamped() {
        let bbox = BoundingBox::new(0, 0, 1, 1, "x", 1.7).unwrap();
        assert_eq!(bbox.confidence(), 1.0);

        let result = OcrResult::new("", f32::NAN, vec![], vec![], -2.0, "local");
        assert_eq!(result.confidence(), 0.0);
        assert_eq!(result.processing_time(), 0.0);
    }

    #[test]
    fn test_wire_format() {
        let bbox = BoundingBox::new(4, 8, 120, 30, "SUGAR", 0.5).unwrap();
        let result = OcrResult::new(
            "SUGAR",
            0.75,
            vec![bbox],
            vec!["en".to_string()],
            0.25,
            "cloud",
        );

        let value = serde_json::to_value(&result).unwrap();
        assert_eq!(
            value,
            json!({
                "raw_text": "SUGAR",
                "confidence": 0.75,
                "bounding_boxes": [
                    { "x": 4, "y": 8, "width": 120, "height": 30, "text": "SUGAR", "confidence": 0.5 }
                ],
                "detected_languages": ["en"],
                "processing_time": 0.25,
                "backend_used": "cloud"
            })
        );
    }

    #[test]
    fn test_meets_threshold() {
        let result = OcrResult::new("a", 0.5, vec![], vec![], 0.0, "local");
        assert!(result.meets_threshold(0.5));
        assert!(!result.meets_threshold(0.51));
    }
}
