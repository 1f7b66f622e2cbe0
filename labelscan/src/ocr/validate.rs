use image::{ImageFormat, ImageReader};
use std::io::Cursor;

use crate::error::{OcrError, Result};

/// What the validator learned about an accepted image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageInfo {
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
}

impl ImageInfo {
    pub fn mime_type(&self) -> &'static str {
        self.format.to_mime_type()
    }
}

/// Confirm the bytes are a PNG or JPEG whose header decodes.
///
/// Only the header is read; pixel data is left to the backends.
pub fn validate_image(bytes: &[u8]) -> Result<ImageInfo> {
    if bytes.is_empty() {
        return Err(OcrError::Validation("Image payload is empty".to_string()));
    }

    let format = image::guess_format(bytes)
        .map_err(|e| OcrError::Validation(format!("Unrecognized image format: {e}")))?;

    if !matches!(format, ImageFormat::Png | ImageFormat::Jpeg) {
        return Err(OcrError::Validation(format!(
            "Unsupported image format {format:?}, expected PNG or JPEG"
        )));
    }

    let (width, height) = ImageReader::with_format(Cursor::new(bytes), format)
        .into_dimensions()
        .map_err(|e| OcrError::Validation(format!("Failed to decode image: {e}")))?;

    if width == 0 || height == 0 {
        return Err(OcrError::Validation(format!(
            "Image has no pixels: {width}x{height}"
        )));
    }

    Ok(ImageInfo {
        format,
        width,
        height,
    })
}
