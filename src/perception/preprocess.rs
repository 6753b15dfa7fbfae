//! Screenshot downsampling ahead of a VLM call.
//!
//! Each model variant accepts a bounded number of pixels per image. Frames
//! above the budget are shrunk with their aspect ratio preserved; frames
//! already within it pass through byte-identical so repeated calls never
//! re-encode the same image twice.
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::GenericImageView;

use crate::errors::{PilotError, PilotResult};

/// Pixel budget of UI-TARS 1.0 style models (1350 patches of 28×28).
pub const DEFAULT_MAX_PIXELS: u64 = 1350 * 28 * 28;

const JPEG_QUALITY: u8 = 80;

/// Result of a preprocessing pass.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    /// Base64-encoded image, without a data-URI prefix.
    pub base64: String,
    pub width: u32,
    pub height: u32,
    /// `true` when the image was resized and re-encoded.
    pub resized: bool,
}

impl PreparedImage {
    /// MIME type for a data URI; only resized images are known to be JPEG.
    pub fn mime(&self) -> &'static str {
        if self.resized {
            "image/jpeg"
        } else {
            sniff_mime(&self.base64)
        }
    }
}

/// Shrink `image_base64` so that `width * height <= max_pixels`.
pub fn preprocess_screenshot(image_base64: &str, max_pixels: u64) -> PilotResult<PreparedImage> {
    let bytes = base64::engine::general_purpose::STANDARD.decode(image_base64.trim())?;
    let img = image::load_from_memory(&bytes)
        .map_err(|e| PilotError::Image(format!("decode: {e}")))?;
    let (w, h) = img.dimensions();
    let pixels = u64::from(w) * u64::from(h);

    if pixels <= max_pixels {
        return Ok(PreparedImage {
            base64: image_base64.trim().to_string(),
            width: w,
            height: h,
            resized: false,
        });
    }

    let resize_factor = (max_pixels as f64 / pixels as f64).sqrt();
    let new_w = ((w as f64 * resize_factor).floor() as u32).max(1);
    let new_h = ((h as f64 * resize_factor).floor() as u32).max(1);

    tracing::debug!(
        from = %format!("{w}x{h}"),
        to = %format!("{new_w}x{new_h}"),
        max_pixels,
        "downsampling screenshot"
    );

    let resized = img
        .resize_exact(new_w, new_h, image::imageops::FilterType::Triangle)
        .to_rgb8();

    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY)
        .encode_image(&resized)
        .map_err(|e| PilotError::Image(format!("JPEG encode: {e}")))?;

    Ok(PreparedImage {
        base64: base64::engine::general_purpose::STANDARD.encode(&jpeg),
        width: new_w,
        height: new_h,
        resized: true,
    })
}

/// Guess the MIME type from the first bytes of the base64 payload.
fn sniff_mime(b64: &str) -> &'static str {
    if b64.starts_with("iVBORw0KGgo") {
        "image/png"
    } else if b64.starts_with("/9j/") {
        "image/jpeg"
    } else if b64.starts_with("UklGR") {
        "image/webp"
    } else {
        "image/png"
    }
}
