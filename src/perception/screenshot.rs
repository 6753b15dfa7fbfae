// Primary-monitor capture through xcap.
use async_trait::async_trait;
use base64::Engine as _;

use crate::errors::{PilotError, PilotResult};
use crate::perception::traits::ScreenCapture;
use crate::perception::types::ScreenshotResult;

/// Captures the primary monitor and reports logical dimensions.
#[derive(Debug, Default, Clone, Copy)]
pub struct PrimaryMonitorCapture;

#[async_trait]
impl ScreenCapture for PrimaryMonitorCapture {
    async fn capture(&self) -> PilotResult<ScreenshotResult> {
        tokio::task::spawn_blocking(capture_primary_blocking)
            .await
            .map_err(|e| PilotError::Screenshot(format!("join: {e}")))?
    }
}

fn capture_primary_blocking() -> PilotResult<ScreenshotResult> {
    let monitors = xcap::Monitor::all()
        .map_err(|e| PilotError::Screenshot(format!("enumerate monitors: {e}")))?;
    let monitor = monitors
        .into_iter()
        .find(|m| m.is_primary())
        .ok_or_else(|| PilotError::Screenshot("no primary monitor".into()))?;

    let scale_factor = f64::from(monitor.scale_factor());
    let frame = monitor
        .capture_image()
        .map_err(|e| PilotError::Screenshot(format!("capture: {e}")))?;
    let (physical_w, physical_h) = (frame.width(), frame.height());

    // Re-wrap the raw buffer so we do not depend on xcap's `image` version.
    let rgba = image::RgbaImage::from_raw(physical_w, physical_h, frame.into_raw())
        .ok_or_else(|| PilotError::Screenshot("frame buffer size mismatch".into()))?;
    let mut png = Vec::new();
    image::DynamicImage::ImageRgba8(rgba)
        .write_to(&mut std::io::Cursor::new(&mut png), image::ImageFormat::Png)
        .map_err(|e| PilotError::Image(format!("PNG encode: {e}")))?;

    let logical_w = (f64::from(physical_w) / scale_factor).round() as u32;
    let logical_h = (f64::from(physical_h) / scale_factor).round() as u32;

    tracing::debug!(
        phys = %format!("{physical_w}x{physical_h}"),
        logical = %format!("{logical_w}x{logical_h}"),
        scale = scale_factor,
        "primary monitor captured"
    );

    Ok(ScreenshotResult {
        base64: base64::engine::general_purpose::STANDARD.encode(&png),
        width: logical_w,
        height: logical_h,
        scale_factor,
    })
}
