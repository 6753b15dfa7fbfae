use serde::{Deserialize, Serialize};

/// A captured frame as handed to the loop by an operator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScreenshotResult {
    /// Encoded image (PNG or JPEG), base64 without a data-URI prefix.
    pub base64: String,
    /// Logical width, i.e. the coordinate space pointer actions are expressed in.
    pub width: u32,
    pub height: u32,
    /// Device pixel ratio of the captured display.
    pub scale_factor: f64,
}

impl ScreenshotResult {
    /// Missing data or a zero dimension makes a frame unusable.
    pub fn is_valid(&self) -> bool {
        !self.base64.is_empty() && self.width > 0 && self.height > 0
    }

    pub fn context(&self) -> ScreenContext {
        ScreenContext {
            width: self.width,
            height: self.height,
            scale_factor: self.scale_factor,
        }
    }
}

/// Screen geometry recorded alongside every screenshot turn.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ScreenContext {
    pub width: u32,
    pub height: u32,
    pub scale_factor: f64,
}
