use async_trait::async_trait;

use crate::errors::PilotResult;
use crate::perception::types::ScreenshotResult;

/// Source of screen frames for an operator.
/// Implementations: xcap primary monitor (feature `desktop`), test doubles.
#[async_trait]
pub trait ScreenCapture: Send + Sync {
    async fn capture(&self) -> PilotResult<ScreenshotResult>;
}
