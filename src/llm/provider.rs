use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::state::{ParsedAction, Turn};
use crate::errors::PilotResult;
use crate::perception::types::ScreenContext;

/// Bounded history handed to the model for one prediction.
#[derive(Debug, Clone, Copy)]
pub struct InvokeParams<'a> {
    pub system_prompt: &'a str,
    /// Turns in order; each screenshot turn pairs with the next entry of `images`.
    pub conversation: &'a [Turn],
    pub images: &'a [String],
    pub screen_context: ScreenContext,
    pub scale_factor: f64,
}

#[derive(Debug, Clone, Default)]
pub struct InvokeOutput {
    pub prediction: String,
    pub parsed_actions: Vec<ParsedAction>,
    pub cost_time_ms: Option<u64>,
    pub cost_tokens: Option<u64>,
}

/// Uniform contract for vision-language models driving the loop.
///
/// Implementations must return [`PilotError::Cancelled`] once `cancel`
/// fires, so that the controller never retries an aborted call.
///
/// [`PilotError::Cancelled`]: crate::errors::PilotError::Cancelled
#[async_trait]
pub trait VisionModel: Send + Sync {
    fn name(&self) -> &str;

    async fn invoke(
        &self,
        params: InvokeParams<'_>,
        cancel: &CancellationToken,
    ) -> PilotResult<InvokeOutput>;
}
