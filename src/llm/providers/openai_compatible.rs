use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::agent_engine::state::{Factors, TurnPayload};
use crate::config::ModelConfig;
use crate::errors::{PilotError, PilotResult};
use crate::llm::action_parser;
use crate::llm::provider::{InvokeOutput, InvokeParams, VisionModel};
use crate::llm::sse_parser;
use crate::llm::types::{CallConfig, ChatMessage, StreamChunkKind};
use crate::perception::preprocess::{preprocess_screenshot, DEFAULT_MAX_PIXELS};

/// Any chat-completions endpoint that accepts `image_url` content parts.
pub struct OpenAiCompatibleModel {
    id: String,
    api_base: String,
    api_key: String,
    client: reqwest::Client,
    call: CallConfig,
    factors: Factors,
    max_pixels: u64,
}

impl OpenAiCompatibleModel {
    pub fn new(id: String, api_base: String, api_key: String, call: CallConfig, factors: Factors) -> Self {
        Self {
            id,
            api_base,
            api_key,
            client: reqwest::Client::new(),
            call,
            factors,
            max_pixels: DEFAULT_MAX_PIXELS,
        }
    }

    pub fn with_max_pixels(mut self, max_pixels: u64) -> Self {
        self.max_pixels = max_pixels;
        self
    }

    /// API key resolution: `SCREENPILOT_API_KEY`, then the config file.
    pub fn from_config(cfg: &ModelConfig, factors: Factors) -> Self {
        let api_key = std::env::var("SCREENPILOT_API_KEY")
            .unwrap_or_else(|_| cfg.api_key.clone().unwrap_or_default());
        Self::new(
            cfg.model.clone(),
            cfg.api_base.clone(),
            api_key,
            CallConfig {
                model: cfg.model.clone(),
                stream: cfg.stream,
                temperature: cfg.temperature,
                max_tokens: cfg.max_tokens,
            },
            factors,
        )
        .with_max_pixels(cfg.max_pixels)
    }

    /// System prompt, then one message per turn. Screenshot turns consume
    /// the images array in order.
    fn build_messages(&self, params: &InvokeParams<'_>) -> PilotResult<Vec<ChatMessage>> {
        let mut messages = vec![ChatMessage::text("system", params.system_prompt)];
        let mut images = params.images.iter();

        for turn in params.conversation {
            match &turn.payload {
                TurnPayload::Instruction { text } => messages.push(ChatMessage::text("user", text.clone())),
                TurnPayload::Prediction { summary, .. } => {
                    messages.push(ChatMessage::text("assistant", summary.clone()))
                }
                TurnPayload::Screenshot { .. } => {
                    let Some(image) = images.next() else {
                        tracing::warn!("screenshot turn without a paired image; skipped");
                        continue;
                    };
                    let prepared = preprocess_screenshot(image, self.max_pixels)?;
                    messages.push(ChatMessage::image(
                        "user",
                        format!("data:{};base64,{}", prepared.mime(), prepared.base64),
                    ));
                }
            }
        }
        Ok(messages)
    }

    async fn request(&self, messages: Vec<ChatMessage>) -> PilotResult<(String, Option<u64>)> {
        let body = serde_json::json!({
            "model": self.call.model,
            "messages": &messages,
            "stream": self.call.stream,
            "temperature": self.call.temperature,
            "max_tokens": self.call.max_tokens,
        });

        tracing::debug!(
            provider = %self.id,
            model = %self.call.model,
            stream = self.call.stream,
            messages = messages.len(),
            "sending VLM request"
        );
        tracing::trace!(body = %sanitized(&body), "request body (base64 omitted)");

        let mut request = self.client.post(&self.api_base).json(&body);
        if !self.api_key.is_empty() {
            request = request.bearer_auth(&self.api_key);
        }
        let response = request.send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(PilotError::Model(format!("{status}: {err_body}")));
        }

        if self.call.stream {
            self.handle_stream(response).await
        } else {
            self.handle_json(response).await
        }
    }

    async fn handle_stream(&self, response: reqwest::Response) -> PilotResult<(String, Option<u64>)> {
        let mut byte_stream = response.bytes_stream();
        let mut lines = LineBuffer::default();
        let mut content = String::new();
        let mut tokens = None;

        'stream: while let Some(result) = byte_stream.next().await {
            let bytes = result?;
            for line in lines.push(&bytes) {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                match sse_parser::parse_sse_line(line) {
                    Ok(Some(chunk)) => match chunk.kind {
                        StreamChunkKind::Content => content.push_str(&chunk.content),
                        StreamChunkKind::Usage => tokens = chunk.content.parse().ok(),
                        StreamChunkKind::Reasoning => {}
                        StreamChunkKind::Done => break 'stream,
                    },
                    Ok(None) => {}
                    Err(e) => tracing::debug!("SSE parse skipped: {e}"),
                }
            }
        }

        tracing::info!(content_len = content.len(), tokens = ?tokens, "VLM stream complete");
        Ok((content, tokens))
    }

    async fn handle_json(&self, response: reqwest::Response) -> PilotResult<(String, Option<u64>)> {
        let json: serde_json::Value = response.json().await?;
        let content = json["choices"][0]["message"]["content"]
            .as_str()
            .unwrap_or("")
            .to_string();
        let tokens = json["usage"]["total_tokens"].as_u64();
        tracing::info!(content_len = content.len(), tokens = ?tokens, "VLM JSON response received");
        Ok((content, tokens))
    }
}

#[async_trait]
impl VisionModel for OpenAiCompatibleModel {
    fn name(&self) -> &str {
        &self.id
    }

    async fn invoke(&self, params: InvokeParams<'_>, cancel: &CancellationToken) -> PilotResult<InvokeOutput> {
        let started = Instant::now();
        let messages = self.build_messages(&params)?;

        let (prediction, cost_tokens) = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PilotError::Cancelled),
            res = self.request(messages) => res?,
        };

        let parsed_actions = if prediction.trim().is_empty() {
            Vec::new()
        } else {
            action_parser::parse(&prediction, self.factors, params.screen_context, params.scale_factor)?
        };

        Ok(InvokeOutput {
            prediction,
            parsed_actions,
            cost_time_ms: Some(started.elapsed().as_millis() as u64),
            cost_tokens,
        })
    }
}

/// Splits a byte stream into lines. Bytes are only decoded once a full line
/// has arrived, so multi-byte characters split across network chunks survive.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, bytes: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(nl) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=nl).collect();
            lines.push(String::from_utf8_lossy(&line[..nl]).into_owned());
        }
        lines
    }
}

/// Copy of `body` with image payloads replaced, for logging.
fn sanitized(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|i| i.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}
