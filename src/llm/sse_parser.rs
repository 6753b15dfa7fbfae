use crate::errors::{PilotError, PilotResult};
use crate::llm::types::{StreamChunk, StreamChunkKind};

/// Parses a raw SSE line (OpenAI-compatible format) into a StreamChunk.
/// Returns None if the line is a keep-alive or non-data line.
pub fn parse_sse_line(line: &str) -> PilotResult<Option<StreamChunk>> {
    if line.is_empty() || line.starts_with(':') {
        return Ok(None);
    }

    let Some(data) = line.strip_prefix("data:").map(str::trim) else {
        return Ok(None);
    };

    if data == "[DONE]" {
        return Ok(Some(StreamChunk {
            kind: StreamChunkKind::Done,
            content: String::new(),
        }));
    }

    let json: serde_json::Value =
        serde_json::from_str(data).map_err(|e| PilotError::SseParsing(e.to_string()))?;

    // Some servers attach usage to a final chunk with an empty `choices` array.
    if let Some(total) = json["usage"]["total_tokens"].as_u64() {
        let no_delta = json["choices"]
            .as_array()
            .map_or(true, |c| c.is_empty() || c[0]["delta"]["content"].as_str().map_or(true, str::is_empty));
        if no_delta {
            return Ok(Some(StreamChunk {
                kind: StreamChunkKind::Usage,
                content: total.to_string(),
            }));
        }
    }

    if let Some(first) = json["choices"].as_array().and_then(|c| c.first()) {
        let delta = &first["delta"];

        if let Some(reasoning) = delta["reasoning_content"].as_str() {
            if !reasoning.is_empty() {
                return Ok(Some(StreamChunk {
                    kind: StreamChunkKind::Reasoning,
                    content: reasoning.to_string(),
                }));
            }
        }

        if let Some(content) = delta["content"].as_str() {
            if !content.is_empty() {
                return Ok(Some(StreamChunk {
                    kind: StreamChunkKind::Content,
                    content: content.to_string(),
                }));
            }
        }

        if first["finish_reason"].as_str().is_some() {
            return Ok(Some(StreamChunk {
                kind: StreamChunkKind::Done,
                content: String::new(),
            }));
        }
    }

    Ok(None)
}
