//! Request/response mapping between workflow types and the Anthropic
//! Messages API format.
//!
//! Reference: <https://docs.anthropic.com/en/api/messages>

use crate::client::AnthropicModel;
use optic_protocol::{
    ConversationBlock, ConversationMessage, ConversationRole, ErrorCategory, ModelResponse,
    WorkflowError,
};
use serde_json::json;

/// Build the Messages API body for a verification turn.
///
/// Prior messages come first, preserving role and content blocks
/// (thinking blocks included); the new user message carries the image
/// followed by the prompt text.
pub(crate) fn build_request_body(
    client: &AnthropicModel,
    system_prompt: &str,
    user_prompt: &str,
    base64_image: &str,
    image_format: &str,
    prior: &[ConversationMessage],
) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = prior.iter().map(map_message).collect();
    messages.push(json!({
        "role": "user",
        "content": [
            {
                "type": "image",
                "source": {
                    "type": "base64",
                    "media_type": format!("image/{image_format}"),
                    "data": base64_image,
                },
            },
            { "type": "text", "text": user_prompt },
        ],
    }));

    let mut body = json!({
        "model": client.model_id,
        "system": system_prompt,
        "messages": messages,
        "max_tokens": client.max_tokens,
        "temperature": client.temperature,
    });
    if let Some(top_p) = client.top_p {
        body["top_p"] = serde_json::Value::from(top_p);
    }
    body
}

/// Map a stored conversation message to an API message.
///
/// Stored image references are replayed as text markers; the pixels
/// stay in the artifact store and only the current turn's image travels
/// inline.
fn map_message(message: &ConversationMessage) -> serde_json::Value {
    let role = match message.role {
        ConversationRole::User => "user",
        ConversationRole::Assistant => "assistant",
    };
    let content: Vec<serde_json::Value> = message
        .content
        .iter()
        .map(|block| match block {
            ConversationBlock::Text { text } => json!({ "type": "text", "text": text }),
            ConversationBlock::Thinking { thinking } => {
                json!({ "type": "thinking", "thinking": thinking })
            }
            ConversationBlock::ImageRef { key, format } => json!({
                "type": "text",
                "text": format!("[stored {format} image: {key}]"),
            }),
        })
        .collect();
    json!({ "role": role, "content": content })
}

/// Map a Messages API response body to a [`ModelResponse`].
///
/// Latency fields are filled in by the caller.
pub(crate) fn from_api_response(json: &serde_json::Value) -> Result<ModelResponse, WorkflowError> {
    let blocks = json
        .get("content")
        .and_then(|c| c.as_array())
        .ok_or_else(|| {
            WorkflowError::new(
                ErrorCategory::Model,
                "MODEL_RESPONSE_MALFORMED",
                "response has no content array",
            )
            .non_retryable()
            .with_component("anthropic_model")
        })?;

    let mut content = String::new();
    let mut thinking = String::new();
    for block in blocks {
        match block.get("type").and_then(|t| t.as_str()) {
            Some("text") => {
                if let Some(text) = block.get("text").and_then(|t| t.as_str()) {
                    content.push_str(text);
                }
            }
            Some("thinking") => {
                if let Some(text) = block.get("thinking").and_then(|t| t.as_str()) {
                    if !thinking.is_empty() {
                        thinking.push('\n');
                    }
                    thinking.push_str(text);
                }
            }
            _ => {}
        }
    }

    let input_tokens = json["usage"]["input_tokens"].as_u64().unwrap_or(0);
    let output_tokens = json["usage"]["output_tokens"].as_u64().unwrap_or(0);
    // The API does not report thinking tokens separately; they are
    // included in output_tokens.
    let thinking_tokens = 0;

    Ok(ModelResponse {
        content,
        thinking: (!thinking.is_empty()).then_some(thinking),
        stop_reason: json
            .get("stop_reason")
            .and_then(|s| s.as_str())
            .unwrap_or("unknown")
            .to_string(),
        input_tokens,
        output_tokens,
        thinking_tokens,
        total_tokens: input_tokens + output_tokens + thinking_tokens,
        latency_ms: 0,
        model_id: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or_default()
            .to_string(),
        processing_time_ms: 0,
    })
}
