//! The multimodal model port.

use crate::error::WorkflowError;
use crate::turn::{ConversationMessage, TokenUsage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Response of a single model call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelResponse {
    /// Response text.
    pub content: String,
    /// Extended-thinking text, when present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Why generation stopped. Opaque; logged, never branched on.
    pub stop_reason: String,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens generated.
    pub output_tokens: u64,
    /// Thinking tokens generated.
    pub thinking_tokens: u64,
    /// Total tokens.
    pub total_tokens: u64,
    /// HTTP round-trip latency, milliseconds.
    pub latency_ms: u64,
    /// The model that answered.
    pub model_id: String,
    /// Total adapter-side processing time, milliseconds.
    pub processing_time_ms: u64,
}

impl ModelResponse {
    /// Token usage of this response.
    pub fn token_usage(&self) -> TokenUsage {
        TokenUsage {
            input: self.input_tokens,
            output: self.output_tokens,
            thinking: self.thinking_tokens,
            total: self.total_tokens,
        }
    }
}

/// A multimodal model able to answer single-turn and
/// conversation-continuation calls.
///
/// Implementations classify their failures (substring rules over the
/// underlying provider message) before returning, so callers can drive
/// retries straight off the returned [`WorkflowError`].
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Single-turn call: system prompt, user prompt, and one image.
    async fn converse(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        base64_image: &str,
        image_format: &str,
    ) -> Result<ModelResponse, WorkflowError>;

    /// Conversation-continuation call: prior turn messages are
    /// prepended, preserving role and content blocks (thinking blocks
    /// included), followed by the new user prompt and image.
    async fn converse_with_history(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        base64_image: &str,
        image_format: &str,
        prior: &[ConversationMessage],
    ) -> Result<ModelResponse, WorkflowError>;
}
