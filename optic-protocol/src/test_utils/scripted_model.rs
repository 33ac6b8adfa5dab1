//! A model client that replays a scripted sequence of results.

use crate::error::WorkflowError;
use crate::ports::{ModelClient, ModelResponse};
use crate::turn::ConversationMessage;
use async_trait::async_trait;
use std::collections::VecDeque;
use tokio::sync::Mutex;

/// What a [`ScriptedModelClient`] saw in one call.
#[derive(Debug, Clone)]
pub struct RecordedModelCall {
    /// The system prompt passed in.
    pub system_prompt: String,
    /// The user prompt passed in.
    pub user_prompt: String,
    /// The image format token passed in.
    pub image_format: String,
    /// Number of prior messages (0 for single-turn calls).
    pub prior_messages: usize,
}

/// Model client test double: answers from a scripted queue of results
/// and records every call it receives.
///
/// Push responses and errors in the order the test expects them to be
/// consumed; an exhausted script is an internal error.
#[derive(Default)]
pub struct ScriptedModelClient {
    script: Mutex<VecDeque<Result<ModelResponse, WorkflowError>>>,
    calls: Mutex<Vec<RecordedModelCall>>,
}

impl ScriptedModelClient {
    /// An empty script.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a successful response.
    pub fn push_response(&self, response: ModelResponse) {
        self.script
            .try_lock()
            .expect("script lock")
            .push_back(Ok(response));
    }

    /// Queue a failure.
    pub fn push_error(&self, error: WorkflowError) {
        self.script
            .try_lock()
            .expect("script lock")
            .push_back(Err(error));
    }

    /// A plain text response with plausible usage numbers.
    pub fn text_response(content: impl Into<String>) -> ModelResponse {
        ModelResponse {
            content: content.into(),
            thinking: None,
            stop_reason: "end_turn".into(),
            input_tokens: 1200,
            output_tokens: 400,
            thinking_tokens: 0,
            total_tokens: 1600,
            latency_ms: 850,
            model_id: "scripted-model".into(),
            processing_time_ms: 860,
        }
    }

    /// Every call recorded so far.
    pub async fn calls(&self) -> Vec<RecordedModelCall> {
        self.calls.lock().await.clone()
    }

    async fn answer(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        image_format: &str,
        prior_messages: usize,
    ) -> Result<ModelResponse, WorkflowError> {
        self.calls.lock().await.push(RecordedModelCall {
            system_prompt: system_prompt.to_string(),
            user_prompt: user_prompt.to_string(),
            image_format: image_format.to_string(),
            prior_messages,
        });
        self.script
            .lock()
            .await
            .pop_front()
            .unwrap_or_else(|| {
                Err(WorkflowError::internal(
                    "SCRIPT_EXHAUSTED",
                    "scripted model client has no response left",
                ))
            })
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    async fn converse(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _base64_image: &str,
        image_format: &str,
    ) -> Result<ModelResponse, WorkflowError> {
        self.answer(system_prompt, user_prompt, image_format, 0).await
    }

    async fn converse_with_history(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        _base64_image: &str,
        image_format: &str,
        prior: &[ConversationMessage],
    ) -> Result<ModelResponse, WorkflowError> {
        self.answer(system_prompt, user_prompt, image_format, prior.len())
            .await
    }
}
