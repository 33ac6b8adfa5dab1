//! Anthropic API client struct and builder.

use crate::error::{map_http_status, map_reqwest_error};
use crate::mapping::{build_request_body, from_api_response};
use async_trait::async_trait;
use optic_protocol::{
    ConversationMessage, ModelClient, ModelResponse, WorkflowError, WorkflowConfig,
};
use std::time::Instant;

/// Default Anthropic API base URL.
const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";

/// Anthropic API version header value.
const ANTHROPIC_VERSION: &str = "2023-06-01";

/// Client for the Anthropic Messages API.
///
/// Implements [`ModelClient`] for use anywhere the workflow accepts a
/// model.
///
/// # Example
///
/// ```no_run
/// use optic_model_anthropic::AnthropicModel;
///
/// let client = AnthropicModel::new("sk-ant-...", "claude-sonnet-4-20250514")
///     .max_tokens(4096)
///     .temperature(0.0);
/// ```
pub struct AnthropicModel {
    pub(crate) api_key: String,
    pub(crate) model_id: String,
    pub(crate) base_url: String,
    pub(crate) max_tokens: u32,
    pub(crate) temperature: f64,
    pub(crate) top_p: Option<f64>,
    pub(crate) client: reqwest::Client,
}

impl AnthropicModel {
    /// Create a new client with the given API key and model id.
    #[must_use]
    pub fn new(api_key: impl Into<String>, model_id: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            model_id: model_id.into(),
            base_url: DEFAULT_BASE_URL.into(),
            max_tokens: 4096,
            temperature: 0.0,
            top_p: None,
            client: reqwest::Client::new(),
        }
    }

    /// Build a client from workflow configuration.
    #[must_use]
    pub fn from_config(api_key: impl Into<String>, config: &WorkflowConfig) -> Self {
        let mut model = Self::new(api_key, &config.model_id);
        model.max_tokens = config.model_max_tokens;
        model.temperature = config.model_temperature;
        model.top_p = config.model_top_p;
        model
    }

    /// Override the API base URL.
    ///
    /// Useful for testing with a local mock server or an API proxy.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    /// Override the maximum output tokens.
    #[must_use]
    pub fn max_tokens(mut self, max_tokens: u32) -> Self {
        self.max_tokens = max_tokens;
        self
    }

    /// Override the sampling temperature.
    #[must_use]
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Set the nucleus sampling parameter.
    #[must_use]
    pub fn top_p(mut self, top_p: f64) -> Self {
        self.top_p = Some(top_p);
        self
    }

    /// Build the messages endpoint URL.
    pub(crate) fn messages_url(&self) -> String {
        format!("{}/v1/messages", self.base_url)
    }

    async fn send(&self, body: serde_json::Value) -> Result<ModelResponse, WorkflowError> {
        let url = self.messages_url();
        let started = Instant::now();

        tracing::debug!(url = %url, model = %self.model_id, "sending model request");

        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .header("content-type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest_error)?;

        let status = response.status();
        let response_text = response.text().await.map_err(map_reqwest_error)?;
        let latency_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(map_http_status(status, &response_text));
        }

        let json: serde_json::Value = serde_json::from_str(&response_text).map_err(|e| {
            WorkflowError::new(
                optic_protocol::ErrorCategory::Model,
                "MODEL_RESPONSE_MALFORMED",
                format!("response body is not JSON: {e}"),
            )
            .non_retryable()
            .with_component("anthropic_model")
        })?;

        let mut parsed = from_api_response(&json)?;
        parsed.latency_ms = latency_ms;
        parsed.processing_time_ms = started.elapsed().as_millis() as u64;
        Ok(parsed)
    }
}

#[async_trait]
impl ModelClient for AnthropicModel {
    async fn converse(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        base64_image: &str,
        image_format: &str,
    ) -> Result<ModelResponse, WorkflowError> {
        let body = build_request_body(
            self,
            system_prompt,
            user_prompt,
            base64_image,
            image_format,
            &[],
        );
        self.send(body)
            .await
            .map_err(|e| e.with_operation("converse"))
    }

    async fn converse_with_history(
        &self,
        system_prompt: &str,
        user_prompt: &str,
        base64_image: &str,
        image_format: &str,
        prior: &[ConversationMessage],
    ) -> Result<ModelResponse, WorkflowError> {
        let body = build_request_body(
            self,
            system_prompt,
            user_prompt,
            base64_image,
            image_format,
            prior,
        );
        self.send(body)
            .await
            .map_err(|e| e.with_operation("converse_with_history"))
    }
}
