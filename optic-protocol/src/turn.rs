//! Per-turn records: requests, responses, conversations, and metrics.

use crate::context::VerificationContext;
use crate::envelope::Envelope;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Which of the two turns a record belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TurnId {
    /// Turn 1 analyzes the reference (or previous) image.
    #[serde(rename = "1")]
    Turn1,
    /// Turn 2 analyzes the checking (or current) image and compares.
    #[serde(rename = "2")]
    Turn2,
}

impl TurnId {
    /// Numeric turn id.
    pub fn number(&self) -> u8 {
        match self {
            TurnId::Turn1 => 1,
            TurnId::Turn2 => 2,
        }
    }
}

impl fmt::Display for TurnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number())
    }
}

/// Analysis stage tag of a turn record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AnalysisStage {
    /// Turn 1 analyzes the reference image.
    ReferenceAnalysis,
    /// Turn 2 compares the checking image against turn 1.
    ComparisonAnalysis,
}

impl AnalysisStage {
    /// The stage tag for a turn.
    pub fn for_turn(turn: TurnId) -> Self {
        match turn {
            TurnId::Turn1 => AnalysisStage::ReferenceAnalysis,
            TurnId::Turn2 => AnalysisStage::ComparisonAnalysis,
        }
    }

    /// The wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            AnalysisStage::ReferenceAnalysis => "REFERENCE_ANALYSIS",
            AnalysisStage::ComparisonAnalysis => "COMPARISON_ANALYSIS",
        }
    }
}

impl fmt::Display for AnalysisStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token usage of a single model call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    /// Input tokens consumed.
    pub input: u64,
    /// Output tokens generated.
    pub output: u64,
    /// Thinking tokens generated.
    pub thinking: u64,
    /// Total tokens (`input + output + thinking`).
    pub total: u64,
}

impl TokenUsage {
    /// Build a usage record; `total` is derived.
    pub fn new(input: u64, output: u64, thinking: u64) -> Self {
        Self {
            input,
            output,
            thinking,
            total: input + output + thinking,
        }
    }
}

/// The model's raw answer for one turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelOutput {
    /// Response text.
    pub content: String,
    /// Extended-thinking text, when the model produced any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<String>,
    /// Why generation stopped. Opaque; logged, never branched on.
    pub stop_reason: String,
    /// The model that produced the response.
    pub model_id: String,
}

/// Record of one completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    /// Which turn this record belongs to.
    pub turn_id: TurnId,
    /// When the turn finished.
    pub timestamp: DateTime<Utc>,
    /// The rendered prompt that was sent.
    pub prompt: String,
    /// Logical image name → stored object key.
    #[serde(default)]
    pub image_refs: BTreeMap<String, String>,
    /// The model's answer.
    pub response: ModelOutput,
    /// Model round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Token usage of the call.
    pub token_usage: TokenUsage,
    /// Analysis stage tag.
    pub stage: AnalysisStage,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConversationRole {
    /// The prompt author.
    User,
    /// The model.
    Assistant,
}

/// A single content block within a conversation message.
///
/// Images travel as references into the artifact store, not as inline
/// data; thinking blocks are preserved so a continuation call can replay
/// them verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConversationBlock {
    /// Plain text.
    Text {
        /// The text content.
        text: String,
    },
    /// A stored image, by object key.
    ImageRef {
        /// Key of the stored base64 payload.
        key: String,
        /// Image format token (`jpeg`, `png`, …).
        format: String,
    },
    /// Extended thinking emitted by the model.
    Thinking {
        /// The thinking text.
        thinking: String,
    },
}

/// A message in the stored conversation transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationMessage {
    /// The message author.
    pub role: ConversationRole,
    /// Content blocks of the message.
    pub content: Vec<ConversationBlock>,
}

impl ConversationMessage {
    /// A user message with a single text block.
    pub fn user_text(text: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::User,
            content: vec![ConversationBlock::Text { text: text.into() }],
        }
    }

    /// An assistant message with a single text block.
    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self {
            role: ConversationRole::Assistant,
            content: vec![ConversationBlock::Text { text: text.into() }],
        }
    }
}

/// The stored conversation artifact for a turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRecord {
    /// The verification this conversation belongs to.
    pub verification_id: String,
    /// Which turn produced the record.
    pub turn_id: TurnId,
    /// The system prompt in effect.
    pub system_prompt: String,
    /// Ordered messages, oldest first.
    pub messages: Vec<ConversationMessage>,
    /// Token usage of the turn's model call.
    pub token_usage: TokenUsage,
    /// Model round-trip latency in milliseconds.
    pub latency_ms: u64,
    /// Why generation stopped.
    pub stop_reason: String,
    /// The model that answered.
    pub model_id: String,
    /// Free-form metadata.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,
}

/// Timing and usage metrics for one processed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingMetrics {
    /// When the turn pipeline started.
    pub started_at: DateTime<Utc>,
    /// When the turn pipeline finished.
    pub ended_at: DateTime<Utc>,
    /// Total wall-clock time, milliseconds.
    pub total_ms: u64,
    /// Model round-trip latency, milliseconds.
    pub model_latency_ms: u64,
    /// Pipeline time outside the model call
    /// (`total_ms − model_latency_ms`).
    pub processing_ms: u64,
    /// Token usage of the model call.
    pub token_usage: TokenUsage,
}

impl ProcessingMetrics {
    /// Build metrics from wall-clock bounds and the model latency.
    pub fn new(
        started_at: DateTime<Utc>,
        ended_at: DateTime<Utc>,
        model_latency_ms: u64,
        token_usage: TokenUsage,
    ) -> Self {
        let total_ms = (ended_at - started_at).num_milliseconds().max(0) as u64;
        Self {
            started_at,
            ended_at,
            total_ms,
            model_latency_ms,
            processing_ms: total_ms.saturating_sub(model_latency_ms),
            token_usage,
        }
    }
}

/// Observability record of one template rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemplateProcessor {
    /// The template that was rendered.
    pub template_id: String,
    /// Variables bound during rendering.
    pub variables: BTreeMap<String, String>,
    /// Length of the rendered text, characters.
    pub processed_length: usize,
    /// Rendering time, milliseconds.
    pub processing_time_ms: u64,
    /// Token estimate of the template inputs.
    pub input_token_estimate: usize,
    /// Token estimate of the rendered output.
    pub output_token_estimate: usize,
    /// Deterministic hash of the rendered output, for cache keying.
    pub output_hash: String,
}

/// A fully-resolved request for one turn, produced by the event
/// transformer and consumed by the turn executor.
#[derive(Debug, Clone)]
pub struct TurnRequest {
    /// Which turn to execute.
    pub turn_id: TurnId,
    /// The resolved verification context.
    pub context: VerificationContext,
    /// The inbound envelope with normalized references.
    pub envelope: Envelope,
}
