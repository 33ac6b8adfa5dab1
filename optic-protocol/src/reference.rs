//! Artifact references and the closed set of logical artifact names.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Pointer to a stored artifact: `(bucket, key, size)`.
///
/// References are immutable once written. Keys are hierarchical:
/// `YYYY/MM/DD/<verificationId>/<category>/<artifact>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Reference {
    /// Bucket (or top-level namespace) holding the artifact.
    pub bucket: String,
    /// Hierarchical object key.
    pub key: String,
    /// Stored size in bytes.
    pub size: u64,
}

impl Reference {
    /// Create a new reference.
    pub fn new(bucket: impl Into<String>, key: impl Into<String>, size: u64) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            size,
        }
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// The closed enumeration of logical artifact names carried in an
/// envelope's reference map.
///
/// The wire strings are part of the external contract; unknown names are
/// rejected when an envelope is decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum LogicalName {
    /// Initialization record written by the Initialize stage.
    #[serde(rename = "processing_initialization")]
    ProcessingInitialization,
    /// Per-image storage metadata for both images.
    #[serde(rename = "images_metadata")]
    ImagesMetadata,
    /// Base64-encoded reference (or previous) image.
    #[serde(rename = "images_referenceBase64")]
    ImagesReferenceBase64,
    /// Base64-encoded checking (or current) image.
    #[serde(rename = "images_checkingBase64")]
    ImagesCheckingBase64,
    /// System prompt shared by both turns.
    #[serde(rename = "prompts_system")]
    PromptsSystem,
    /// Rendered Turn-1 prompt.
    #[serde(rename = "prompts_turn1")]
    PromptsTurn1,
    /// Rendered Turn-2 prompt.
    #[serde(rename = "prompts_turn2")]
    PromptsTurn2,
    /// Raw Turn-1 turn record.
    #[serde(rename = "responses_turn1Raw")]
    ResponsesTurn1Raw,
    /// Processed Turn-1 markdown.
    #[serde(rename = "responses_turn1Processed")]
    ResponsesTurn1Processed,
    /// Raw Turn-2 turn record.
    #[serde(rename = "responses_turn2Raw")]
    ResponsesTurn2Raw,
    /// Processed Turn-2 markdown.
    #[serde(rename = "responses_turn2Processed")]
    ResponsesTurn2Processed,
    /// Turn-1 conversation transcript.
    #[serde(rename = "conversation_turn1")]
    ConversationTurn1,
    /// Turn-2 (full) conversation transcript.
    #[serde(rename = "conversation_turn2")]
    ConversationTurn2,
    /// Layout metadata artifact (layout-vs-checking only).
    #[serde(rename = "processing_layout-metadata")]
    ProcessingLayoutMetadata,
    /// Historical context artifact (previous-vs-current only).
    #[serde(rename = "processing_historical_context")]
    ProcessingHistoricalContext,
    /// Per-turn processing metrics.
    #[serde(rename = "processing_metrics")]
    ProcessingMetrics,
    /// Template processor observability record.
    #[serde(rename = "processing_template-processor")]
    ProcessingTemplateProcessor,
}

impl LogicalName {
    /// All logical names, in reference-map order.
    pub const ALL: [LogicalName; 17] = [
        LogicalName::ProcessingInitialization,
        LogicalName::ImagesMetadata,
        LogicalName::ImagesReferenceBase64,
        LogicalName::ImagesCheckingBase64,
        LogicalName::PromptsSystem,
        LogicalName::PromptsTurn1,
        LogicalName::PromptsTurn2,
        LogicalName::ResponsesTurn1Raw,
        LogicalName::ResponsesTurn1Processed,
        LogicalName::ResponsesTurn2Raw,
        LogicalName::ResponsesTurn2Processed,
        LogicalName::ConversationTurn1,
        LogicalName::ConversationTurn2,
        LogicalName::ProcessingLayoutMetadata,
        LogicalName::ProcessingHistoricalContext,
        LogicalName::ProcessingMetrics,
        LogicalName::ProcessingTemplateProcessor,
    ];

    /// The wire string for this logical name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogicalName::ProcessingInitialization => "processing_initialization",
            LogicalName::ImagesMetadata => "images_metadata",
            LogicalName::ImagesReferenceBase64 => "images_referenceBase64",
            LogicalName::ImagesCheckingBase64 => "images_checkingBase64",
            LogicalName::PromptsSystem => "prompts_system",
            LogicalName::PromptsTurn1 => "prompts_turn1",
            LogicalName::PromptsTurn2 => "prompts_turn2",
            LogicalName::ResponsesTurn1Raw => "responses_turn1Raw",
            LogicalName::ResponsesTurn1Processed => "responses_turn1Processed",
            LogicalName::ResponsesTurn2Raw => "responses_turn2Raw",
            LogicalName::ResponsesTurn2Processed => "responses_turn2Processed",
            LogicalName::ConversationTurn1 => "conversation_turn1",
            LogicalName::ConversationTurn2 => "conversation_turn2",
            LogicalName::ProcessingLayoutMetadata => "processing_layout-metadata",
            LogicalName::ProcessingHistoricalContext => "processing_historical_context",
            LogicalName::ProcessingMetrics => "processing_metrics",
            LogicalName::ProcessingTemplateProcessor => "processing_template-processor",
        }
    }

    /// The `<category>/<artifact>` suffix of the stored object key.
    pub fn key_suffix(&self) -> &'static str {
        match self {
            LogicalName::ProcessingInitialization => "processing/initialization.json",
            LogicalName::ImagesMetadata => "images/metadata.json",
            LogicalName::ImagesReferenceBase64 => "images/reference-base64.base64",
            LogicalName::ImagesCheckingBase64 => "images/checking-base64.base64",
            LogicalName::PromptsSystem => "prompts/system-prompt.json",
            LogicalName::PromptsTurn1 => "prompts/turn1-prompt.json",
            LogicalName::PromptsTurn2 => "prompts/turn2-prompt.json",
            LogicalName::ResponsesTurn1Raw => "responses/turn1-raw-response.json",
            LogicalName::ResponsesTurn1Processed => "responses/turn1-processed-response.md",
            LogicalName::ResponsesTurn2Raw => "responses/turn2-raw-response.json",
            LogicalName::ResponsesTurn2Processed => "responses/turn2-processed-response.md",
            LogicalName::ConversationTurn1 => "conversation/turn1-conversation.json",
            LogicalName::ConversationTurn2 => "conversation/turn2-conversation.json",
            LogicalName::ProcessingLayoutMetadata => "processing/layout-metadata.json",
            LogicalName::ProcessingHistoricalContext => "processing/historical-context.json",
            LogicalName::ProcessingMetrics => "processing/metrics.json",
            LogicalName::ProcessingTemplateProcessor => "processing/template-processor.json",
        }
    }
}

impl fmt::Display for LogicalName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LogicalName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LogicalName::ALL
            .iter()
            .copied()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| format!("unknown logical name: {s}"))
    }
}

/// Key builder for a verification's artifact tree.
///
/// Every artifact of a verification lives under
/// `YYYY/MM/DD/<verificationId>/`, the date taken from the verification
/// timestamp. The suffix per artifact is fixed by [`LogicalName`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactKeys {
    verification_id: String,
    date_path: String,
}

impl ArtifactKeys {
    /// Create a key builder for the given verification.
    pub fn new(verification_id: impl Into<String>, verification_at: DateTime<Utc>) -> Self {
        Self {
            verification_id: verification_id.into(),
            date_path: format!(
                "{:04}/{:02}/{:02}",
                verification_at.year(),
                verification_at.month(),
                verification_at.day()
            ),
        }
    }

    /// The verification id this builder serves.
    pub fn verification_id(&self) -> &str {
        &self.verification_id
    }

    /// The `YYYY/MM/DD/<verificationId>` prefix shared by every key.
    pub fn prefix(&self) -> String {
        format!("{}/{}", self.date_path, self.verification_id)
    }

    /// The full object key for a logical artifact.
    pub fn key(&self, name: LogicalName) -> String {
        format!("{}/{}", self.prefix(), name.key_suffix())
    }
}
