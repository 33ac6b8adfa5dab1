//! The object-storage port.

use crate::context::{HistoricalContext, ImagesMetadata, LayoutMetadata, VerificationContext};
use crate::error::{ErrorCategory, WorkflowError};
use crate::reference::{ArtifactKeys, Reference};
use crate::turn::{ConversationRecord, ProcessingMetrics, TemplateProcessor, TurnId, TurnResponse};
use async_trait::async_trait;

/// Typed load/store access to the artifact store.
///
/// Loads take the reference out of the envelope's reference map; stores
/// take an [`ArtifactKeys`] builder so every object lands under the
/// verification's `YYYY/MM/DD/<verificationId>/` prefix and return the
/// reference written.
///
/// Guarantees required of implementations:
/// - a store call writes a complete object atomically; a partial write
///   must never be readable,
/// - load/store failures are classified STORAGE (retryable by default;
///   a missing object is not retryable),
/// - [`load_base64_image`](ArtifactStore::load_base64_image) validates
///   the decoded payload size against the configured maximum.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// Load the system prompt. The stored artifact is JSON: either a
    /// bare string or an object with a `content` field.
    async fn load_system_prompt(&self, reference: &Reference) -> Result<String, WorkflowError>;

    /// Load a base64-encoded image payload.
    async fn load_base64_image(&self, reference: &Reference) -> Result<String, WorkflowError>;

    /// Load the initialization record.
    async fn load_initialization(
        &self,
        reference: &Reference,
    ) -> Result<VerificationContext, WorkflowError>;

    /// Load the per-image storage metadata.
    async fn load_images_metadata(
        &self,
        reference: &Reference,
    ) -> Result<ImagesMetadata, WorkflowError>;

    /// Load planogram metadata (layout-vs-checking).
    async fn load_layout_metadata(
        &self,
        reference: &Reference,
    ) -> Result<LayoutMetadata, WorkflowError>;

    /// Load historical context (previous-vs-current).
    async fn load_historical_context(
        &self,
        reference: &Reference,
    ) -> Result<HistoricalContext, WorkflowError>;

    /// Load a stored turn record (e.g. the Turn-1 raw response).
    async fn load_turn_response(
        &self,
        reference: &Reference,
    ) -> Result<TurnResponse, WorkflowError>;

    /// Load a stored conversation transcript.
    async fn load_conversation(
        &self,
        reference: &Reference,
    ) -> Result<ConversationRecord, WorkflowError>;

    /// Load an arbitrary JSON artifact.
    async fn load_json(&self, reference: &Reference) -> Result<serde_json::Value, WorkflowError>;

    /// Store a rendered prompt.
    async fn store_prompt(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        text: &str,
    ) -> Result<Reference, WorkflowError>;

    /// Store the processed (markdown) response of a turn.
    async fn store_processed_markdown(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        markdown: &str,
    ) -> Result<Reference, WorkflowError>;

    /// Store the raw turn record.
    async fn store_raw_response(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        response: &TurnResponse,
    ) -> Result<Reference, WorkflowError>;

    /// Store the conversation transcript of a turn.
    async fn store_conversation(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        conversation: &ConversationRecord,
    ) -> Result<Reference, WorkflowError>;

    /// Store per-turn processing metrics.
    async fn store_processing_metrics(
        &self,
        keys: &ArtifactKeys,
        metrics: &ProcessingMetrics,
    ) -> Result<Reference, WorkflowError>;

    /// Store the template processor observability record.
    async fn store_template_processor(
        &self,
        keys: &ArtifactKeys,
        processor: &TemplateProcessor,
    ) -> Result<Reference, WorkflowError>;
}

/// Decoded length of a base64 payload, computed without decoding.
///
/// Ignores ASCII whitespace; counts trailing `=` padding.
pub fn decoded_base64_len(encoded: &str) -> u64 {
    let significant: Vec<u8> = encoded
        .bytes()
        .filter(|b| !b.is_ascii_whitespace())
        .collect();
    if significant.is_empty() {
        return 0;
    }
    let padding = significant.iter().rev().take_while(|b| **b == b'=').count() as u64;
    (significant.len() as u64 / 4) * 3 - padding
}

/// Validate a base64 image payload against the configured maximum
/// decoded size. Equal passes; one byte over fails.
pub fn validate_image_size(
    encoded: &str,
    max_decoded_bytes: u64,
    key: &str,
) -> Result<(), WorkflowError> {
    let decoded = decoded_base64_len(encoded);
    if decoded > max_decoded_bytes {
        return Err(WorkflowError::new(
            ErrorCategory::Storage,
            "IMAGE_TOO_LARGE",
            format!("decoded image is {decoded} bytes, maximum is {max_decoded_bytes}"),
        )
        .non_retryable()
        .with_operation("load_base64_image")
        .with_context("key", serde_json::json!(key))
        .with_suggestion("re-encode the image below the configured size limit"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decoded_len_counts_padding() {
        // "Man" -> "TWFu" (no padding), "Ma" -> "TWE=", "M" -> "TQ=="
        assert_eq!(decoded_base64_len("TWFu"), 3);
        assert_eq!(decoded_base64_len("TWE="), 2);
        assert_eq!(decoded_base64_len("TQ=="), 1);
        assert_eq!(decoded_base64_len(""), 0);
    }

    #[test]
    fn decoded_len_ignores_whitespace() {
        assert_eq!(decoded_base64_len("TW\nFu"), 3);
        assert_eq!(decoded_base64_len("  TQ==  "), 1);
    }

    #[test]
    fn size_at_limit_passes_one_over_fails() {
        // 3 decoded bytes.
        let encoded = "TWFu";
        assert!(validate_image_size(encoded, 3, "k").is_ok());
        let err = validate_image_size(encoded, 2, "k").unwrap_err();
        assert_eq!(err.code, "IMAGE_TOO_LARGE");
        assert_eq!(err.category, ErrorCategory::Storage);
        assert!(!err.retryable());
    }
}
