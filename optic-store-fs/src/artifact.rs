//! Filesystem artifact store.

use crate::{io_error, validate_key, write_atomic};
use async_trait::async_trait;
use optic_protocol::{
    ArtifactKeys, ArtifactStore, ConversationRecord, ErrorCategory, HistoricalContext,
    ImagesMetadata, LayoutMetadata, LogicalName, ProcessingMetrics, Reference, TemplateProcessor,
    TurnId, TurnResponse, VerificationContext, WorkflowError, validate_image_size,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Filesystem-backed artifact store.
///
/// Directory layout:
/// ```text
/// root/
///   <bucket>/
///     YYYY/MM/DD/<verificationId>/<category>/<artifact>
/// ```
pub struct FsArtifactStore {
    root: PathBuf,
    bucket: String,
    max_image_size_bytes: u64,
}

impl FsArtifactStore {
    /// Create a store rooted at the given directory, serving one bucket.
    ///
    /// Directories are created lazily on first write.
    pub fn new(root: &Path, bucket: impl Into<String>, max_image_size_bytes: u64) -> Self {
        Self {
            root: root.to_path_buf(),
            bucket: bucket.into(),
            max_image_size_bytes,
        }
    }

    fn object_path(&self, reference: &Reference) -> Result<PathBuf, WorkflowError> {
        validate_key(&reference.key)?;
        Ok(self.root.join(&reference.bucket).join(&reference.key))
    }

    async fn read_text(&self, reference: &Reference) -> Result<String, WorkflowError> {
        let path = self.object_path(reference)?;
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => Ok(contents),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(WorkflowError::new(
                ErrorCategory::Storage,
                "ARTIFACT_NOT_FOUND",
                format!("no object at {reference}"),
            )
            .non_retryable()
            .with_component("fs_artifact_store")),
            Err(e) => Err(io_error("read", &path, e).with_component("fs_artifact_store")),
        }
    }

    async fn read_json<T: DeserializeOwned>(
        &self,
        reference: &Reference,
    ) -> Result<T, WorkflowError> {
        let text = self.read_text(reference).await?;
        serde_json::from_str(&text).map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Storage,
                "ARTIFACT_DECODE_FAILED",
                format!("artifact at {reference} is not valid: {e}"),
            )
            .non_retryable()
            .with_component("fs_artifact_store")
        })
    }

    async fn write_text(&self, key: String, content: &str) -> Result<Reference, WorkflowError> {
        validate_key(&key)?;
        let path = self.root.join(&self.bucket).join(&key);
        write_atomic(&path, content).await?;
        tracing::debug!(bucket = %self.bucket, key = %key, size = content.len(), "stored artifact");
        Ok(Reference::new(&self.bucket, key, content.len() as u64))
    }

    async fn write_json<T: Serialize>(
        &self,
        key: String,
        value: &T,
    ) -> Result<Reference, WorkflowError> {
        let content = serde_json::to_string_pretty(value).map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Storage,
                "ARTIFACT_ENCODE_FAILED",
                e.to_string(),
            )
            .non_retryable()
        })?;
        self.write_text(key, &content).await
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn load_system_prompt(&self, reference: &Reference) -> Result<String, WorkflowError> {
        let value: serde_json::Value = self.read_json(reference).await?;
        match value {
            serde_json::Value::String(s) => Ok(s),
            serde_json::Value::Object(map) => map
                .get("content")
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    WorkflowError::new(
                        ErrorCategory::Storage,
                        "ARTIFACT_DECODE_FAILED",
                        format!("system prompt at {reference} has no content field"),
                    )
                    .non_retryable()
                }),
            _ => Err(WorkflowError::new(
                ErrorCategory::Storage,
                "ARTIFACT_DECODE_FAILED",
                format!("system prompt at {reference} is neither string nor object"),
            )
            .non_retryable()),
        }
    }

    async fn load_base64_image(&self, reference: &Reference) -> Result<String, WorkflowError> {
        let encoded = self.read_text(reference).await?;
        validate_image_size(&encoded, self.max_image_size_bytes, &reference.key)?;
        Ok(encoded)
    }

    async fn load_initialization(
        &self,
        reference: &Reference,
    ) -> Result<VerificationContext, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_images_metadata(
        &self,
        reference: &Reference,
    ) -> Result<ImagesMetadata, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_layout_metadata(
        &self,
        reference: &Reference,
    ) -> Result<LayoutMetadata, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_historical_context(
        &self,
        reference: &Reference,
    ) -> Result<HistoricalContext, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_turn_response(
        &self,
        reference: &Reference,
    ) -> Result<TurnResponse, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_conversation(
        &self,
        reference: &Reference,
    ) -> Result<ConversationRecord, WorkflowError> {
        self.read_json(reference).await
    }

    async fn load_json(&self, reference: &Reference) -> Result<serde_json::Value, WorkflowError> {
        self.read_json(reference).await
    }

    async fn store_prompt(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        text: &str,
    ) -> Result<Reference, WorkflowError> {
        let name = match turn {
            TurnId::Turn1 => LogicalName::PromptsTurn1,
            TurnId::Turn2 => LogicalName::PromptsTurn2,
        };
        self.write_json(keys.key(name), &serde_json::json!({ "content": text }))
            .await
    }

    async fn store_processed_markdown(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        markdown: &str,
    ) -> Result<Reference, WorkflowError> {
        let name = match turn {
            TurnId::Turn1 => LogicalName::ResponsesTurn1Processed,
            TurnId::Turn2 => LogicalName::ResponsesTurn2Processed,
        };
        self.write_text(keys.key(name), markdown).await
    }

    async fn store_raw_response(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        response: &TurnResponse,
    ) -> Result<Reference, WorkflowError> {
        let name = match turn {
            TurnId::Turn1 => LogicalName::ResponsesTurn1Raw,
            TurnId::Turn2 => LogicalName::ResponsesTurn2Raw,
        };
        self.write_json(keys.key(name), response).await
    }

    async fn store_conversation(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        conversation: &ConversationRecord,
    ) -> Result<Reference, WorkflowError> {
        let name = match turn {
            TurnId::Turn1 => LogicalName::ConversationTurn1,
            TurnId::Turn2 => LogicalName::ConversationTurn2,
        };
        self.write_json(keys.key(name), conversation).await
    }

    async fn store_processing_metrics(
        &self,
        keys: &ArtifactKeys,
        metrics: &ProcessingMetrics,
    ) -> Result<Reference, WorkflowError> {
        self.write_json(keys.key(LogicalName::ProcessingMetrics), metrics)
            .await
    }

    async fn store_template_processor(
        &self,
        keys: &ArtifactKeys,
        processor: &TemplateProcessor,
    ) -> Result<Reference, WorkflowError> {
        self.write_json(keys.key(LogicalName::ProcessingTemplateProcessor), processor)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn keys() -> ArtifactKeys {
        ArtifactKeys::new(
            "verif-20250401123000",
            Utc.with_ymd_and_hms(2025, 4, 1, 12, 30, 0).unwrap(),
        )
    }

    #[tokio::test]
    async fn store_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "artifacts", 1 << 20);
        let reference = store
            .store_processed_markdown(&keys(), TurnId::Turn2, "# Comparison Report\n")
            .await
            .unwrap();
        assert_eq!(
            reference.key,
            "2025/04/01/verif-20250401123000/responses/turn2-processed-response.md"
        );
        let text = store.read_text(&reference).await.unwrap();
        assert_eq!(text, "# Comparison Report\n");
    }

    #[tokio::test]
    async fn missing_object_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "artifacts", 1 << 20);
        let reference = Reference::new("artifacts", "2025/04/01/verif-x/images/metadata.json", 0);
        let err = store.load_json(&reference).await.unwrap_err();
        assert_eq!(err.code, "ARTIFACT_NOT_FOUND");
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn prompt_is_wrapped_in_json() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "artifacts", 1 << 20);
        let reference = store
            .store_prompt(&keys(), TurnId::Turn1, "analyze the reference image")
            .await
            .unwrap();
        let value = store.load_json(&reference).await.unwrap();
        assert_eq!(value["content"], "analyze the reference image");
        // The prompt artifact doubles as a system-prompt-shaped object.
        assert_eq!(
            store.load_system_prompt(&reference).await.unwrap(),
            "analyze the reference image"
        );
    }

    #[tokio::test]
    async fn oversized_image_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "artifacts", 2);
        let reference = store.write_text("img.base64".into(), "TWFu").await.unwrap();
        let err = store.load_base64_image(&reference).await.unwrap_err();
        assert_eq!(err.code, "IMAGE_TOO_LARGE");
    }

    #[tokio::test]
    async fn traversal_keys_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsArtifactStore::new(dir.path(), "artifacts", 1 << 20);
        let reference = Reference::new("artifacts", "../outside.json", 0);
        let err = store.load_json(&reference).await.unwrap_err();
        assert_eq!(err.code, "INVALID_ARTIFACT_KEY");
    }
}
