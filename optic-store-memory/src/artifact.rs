//! In-memory artifact store.

use async_trait::async_trait;
use optic_protocol::{
    ArtifactKeys, ArtifactStore, ConversationRecord, ErrorCategory, HistoricalContext,
    ImagesMetadata, LayoutMetadata, LogicalName, ProcessingMetrics, Reference, TemplateProcessor,
    TurnId, TurnResponse, VerificationContext, WorkflowError, validate_image_size,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Operations a [`MemoryArtifactStore`] can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactOp {
    /// Any load operation.
    Load,
    /// [`ArtifactStore::store_prompt`].
    StorePrompt,
    /// [`ArtifactStore::store_processed_markdown`].
    StoreMarkdown,
    /// [`ArtifactStore::store_raw_response`].
    StoreRawResponse,
    /// [`ArtifactStore::store_conversation`].
    StoreConversation,
    /// [`ArtifactStore::store_processing_metrics`].
    StoreMetrics,
    /// [`ArtifactStore::store_template_processor`].
    StoreTemplateProcessor,
}

/// In-memory artifact store backed by a `HashMap` behind a `RwLock`.
///
/// Objects are stored as text (JSON, markdown, or base64). Failure
/// injection: [`fail_next`](MemoryArtifactStore::fail_next) makes the
/// next *n* occurrences of an operation return a transient STORAGE
/// error.
pub struct MemoryArtifactStore {
    bucket: String,
    max_image_size_bytes: u64,
    objects: RwLock<HashMap<String, String>>,
    failures: RwLock<HashMap<ArtifactOp, u32>>,
}

fn composite_key(bucket: &str, key: &str) -> String {
    format!("{bucket}\0{key}")
}

impl MemoryArtifactStore {
    /// Create a store serving the given bucket.
    pub fn new(bucket: impl Into<String>, max_image_size_bytes: u64) -> Self {
        Self {
            bucket: bucket.into(),
            max_image_size_bytes,
            objects: RwLock::new(HashMap::new()),
            failures: RwLock::new(HashMap::new()),
        }
    }

    /// The bucket this store serves.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Script the next `times` occurrences of `op` to fail with a
    /// transient STORAGE error.
    pub async fn fail_next(&self, op: ArtifactOp, times: u32) {
        self.failures.write().await.insert(op, times);
    }

    /// Seed a text object; returns the reference written.
    pub async fn put_text(&self, key: impl Into<String>, content: impl Into<String>) -> Reference {
        let key = key.into();
        let content = content.into();
        let reference = Reference::new(&self.bucket, &key, content.len() as u64);
        self.objects
            .write()
            .await
            .insert(composite_key(&self.bucket, &key), content);
        reference
    }

    /// Seed a JSON object; returns the reference written.
    pub async fn put_json<T: Serialize>(&self, key: impl Into<String>, value: &T) -> Reference {
        let content = serde_json::to_string_pretty(value).expect("serializable artifact");
        self.put_text(key, content).await
    }

    /// Read a raw object back, if present.
    pub async fn get(&self, key: &str) -> Option<String> {
        self.objects
            .read()
            .await
            .get(&composite_key(&self.bucket, key))
            .cloned()
    }

    /// Whether an object exists.
    pub async fn contains(&self, key: &str) -> bool {
        self.objects
            .read()
            .await
            .contains_key(&composite_key(&self.bucket, key))
    }

    async fn consume_failure(&self, op: ArtifactOp) -> Result<(), WorkflowError> {
        let mut failures = self.failures.write().await;
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WorkflowError::new(
                    ErrorCategory::Storage,
                    "ARTIFACT_IO_FAILED",
                    format!("scripted transient failure for {op:?}"),
                )
                .with_component("memory_artifact_store"));
            }
        }
        Ok(())
    }

    async fn read_text(&self, reference: &Reference) -> Result<String, WorkflowError> {
        self.consume_failure(ArtifactOp::Load).await?;
        self.objects
            .read()
            .await
            .get(&composite_key(&reference.bucket, &reference.key))
            .cloned()
            .ok_or_else(|| {
                WorkflowError::new(
                    ErrorCategory::Storage,
                    "ARTIFACT_NOT_FOUND",
                    format!("no object at {reference}"),
                )
                .non_retryable()
                .with_component("memory_artifact_store")
            })
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
            .with_component("memory_artifact_store")
        })
    }

    async fn write_json<T: Serialize>(
        &self,
        op: ArtifactOp,
        key: String,
        value: &T,
    ) -> Result<Reference, WorkflowError> {
        self.consume_failure(op).await?;
        let content = serde_json::to_string_pretty(value).map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Storage,
                "ARTIFACT_ENCODE_FAILED",
                e.to_string(),
            )
            .non_retryable()
        })?;
        Ok(self.put_text(key, content).await)
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
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
        self.write_json(
            ArtifactOp::StorePrompt,
            keys.key(name),
            &serde_json::json!({ "content": text }),
        )
        .await
    }

    async fn store_processed_markdown(
        &self,
        keys: &ArtifactKeys,
        turn: TurnId,
        markdown: &str,
    ) -> Result<Reference, WorkflowError> {
        self.consume_failure(ArtifactOp::StoreMarkdown).await?;
        let name = match turn {
            TurnId::Turn1 => LogicalName::ResponsesTurn1Processed,
            TurnId::Turn2 => LogicalName::ResponsesTurn2Processed,
        };
        Ok(self.put_text(keys.key(name), markdown).await)
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
        self.write_json(ArtifactOp::StoreRawResponse, keys.key(name), response)
            .await
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
        self.write_json(ArtifactOp::StoreConversation, keys.key(name), conversation)
            .await
    }

    async fn store_processing_metrics(
        &self,
        keys: &ArtifactKeys,
        metrics: &ProcessingMetrics,
    ) -> Result<Reference, WorkflowError> {
        self.write_json(
            ArtifactOp::StoreMetrics,
            keys.key(LogicalName::ProcessingMetrics),
            metrics,
        )
        .await
    }

    async fn store_template_processor(
        &self,
        keys: &ArtifactKeys,
        processor: &TemplateProcessor,
    ) -> Result<Reference, WorkflowError> {
        self.write_json(
            ArtifactOp::StoreTemplateProcessor,
            keys.key(LogicalName::ProcessingTemplateProcessor),
            processor,
        )
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
    async fn system_prompt_accepts_string_and_object() {
        let store = MemoryArtifactStore::new("artifacts", 1024);
        let r1 = store.put_json("a.json", &serde_json::json!("bare prompt")).await;
        let r2 = store
            .put_json("b.json", &serde_json::json!({ "content": "wrapped prompt" }))
            .await;
        assert_eq!(store.load_system_prompt(&r1).await.unwrap(), "bare prompt");
        assert_eq!(
            store.load_system_prompt(&r2).await.unwrap(),
            "wrapped prompt"
        );
    }

    #[tokio::test]
    async fn missing_artifact_is_not_retryable() {
        let store = MemoryArtifactStore::new("artifacts", 1024);
        let reference = Reference::new("artifacts", "nope.json", 0);
        let err = store.load_json(&reference).await.unwrap_err();
        assert_eq!(err.code, "ARTIFACT_NOT_FOUND");
        assert!(!err.retryable());
    }

    #[tokio::test]
    async fn image_size_is_validated() {
        let store = MemoryArtifactStore::new("artifacts", 2);
        // "TWFu" decodes to 3 bytes, one over the limit.
        let reference = store.put_text("img.base64", "TWFu").await;
        let err = store.load_base64_image(&reference).await.unwrap_err();
        assert_eq!(err.code, "IMAGE_TOO_LARGE");

        let roomy = MemoryArtifactStore::new("artifacts", 3);
        let reference = roomy.put_text("img.base64", "TWFu").await;
        assert_eq!(roomy.load_base64_image(&reference).await.unwrap(), "TWFu");
    }

    #[tokio::test]
    async fn store_prompt_lands_under_the_layout_key() {
        let store = MemoryArtifactStore::new("artifacts", 1024);
        let reference = store
            .store_prompt(&keys(), TurnId::Turn2, "compare the images")
            .await
            .unwrap();
        assert_eq!(
            reference.key,
            "2025/04/01/verif-20250401123000/prompts/turn2-prompt.json"
        );
        assert!(store.contains(&reference.key).await);
    }

    #[tokio::test]
    async fn injected_failures_are_transient() {
        let store = MemoryArtifactStore::new("artifacts", 1024);
        store.fail_next(ArtifactOp::StoreMarkdown, 1).await;
        let err = store
            .store_processed_markdown(&keys(), TurnId::Turn2, "# Report")
            .await
            .unwrap_err();
        assert_eq!(err.code, "ARTIFACT_IO_FAILED");
        assert!(err.retryable());
        // The next attempt succeeds.
        store
            .store_processed_markdown(&keys(), TurnId::Turn2, "# Report")
            .await
            .unwrap();
    }
}
