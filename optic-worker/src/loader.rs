//! Concurrent per-turn context loading.

use optic_protocol::{
    ArtifactStore, ConversationRecord, ErrorCategory, LogicalName, Reference, TurnId, TurnRequest,
    TurnResponse, WorkflowError,
};
use optic_retry::{RetryPolicy, with_retry};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Everything a turn needs before the model call.
#[derive(Debug, Clone)]
pub struct TurnContext {
    /// The system prompt.
    pub system_prompt: String,
    /// Base64 payload of the turn's image (reference image for Turn 1,
    /// checking image for Turn 2).
    pub image_base64: String,
    /// Image format token (`jpeg`, `png`, …).
    pub image_format: String,
    /// Object key the image was loaded from.
    pub image_key: String,
    /// Object key of the other image (used by the Turn-2 transcript).
    pub other_image_key: Option<String>,
    /// Format of the other image.
    pub other_image_format: Option<String>,
    /// The Turn-1 raw record, when referenced.
    pub turn1_response: Option<TurnResponse>,
    /// The Turn-1 conversation transcript, when referenced.
    pub turn1_conversation: Option<ConversationRecord>,
}

/// Loads the per-turn context concurrently with bounded retry per
/// operation.
///
/// The system-prompt and image loads run in parallel; the optional
/// Turn-1 transcript load runs independently alongside them. The first
/// failure wins: it is parked in a mutex-guarded write-once slot while
/// the outstanding operations finish their current attempt, then
/// returned.
pub struct ContextLoader {
    artifacts: Arc<dyn ArtifactStore>,
    cancel: CancellationToken,
}

/// Per-operation retry policy: 3 attempts, exponential backoff from
/// 100 ms, capped at 2 s.
fn load_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(100),
        max_delay: Duration::from_secs(2),
        max_attempts: 3,
    }
}

/// Write-once first-error slot shared by the loader tasks.
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<WorkflowError>>>);

impl ErrorSlot {
    fn record(&self, error: WorkflowError) {
        let mut slot = self.0.lock().expect("error slot poisoned");
        if slot.is_none() {
            *slot = Some(error);
        }
    }

    fn take(&self) -> Option<WorkflowError> {
        self.0.lock().expect("error slot poisoned").take()
    }
}

impl ContextLoader {
    /// Create a loader over the artifact store.
    pub fn new(artifacts: Arc<dyn ArtifactStore>, cancel: CancellationToken) -> Self {
        Self { artifacts, cancel }
    }

    /// Load the context for a turn. On success the system prompt and
    /// image are both non-empty and the image is within the configured
    /// size limit (enforced by the store).
    pub async fn load(&self, request: &TurnRequest) -> Result<TurnContext, WorkflowError> {
        let errors = ErrorSlot::default();
        let policy = load_policy();

        let prompt_ref = request
            .envelope
            .reference(LogicalName::PromptsSystem)
            .cloned();
        let image_task = self.image_task(request, policy, errors.clone());
        let prompt_task = async {
            let Some(reference) = prompt_ref else {
                errors.record(missing_ref(LogicalName::PromptsSystem));
                return None;
            };
            match with_retry("load_system_prompt", policy, &self.cancel, |_| {
                self.artifacts.load_system_prompt(&reference)
            })
            .await
            {
                Ok(prompt) => Some(prompt),
                Err(error) => {
                    errors.record(error.with_component("context_loader"));
                    None
                }
            }
        };
        let turn1_task = self.turn1_task(request, policy, errors.clone());

        let (system_prompt, image, turn1) = tokio::join!(prompt_task, image_task, turn1_task);

        if let Some(error) = errors.take() {
            return Err(error);
        }

        let system_prompt = system_prompt.unwrap_or_default();
        let (image_base64, image_format, image_key, other_image_key, other_image_format) =
            image.unwrap_or_default();
        if system_prompt.is_empty() || image_base64.is_empty() {
            return Err(WorkflowError::new(
                ErrorCategory::Storage,
                "EMPTY_CONTEXT",
                "context loading produced an empty system prompt or image",
            )
            .with_component("context_loader"));
        }

        let (turn1_response, turn1_conversation) = turn1.unwrap_or((None, None));
        Ok(TurnContext {
            system_prompt,
            image_base64,
            image_format,
            image_key,
            other_image_key,
            other_image_format,
            turn1_response,
            turn1_conversation,
        })
    }

    /// Resolve and load the turn's image. The explicit base64 reference
    /// wins; otherwise the location comes from the images-metadata
    /// artifact. Returns `(base64, format, key, other_key, other_format)`.
    async fn image_task(
        &self,
        request: &TurnRequest,
        policy: RetryPolicy,
        errors: ErrorSlot,
    ) -> Option<(String, String, String, Option<String>, Option<String>)> {
        let metadata_ref = match request.envelope.reference(LogicalName::ImagesMetadata) {
            Some(reference) => reference.clone(),
            None => {
                errors.record(missing_ref(LogicalName::ImagesMetadata));
                return None;
            }
        };
        let metadata = match with_retry("load_images_metadata", policy, &self.cancel, |_| {
            self.artifacts.load_images_metadata(&metadata_ref)
        })
        .await
        {
            Ok(metadata) => metadata,
            Err(error) => {
                errors.record(error.with_component("context_loader"));
                return None;
            }
        };

        let (own_meta, other_meta, own_name) = match request.turn_id {
            TurnId::Turn1 => (
                &metadata.reference_image,
                &metadata.checking_image,
                LogicalName::ImagesReferenceBase64,
            ),
            TurnId::Turn2 => (
                &metadata.checking_image,
                &metadata.reference_image,
                LogicalName::ImagesCheckingBase64,
            ),
        };
        let image_ref = request
            .envelope
            .reference(own_name)
            .cloned()
            .unwrap_or_else(|| {
                Reference::new(
                    &own_meta.storage_bucket,
                    &own_meta.storage_key,
                    own_meta.stored_size,
                )
            });

        match with_retry("load_base64_image", policy, &self.cancel, |_| {
            self.artifacts.load_base64_image(&image_ref)
        })
        .await
        {
            Ok(encoded) => Some((
                encoded,
                own_meta.image_format().to_string(),
                image_ref.key.clone(),
                Some(other_meta.storage_key.clone()),
                Some(other_meta.image_format().to_string()),
            )),
            Err(error) => {
                errors.record(error.with_component("context_loader"));
                None
            }
        }
    }

    /// Load the Turn-1 transcript when the request references one. A
    /// Turn-2 request without a Turn-1 reference is legal; the turn then
    /// runs on the Turn-2 context alone.
    async fn turn1_task(
        &self,
        request: &TurnRequest,
        policy: RetryPolicy,
        errors: ErrorSlot,
    ) -> Option<(Option<TurnResponse>, Option<ConversationRecord>)> {
        if request.turn_id != TurnId::Turn2 {
            return Some((None, None));
        }
        // A reference with an empty key counts as absent.
        let Some(raw_ref) = request
            .envelope
            .reference(LogicalName::ResponsesTurn1Raw)
            .filter(|reference| !reference.key.is_empty())
            .cloned()
        else {
            return Some((None, None));
        };

        let response = match with_retry("load_turn1_response", policy, &self.cancel, |_| {
            self.artifacts.load_turn_response(&raw_ref)
        })
        .await
        {
            Ok(response) => response,
            Err(error) => {
                errors.record(error.with_component("context_loader"));
                return None;
            }
        };

        let conversation = match request
            .envelope
            .reference(LogicalName::ConversationTurn1)
            .filter(|reference| !reference.key.is_empty())
            .cloned()
        {
            Some(conversation_ref) => {
                match with_retry("load_turn1_conversation", policy, &self.cancel, |_| {
                    self.artifacts.load_conversation(&conversation_ref)
                })
                .await
                {
                    Ok(conversation) => Some(conversation),
                    Err(error) => {
                        errors.record(error.with_component("context_loader"));
                        return None;
                    }
                }
            }
            None => None,
        };

        Some((Some(response), conversation))
    }
}

fn missing_ref(name: LogicalName) -> WorkflowError {
    WorkflowError::new(
        ErrorCategory::Validation,
        "MISSING_REF",
        format!("missing required reference {name}"),
    )
    .with_component("context_loader")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_slot_keeps_the_first_writer() {
        let slot = ErrorSlot::default();
        slot.record(WorkflowError::new(
            ErrorCategory::Storage,
            "FIRST",
            "first",
        ));
        slot.record(WorkflowError::new(
            ErrorCategory::Network,
            "SECOND",
            "second",
        ));
        let error = slot.take().unwrap();
        assert_eq!(error.code, "FIRST");
        assert!(slot.take().is_none());
    }

    #[test]
    fn load_policy_matches_the_contract() {
        let policy = load_policy();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.base_delay, Duration::from_millis(100));
        assert_eq!(policy.max_delay, Duration::from_secs(2));
    }
}
