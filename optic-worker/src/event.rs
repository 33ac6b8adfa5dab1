//! Inbound event transformation: orchestrator envelope → TurnRequest.

use optic_protocol::{
    ArtifactStore, Envelope, ErrorCategory, HistoricalContext, LogicalName, TurnId, TurnRequest,
    VerificationType, WorkflowConfig, WorkflowError,
};
use optic_retry::{RetryPolicy, with_retry};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Resolves an inbound envelope into a fully-bound [`TurnRequest`].
///
/// All input-shape questions are answered here, exactly once: legacy key
/// normalization, required-reference validation, verification-id
/// resolution, and layout/historical context reconciliation. Downstream
/// code sees one normalized request.
pub struct EventTransformer {
    config: Arc<WorkflowConfig>,
    artifacts: Arc<dyn ArtifactStore>,
    cancel: CancellationToken,
}

impl EventTransformer {
    /// Create a transformer.
    pub fn new(
        config: Arc<WorkflowConfig>,
        artifacts: Arc<dyn ArtifactStore>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            artifacts,
            cancel,
        }
    }

    /// Decode and transform a raw JSON event. Unknown logical names and
    /// malformed references are rejected here.
    pub async fn transform_value(
        &self,
        turn_id: TurnId,
        event: serde_json::Value,
    ) -> Result<TurnRequest, WorkflowError> {
        let envelope = Envelope::from_json(event).map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Validation,
                "INVALID_EVENT",
                format!("event does not decode as an envelope: {e}"),
            )
            .with_component("event_transformer")
        })?;
        self.transform(turn_id, envelope).await
    }

    /// Transform an already-decoded envelope.
    pub async fn transform(
        &self,
        turn_id: TurnId,
        mut envelope: Envelope,
    ) -> Result<TurnRequest, WorkflowError> {
        normalize_legacy_keys(&mut envelope);
        self.check_required_references(turn_id, &envelope)?;

        let init_ref = match envelope.reference(LogicalName::ProcessingInitialization) {
            Some(reference) => reference.clone(),
            None => {
                return Err(WorkflowError::new(
                    ErrorCategory::Validation,
                    "MISSING_REF",
                    "missing required reference processing_initialization",
                )
                .with_component("event_transformer"));
            }
        };

        let mut context = with_retry(
            "load_initialization",
            RetryPolicy::default(),
            &self.cancel,
            |_| self.artifacts.load_initialization(&init_ref),
        )
        .await
        .map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Storage,
                "REQUIRED_ARTIFACT_LOAD_FAILED",
                format!("initialization artifact could not be loaded: {e}"),
            )
            .with_component("event_transformer")
            .with_context("key", serde_json::json!(init_ref.key))
            .with_source(e)
        })?;

        // Verification-id precedence: artifact, then envelope, then a
        // prefixed substring of the initialization key.
        let resolved_id = [
            context.verification_id.trim(),
            envelope.verification_id.trim(),
        ]
        .into_iter()
        .find(|candidate| !candidate.is_empty())
        .map(str::to_string)
        .or_else(|| extract_id_from_key(&init_ref.key, &self.config.verification_id_prefix));
        let verification_id = resolved_id.ok_or_else(|| {
            WorkflowError::new(
                ErrorCategory::Validation,
                "MISSING_VERIFICATION_ID",
                "no verification id in the initialization artifact, the envelope, or the key",
            )
            .with_component("event_transformer")
        })?;
        context.verification_id = verification_id.clone();
        envelope.verification_id = verification_id;

        match context.verification_type {
            VerificationType::LayoutVsChecking => {
                self.reconcile_layout_fields(&mut context, &envelope).await?;
                context.validate()?;
            }
            VerificationType::PreviousVsCurrent => {
                self.fill_historical_context(&mut context, &envelope).await;
            }
        }

        Ok(TurnRequest {
            turn_id,
            context,
            envelope,
        })
    }

    fn check_required_references(
        &self,
        turn_id: TurnId,
        envelope: &Envelope,
    ) -> Result<(), WorkflowError> {
        for name in [
            LogicalName::ProcessingInitialization,
            LogicalName::ImagesMetadata,
        ] {
            if envelope.reference(name).is_none() {
                return Err(WorkflowError::new(
                    ErrorCategory::Validation,
                    "MISSING_REF",
                    format!("missing required reference {name}"),
                )
                .with_component("event_transformer"));
            }
        }
        // A Turn-2 request without Turn-1 references is legal: the turn
        // then runs on its own context and the transcript is not
        // replayed.
        if turn_id == TurnId::Turn2
            && envelope.reference(LogicalName::ResponsesTurn1Raw).is_none()
        {
            tracing::warn!(
                verification_id = %envelope.verification_id,
                "turn 2 request carries no turn 1 response reference"
            );
        }
        Ok(())
    }

    /// Layout fields from the initialization artifact win; zero/empty
    /// values fall back to the envelope summary and finally to the
    /// layout-metadata artifact.
    async fn reconcile_layout_fields(
        &self,
        context: &mut optic_protocol::VerificationContext,
        envelope: &Envelope,
    ) -> Result<(), WorkflowError> {
        if context.layout_id.unwrap_or(0) <= 0 {
            if let Some(id) = envelope.summary.get("layoutId").and_then(|v| v.as_i64()) {
                context.layout_id = Some(id);
            }
        }
        if context.layout_prefix.as_deref().unwrap_or("").is_empty() {
            if let Some(prefix) = envelope.summary.get("layoutPrefix").and_then(|v| v.as_str()) {
                if !prefix.is_empty() {
                    context.layout_prefix = Some(prefix.to_string());
                }
            }
        }

        let needs_fill = context.layout_id.unwrap_or(0) <= 0
            || context.layout_prefix.as_deref().unwrap_or("").is_empty()
            || context.layout_metadata.is_none();
        if !needs_fill {
            return Ok(());
        }
        let Some(layout_ref) = envelope
            .reference(LogicalName::ProcessingLayoutMetadata)
            .cloned()
        else {
            // Without the artifact, whatever is bound so far must stand
            // on its own; validate() decides.
            return Ok(());
        };

        match with_retry(
            "load_layout_metadata",
            RetryPolicy::default(),
            &self.cancel,
            |_| self.artifacts.load_layout_metadata(&layout_ref),
        )
        .await
        {
            Ok(layout) => {
                if context.layout_id.unwrap_or(0) <= 0 {
                    context.layout_id = Some(layout.layout_id);
                }
                if context.layout_prefix.as_deref().unwrap_or("").is_empty() {
                    context.layout_prefix = Some(layout.layout_prefix.clone());
                }
                if context.vending_machine_id.is_none() {
                    context.vending_machine_id = Some(layout.vending_machine_id.clone());
                }
                context.layout_metadata = Some(layout);
                Ok(())
            }
            Err(e) => Err(WorkflowError::new(
                ErrorCategory::Storage,
                "REQUIRED_ARTIFACT_LOAD_FAILED",
                format!("layout metadata could not be loaded: {e}"),
            )
            .with_component("event_transformer")
            .with_source(e)),
        }
    }

    /// Historical context is best-effort: a referenced artifact is
    /// loaded, an absent one is synthesized empty with a warning.
    async fn fill_historical_context(
        &self,
        context: &mut optic_protocol::VerificationContext,
        envelope: &Envelope,
    ) {
        if context.historical_context.is_some() {
            return;
        }
        if let Some(historical_ref) = envelope
            .reference(LogicalName::ProcessingHistoricalContext)
            .cloned()
        {
            match with_retry(
                "load_historical_context",
                RetryPolicy::default(),
                &self.cancel,
                |_| self.artifacts.load_historical_context(&historical_ref),
            )
            .await
            {
                Ok(historical) => {
                    context.historical_context = Some(historical);
                    return;
                }
                Err(e) => {
                    tracing::warn!(
                        verification_id = %context.verification_id,
                        error = %e,
                        "historical context artifact unreadable, continuing with an empty one"
                    );
                }
            }
        } else {
            tracing::warn!(
                verification_id = %context.verification_id,
                "no historical context referenced, continuing with an empty one"
            );
        }
        context.historical_context = Some(HistoricalContext::empty());
    }
}

/// Rewrite legacy `…/initialization.json` keys (written before the
/// `processing/` subtree existed) to their current location.
fn normalize_legacy_keys(envelope: &mut Envelope) {
    if let Some(reference) = envelope
        .references
        .get_mut(&LogicalName::ProcessingInitialization)
    {
        if reference.key.ends_with("/initialization.json")
            && !reference.key.ends_with("/processing/initialization.json")
        {
            let normalized = format!(
                "{}/processing/initialization.json",
                reference.key.trim_end_matches("/initialization.json")
            );
            tracing::debug!(from = %reference.key, to = %normalized, "normalized legacy key");
            reference.key = normalized;
        }
    }
}

/// A substring of the key starting at the configured id prefix, up to
/// the next path separator.
fn extract_id_from_key(key: &str, prefix: &str) -> Option<String> {
    let start = key.find(prefix)?;
    let tail = &key[start..];
    let end = tail.find('/').unwrap_or(tail.len());
    let id = &tail[..end];
    (id.len() > prefix.len()).then(|| id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use optic_protocol::Reference;

    #[test]
    fn legacy_keys_are_normalized() {
        let mut envelope = Envelope::new(
            "verif-1",
            optic_protocol::VerificationStatus::Turn1Processed,
        );
        envelope.set_reference(
            LogicalName::ProcessingInitialization,
            Reference::new("artifacts", "2025/04/01/verif-1/initialization.json", 100),
        );
        normalize_legacy_keys(&mut envelope);
        assert_eq!(
            envelope
                .reference(LogicalName::ProcessingInitialization)
                .unwrap()
                .key,
            "2025/04/01/verif-1/processing/initialization.json"
        );
    }

    #[test]
    fn normalized_keys_stay_put() {
        let mut envelope = Envelope::new(
            "verif-1",
            optic_protocol::VerificationStatus::Turn1Processed,
        );
        let key = "2025/04/01/verif-1/processing/initialization.json";
        envelope.set_reference(
            LogicalName::ProcessingInitialization,
            Reference::new("artifacts", key, 100),
        );
        normalize_legacy_keys(&mut envelope);
        assert_eq!(
            envelope
                .reference(LogicalName::ProcessingInitialization)
                .unwrap()
                .key,
            key
        );
    }

    #[test]
    fn id_extraction_stops_at_the_separator() {
        assert_eq!(
            extract_id_from_key(
                "2025/04/01/verif-20250401123000/processing/initialization.json",
                "verif-"
            ),
            Some("verif-20250401123000".to_string())
        );
        assert_eq!(
            extract_id_from_key("2025/04/01/other/initialization.json", "verif-"),
            None
        );
        // A bare prefix with no tail is not an id.
        assert_eq!(extract_id_from_key("a/verif-/b", "verif-"), None);
    }
}
