//! The per-turn pipeline: load → render → invoke → parse → reconcile →
//! persist → update metadata.

use crate::conversation::{ImageBlock, build_turn1_conversation, build_turn2_conversation};
use crate::interpret::interpret;
use crate::loader::{ContextLoader, TurnContext};
use crate::persist::persist_failure;
use crate::prompt::prompt_variables;
use optic_markdown::{extract_comparison_markdown, parse_turn2_markdown};
use optic_protocol::{
    AnalysisStage, ArtifactKeys, ArtifactStore, Discrepancy, LogicalName, MetaStore, ModelClient,
    ModelOutput, ModelResponse, ParsedTurn2, ProcessingMetrics, Reference, StatusHistoryEntry,
    TurnId, TurnRequest, TurnResponse, VerificationOutcome, VerificationStatus, VerificationType,
    WorkflowConfig, WorkflowError,
};
use optic_retry::{RetryPolicy, with_retry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// References to the artifacts a turn wrote. Absent references mean the
/// corresponding store step failed non-fatally (or did not run).
#[derive(Debug, Clone, Default)]
pub struct TurnArtifactRefs {
    /// The rendered prompt.
    pub prompt: Option<Reference>,
    /// The raw turn record.
    pub raw: Option<Reference>,
    /// The processed markdown.
    pub processed: Option<Reference>,
    /// The conversation transcript.
    pub conversation: Option<Reference>,
    /// The processing metrics.
    pub metrics: Option<Reference>,
    /// The template processor record.
    pub template_processor: Option<Reference>,
}

/// Success/degradation flags reported in the outbound summary.
#[derive(Debug, Clone, Copy)]
pub struct TurnFlags {
    /// Whether every metadata-store update succeeded.
    pub dynamodb_updated: bool,
    /// Whether the comparison itself completed.
    pub comparison_completed: bool,
    /// Whether the conversation artifact was stored.
    pub conversation_completed: bool,
    /// Whether all required artifact stores (raw, conversation)
    /// succeeded.
    pub s3_storage_completed: bool,
}

/// Everything a completed turn produced.
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The raw turn record.
    pub response: TurnResponse,
    /// The final outcome after business rules (Turn 2 only).
    pub final_outcome: Option<VerificationOutcome>,
    /// The refined comparison summary (Turn 2 only).
    pub comparison_summary: Option<String>,
    /// Discrepancies of the final outcome (Turn 2 only).
    pub discrepancies: Vec<Discrepancy>,
    /// References to the stored artifacts.
    pub refs: TurnArtifactRefs,
    /// Degradation flags for the summary.
    pub flags: TurnFlags,
    /// Timing and usage metrics.
    pub metrics: ProcessingMetrics,
}

/// Drives one turn through the fifteen-step pipeline. Turn 1 runs the
/// documented subset (no comparison parsing, no business rules).
pub struct TurnExecutor {
    config: Arc<WorkflowConfig>,
    artifacts: Arc<dyn ArtifactStore>,
    meta: Arc<dyn MetaStore>,
    model: Arc<dyn ModelClient>,
    cancel: CancellationToken,
}

impl TurnExecutor {
    /// Create an executor over the three ports.
    pub fn new(
        config: Arc<WorkflowConfig>,
        artifacts: Arc<dyn ArtifactStore>,
        meta: Arc<dyn MetaStore>,
        model: Arc<dyn ModelClient>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            config,
            artifacts,
            meta,
            model,
            cancel,
        }
    }

    /// Execute one turn.
    pub async fn process_turn(&self, request: &TurnRequest) -> Result<TurnOutcome, WorkflowError> {
        let started_at = chrono::Utc::now();
        let turn_id = request.turn_id;
        let context = &request.context;
        let keys = ArtifactKeys::new(&context.verification_id, context.verification_at);

        self.record_status(request, status_for(turn_id, Sub::Started), "turn_started")
            .await;

        // Steps 1–2: concurrent context load (system prompt, image, and
        // the Turn-1 transcript when referenced).
        let loader = ContextLoader::new(self.artifacts.clone(), self.cancel.clone());
        let turn_context = match loader.load(request).await {
            Ok(turn_context) => turn_context,
            Err(error) => {
                let error = error.with_verification_id(context.verification_id.clone());
                self.fail(request, "context_loading", &error).await;
                return Err(error);
            }
        };
        self.record_status(
            request,
            status_for(turn_id, Sub::ContextLoaded),
            "context_loading",
        )
        .await;

        // Step 3: refresh layout metadata when an artifact is
        // referenced. Failure is a warning; the embedded copy stands.
        let mut verification_context = context.clone();
        if verification_context.verification_type == VerificationType::LayoutVsChecking {
            if let Some(layout_ref) = request
                .envelope
                .reference(LogicalName::ProcessingLayoutMetadata)
                .cloned()
            {
                match with_retry(
                    "load_layout_metadata",
                    RetryPolicy::default(),
                    &self.cancel,
                    |_| self.artifacts.load_layout_metadata(&layout_ref),
                )
                .await
                {
                    Ok(layout) => verification_context.layout_metadata = Some(layout),
                    Err(error) => tracing::warn!(
                        verification_id = %verification_context.verification_id,
                        %error,
                        "layout metadata unreadable, continuing with embedded data"
                    ),
                }
            }
        }

        // Step 4: render the prompt; persist the processor record and
        // the rendered text (both non-fatal).
        let variables = prompt_variables(
            &verification_context,
            turn_id,
            turn_context.turn1_response.as_ref(),
        );
        let rendered = match optic_templates::render_for(
            verification_context.verification_type,
            turn_id,
            &variables,
        ) {
            Ok(rendered) => rendered,
            Err(error) => {
                let error = WorkflowError::from(error)
                    .with_verification_id(verification_context.verification_id.clone());
                self.fail(request, "prompt_rendering", &error).await;
                return Err(error);
            }
        };
        let mut refs = TurnArtifactRefs::default();
        match self
            .artifacts
            .store_template_processor(&keys, &rendered.processor)
            .await
        {
            Ok(reference) => refs.template_processor = Some(reference),
            Err(error) => tracing::warn!(%error, "template processor not stored"),
        }
        match self.artifacts.store_prompt(&keys, turn_id, &rendered.text).await {
            Ok(reference) => refs.prompt = Some(reference),
            Err(error) => tracing::warn!(%error, "rendered prompt not stored"),
        }
        self.record_status(
            request,
            status_for(turn_id, Sub::PromptPrepared),
            "prompt_rendering",
        )
        .await;

        // Step 5: invoke the model. Retries follow each error's own
        // classification; nothing beyond it.
        self.record_status(
            request,
            status_for(turn_id, Sub::BedrockInvoked),
            "model_invocation",
        )
        .await;
        let prior = prior_messages(&turn_context);
        let model_response = match with_retry(
            "model_invocation",
            RetryPolicy::with_attempts(5),
            &self.cancel,
            |attempt| {
                if attempt > 1 {
                    tracing::debug!(attempt, "retrying model invocation");
                }
                self.invoke_model(turn_id, &turn_context, &rendered.text, &prior)
            },
        )
        .await
        {
            Ok(response) => response,
            Err(error) => {
                let error = error.with_verification_id(verification_context.verification_id.clone());
                self.fail(request, "model_invocation", &error).await;
                return Err(error);
            }
        };
        self.record_status(
            request,
            status_for(turn_id, Sub::BedrockCompleted),
            "model_invocation",
        )
        .await;

        // Step 6: the raw turn record.
        let turn_response = build_turn_record(turn_id, &turn_context, &rendered.text, &model_response);
        self.record_status(
            request,
            status_for(turn_id, Sub::ResponseProcessing),
            "response_processing",
        )
        .await;

        // Step 7: extract the report markdown. Turn 1 stores its full
        // analysis; Turn 2 requires the comparison section.
        let processed_markdown = match turn_id {
            TurnId::Turn1 => model_response.content.clone(),
            TurnId::Turn2 => match extract_comparison_markdown(&model_response.content) {
                Ok(markdown) => markdown,
                Err(error) => {
                    let error = WorkflowError::from(error)
                        .with_verification_id(verification_context.verification_id.clone());
                    self.fail(request, "response_parsing", &error).await;
                    return Err(error);
                }
            },
        };

        // Step 8: store the processed markdown (non-fatal).
        match self
            .artifacts
            .store_processed_markdown(&keys, turn_id, &processed_markdown)
            .await
        {
            Ok(reference) => refs.processed = Some(reference),
            Err(error) => tracing::warn!(%error, "processed markdown not stored"),
        }

        // Step 9: rebuild and store the conversation transcript.
        let conversation = self.build_conversation(
            turn_id,
            &verification_context,
            &turn_context,
            &rendered.text,
            &model_response,
        );
        let conversation_completed = match self
            .artifacts
            .store_conversation(&keys, turn_id, &conversation)
            .await
        {
            Ok(reference) => {
                refs.conversation = Some(reference);
                true
            }
            Err(error) => {
                tracing::warn!(%error, "conversation not stored");
                false
            }
        };

        // Steps 10–11: structured parsing and business rules (Turn 2).
        let (parsed, final_outcome, comparison_summary) = match turn_id {
            TurnId::Turn1 => (None, None, None),
            TurnId::Turn2 => {
                let parsed = match parse_turn2_markdown(&model_response.content) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        let error = WorkflowError::from(error)
                            .with_verification_id(verification_context.verification_id.clone());
                        self.fail(request, "structured_parsing", &error).await;
                        return Err(error);
                    }
                };
                let interpretation =
                    match interpret(Some(&parsed), self.config.discrepancy_threshold) {
                        Ok(interpretation) => interpretation,
                        Err(error) => {
                            let error = error
                                .with_verification_id(verification_context.verification_id.clone());
                            self.fail(request, "discrepancy_interpretation", &error).await;
                            return Err(error);
                        }
                    };
                if interpretation.escalated {
                    tracing::debug!(
                        outcome = %interpretation.final_outcome,
                        "business rules escalated the parsed outcome"
                    );
                }
                (
                    Some(parsed),
                    Some(interpretation.final_outcome),
                    Some(interpretation.comparison_summary),
                )
            }
        };

        // Step 12: store the raw turn record.
        match self
            .artifacts
            .store_raw_response(&keys, turn_id, &turn_response)
            .await
        {
            Ok(reference) => refs.raw = Some(reference),
            Err(error) => tracing::warn!(%error, "raw turn record not stored"),
        }

        // Step 13: build and store processing metrics (non-fatal).
        let metrics = ProcessingMetrics::new(
            started_at,
            chrono::Utc::now(),
            model_response.latency_ms,
            model_response.token_usage(),
        );
        match self.artifacts.store_processing_metrics(&keys, &metrics).await {
            Ok(reference) => refs.metrics = Some(reference),
            Err(error) => tracing::warn!(%error, "processing metrics not stored"),
        }

        // Step 14: metadata-store completion updates.
        let dynamodb_updated = self
            .update_completion(
                request,
                &turn_response,
                &metrics,
                &refs,
                parsed.as_ref(),
                final_outcome,
                comparison_summary.as_deref(),
            )
            .await;

        let flags = TurnFlags {
            dynamodb_updated,
            comparison_completed: turn_id == TurnId::Turn2,
            conversation_completed,
            s3_storage_completed: refs.raw.is_some() && refs.conversation.is_some(),
        };

        Ok(TurnOutcome {
            response: turn_response,
            final_outcome,
            comparison_summary,
            discrepancies: parsed.map(|p| p.discrepancies).unwrap_or_default(),
            refs,
            flags,
            metrics,
        })
    }

    async fn invoke_model(
        &self,
        turn_id: TurnId,
        turn_context: &TurnContext,
        prompt: &str,
        prior: &[optic_protocol::ConversationMessage],
    ) -> Result<ModelResponse, WorkflowError> {
        match turn_id {
            TurnId::Turn1 => {
                self.model
                    .converse(
                        &turn_context.system_prompt,
                        prompt,
                        &turn_context.image_base64,
                        &turn_context.image_format,
                    )
                    .await
            }
            TurnId::Turn2 => {
                self.model
                    .converse_with_history(
                        &turn_context.system_prompt,
                        prompt,
                        &turn_context.image_base64,
                        &turn_context.image_format,
                        prior,
                    )
                    .await
            }
        }
    }

    fn build_conversation(
        &self,
        turn_id: TurnId,
        context: &optic_protocol::VerificationContext,
        turn_context: &TurnContext,
        prompt: &str,
        model_response: &ModelResponse,
    ) -> optic_protocol::ConversationRecord {
        let own_image = ImageBlock {
            key: turn_context.image_key.clone(),
            format: turn_context.image_format.clone(),
        };
        match turn_id {
            TurnId::Turn1 => build_turn1_conversation(
                context,
                &turn_context.system_prompt,
                prompt,
                &own_image,
                model_response,
            ),
            TurnId::Turn2 => {
                let reference_image = turn_context.other_image_key.as_ref().map(|key| ImageBlock {
                    key: key.clone(),
                    format: turn_context
                        .other_image_format
                        .clone()
                        .unwrap_or_else(|| "jpeg".into()),
                });
                build_turn2_conversation(
                    context,
                    turn_context.turn1_conversation.as_ref(),
                    turn_context.turn1_response.as_ref(),
                    &turn_context.system_prompt,
                    prompt,
                    reference_image.as_ref(),
                    &own_image,
                    model_response,
                )
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn update_completion(
        &self,
        request: &TurnRequest,
        turn_response: &TurnResponse,
        metrics: &ProcessingMetrics,
        refs: &TurnArtifactRefs,
        parsed: Option<&ParsedTurn2>,
        final_outcome: Option<VerificationOutcome>,
        comparison_summary: Option<&str>,
    ) -> bool {
        let context = &request.context;
        if context.verification_id.trim().is_empty() {
            // An empty id this deep is an internal invariant violation;
            // nothing can be recorded.
            tracing::error!("verification id empty at the metadata-store boundary");
            return false;
        }

        let turn_id = request.turn_id;
        let status = match turn_id {
            TurnId::Turn1 => VerificationStatus::Turn1Completed,
            TurnId::Turn2 => VerificationStatus::Turn2Completed,
        };
        let entry = StatusHistoryEntry::new(
            status,
            format!("turn{turn_id}-worker"),
            "turn_completion",
            metrics.total_ms,
        )
        .with_metric("totalTokens", serde_json::json!(metrics.token_usage.total))
        .with_metric("modelLatencyMs", serde_json::json!(metrics.model_latency_ms));

        let policy = RetryPolicy::default();
        let mut updated = true;

        if let Err(error) = with_retry("update_status", policy, &self.cancel, |_| {
            self.meta
                .update_status(&context.verification_id, context.verification_at, &entry)
        })
        .await
        {
            tracing::warn!(%error, "status update failed");
            updated = false;
        }

        if let Err(error) = with_retry("update_conversation_turn", policy, &self.cancel, |_| {
            self.meta
                .update_conversation_turn(&context.verification_id, turn_response)
        })
        .await
        {
            tracing::warn!(%error, "conversation turn update failed");
            updated = false;
        }

        match turn_id {
            TurnId::Turn1 => {
                match (refs.processed.as_ref(), refs.conversation.as_ref()) {
                    (Some(processed_ref), Some(conversation_ref)) => {
                        if let Err(error) =
                            with_retry("update_turn1_completion", policy, &self.cancel, |_| {
                                self.meta.update_turn1_completion(
                                    &context.verification_id,
                                    context.verification_at,
                                    &entry,
                                    metrics,
                                    processed_ref,
                                    conversation_ref,
                                )
                            })
                            .await
                        {
                            tracing::warn!(%error, "turn 1 completion update failed");
                            updated = false;
                        }
                    }
                    _ => {
                        tracing::warn!(
                            "turn 1 completion not recorded: processed or conversation artifact missing"
                        );
                        updated = false;
                    }
                }
            }
            TurnId::Turn2 => {
                let discrepancies = parsed.map(|p| p.discrepancies.as_slice()).unwrap_or(&[]);
                if let Err(error) =
                    with_retry("update_turn2_completion", policy, &self.cancel, |_| {
                        self.meta.update_turn2_completion(
                            &context.verification_id,
                            context.verification_at,
                            &entry,
                            metrics,
                            refs.processed.as_ref(),
                            final_outcome.unwrap_or(VerificationOutcome::Failed),
                            discrepancies,
                            comparison_summary.unwrap_or(""),
                            refs.conversation.as_ref(),
                        )
                    })
                    .await
                {
                    tracing::warn!(%error, "turn 2 completion update failed");
                    updated = false;
                }
            }
        }

        updated
    }

    /// Record an observability sub-status. Never fatal.
    async fn record_status(&self, request: &TurnRequest, status: VerificationStatus, stage: &str) {
        let context = &request.context;
        if context.verification_id.trim().is_empty() {
            return;
        }
        let entry = StatusHistoryEntry::new(
            status,
            format!("turn{}-worker", request.turn_id),
            stage,
            0,
        );
        if let Err(error) = self
            .meta
            .update_status(&context.verification_id, context.verification_at, &entry)
            .await
        {
            tracing::warn!(%status, %error, "sub-status not recorded");
        }
    }

    async fn fail(&self, request: &TurnRequest, stage: &str, error: &WorkflowError) {
        persist_failure(
            &self.meta,
            &self.cancel,
            &request.context.verification_id,
            request.context.verification_at,
            request.turn_id,
            stage,
            error,
        )
        .await;
    }
}

/// Sub-status positions within a turn.
enum Sub {
    Started,
    ContextLoaded,
    PromptPrepared,
    BedrockInvoked,
    BedrockCompleted,
    ResponseProcessing,
}

fn status_for(turn_id: TurnId, sub: Sub) -> VerificationStatus {
    use VerificationStatus::*;
    match (turn_id, sub) {
        (TurnId::Turn1, Sub::Started) => Turn1Started,
        (TurnId::Turn1, Sub::ContextLoaded) => Turn1ContextLoaded,
        (TurnId::Turn1, Sub::PromptPrepared) => Turn1PromptPrepared,
        (TurnId::Turn1, Sub::BedrockInvoked) => Turn1BedrockInvoked,
        (TurnId::Turn1, Sub::BedrockCompleted) => Turn1BedrockCompleted,
        (TurnId::Turn1, Sub::ResponseProcessing) => Turn1ResponseProcessing,
        (TurnId::Turn2, Sub::Started) => Turn2Started,
        (TurnId::Turn2, Sub::ContextLoaded) => Turn2ContextLoaded,
        (TurnId::Turn2, Sub::PromptPrepared) => Turn2PromptPrepared,
        (TurnId::Turn2, Sub::BedrockInvoked) => Turn2BedrockInvoked,
        (TurnId::Turn2, Sub::BedrockCompleted) => Turn2BedrockCompleted,
        (TurnId::Turn2, Sub::ResponseProcessing) => Turn2ResponseProcessing,
    }
}

/// Messages prepended to the Turn-2 model call.
///
/// The stored Turn-1 conversation is replayed when present; otherwise
/// the Turn-1 raw record is synthesized into a two-message exchange. A
/// request without any Turn-1 data sends no prior messages.
fn prior_messages(turn_context: &TurnContext) -> Vec<optic_protocol::ConversationMessage> {
    use optic_protocol::{ConversationBlock, ConversationMessage, ConversationRole};
    if let Some(conversation) = &turn_context.turn1_conversation {
        return conversation.messages.clone();
    }
    let Some(turn1) = &turn_context.turn1_response else {
        return Vec::new();
    };
    let mut assistant_content = Vec::new();
    if let Some(thinking) = &turn1.response.thinking {
        assistant_content.push(ConversationBlock::Thinking {
            thinking: thinking.clone(),
        });
    }
    assistant_content.push(ConversationBlock::Text {
        text: turn1.response.content.clone(),
    });
    vec![
        ConversationMessage::user_text(turn1.prompt.clone()),
        ConversationMessage {
            role: ConversationRole::Assistant,
            content: assistant_content,
        },
    ]
}

/// The raw record of a completed model call.
fn build_turn_record(
    turn_id: TurnId,
    turn_context: &TurnContext,
    prompt: &str,
    model_response: &ModelResponse,
) -> TurnResponse {
    let mut image_refs = BTreeMap::new();
    let own_name = match turn_id {
        TurnId::Turn1 => "referenceImage",
        TurnId::Turn2 => "checkingImage",
    };
    image_refs.insert(own_name.to_string(), turn_context.image_key.clone());
    if let Some(other) = &turn_context.other_image_key {
        let other_name = match turn_id {
            TurnId::Turn1 => "checkingImage",
            TurnId::Turn2 => "referenceImage",
        };
        image_refs.insert(other_name.to_string(), other.clone());
    }

    TurnResponse {
        turn_id,
        timestamp: chrono::Utc::now(),
        prompt: prompt.to_string(),
        image_refs,
        response: ModelOutput {
            content: model_response.content.clone(),
            thinking: model_response.thinking.clone(),
            stop_reason: model_response.stop_reason.clone(),
            model_id: model_response.model_id.clone(),
        },
        latency_ms: model_response.latency_ms,
        token_usage: model_response.token_usage(),
        stage: AnalysisStage::for_turn(turn_id),
        metadata: BTreeMap::new(),
    }
}
