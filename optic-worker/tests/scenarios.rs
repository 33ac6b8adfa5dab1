//! End-to-end worker scenarios over in-memory stores and a scripted
//! model client.

use chrono::{DateTime, TimeZone, Utc};
use optic_protocol::test_utils::ScriptedModelClient;
use optic_protocol::{
    AnalysisStage, ArtifactKeys, ConversationBlock, ConversationMessage, ConversationRecord,
    ConversationRole, Envelope, ErrorCategory, ImageMetadata, ImageValidation, ImagesMetadata,
    LayoutMetadata, LogicalName, MachineStructure, ModelOutput, TokenUsage, TurnId, TurnResponse,
    VerificationContext, VerificationOutcome, VerificationStatus, VerificationType, WorkflowConfig,
    classify_model_failure,
};
use optic_store_memory::{ArtifactOp, MemoryArtifactStore, MemoryMetaStore, MetaOp};
use optic_worker::StageWorker;
use std::collections::BTreeMap;
use std::sync::Arc;

const VERIFICATION_ID: &str = "verif-20250401123000";
const SYSTEM_PROMPT: &str = "You are a meticulous vending machine auditor.";

fn verification_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 12, 30, 0).unwrap()
}

fn keys() -> ArtifactKeys {
    ArtifactKeys::new(VERIFICATION_ID, verification_at())
}

fn layout_context() -> VerificationContext {
    VerificationContext {
        verification_id: VERIFICATION_ID.into(),
        verification_at: verification_at(),
        verification_type: VerificationType::LayoutVsChecking,
        reference_image_url: "s3://uploads/ref.jpg".into(),
        checking_image_url: "s3://uploads/check.jpg".into(),
        vending_machine_id: Some("vm-104".into()),
        layout_id: Some(23591),
        layout_prefix: Some("5560c9c9".into()),
        previous_verification_id: None,
        layout_metadata: Some(LayoutMetadata {
            layout_id: 23591,
            layout_prefix: "5560c9c9".into(),
            vending_machine_id: "vm-104".into(),
            location: "Lobby 3F".into(),
            machine_structure: MachineStructure {
                row_count: 6,
                column_count: 8,
                row_labels: vec![
                    "A".into(),
                    "B".into(),
                    "C".into(),
                    "D".into(),
                    "E".into(),
                    "F".into(),
                ],
            },
            product_position_map: BTreeMap::new(),
        }),
        historical_context: None,
    }
}

fn previous_context() -> VerificationContext {
    VerificationContext {
        verification_type: VerificationType::PreviousVsCurrent,
        layout_id: None,
        layout_prefix: None,
        layout_metadata: None,
        ..layout_context()
    }
}

fn image_metadata(key: String) -> ImageMetadata {
    ImageMetadata {
        storage_bucket: "artifacts".into(),
        storage_key: key,
        stored_size: 12,
        original_content_type: "image/jpeg".into(),
        source_key: "uploads/img.jpg".into(),
        validation: ImageValidation {
            model_compatible: true,
        },
    }
}

fn turn1_response() -> TurnResponse {
    TurnResponse {
        turn_id: TurnId::Turn1,
        timestamp: verification_at(),
        prompt: "Analyze the reference image.".into(),
        image_refs: BTreeMap::from([(
            "referenceImage".to_string(),
            keys().key(LogicalName::ImagesReferenceBase64),
        )]),
        response: ModelOutput {
            content: "# Reference Analysis\n\nRow A holds Cola 330ml in A1-A4.".into(),
            thinking: Some("six rows visible".into()),
            stop_reason: "end_turn".into(),
            model_id: "model-x".into(),
        },
        latency_ms: 800,
        token_usage: TokenUsage::new(900, 300, 0),
        stage: AnalysisStage::ReferenceAnalysis,
        metadata: BTreeMap::new(),
    }
}

fn turn1_conversation() -> ConversationRecord {
    ConversationRecord {
        verification_id: VERIFICATION_ID.into(),
        turn_id: TurnId::Turn1,
        system_prompt: SYSTEM_PROMPT.into(),
        messages: vec![
            ConversationMessage {
                role: ConversationRole::User,
                content: vec![
                    ConversationBlock::ImageRef {
                        key: keys().key(LogicalName::ImagesReferenceBase64),
                        format: "jpeg".into(),
                    },
                    ConversationBlock::Text {
                        text: "Analyze the reference image.".into(),
                    },
                ],
            },
            ConversationMessage {
                role: ConversationRole::Assistant,
                content: vec![
                    ConversationBlock::Thinking {
                        thinking: "six rows visible".into(),
                    },
                    ConversationBlock::Text {
                        text: "# Reference Analysis\n\nRow A holds Cola 330ml in A1-A4.".into(),
                    },
                ],
            },
        ],
        token_usage: TokenUsage::new(900, 300, 0),
        latency_ms: 800,
        stop_reason: "end_turn".into(),
        model_id: "model-x".into(),
        metadata: BTreeMap::new(),
    }
}

/// A Turn-2 comparison report in the canonical shape.
fn report(outcome: &str, discrepancy_rows: &[&str]) -> String {
    let mut md = format!(
        "I inspected the checking photo carefully.\n\n\
         # Comparison Report\n\n\
         **Verification Outcome:** {outcome}\n\n\
         ## Comparison Summary\n\
         Row A shows deviations from the planogram.\n"
    );
    if !discrepancy_rows.is_empty() {
        md.push_str(
            "\n## Discrepancies\n\
             | Item | Expected | Found | Type | Severity |\n\
             | --- | --- | --- | --- | --- |\n",
        );
        for row in discrepancy_rows {
            md.push_str(row);
            md.push('\n');
        }
    }
    md.push_str(
        "\n## Machine Structure\n\
         | Rows | Columns | Row Labels |\n\
         | --- | --- | --- |\n\
         | 6 | 8 | A, B, C, D, E, F |\n\
         \n## Row Status\n\
         | Row | Status | Notes |\n\
         | --- | --- | --- |\n\
         | A | deviations | see discrepancies |\n\
         | B | OK | |\n",
    );
    md
}

struct Fixture {
    config: Arc<WorkflowConfig>,
    artifacts: Arc<MemoryArtifactStore>,
    meta: Arc<MemoryMetaStore>,
    model: Arc<ScriptedModelClient>,
    envelope: Envelope,
}

impl Fixture {
    async fn new(context: &VerificationContext, discrepancy_threshold: u32) -> Self {
        let mut config =
            WorkflowConfig::new("artifacts", "verifications", "conversations", "model-x");
        config.discrepancy_threshold = discrepancy_threshold;
        let artifacts = Arc::new(MemoryArtifactStore::new(
            "artifacts",
            config.max_image_size_bytes,
        ));
        let meta = Arc::new(MemoryMetaStore::new());
        let model = Arc::new(ScriptedModelClient::new());
        let keys = keys();

        let init_ref = artifacts
            .put_json(keys.key(LogicalName::ProcessingInitialization), context)
            .await;
        let images = ImagesMetadata {
            reference_image: image_metadata(keys.key(LogicalName::ImagesReferenceBase64)),
            checking_image: image_metadata(keys.key(LogicalName::ImagesCheckingBase64)),
        };
        let images_ref = artifacts
            .put_json(keys.key(LogicalName::ImagesMetadata), &images)
            .await;
        let reference_image_ref = artifacts
            .put_text(keys.key(LogicalName::ImagesReferenceBase64), "UkVGSU1BR0U=")
            .await;
        let checking_image_ref = artifacts
            .put_text(keys.key(LogicalName::ImagesCheckingBase64), "Q0hLSU1BR0U=")
            .await;
        let prompt_ref = artifacts
            .put_json(
                keys.key(LogicalName::PromptsSystem),
                &serde_json::json!({ "content": SYSTEM_PROMPT }),
            )
            .await;
        let turn1_raw_ref = artifacts
            .put_json(keys.key(LogicalName::ResponsesTurn1Raw), &turn1_response())
            .await;
        let turn1_processed_ref = artifacts
            .put_text(
                keys.key(LogicalName::ResponsesTurn1Processed),
                turn1_response().response.content,
            )
            .await;
        let turn1_conversation_ref = artifacts
            .put_json(
                keys.key(LogicalName::ConversationTurn1),
                &turn1_conversation(),
            )
            .await;

        let mut envelope = Envelope::new(VERIFICATION_ID, VerificationStatus::Turn1Processed);
        envelope.set_reference(LogicalName::ProcessingInitialization, init_ref);
        envelope.set_reference(LogicalName::ImagesMetadata, images_ref);
        envelope.set_reference(LogicalName::ImagesReferenceBase64, reference_image_ref);
        envelope.set_reference(LogicalName::ImagesCheckingBase64, checking_image_ref);
        envelope.set_reference(LogicalName::PromptsSystem, prompt_ref);
        envelope.set_reference(LogicalName::ResponsesTurn1Raw, turn1_raw_ref);
        envelope.set_reference(LogicalName::ResponsesTurn1Processed, turn1_processed_ref);
        envelope.set_reference(LogicalName::ConversationTurn1, turn1_conversation_ref);

        Self {
            config: Arc::new(config),
            artifacts,
            meta,
            model,
            envelope,
        }
    }

    fn worker(&self) -> StageWorker {
        StageWorker::new(
            self.config.clone(),
            self.artifacts.clone(),
            self.meta.clone(),
            self.model.clone(),
        )
    }
}

fn assert_history_is_legal(history: &[optic_protocol::StatusHistoryEntry]) {
    for pair in history.windows(2) {
        assert!(
            pair[0].status.can_transition_to(pair[1].status),
            "illegal transition {} -> {}",
            pair[0].status,
            pair[1].status
        );
    }
}

#[tokio::test]
async fn uc1_happy_path_with_threshold_at_count() {
    let fixture = Fixture::new(&layout_context(), 2).await;
    fixture.model.push_response(ScriptedModelClient::text_response(report(
        "CORRECT",
        &[
            "| A3 | Cola 330ml | (empty) | MISSING | MEDIUM |",
            "| A4 | Cola 330ml | (empty) | MISSING | MEDIUM |",
        ],
    )));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    assert_eq!(outbound.status, VerificationStatus::Turn2Completed);
    assert_eq!(outbound.summary["verificationOutcome"], "INCORRECT");
    assert_eq!(outbound.summary["discrepanciesFound"], 2);
    assert_eq!(outbound.summary["dynamodbUpdated"], true);
    assert_eq!(outbound.summary["comparisonCompleted"], true);
    assert_eq!(outbound.summary["s3StorageCompleted"], true);
    assert_eq!(outbound.summary["verificationType"], "LAYOUT_VS_CHECKING");

    // tokenUsage.total == input + output + thinking
    let usage = &outbound.summary["tokenUsage"];
    assert_eq!(
        usage["total"].as_u64().unwrap(),
        usage["input"].as_u64().unwrap()
            + usage["output"].as_u64().unwrap()
            + usage["thinking"].as_u64().unwrap()
    );

    // The outbound reference map is a superset of the inbound one.
    for name in fixture.envelope.references.keys() {
        assert!(outbound.references.contains_key(name), "lost reference {name}");
    }
    for name in [
        LogicalName::ResponsesTurn2Raw,
        LogicalName::ResponsesTurn2Processed,
        LogicalName::ConversationTurn2,
        LogicalName::PromptsTurn2,
    ] {
        assert!(outbound.references.contains_key(&name), "missing {name}");
    }

    // The row carries the final outcome and the history is legal.
    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(row.current_status, VerificationStatus::Turn2Completed);
    assert_eq!(row.verification_outcome, Some(VerificationOutcome::Incorrect));
    assert_eq!(row.discrepancies.len(), 2);
    assert!(row.comparison_summary.unwrap().contains("Assessment: INCORRECT"));
    assert_history_is_legal(&row.status_history);

    // The conversation row was upserted for turn 2.
    let conversation = fixture.meta.conversation_row(VERIFICATION_ID).await.unwrap();
    assert!(conversation.turns.contains_key("2"));
}

#[tokio::test]
async fn uc1_threshold_above_count_keeps_parsed_outcome() {
    let fixture = Fixture::new(&layout_context(), 3).await;
    fixture.model.push_response(ScriptedModelClient::text_response(report(
        "CORRECT",
        &[
            "| A3 | Cola 330ml | (empty) | MISSING | MEDIUM |",
            "| A4 | Cola 330ml | (empty) | MISSING | MEDIUM |",
        ],
    )));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();
    assert_eq!(outbound.summary["verificationOutcome"], "CORRECT");
}

#[tokio::test]
async fn uc2_without_prior_verification_mirrors_parsed_outcome() {
    let fixture = Fixture::new(&previous_context(), 0).await;
    fixture.model.push_response(ScriptedModelClient::text_response(report(
        "PARTIAL",
        &["| B2 | Water 500ml | Iced Tea | UNEXPECTED | MEDIUM |"],
    )));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    assert_eq!(outbound.summary["verificationOutcome"], "PARTIAL");
    assert_eq!(outbound.summary["verificationType"], "PREVIOUS_VS_CURRENT");

    // No business-rule escalation: the summary is the parsed one.
    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(
        row.comparison_summary.as_deref(),
        Some("Row A shows deviations from the planogram.")
    );
}

#[tokio::test]
async fn model_throttling_exhausts_five_attempts() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    for _ in 0..5 {
        fixture
            .model
            .push_error(classify_model_failure("throttling: too many requests"));
    }

    let error = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap_err();

    assert_eq!(error.category, ErrorCategory::Capacity);
    assert!(error.retryable());
    assert_eq!(fixture.model.calls().await.len(), 5);

    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(row.current_status, VerificationStatus::Turn2Error);
    let tracking = row.error_tracking.unwrap();
    assert!(tracking.has_errors);
    assert_eq!(tracking.current_error.code, "MODEL_THROTTLED");
    assert_history_is_legal(&row.status_history);
}

#[tokio::test]
async fn markdown_parse_failure_skips_later_stores() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    fixture.model.push_response(ScriptedModelClient::text_response(
        "Everything looks fine to me, no structured report today.",
    ));

    let error = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap_err();

    assert_eq!(error.category, ErrorCategory::Conversion);
    assert!(!error.retryable());

    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(row.current_status, VerificationStatus::Turn2Error);
    let last = row.status_history.last().unwrap();
    assert_eq!(last.stage, "response_parsing");

    // Step 12/13 never ran: no raw record, no metrics artifact.
    let keys = keys();
    assert!(
        !fixture
            .artifacts
            .contains(&keys.key(LogicalName::ResponsesTurn2Raw))
            .await
    );
    assert!(
        !fixture
            .artifacts
            .contains(&keys.key(LogicalName::ProcessingMetrics))
            .await
    );
}

#[tokio::test]
async fn transient_markdown_store_failure_degrades_gracefully() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    fixture.artifacts.fail_next(ArtifactOp::StoreMarkdown, 1).await;
    fixture
        .model
        .push_response(ScriptedModelClient::text_response(report("CORRECT", &[])));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    assert!(
        !outbound
            .references
            .contains_key(&LogicalName::ResponsesTurn2Processed)
    );
    assert_eq!(outbound.summary["verificationOutcome"], "CORRECT");
    assert_eq!(outbound.summary["comparisonCompleted"], true);
    // Raw and conversation stores succeeded.
    assert_eq!(outbound.summary["s3StorageCompleted"], true);
    assert_eq!(outbound.summary["conversationCompleted"], true);
}

#[tokio::test]
async fn high_severity_discrepancy_forces_incorrect() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    fixture.model.push_response(ScriptedModelClient::text_response(report(
        "CORRECT",
        &["| C1 | Juice 250ml | Energy Drink | INCORRECT_TYPE | HIGH |"],
    )));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    assert_eq!(outbound.summary["verificationOutcome"], "INCORRECT");
    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert!(
        row.comparison_summary
            .unwrap()
            .ends_with("Assessment: INCORRECT due to 1 discrepancies.")
    );
}

#[tokio::test]
async fn turn1_pipeline_completes_and_stores_artifacts() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    fixture.model.push_response(ScriptedModelClient::text_response(
        "# Reference Analysis\n\n## Row A\nCola 330ml in A1-A4.",
    ));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn1, fixture.envelope.clone())
        .await
        .unwrap();

    assert_eq!(outbound.status, VerificationStatus::Turn1Completed);
    assert_eq!(outbound.summary["analysisStage"], "REFERENCE_ANALYSIS");
    for name in [
        LogicalName::PromptsTurn1,
        LogicalName::ResponsesTurn1Raw,
        LogicalName::ResponsesTurn1Processed,
        LogicalName::ConversationTurn1,
    ] {
        assert!(outbound.references.contains_key(&name), "missing {name}");
    }

    let row = fixture.meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(row.current_status, VerificationStatus::Turn1Completed);
    assert_history_is_legal(&row.status_history);
    let conversation = fixture.meta.conversation_row(VERIFICATION_ID).await.unwrap();
    assert!(conversation.turns.contains_key("1"));
}

#[tokio::test]
async fn turn2_without_turn1_reference_still_completes() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    let mut envelope = fixture.envelope.clone();
    envelope.references.remove(&LogicalName::ResponsesTurn1Raw);
    envelope
        .references
        .remove(&LogicalName::ResponsesTurn1Processed);
    envelope.references.remove(&LogicalName::ConversationTurn1);

    fixture
        .model
        .push_response(ScriptedModelClient::text_response(report("CORRECT", &[])));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, envelope)
        .await
        .unwrap();
    assert_eq!(outbound.summary["verificationOutcome"], "CORRECT");

    // No prior messages were replayed.
    let calls = fixture.model.calls().await;
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].prior_messages, 0);
}

#[tokio::test]
async fn turn2_replays_stored_turn1_conversation() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    fixture
        .model
        .push_response(ScriptedModelClient::text_response(report("CORRECT", &[])));

    fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    let calls = fixture.model.calls().await;
    assert_eq!(calls.len(), 1);
    // The stored Turn-1 conversation has two messages.
    assert_eq!(calls[0].prior_messages, 2);
    assert_eq!(calls[0].system_prompt, SYSTEM_PROMPT);
    assert_eq!(calls[0].image_format, "jpeg");
}

#[tokio::test]
async fn metastore_completion_failure_flags_the_summary() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    // Exhaust the retry budget of the completion update.
    fixture
        .meta
        .fail_next(MetaOp::UpdateTurn2Completion, 3)
        .await;
    fixture
        .model
        .push_response(ScriptedModelClient::text_response(report("CORRECT", &[])));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();

    assert_eq!(outbound.status, VerificationStatus::Turn2Completed);
    assert_eq!(outbound.summary["dynamodbUpdated"], false);
    assert_eq!(outbound.summary["verificationOutcome"], "CORRECT");
}

#[tokio::test]
async fn replayed_request_does_not_grow_history_and_rewrites_identically() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    let markdown = report("CORRECT", &[]);
    fixture
        .model
        .push_response(ScriptedModelClient::text_response(markdown.clone()));
    fixture
        .model
        .push_response(ScriptedModelClient::text_response(markdown));

    let worker = fixture.worker();
    worker
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();
    let first_processed = fixture
        .artifacts
        .get(&keys().key(LogicalName::ResponsesTurn2Processed))
        .await
        .unwrap();
    let first_history_len = fixture
        .meta
        .verification_row(VERIFICATION_ID)
        .await
        .unwrap()
        .status_history
        .len();

    worker
        .handle(TurnId::Turn2, fixture.envelope.clone())
        .await
        .unwrap();
    let second_processed = fixture
        .artifacts
        .get(&keys().key(LogicalName::ResponsesTurn2Processed))
        .await
        .unwrap();
    let second_history_len = fixture
        .meta
        .verification_row(VERIFICATION_ID)
        .await
        .unwrap()
        .status_history
        .len();

    // Deterministic model ⇒ byte-identical processed artifact, and the
    // replay collapses into the existing history rows.
    assert_eq!(first_processed, second_processed);
    assert_eq!(first_history_len, second_history_len);
}

#[tokio::test]
async fn unknown_reference_names_are_rejected() {
    let fixture = Fixture::new(&layout_context(), 0).await;
    let mut event = serde_json::to_value(&fixture.envelope).unwrap();
    event["s3References"]["responses_turn9Raw"] =
        serde_json::json!({ "bucket": "artifacts", "key": "k", "size": 1 });

    let error = fixture
        .worker()
        .handle_value(TurnId::Turn2, event)
        .await
        .unwrap_err();
    assert_eq!(error.category, ErrorCategory::Validation);
    assert_eq!(error.code, "INVALID_EVENT");
}

#[tokio::test]
async fn missing_verification_id_everywhere_fails_the_transform() {
    let fixture = Fixture::new(&layout_context(), 0).await;

    // Re-seed an initialization artifact without an id, under a key
    // that carries no id either, and clear the envelope id.
    let mut context = layout_context();
    context.verification_id = String::new();
    let init_ref = fixture
        .artifacts
        .put_json("2025/04/01/unlabeled/processing/initialization.json", &context)
        .await;
    let mut envelope = fixture.envelope.clone();
    envelope.verification_id = String::new();
    envelope.set_reference(LogicalName::ProcessingInitialization, init_ref);

    let error = fixture
        .worker()
        .handle(TurnId::Turn2, envelope)
        .await
        .unwrap_err();
    assert_eq!(error.code, "MISSING_VERIFICATION_ID");
    assert!(!error.retryable());
}

#[tokio::test]
async fn verification_id_recovered_from_the_initialization_key() {
    let fixture = Fixture::new(&layout_context(), 0).await;

    // Artifact and envelope ids are empty; the key still names the
    // verification.
    let mut context = layout_context();
    context.verification_id = String::new();
    fixture
        .artifacts
        .put_json(keys().key(LogicalName::ProcessingInitialization), &context)
        .await;
    let mut envelope = fixture.envelope.clone();
    envelope.verification_id = String::new();

    fixture
        .model
        .push_response(ScriptedModelClient::text_response(report("CORRECT", &[])));

    let outbound = fixture
        .worker()
        .handle(TurnId::Turn2, envelope)
        .await
        .unwrap();
    assert_eq!(outbound.verification_id, VERIFICATION_ID);
}
