//! Building the outbound envelope.

use crate::executor::TurnOutcome;
use optic_protocol::{Envelope, LogicalName, TurnId, TurnRequest, VerificationStatus};
use serde_json::json;

/// Package a completed turn into the outbound envelope.
///
/// Every inbound reference is copied; the turn's artifacts are added or
/// overwritten on top, so the outbound reference map is always a
/// superset of the inbound one. The summary carries the stage, timing,
/// token usage, and degradation flags the orchestrator routes on.
pub fn build_envelope(request: &TurnRequest, outcome: &TurnOutcome) -> Envelope {
    let turn_id = request.turn_id;
    let mut envelope = request.envelope.clone();
    envelope.schema_version = optic_protocol::SCHEMA_VERSION.to_string();
    envelope.verification_id = request.context.verification_id.clone();
    envelope.status = match turn_id {
        TurnId::Turn1 => VerificationStatus::Turn1Completed,
        TurnId::Turn2 => VerificationStatus::Turn2Completed,
    };

    let (prompt_name, raw_name, processed_name, conversation_name) = match turn_id {
        TurnId::Turn1 => (
            LogicalName::PromptsTurn1,
            LogicalName::ResponsesTurn1Raw,
            LogicalName::ResponsesTurn1Processed,
            LogicalName::ConversationTurn1,
        ),
        TurnId::Turn2 => (
            LogicalName::PromptsTurn2,
            LogicalName::ResponsesTurn2Raw,
            LogicalName::ResponsesTurn2Processed,
            LogicalName::ConversationTurn2,
        ),
    };
    if let Some(reference) = &outcome.refs.prompt {
        envelope.set_reference(prompt_name, reference.clone());
    }
    if let Some(reference) = &outcome.refs.raw {
        envelope.set_reference(raw_name, reference.clone());
    }
    if let Some(reference) = &outcome.refs.processed {
        envelope.set_reference(processed_name, reference.clone());
    }
    if let Some(reference) = &outcome.refs.conversation {
        envelope.set_reference(conversation_name, reference.clone());
    }
    if let Some(reference) = &outcome.refs.metrics {
        envelope.set_reference(LogicalName::ProcessingMetrics, reference.clone());
    }
    if let Some(reference) = &outcome.refs.template_processor {
        envelope.set_reference(LogicalName::ProcessingTemplateProcessor, reference.clone());
    }

    let usage = outcome.metrics.token_usage;
    let summary = &mut envelope.summary;
    summary.insert(
        "analysisStage".into(),
        json!(outcome.response.stage.as_str()),
    );
    summary.insert(
        "processingTimeMs".into(),
        json!(outcome.metrics.total_ms),
    );
    if let Some(final_outcome) = outcome.final_outcome {
        summary.insert("verificationOutcome".into(), json!(final_outcome.as_str()));
    }
    summary.insert(
        "tokenUsage".into(),
        json!({
            "input": usage.input,
            "output": usage.output,
            "thinking": usage.thinking,
            "total": usage.total,
        }),
    );
    if turn_id == TurnId::Turn2 {
        summary.insert(
            "discrepanciesFound".into(),
            json!(outcome.discrepancies.len()),
        );
        summary.insert(
            "comparisonCompleted".into(),
            json!(outcome.flags.comparison_completed),
        );
    }
    summary.insert(
        "dynamodbUpdated".into(),
        json!(outcome.flags.dynamodb_updated),
    );
    summary.insert(
        "conversationCompleted".into(),
        json!(outcome.flags.conversation_completed),
    );
    summary.insert(
        "verificationType".into(),
        json!(request.context.verification_type.as_str()),
    );
    summary.insert(
        "bedrockLatencyMs".into(),
        json!(outcome.metrics.model_latency_ms),
    );
    summary.insert(
        "s3StorageCompleted".into(),
        json!(outcome.flags.s3_storage_completed),
    );

    envelope
}
