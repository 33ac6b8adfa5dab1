//! Failure persistence: record an error on the verification row before
//! the executor returns it.

use optic_protocol::{
    AnalysisStage, ErrorSeverity, ErrorTracking, MetaStore, ModelOutput, StatusHistoryEntry,
    TokenUsage, TurnId, TurnResponse, VerificationStatus, WorkflowError,
};
use optic_retry::{RetryPolicy, with_retry};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Log a persistence sub-failure at the severity of the original error
/// classification.
fn log_sub_failure(original: &WorkflowError, operation: &str, failure: &WorkflowError) {
    match original.severity {
        ErrorSeverity::Critical | ErrorSeverity::High => {
            tracing::error!(operation, %failure, "failure persistence step failed");
        }
        ErrorSeverity::Medium => {
            tracing::warn!(operation, %failure, "failure persistence step failed");
        }
        ErrorSeverity::Low => {
            tracing::info!(operation, %failure, "failure persistence step failed");
        }
    }
}

/// Persist a turn failure: status history, error tracking, and a
/// minimal error-bearing conversation turn.
///
/// Sub-failures are logged but never override the original error; the
/// caller still returns it. With an empty verification id nothing can
/// be recorded and the failure is only logged.
pub async fn persist_failure(
    meta: &Arc<dyn MetaStore>,
    cancel: &CancellationToken,
    verification_id: &str,
    verification_at: chrono::DateTime<chrono::Utc>,
    turn_id: TurnId,
    failed_stage: &str,
    error: &WorkflowError,
) {
    if verification_id.trim().is_empty() {
        tracing::error!(
            stage = failed_stage,
            %error,
            "cannot persist failure without a verification id"
        );
        return;
    }

    let status = match turn_id {
        TurnId::Turn1 => VerificationStatus::Turn1Error,
        TurnId::Turn2 => VerificationStatus::Turn2Error,
    };
    let function_name = format!("turn{turn_id}-worker");
    let entry = StatusHistoryEntry::new(status, &function_name, failed_stage, 0)
        .with_metric("errorCode", serde_json::json!(error.code))
        .with_metric("errorCategory", serde_json::json!(error.category.to_string()));

    let policy = RetryPolicy::default();

    if let Err(failure) = with_retry("update_status", policy, cancel, |_| {
        meta.update_status(verification_id, verification_at, &entry)
    })
    .await
    {
        log_sub_failure(error, "update_status", &failure);
    }

    let tracking = ErrorTracking::for_error(error);
    if let Err(failure) = with_retry("update_error_tracking", policy, cancel, |_| {
        meta.update_error_tracking(verification_id, &tracking)
    })
    .await
    {
        log_sub_failure(error, "update_error_tracking", &failure);
    }

    let error_turn = minimal_error_turn(turn_id, failed_stage, error);
    if let Err(failure) = with_retry("update_conversation_turn", policy, cancel, |_| {
        meta.update_conversation_turn(verification_id, &error_turn)
    })
    .await
    {
        log_sub_failure(error, "update_conversation_turn", &failure);
    }
}

/// The minimal turn record written when a turn fails: only the failing
/// stage and the error message.
fn minimal_error_turn(turn_id: TurnId, failed_stage: &str, error: &WorkflowError) -> TurnResponse {
    let mut metadata = BTreeMap::new();
    metadata.insert("failedStage".to_string(), serde_json::json!(failed_stage));
    metadata.insert(
        "errorMessage".to_string(),
        serde_json::json!(error.message),
    );
    TurnResponse {
        turn_id,
        timestamp: chrono::Utc::now(),
        prompt: String::new(),
        image_refs: BTreeMap::new(),
        response: ModelOutput {
            content: String::new(),
            thinking: None,
            stop_reason: "error".into(),
            model_id: String::new(),
        },
        latency_ms: 0,
        token_usage: TokenUsage::default(),
        stage: AnalysisStage::for_turn(turn_id),
        metadata,
    }
}
