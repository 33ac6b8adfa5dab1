//! The metadata-store port.

use crate::error::{ErrorTracking, WorkflowError};
use crate::parsed::{Discrepancy, VerificationOutcome};
use crate::reference::Reference;
use crate::status::{StatusHistoryEntry, VerificationStatus};
use crate::turn::{ProcessingMetrics, TurnResponse};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Fail synchronously on an empty verification id, before any write.
///
/// An empty id at the metadata-store boundary is an internal invariant
/// violation: CRITICAL, never retried.
pub fn require_verification_id(verification_id: &str) -> Result<(), WorkflowError> {
    if verification_id.trim().is_empty() {
        return Err(WorkflowError::internal(
            "EMPTY_VERIFICATION_ID",
            "verification id must not be empty at the metadata-store boundary",
        )
        .with_component("meta_store"));
    }
    Ok(())
}

/// Idempotent monotonic updates to the verification and conversation
/// tables, keyed by `(verificationId, verificationAt)`.
///
/// Rows are created minimal at Initialize and only grow: status,
/// history, metrics, and terminal outcome fields are appended or
/// replaced, never removed. Every operation tolerates being replayed;
/// duplicate status-history rows (same status and stage within the same
/// minute) collapse into one.
#[async_trait]
pub trait MetaStore: Send + Sync {
    /// Append a status-history entry and update the current status.
    async fn update_status(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
    ) -> Result<(), WorkflowError>;

    /// Upsert a turn in the conversation row. Calling twice for the same
    /// turn replaces the stored record.
    async fn update_conversation_turn(
        &self,
        verification_id: &str,
        turn: &TurnResponse,
    ) -> Result<(), WorkflowError>;

    /// Record Turn-1 completion: status history, metrics, and the
    /// processed/conversation references.
    async fn update_turn1_completion(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
        metrics: &ProcessingMetrics,
        processed_ref: &Reference,
        conversation_ref: &Reference,
    ) -> Result<(), WorkflowError>;

    /// Record Turn-2 completion: status history, metrics, the final
    /// outcome with its discrepancies and summary, and the artifact
    /// references.
    #[allow(clippy::too_many_arguments)]
    async fn update_turn2_completion(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
        metrics: &ProcessingMetrics,
        processed_ref: Option<&Reference>,
        outcome: VerificationOutcome,
        discrepancies: &[Discrepancy],
        comparison_summary: &str,
        conversation_ref: Option<&Reference>,
    ) -> Result<(), WorkflowError>;

    /// Replace the error-tracking block on the verification row.
    async fn update_error_tracking(
        &self,
        verification_id: &str,
        tracking: &ErrorTracking,
    ) -> Result<(), WorkflowError>;
}

/// A verification row as stored in the metadata table.
///
/// Shared by the store adapters so the monotonic-merge rules live in one
/// place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRow {
    /// Stable verification identifier.
    pub verification_id: String,
    /// When the verification was requested.
    pub verification_at: DateTime<Utc>,
    /// Current status.
    pub current_status: VerificationStatus,
    /// Append-only status history, oldest first.
    #[serde(default)]
    pub status_history: Vec<StatusHistoryEntry>,
    /// Final outcome, present after Turn-2 completion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_outcome: Option<VerificationOutcome>,
    /// Discrepancies of the final outcome.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub discrepancies: Vec<Discrepancy>,
    /// Comparison summary of the final outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comparison_summary: Option<String>,
    /// Metrics of the most recently completed turn.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metrics: Option<ProcessingMetrics>,
    /// Processed-response references per turn (`"1"`/`"2"`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub processed_refs: BTreeMap<String, Reference>,
    /// Conversation references per turn (`"1"`/`"2"`).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub conversation_refs: BTreeMap<String, Reference>,
    /// Error tracking, present once a failure was recorded.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_tracking: Option<ErrorTracking>,
}

impl VerificationRow {
    /// A minimal row, as the Initialize stage creates it.
    pub fn minimal(
        verification_id: impl Into<String>,
        verification_at: DateTime<Utc>,
        status: VerificationStatus,
    ) -> Self {
        Self {
            verification_id: verification_id.into(),
            verification_at,
            current_status: status,
            status_history: Vec::new(),
            verification_outcome: None,
            discrepancies: Vec::new(),
            comparison_summary: None,
            metrics: None,
            processed_refs: BTreeMap::new(),
            conversation_refs: BTreeMap::new(),
            error_tracking: None,
        }
    }

    /// Append a status-history entry, collapsing idempotent replays, and
    /// update the current status.
    pub fn apply_status(&mut self, entry: &StatusHistoryEntry) {
        if !self
            .status_history
            .iter()
            .any(|existing| existing.duplicates(entry))
        {
            self.status_history.push(entry.clone());
        }
        self.current_status = entry.status;
    }

    /// Apply a Turn-1 completion update.
    pub fn apply_turn1_completion(
        &mut self,
        entry: &StatusHistoryEntry,
        metrics: &ProcessingMetrics,
        processed_ref: &Reference,
        conversation_ref: &Reference,
    ) {
        self.apply_status(entry);
        self.metrics = Some(metrics.clone());
        self.processed_refs.insert("1".into(), processed_ref.clone());
        self.conversation_refs
            .insert("1".into(), conversation_ref.clone());
    }

    /// Apply a Turn-2 completion update. Afterwards the row carries the
    /// final outcome, discrepancy list, and comparison summary, and the
    /// current status is the entry's status.
    pub fn apply_turn2_completion(
        &mut self,
        entry: &StatusHistoryEntry,
        metrics: &ProcessingMetrics,
        processed_ref: Option<&Reference>,
        outcome: VerificationOutcome,
        discrepancies: &[Discrepancy],
        comparison_summary: &str,
        conversation_ref: Option<&Reference>,
    ) {
        self.apply_status(entry);
        self.metrics = Some(metrics.clone());
        self.verification_outcome = Some(outcome);
        self.discrepancies = discrepancies.to_vec();
        self.comparison_summary = Some(comparison_summary.to_string());
        if let Some(reference) = processed_ref {
            self.processed_refs.insert("2".into(), reference.clone());
        }
        if let Some(reference) = conversation_ref {
            self.conversation_refs.insert("2".into(), reference.clone());
        }
    }
}

/// A conversation row: one record per turn, upserted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationRow {
    /// Stable verification identifier.
    pub verification_id: String,
    /// Turn number (`"1"`/`"2"`) → turn record.
    #[serde(default)]
    pub turns: BTreeMap<String, TurnResponse>,
}

impl ConversationRow {
    /// An empty row for a verification.
    pub fn new(verification_id: impl Into<String>) -> Self {
        Self {
            verification_id: verification_id.into(),
            turns: BTreeMap::new(),
        }
    }

    /// Upsert a turn record.
    pub fn upsert_turn(&mut self, turn: &TurnResponse) {
        self.turns
            .insert(turn.turn_id.number().to_string(), turn.clone());
    }
}
