//! In-memory metadata store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use optic_protocol::{
    ConversationRow, Discrepancy, ErrorCategory, ErrorTracking, MetaStore, ProcessingMetrics,
    Reference, StatusHistoryEntry, TurnResponse, VerificationOutcome, VerificationRow,
    WorkflowError, require_verification_id,
};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Operations a [`MemoryMetaStore`] can be scripted to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetaOp {
    /// [`MetaStore::update_status`].
    UpdateStatus,
    /// [`MetaStore::update_conversation_turn`].
    UpdateConversationTurn,
    /// [`MetaStore::update_turn1_completion`].
    UpdateTurn1Completion,
    /// [`MetaStore::update_turn2_completion`].
    UpdateTurn2Completion,
    /// [`MetaStore::update_error_tracking`].
    UpdateErrorTracking,
}

/// In-memory metadata store: verification and conversation rows behind a
/// `RwLock`, merged through the shared monotonic-row helpers.
#[derive(Default)]
pub struct MemoryMetaStore {
    rows: RwLock<HashMap<String, VerificationRow>>,
    conversations: RwLock<HashMap<String, ConversationRow>>,
    failures: RwLock<HashMap<MetaOp, u32>>,
}

impl MemoryMetaStore {
    /// An empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Script the next `times` occurrences of `op` to fail with a
    /// transient METASTORE error.
    pub async fn fail_next(&self, op: MetaOp, times: u32) {
        self.failures.write().await.insert(op, times);
    }

    /// Inspect a verification row.
    pub async fn verification_row(&self, verification_id: &str) -> Option<VerificationRow> {
        self.rows.read().await.get(verification_id).cloned()
    }

    /// Inspect a conversation row.
    pub async fn conversation_row(&self, verification_id: &str) -> Option<ConversationRow> {
        self.conversations.read().await.get(verification_id).cloned()
    }

    async fn consume_failure(&self, op: MetaOp) -> Result<(), WorkflowError> {
        let mut failures = self.failures.write().await;
        if let Some(remaining) = failures.get_mut(&op) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(WorkflowError::new(
                    ErrorCategory::Metastore,
                    "META_UPDATE_FAILED",
                    format!("scripted transient failure for {op:?}"),
                )
                .with_component("memory_meta_store"));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl MetaStore for MemoryMetaStore {
    async fn update_status(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.consume_failure(MetaOp::UpdateStatus).await?;
        let mut rows = self.rows.write().await;
        let row = rows.entry(verification_id.to_string()).or_insert_with(|| {
            VerificationRow::minimal(verification_id, verification_at, entry.status)
        });
        row.apply_status(entry);
        Ok(())
    }

    async fn update_conversation_turn(
        &self,
        verification_id: &str,
        turn: &TurnResponse,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.consume_failure(MetaOp::UpdateConversationTurn).await?;
        let mut conversations = self.conversations.write().await;
        let row = conversations
            .entry(verification_id.to_string())
            .or_insert_with(|| ConversationRow::new(verification_id));
        row.upsert_turn(turn);
        Ok(())
    }

    async fn update_turn1_completion(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
        metrics: &ProcessingMetrics,
        processed_ref: &Reference,
        conversation_ref: &Reference,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.consume_failure(MetaOp::UpdateTurn1Completion).await?;
        let mut rows = self.rows.write().await;
        let row = rows.entry(verification_id.to_string()).or_insert_with(|| {
            VerificationRow::minimal(verification_id, verification_at, entry.status)
        });
        row.apply_turn1_completion(entry, metrics, processed_ref, conversation_ref);
        Ok(())
    }

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
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.consume_failure(MetaOp::UpdateTurn2Completion).await?;
        let mut rows = self.rows.write().await;
        let row = rows.entry(verification_id.to_string()).or_insert_with(|| {
            VerificationRow::minimal(verification_id, verification_at, entry.status)
        });
        row.apply_turn2_completion(
            entry,
            metrics,
            processed_ref,
            outcome,
            discrepancies,
            comparison_summary,
            conversation_ref,
        );
        Ok(())
    }

    async fn update_error_tracking(
        &self,
        verification_id: &str,
        tracking: &ErrorTracking,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.consume_failure(MetaOp::UpdateErrorTracking).await?;
        let mut rows = self.rows.write().await;
        if let Some(row) = rows.get_mut(verification_id) {
            // Monotonic merge: keep existing history, append the new one.
            match row.error_tracking.as_mut() {
                Some(existing) => {
                    existing.has_errors = true;
                    existing.current_error = tracking.current_error.clone();
                    existing.last_error_at = tracking.last_error_at;
                    existing
                        .error_history
                        .extend(tracking.error_history.iter().cloned());
                }
                None => row.error_tracking = Some(tracking.clone()),
            }
        } else {
            let mut row = VerificationRow::minimal(
                verification_id,
                tracking.last_error_at,
                optic_protocol::VerificationStatus::VerificationRequested,
            );
            row.error_tracking = Some(tracking.clone());
            rows.insert(verification_id.to_string(), row);
        }
        Ok(())
    }
}
