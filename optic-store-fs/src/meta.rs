//! Filesystem metadata store.

use crate::{io_error, write_atomic};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use optic_protocol::{
    ConversationRow, Discrepancy, ErrorCategory, ErrorTracking, MetaStore, ProcessingMetrics,
    Reference, StatusHistoryEntry, TurnResponse, VerificationOutcome, VerificationRow,
    VerificationStatus, WorkflowError, require_verification_id,
};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Filesystem-backed metadata store.
///
/// One JSON document per row:
/// ```text
/// root/
///   <verification-table>/<encoded-id>.json
///   <conversation-table>/<encoded-id>.json
/// ```
///
/// Updates are read-modify-write under a process-wide lock; cross-process
/// serialization per verification is the orchestrator's responsibility.
pub struct FsMetaStore {
    root: PathBuf,
    verification_table: String,
    conversation_table: String,
    write_lock: Mutex<()>,
}

/// Encode a row id into a safe filename.
fn id_to_filename(id: &str) -> String {
    let mut encoded = String::new();
    for ch in id.chars() {
        match ch {
            'a'..='z' | 'A'..='Z' | '0'..='9' | '-' | '_' | '.' => encoded.push(ch),
            _ => {
                for byte in ch.to_string().as_bytes() {
                    encoded.push_str(&format!("%{byte:02X}"));
                }
            }
        }
    }
    format!("{encoded}.json")
}

impl FsMetaStore {
    /// Create a store rooted at the given directory with the two table
    /// names from configuration.
    pub fn new(
        root: &Path,
        verification_table: impl Into<String>,
        conversation_table: impl Into<String>,
    ) -> Self {
        Self {
            root: root.to_path_buf(),
            verification_table: verification_table.into(),
            conversation_table: conversation_table.into(),
            write_lock: Mutex::new(()),
        }
    }

    fn row_path(&self, table: &str, id: &str) -> PathBuf {
        self.root.join(table).join(id_to_filename(id))
    }

    async fn read_row<T: DeserializeOwned>(
        &self,
        table: &str,
        id: &str,
    ) -> Result<Option<T>, WorkflowError> {
        let path = self.row_path(table, id);
        match tokio::fs::read_to_string(&path).await {
            Ok(contents) => serde_json::from_str(&contents).map(Some).map_err(|e| {
                WorkflowError::new(
                    ErrorCategory::Metastore,
                    "META_ROW_DECODE_FAILED",
                    format!("row {id} in {table} is not valid: {e}"),
                )
                .non_retryable()
                .with_component("fs_meta_store")
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e).with_component("fs_meta_store")),
        }
    }

    async fn write_row<T: Serialize>(
        &self,
        table: &str,
        id: &str,
        row: &T,
    ) -> Result<(), WorkflowError> {
        let content = serde_json::to_string_pretty(row).map_err(|e| {
            WorkflowError::new(
                ErrorCategory::Metastore,
                "META_ROW_ENCODE_FAILED",
                e.to_string(),
            )
            .non_retryable()
        })?;
        write_atomic(&self.row_path(table, id), &content).await
    }

    async fn modify_verification_row<F>(
        &self,
        id: &str,
        default_status: VerificationStatus,
        verification_at: DateTime<Utc>,
        apply: F,
    ) -> Result<(), WorkflowError>
    where
        F: FnOnce(&mut VerificationRow),
    {
        let _guard = self.write_lock.lock().await;
        let mut row: VerificationRow = self
            .read_row(&self.verification_table, id)
            .await?
            .unwrap_or_else(|| VerificationRow::minimal(id, verification_at, default_status));
        apply(&mut row);
        self.write_row(&self.verification_table, id, &row).await
    }

    /// Inspect a verification row.
    pub async fn verification_row(
        &self,
        verification_id: &str,
    ) -> Result<Option<VerificationRow>, WorkflowError> {
        self.read_row(&self.verification_table, verification_id)
            .await
    }

    /// Inspect a conversation row.
    pub async fn conversation_row(
        &self,
        verification_id: &str,
    ) -> Result<Option<ConversationRow>, WorkflowError> {
        self.read_row(&self.conversation_table, verification_id)
            .await
    }
}

#[async_trait]
impl MetaStore for FsMetaStore {
    async fn update_status(
        &self,
        verification_id: &str,
        verification_at: DateTime<Utc>,
        entry: &StatusHistoryEntry,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.modify_verification_row(verification_id, entry.status, verification_at, |row| {
            row.apply_status(entry);
        })
        .await
    }

    async fn update_conversation_turn(
        &self,
        verification_id: &str,
        turn: &TurnResponse,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        let _guard = self.write_lock.lock().await;
        let mut row: ConversationRow = self
            .read_row(&self.conversation_table, verification_id)
            .await?
            .unwrap_or_else(|| ConversationRow::new(verification_id));
        row.upsert_turn(turn);
        self.write_row(&self.conversation_table, verification_id, &row)
            .await
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
        self.modify_verification_row(verification_id, entry.status, verification_at, |row| {
            row.apply_turn1_completion(entry, metrics, processed_ref, conversation_ref);
        })
        .await
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
        self.modify_verification_row(verification_id, entry.status, verification_at, |row| {
            row.apply_turn2_completion(
                entry,
                metrics,
                processed_ref,
                outcome,
                discrepancies,
                comparison_summary,
                conversation_ref,
            );
        })
        .await
    }

    async fn update_error_tracking(
        &self,
        verification_id: &str,
        tracking: &ErrorTracking,
    ) -> Result<(), WorkflowError> {
        require_verification_id(verification_id)?;
        self.modify_verification_row(
            verification_id,
            VerificationStatus::VerificationRequested,
            tracking.last_error_at,
            |row| match row.error_tracking.as_mut() {
                Some(existing) => {
                    existing.has_errors = true;
                    existing.current_error = tracking.current_error.clone();
                    existing.last_error_at = tracking.last_error_at;
                    existing
                        .error_history
                        .extend(tracking.error_history.iter().cloned());
                }
                None => row.error_tracking = Some(tracking.clone()),
            },
        )
        .await
    }
}
