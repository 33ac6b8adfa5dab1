//! Two-turn chain over swappable store backends.
//!
//! Demonstrates the composability the port split buys:
//!
//! 1. **Store swap**: the same worker drives a verification over the
//!    in-memory stores and over the filesystem stores.
//! 2. **Envelope chaining**: the Turn-1 outbound envelope is the
//!    Turn-2 inbound envelope; the Turn-2 worker picks up the Turn-1
//!    artifacts purely by reference.
//!
//! All tests run without network access: the model is scripted.

use chrono::{DateTime, TimeZone, Utc};
use optic_protocol::test_utils::ScriptedModelClient;
use optic_protocol::{
    ArtifactKeys, ArtifactStore, Envelope, ImageMetadata, ImageValidation, ImagesMetadata,
    LayoutMetadata, LogicalName, MachineStructure, TurnId, VerificationContext,
    VerificationOutcome, VerificationStatus, VerificationType, WorkflowConfig,
};
use optic_store_fs::{FsArtifactStore, FsMetaStore};
use optic_store_memory::{MemoryArtifactStore, MemoryMetaStore};
use optic_worker::StageWorker;
use std::collections::BTreeMap;
use std::sync::Arc;

const VERIFICATION_ID: &str = "verif-20250401123000";
const SYSTEM_PROMPT: &str = "You are a meticulous vending machine auditor.";

fn verification_at() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 4, 1, 12, 30, 0).unwrap()
}

fn context() -> VerificationContext {
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
                row_labels: vec!["A".into(), "B".into(), "C".into()],
            },
            product_position_map: BTreeMap::new(),
        }),
        historical_context: None,
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

const TURN1_ANALYSIS: &str = "# Reference Analysis\n\n## Row A\nCola 330ml in A1-A4.";

const TURN2_REPORT: &str = "\
# Comparison Report

**Verification Outcome:** INCORRECT

## Comparison Summary
A3 is empty where the planogram expects Cola 330ml.

## Discrepancies
| Item | Expected | Found | Type | Severity |
| --- | --- | --- | --- | --- |
| A3 | Cola 330ml | (empty) | MISSING | HIGH |
";

fn scripted_model() -> Arc<ScriptedModelClient> {
    let model = Arc::new(ScriptedModelClient::new());
    model.push_response(ScriptedModelClient::text_response(TURN1_ANALYSIS));
    model.push_response(ScriptedModelClient::text_response(TURN2_REPORT));
    model
}

/// Build the Initialize-stage envelope after seeding the artifacts via
/// the given raw writer.
async fn seed_envelope<F, Fut>(mut put: F) -> Envelope
where
    F: FnMut(String, String) -> Fut,
    Fut: std::future::Future<Output = optic_protocol::Reference>,
{
    let keys = ArtifactKeys::new(VERIFICATION_ID, verification_at());
    let mut envelope = Envelope::new(VERIFICATION_ID, VerificationStatus::ImagesFetched);

    envelope.set_reference(
        LogicalName::ProcessingInitialization,
        put(
            keys.key(LogicalName::ProcessingInitialization),
            serde_json::to_string_pretty(&context()).unwrap(),
        )
        .await,
    );
    let images = ImagesMetadata {
        reference_image: image_metadata(keys.key(LogicalName::ImagesReferenceBase64)),
        checking_image: image_metadata(keys.key(LogicalName::ImagesCheckingBase64)),
    };
    envelope.set_reference(
        LogicalName::ImagesMetadata,
        put(
            keys.key(LogicalName::ImagesMetadata),
            serde_json::to_string_pretty(&images).unwrap(),
        )
        .await,
    );
    envelope.set_reference(
        LogicalName::ImagesReferenceBase64,
        put(
            keys.key(LogicalName::ImagesReferenceBase64),
            "UkVGSU1BR0U=".into(),
        )
        .await,
    );
    envelope.set_reference(
        LogicalName::ImagesCheckingBase64,
        put(
            keys.key(LogicalName::ImagesCheckingBase64),
            "Q0hLSU1BR0U=".into(),
        )
        .await,
    );
    envelope.set_reference(
        LogicalName::PromptsSystem,
        put(
            keys.key(LogicalName::PromptsSystem),
            serde_json::json!({ "content": SYSTEM_PROMPT }).to_string(),
        )
        .await,
    );
    envelope
}

#[tokio::test]
async fn two_turn_chain_over_memory_stores() {
    let config = Arc::new(WorkflowConfig::new(
        "artifacts",
        "verifications",
        "conversations",
        "model-x",
    ));
    let artifacts = Arc::new(MemoryArtifactStore::new(
        "artifacts",
        config.max_image_size_bytes,
    ));
    let meta = Arc::new(MemoryMetaStore::new());

    let envelope = {
        let artifacts = artifacts.clone();
        seed_envelope(move |key, content| {
            let artifacts = artifacts.clone();
            async move { artifacts.put_text(key, content).await }
        })
        .await
    };

    let worker = StageWorker::new(config, artifacts, meta.clone(), scripted_model());

    let after_turn1 = worker.handle(TurnId::Turn1, envelope).await.unwrap();
    assert_eq!(after_turn1.status, VerificationStatus::Turn1Completed);
    assert!(
        after_turn1
            .references
            .contains_key(&LogicalName::ResponsesTurn1Raw)
    );

    let after_turn2 = worker.handle(TurnId::Turn2, after_turn1).await.unwrap();
    assert_eq!(after_turn2.status, VerificationStatus::Turn2Completed);
    assert_eq!(after_turn2.summary["verificationOutcome"], "INCORRECT");
    assert_eq!(after_turn2.summary["discrepanciesFound"], 1);

    let row = meta.verification_row(VERIFICATION_ID).await.unwrap();
    assert_eq!(row.verification_outcome, Some(VerificationOutcome::Incorrect));
}

#[tokio::test]
async fn two_turn_chain_over_filesystem_stores() {
    let dir = tempfile::tempdir().unwrap();
    let config = Arc::new(WorkflowConfig::new(
        "artifacts",
        "verifications",
        "conversations",
        "model-x",
    ));
    let artifacts = Arc::new(FsArtifactStore::new(
        dir.path(),
        "artifacts",
        config.max_image_size_bytes,
    ));
    let meta = Arc::new(FsMetaStore::new(
        dir.path(),
        "verifications",
        "conversations",
    ));

    let envelope = {
        let root = dir.path().to_path_buf();
        seed_envelope(move |key, content| {
            let root = root.clone();
            async move {
                let path = root.join("artifacts").join(&key);
                tokio::fs::create_dir_all(path.parent().unwrap())
                    .await
                    .unwrap();
                tokio::fs::write(&path, &content).await.unwrap();
                optic_protocol::Reference::new("artifacts", key, content.len() as u64)
            }
        })
        .await
    };

    let worker = StageWorker::new(config, artifacts.clone(), meta.clone(), scripted_model());

    let after_turn1 = worker.handle(TurnId::Turn1, envelope).await.unwrap();
    assert_eq!(after_turn1.status, VerificationStatus::Turn1Completed);

    let after_turn2 = worker.handle(TurnId::Turn2, after_turn1).await.unwrap();
    assert_eq!(after_turn2.status, VerificationStatus::Turn2Completed);
    assert_eq!(after_turn2.summary["verificationOutcome"], "INCORRECT");

    // The artifacts really are on disk under the production key layout.
    let raw = artifacts
        .load_json(
            after_turn2
                .references
                .get(&LogicalName::ResponsesTurn2Raw)
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(raw["turnId"], "2");

    let row = meta
        .verification_row(VERIFICATION_ID)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(row.current_status, VerificationStatus::Turn2Completed);
}
