//! Protocol types and ports for the optic visual verification workflow.
//!
//! A verification compares two images of a vending machine (a planogram
//! reference against a captured photo, or a previous snapshot against the
//! current one) through a two-turn conversation with a multimodal model.
//! Stage workers are stateless; everything they exchange travels by
//! reference through a shared artifact store and a metadata store.
//!
//! This crate is the bottom of the dependency graph. It defines:
//!
//! - the on-wire [`Envelope`] and the typed reference map
//!   ([`LogicalName`] → [`Reference`]),
//! - the verification data model ([`VerificationContext`],
//!   [`TurnResponse`], [`ParsedTurn2`], …),
//! - the status machine ([`VerificationStatus`]) and its legal
//!   transitions,
//! - the [`WorkflowError`] taxonomy with per-category retry
//!   classification,
//! - the three ports every worker consumes: [`ArtifactStore`],
//!   [`MetaStore`], and [`ModelClient`],
//! - startup [`WorkflowConfig`].
//!
//! Adapters live in sibling crates (`optic-store-fs`, `optic-store-memory`,
//! `optic-model-anthropic`); the combined stage worker lives in
//! `optic-worker`.

pub mod config;
pub mod context;
pub mod envelope;
pub mod error;
pub mod parsed;
pub mod ports;
pub mod reference;
pub mod status;
pub mod turn;

#[cfg(feature = "test-utils")]
pub mod test_utils;

pub use config::{LogLevel, WorkflowConfig};
pub use context::{
    HistoricalContext, ImageMetadata, ImageValidation, ImagesMetadata, LayoutMetadata,
    MachineStructure, VerificationContext, VerificationType,
};
pub use envelope::{Envelope, SCHEMA_VERSION};
pub use error::{
    ErrorCategory, ErrorInfo, ErrorRecord, ErrorSeverity, ErrorTracking, RetryStrategy,
    WorkflowError, classify_model_failure,
};
pub use parsed::{
    Discrepancy, DiscrepancyKind, DiscrepancySeverity, MachineStructureReport, ParsedTurn2,
    RowStatusEntry, VerificationOutcome,
};
pub use ports::{
    ArtifactStore, ConversationRow, MetaStore, ModelClient, ModelResponse, VerificationRow,
    decoded_base64_len, require_verification_id, validate_image_size,
};
pub use reference::{ArtifactKeys, LogicalName, Reference};
pub use status::{StatusHistoryEntry, VerificationStatus};
pub use turn::{
    AnalysisStage, ConversationBlock, ConversationMessage, ConversationRecord, ConversationRole,
    ModelOutput, ProcessingMetrics, TemplateProcessor, TokenUsage, TurnId, TurnRequest,
    TurnResponse,
};
