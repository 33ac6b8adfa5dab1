//! The verification context and its embedded metadata records.

use crate::error::{ErrorCategory, WorkflowError};
use crate::parsed::{Discrepancy, VerificationOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The two supported verification types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationType {
    /// Compare a planogram layout against a captured photo.
    LayoutVsChecking,
    /// Compare the previous snapshot against the current one.
    PreviousVsCurrent,
}

impl VerificationType {
    /// The wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationType::LayoutVsChecking => "LAYOUT_VS_CHECKING",
            VerificationType::PreviousVsCurrent => "PREVIOUS_VS_CURRENT",
        }
    }
}

impl fmt::Display for VerificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Physical shelf structure of a vending machine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStructure {
    /// Number of shelf rows.
    pub row_count: u32,
    /// Number of columns per row.
    pub column_count: u32,
    /// Row labels, top to bottom (e.g. `A`, `B`, `C`).
    pub row_labels: Vec<String>,
}

/// Planogram metadata for a layout-vs-checking verification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayoutMetadata {
    /// Layout identifier. Positive for a valid layout.
    pub layout_id: i64,
    /// Layout storage prefix.
    pub layout_prefix: String,
    /// The machine the layout belongs to.
    pub vending_machine_id: String,
    /// Human-readable machine location.
    #[serde(default)]
    pub location: String,
    /// Shelf structure.
    pub machine_structure: MachineStructure,
    /// Position → product-name map (e.g. `A3` → `Cola 330ml`).
    #[serde(default)]
    pub product_position_map: BTreeMap<String, String>,
}

/// Validation block of an image metadata record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageValidation {
    /// Whether the stored image is compatible with the model's input
    /// constraints.
    pub model_compatible: bool,
}

/// Storage metadata for one image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageMetadata {
    /// Bucket holding the stored base64 payload.
    pub storage_bucket: String,
    /// Key of the stored base64 payload.
    pub storage_key: String,
    /// Stored (encoded) size in bytes.
    pub stored_size: u64,
    /// Content type of the original upload.
    pub original_content_type: String,
    /// Key the image was originally uploaded under.
    #[serde(default)]
    pub source_key: String,
    /// Validation results.
    pub validation: ImageValidation,
}

impl ImageMetadata {
    /// The image format token expected by the model (`jpeg`, `png`, …),
    /// derived from the original content type.
    pub fn image_format(&self) -> &str {
        self.original_content_type
            .rsplit('/')
            .next()
            .unwrap_or("jpeg")
    }
}

/// The `images/metadata.json` artifact: metadata for both images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagesMetadata {
    /// The reference (or previous) image.
    pub reference_image: ImageMetadata,
    /// The checking (or current) image.
    pub checking_image: ImageMetadata,
}

/// Summary of a prior verification, for previous-vs-current comparisons.
///
/// When no prior verification exists the context is synthesized empty and
/// the verification passes through `HISTORICAL_CONTEXT_NOT_FOUND`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoricalContext {
    /// The prior verification's id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    /// When the prior verification ran.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_at: Option<DateTime<Utc>>,
    /// The prior verification's outcome.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_outcome: Option<VerificationOutcome>,
    /// The prior verification's comparison summary.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_summary: Option<String>,
    /// Discrepancies found by the prior verification.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub previous_discrepancies: Vec<Discrepancy>,
}

impl HistoricalContext {
    /// The synthesized empty context used when no prior verification
    /// exists.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Whether this context carries any prior data.
    pub fn is_empty(&self) -> bool {
        self.previous_verification_id.is_none()
            && self.previous_outcome.is_none()
            && self.previous_summary.is_none()
            && self.previous_discrepancies.is_empty()
    }
}

/// Everything bound at Initialize and carried through both turns.
///
/// The `processing/initialization.json` artifact is this record,
/// serialized.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationContext {
    /// Stable verification identifier.
    #[serde(default)]
    pub verification_id: String,
    /// When the verification was requested.
    pub verification_at: DateTime<Utc>,
    /// The comparison being performed.
    pub verification_type: VerificationType,
    /// Source URL of the reference (or previous) image.
    #[serde(default)]
    pub reference_image_url: String,
    /// Source URL of the checking (or current) image.
    #[serde(default)]
    pub checking_image_url: String,
    /// The machine under verification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vending_machine_id: Option<String>,
    /// Layout identifier (layout-vs-checking).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_id: Option<i64>,
    /// Layout storage prefix (layout-vs-checking).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_prefix: Option<String>,
    /// Prior verification id (previous-vs-current).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_verification_id: Option<String>,
    /// Embedded planogram metadata (layout-vs-checking).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub layout_metadata: Option<LayoutMetadata>,
    /// Embedded historical context (previous-vs-current).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub historical_context: Option<HistoricalContext>,
}

impl VerificationContext {
    /// Validate the context invariants.
    ///
    /// A layout-vs-checking verification must carry a positive layout id
    /// and a non-empty layout prefix. A previous-vs-current verification
    /// has no required optional field: a missing prior verification is
    /// represented by an empty historical context.
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.verification_type == VerificationType::LayoutVsChecking {
            if self.layout_id.unwrap_or(0) <= 0 {
                return Err(WorkflowError::new(
                    ErrorCategory::Validation,
                    "INVALID_LAYOUT_ID",
                    "layout-vs-checking verification requires a positive layoutId",
                )
                .with_verification_id(self.verification_id.clone()));
            }
            if self.layout_prefix.as_deref().unwrap_or("").is_empty() {
                return Err(WorkflowError::new(
                    ErrorCategory::Validation,
                    "MISSING_LAYOUT_PREFIX",
                    "layout-vs-checking verification requires a layoutPrefix",
                )
                .with_verification_id(self.verification_id.clone()));
            }
        }
        Ok(())
    }
}
