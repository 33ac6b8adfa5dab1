//! Structured results parsed from the model's Turn-2 comparison report.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Final verdict of a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationOutcome {
    /// The checking image matches expectations.
    Correct,
    /// At least one position-level mismatch.
    Incorrect,
    /// Some positions could not be assessed.
    Partial,
    /// The comparison could not be completed.
    Failed,
}

impl VerificationOutcome {
    /// The wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationOutcome::Correct => "CORRECT",
            VerificationOutcome::Incorrect => "INCORRECT",
            VerificationOutcome::Partial => "PARTIAL",
            VerificationOutcome::Failed => "FAILED",
        }
    }
}

impl fmt::Display for VerificationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for VerificationOutcome {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "CORRECT" => Ok(VerificationOutcome::Correct),
            "INCORRECT" => Ok(VerificationOutcome::Incorrect),
            "PARTIAL" => Ok(VerificationOutcome::Partial),
            "FAILED" => Ok(VerificationOutcome::Failed),
            other => Err(format!("unknown verification outcome: {other}")),
        }
    }
}

/// Kind of a position-level mismatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancyKind {
    /// The expected product is absent.
    Missing,
    /// A product is present where none was expected.
    Unexpected,
    /// A different product occupies the position.
    IncorrectType,
    /// The expected product sits in a different position.
    Misplaced,
}

impl DiscrepancyKind {
    /// The wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancyKind::Missing => "MISSING",
            DiscrepancyKind::Unexpected => "UNEXPECTED",
            DiscrepancyKind::IncorrectType => "INCORRECT_TYPE",
            DiscrepancyKind::Misplaced => "MISPLACED",
        }
    }
}

impl fmt::Display for DiscrepancyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscrepancyKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let token = s.trim().to_ascii_uppercase().replace(' ', "_");
        match token.as_str() {
            "MISSING" => Ok(DiscrepancyKind::Missing),
            "UNEXPECTED" => Ok(DiscrepancyKind::Unexpected),
            "INCORRECT_TYPE" => Ok(DiscrepancyKind::IncorrectType),
            "MISPLACED" => Ok(DiscrepancyKind::Misplaced),
            other => Err(format!("unknown discrepancy type: {other}")),
        }
    }
}

/// Severity assigned to a discrepancy by the model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DiscrepancySeverity {
    /// Business-critical mismatch.
    High,
    /// Notable mismatch.
    Medium,
    /// Cosmetic mismatch.
    Low,
}

impl DiscrepancySeverity {
    /// The wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            DiscrepancySeverity::High => "HIGH",
            DiscrepancySeverity::Medium => "MEDIUM",
            DiscrepancySeverity::Low => "LOW",
        }
    }
}

impl fmt::Display for DiscrepancySeverity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DiscrepancySeverity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "HIGH" => Ok(DiscrepancySeverity::High),
            "MEDIUM" => Ok(DiscrepancySeverity::Medium),
            "LOW" => Ok(DiscrepancySeverity::Low),
            other => Err(format!("unknown discrepancy severity: {other}")),
        }
    }
}

/// A single position-level mismatch reported by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Discrepancy {
    /// Position or product the mismatch concerns (e.g. `A3`).
    pub item: String,
    /// What the reference expects there.
    pub expected: String,
    /// What the checking image shows.
    pub found: String,
    /// Kind of mismatch.
    #[serde(rename = "type")]
    pub kind: DiscrepancyKind,
    /// Severity assigned by the model.
    pub severity: DiscrepancySeverity,
}

/// Machine structure as observed by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineStructureReport {
    /// Observed number of rows.
    pub row_count: u32,
    /// Observed number of columns.
    pub column_count: u32,
    /// Observed row labels, top to bottom.
    #[serde(default)]
    pub row_labels: Vec<String>,
}

/// Per-row status reported by the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RowStatusEntry {
    /// Row label.
    pub row: String,
    /// Row-level status (free text, e.g. `OK`, `2 empty slots`).
    pub status: String,
    /// Additional notes.
    #[serde(default)]
    pub notes: String,
}

/// Everything parsed out of the Turn-2 comparison report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedTurn2 {
    /// The model's verdict before business-rule interpretation.
    pub verification_outcome: VerificationOutcome,
    /// The model's comparison summary.
    pub comparison_summary: String,
    /// Position-level mismatches.
    #[serde(default)]
    pub discrepancies: Vec<Discrepancy>,
    /// Observed machine structure, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub machine_structure: Option<MachineStructureReport>,
    /// Per-row status table, when reported.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub row_status: Vec<RowStatusEntry>,
}
