#![deny(missing_docs)]
//! Parsing and rendering of the model's Turn-2 comparison report.
//!
//! The model is instructed to answer with a fixed Markdown structure: a
//! `# Comparison Report` heading, a bolded outcome line, a summary
//! section, and up to three tables (discrepancies, machine structure,
//! row status). [`extract_comparison_markdown`] cuts that report out of
//! whatever prose surrounds it; [`parse_turn2_markdown`] turns it into a
//! [`ParsedTurn2`]; [`render_turn2_markdown`] emits the canonical form
//! back, so `parse(render(x))` preserves the outcome, the discrepancy
//! set, and the summary modulo whitespace.

mod parse;
mod render;

pub use parse::{extract_comparison_markdown, parse_turn2_markdown};
pub use render::render_turn2_markdown;

use optic_protocol::{ErrorCategory, WorkflowError};
use thiserror::Error;

/// Comparison-report parse failures. All are CONVERSION errors: the
/// model's answer is already on disk and re-parsing it cannot change it.
#[derive(Debug, Error)]
pub enum MarkdownError {
    /// No heading containing "Comparison" was found.
    #[error("response contains no comparison section")]
    MissingComparisonSection,

    /// The report carries no outcome line.
    #[error("comparison report has no verification outcome line")]
    MissingOutcome,

    /// The outcome line does not name a known outcome.
    #[error("unknown verification outcome: {0}")]
    InvalidOutcome(String),

    /// A discrepancy table row could not be parsed.
    #[error("invalid discrepancy row: {0}")]
    InvalidDiscrepancyRow(String),
}

impl From<MarkdownError> for WorkflowError {
    fn from(error: MarkdownError) -> Self {
        WorkflowError::new(
            ErrorCategory::Conversion,
            "PARSE_TURN2_MARKDOWN_ERROR",
            error.to_string(),
        )
        .with_component("response_parser")
        .with_source(error)
    }
}
