//! Business-rule interpretation of parsed discrepancies.

use optic_protocol::{
    DiscrepancyKind, DiscrepancySeverity, ErrorCategory, ParsedTurn2, VerificationOutcome,
    WorkflowError,
};

/// The refined verdict after the business rules ran.
#[derive(Debug, Clone, PartialEq)]
pub struct Interpretation {
    /// Final outcome, possibly escalated from the parsed one.
    pub final_outcome: VerificationOutcome,
    /// Comparison summary, extended when the outcome changed.
    pub comparison_summary: String,
    /// Whether a business rule changed the parsed outcome.
    pub escalated: bool,
}

/// Apply the business rules to a parsed comparison result.
///
/// Deterministic; a pure function of the parsed data and the configured
/// threshold. Rules, in order:
///
/// 1. any HIGH-severity discrepancy forces `INCORRECT`;
/// 2. with a positive threshold, `MISSING`/`MISPLACED` discrepancies at
///    or above it force `INCORRECT`;
/// 3. an escalated outcome appends an assessment sentence to the
///    summary.
///
/// A missing parse (`None`) is a CONVERSION error; the caller reports
/// the verification as `FAILED`.
pub fn interpret(
    parsed: Option<&ParsedTurn2>,
    discrepancy_threshold: u32,
) -> Result<Interpretation, WorkflowError> {
    let Some(parsed) = parsed else {
        return Err(WorkflowError::new(
            ErrorCategory::Conversion,
            "NO_PARSED_DATA",
            "no parsed comparison data to interpret",
        )
        .with_component("discrepancy_interpreter"));
    };

    let mut final_outcome = parsed.verification_outcome;
    let mut comparison_summary = parsed.comparison_summary.clone();

    if parsed
        .discrepancies
        .iter()
        .any(|d| d.severity == DiscrepancySeverity::High)
    {
        final_outcome = VerificationOutcome::Incorrect;
    }

    let position_errors = parsed
        .discrepancies
        .iter()
        .filter(|d| matches!(d.kind, DiscrepancyKind::Missing | DiscrepancyKind::Misplaced))
        .count() as u32;
    if discrepancy_threshold > 0 && position_errors >= discrepancy_threshold {
        final_outcome = VerificationOutcome::Incorrect;
    }

    let escalated = final_outcome != parsed.verification_outcome;
    if escalated {
        if !comparison_summary.is_empty() && !comparison_summary.ends_with(char::is_whitespace) {
            comparison_summary.push(' ');
        }
        comparison_summary.push_str(&format!(
            "Assessment: {final_outcome} due to {} discrepancies.",
            parsed.discrepancies.len()
        ));
    }

    Ok(Interpretation {
        final_outcome,
        comparison_summary,
        escalated,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use optic_protocol::Discrepancy;

    fn discrepancy(kind: DiscrepancyKind, severity: DiscrepancySeverity) -> Discrepancy {
        Discrepancy {
            item: "A3".into(),
            expected: "Cola".into(),
            found: "(empty)".into(),
            kind,
            severity,
        }
    }

    fn parsed(
        outcome: VerificationOutcome,
        discrepancies: Vec<Discrepancy>,
    ) -> ParsedTurn2 {
        ParsedTurn2 {
            verification_outcome: outcome,
            comparison_summary: "Two deviations in row A.".into(),
            discrepancies,
            machine_structure: None,
            row_status: vec![],
        }
    }

    #[test]
    fn high_severity_forces_incorrect() {
        let data = parsed(
            VerificationOutcome::Correct,
            vec![discrepancy(
                DiscrepancyKind::Unexpected,
                DiscrepancySeverity::High,
            )],
        );
        let result = interpret(Some(&data), 0).unwrap();
        assert_eq!(result.final_outcome, VerificationOutcome::Incorrect);
        assert!(result.escalated);
        assert!(
            result
                .comparison_summary
                .ends_with("Assessment: INCORRECT due to 1 discrepancies.")
        );
    }

    #[test]
    fn threshold_counts_missing_and_misplaced_only() {
        let data = parsed(
            VerificationOutcome::Partial,
            vec![
                discrepancy(DiscrepancyKind::Missing, DiscrepancySeverity::Low),
                discrepancy(DiscrepancyKind::Misplaced, DiscrepancySeverity::Low),
                discrepancy(DiscrepancyKind::Unexpected, DiscrepancySeverity::Low),
            ],
        );
        // Three discrepancies, but only two count toward the threshold.
        let unchanged = interpret(Some(&data), 3).unwrap();
        assert_eq!(unchanged.final_outcome, VerificationOutcome::Partial);
        assert!(!unchanged.escalated);

        let escalated = interpret(Some(&data), 2).unwrap();
        assert_eq!(escalated.final_outcome, VerificationOutcome::Incorrect);
    }

    #[test]
    fn zero_threshold_disables_the_count_rule() {
        let data = parsed(
            VerificationOutcome::Correct,
            vec![
                discrepancy(DiscrepancyKind::Missing, DiscrepancySeverity::Medium),
                discrepancy(DiscrepancyKind::Missing, DiscrepancySeverity::Medium),
            ],
        );
        let result = interpret(Some(&data), 0).unwrap();
        assert_eq!(result.final_outcome, VerificationOutcome::Correct);
        assert_eq!(result.comparison_summary, "Two deviations in row A.");
    }

    #[test]
    fn parsed_outcome_passes_through_unchanged() {
        let data = parsed(VerificationOutcome::Failed, vec![]);
        let result = interpret(Some(&data), 0).unwrap();
        assert_eq!(result.final_outcome, VerificationOutcome::Failed);
        assert!(!result.escalated);
    }

    #[test]
    fn missing_parse_is_a_conversion_error() {
        let err = interpret(None, 0).unwrap_err();
        assert_eq!(err.category, ErrorCategory::Conversion);
        assert!(!err.retryable());
    }

    #[test]
    fn interpretation_is_deterministic() {
        let data = parsed(
            VerificationOutcome::Correct,
            vec![discrepancy(
                DiscrepancyKind::Missing,
                DiscrepancySeverity::High,
            )],
        );
        let a = interpret(Some(&data), 2).unwrap();
        let b = interpret(Some(&data), 2).unwrap();
        assert_eq!(a, b);
    }
}
