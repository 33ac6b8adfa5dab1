//! The built-in templates, one per `(verification type, turn)`.

use optic_protocol::{TurnId, VerificationType};

/// A prompt template: a stable id and a body with `{{Name}}`
/// placeholders.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Template {
    /// Stable template identifier, recorded in the processor record.
    pub id: &'static str,
    /// Template body.
    pub body: &'static str,
}

/// Turn-1, layout-vs-checking: analyze the planogram reference image.
const TURN1_LAYOUT: Template = Template {
    id: "turn1-layout-reference-analysis",
    body: "\
You are looking at the planogram reference image for vending machine \
{{VendingMachineId}} at {{Location}}.

The machine has {{RowCount}} rows and {{ColumnCount}} columns; rows are \
labeled {{RowLabels}} from top to bottom.

Describe the machine contents row by row: for every position, name the \
product you can identify and note empty or unreadable slots. Respond in \
Markdown with a `# Reference Analysis` heading, one `## Row <label>` \
section per row, and a final `## Machine Structure` table with columns \
`Rows | Columns | Row Labels`.
",
};

/// Turn-1, previous-vs-current: analyze the previous snapshot.
const TURN1_PREVIOUS: Template = Template {
    id: "turn1-previous-snapshot-analysis",
    body: "\
You are looking at the previous verification snapshot of vending machine \
{{VendingMachineId}}.

The prior verification concluded: {{PreviousOutcome}}. Its summary was: \
{{PreviousSummary}}

Describe the machine contents row by row as they appear in this \
snapshot: for every position, name the product you can identify and \
note empty or unreadable slots. Respond in Markdown with a \
`# Reference Analysis` heading, one `## Row <label>` section per row, \
and a final `## Machine Structure` table with columns \
`Rows | Columns | Row Labels`.
",
};

/// Turn-2, layout-vs-checking: compare the checking photo against the
/// reference analysis.
const TURN2_LAYOUT: Template = Template {
    id: "turn2-layout-vs-checking-comparison",
    body: "\
This is the checking photo of vending machine {{VendingMachineId}} at \
{{Location}} ({{RowCount}} rows, {{ColumnCount}} columns, rows labeled \
{{RowLabels}}).

Your reference analysis from the previous turn was:

{{Turn1Analysis}}

Compare the checking photo position by position against the reference \
analysis. Report every mismatch: missing products, unexpected products, \
incorrect product types, and misplaced products.

Respond in Markdown with exactly this structure:

# Comparison Report

**Verification Outcome:** one of CORRECT, INCORRECT, PARTIAL, FAILED

## Comparison Summary
A short paragraph summarizing the comparison.

## Discrepancies
A table with columns `Item | Expected | Found | Type | Severity`, one \
row per mismatch (omit the section if there are none). `Type` is one of \
MISSING, UNEXPECTED, INCORRECT_TYPE, MISPLACED; `Severity` is HIGH, \
MEDIUM, or LOW.

## Machine Structure
A table with columns `Rows | Columns | Row Labels`.

## Row Status
A table with columns `Row | Status | Notes`, one row per shelf row.
",
};

/// Turn-2, previous-vs-current: compare the current photo against the
/// previous snapshot analysis.
const TURN2_PREVIOUS: Template = Template {
    id: "turn2-previous-vs-current-comparison",
    body: "\
This is the current photo of vending machine {{VendingMachineId}}.

Your analysis of the previous snapshot was:

{{Turn1Analysis}}

The prior verification concluded: {{PreviousOutcome}}. Its summary was: \
{{PreviousSummary}}

Compare the current photo position by position against the previous \
snapshot. Report every change: missing products, unexpected products, \
incorrect product types, and misplaced products.

Respond in Markdown with exactly this structure:

# Comparison Report

**Verification Outcome:** one of CORRECT, INCORRECT, PARTIAL, FAILED

## Comparison Summary
A short paragraph summarizing the comparison.

## Discrepancies
A table with columns `Item | Expected | Found | Type | Severity`, one \
row per mismatch (omit the section if there are none). `Type` is one of \
MISSING, UNEXPECTED, INCORRECT_TYPE, MISPLACED; `Severity` is HIGH, \
MEDIUM, or LOW.

## Machine Structure
A table with columns `Rows | Columns | Row Labels`.

## Row Status
A table with columns `Row | Status | Notes`, one row per shelf row.
",
};

/// Select the template for a `(verification type, turn)` pair.
pub fn select_template(verification_type: VerificationType, turn: TurnId) -> &'static Template {
    match (verification_type, turn) {
        (VerificationType::LayoutVsChecking, TurnId::Turn1) => &TURN1_LAYOUT,
        (VerificationType::PreviousVsCurrent, TurnId::Turn1) => &TURN1_PREVIOUS,
        (VerificationType::LayoutVsChecking, TurnId::Turn2) => &TURN2_LAYOUT,
        (VerificationType::PreviousVsCurrent, TurnId::Turn2) => &TURN2_PREVIOUS,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn selection_covers_all_pairs() {
        let ids: Vec<_> = [
            (VerificationType::LayoutVsChecking, TurnId::Turn1),
            (VerificationType::PreviousVsCurrent, TurnId::Turn1),
            (VerificationType::LayoutVsChecking, TurnId::Turn2),
            (VerificationType::PreviousVsCurrent, TurnId::Turn2),
        ]
        .into_iter()
        .map(|(vt, t)| select_template(vt, t).id)
        .collect();
        let mut unique = ids.clone();
        unique.sort_unstable();
        unique.dedup();
        assert_eq!(unique.len(), ids.len());
    }

    #[test]
    fn turn2_templates_fix_the_report_structure() {
        for vt in [
            VerificationType::LayoutVsChecking,
            VerificationType::PreviousVsCurrent,
        ] {
            let body = select_template(vt, TurnId::Turn2).body;
            assert!(body.contains("# Comparison Report"));
            assert!(body.contains("**Verification Outcome:**"));
            assert!(body.contains("## Discrepancies"));
            assert!(body.contains("{{Turn1Analysis}}"));
        }
    }
}
