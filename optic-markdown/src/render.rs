//! Canonical rendering of a parsed comparison report.

use optic_protocol::ParsedTurn2;

/// Render a [`ParsedTurn2`] back into the canonical report form.
///
/// Sections without data are omitted; `parse_turn2_markdown` treats a
/// missing section as empty, so rendering then parsing preserves the
/// outcome, the discrepancy set, and the summary modulo whitespace.
pub fn render_turn2_markdown(parsed: &ParsedTurn2) -> String {
    let mut out = String::new();
    out.push_str("# Comparison Report\n\n");
    out.push_str(&format!(
        "**Verification Outcome:** {}\n",
        parsed.verification_outcome
    ));

    if !parsed.comparison_summary.trim().is_empty() {
        out.push_str("\n## Comparison Summary\n");
        out.push_str(parsed.comparison_summary.trim());
        out.push('\n');
    }

    if !parsed.discrepancies.is_empty() {
        out.push_str("\n## Discrepancies\n");
        out.push_str("| Item | Expected | Found | Type | Severity |\n");
        out.push_str("| --- | --- | --- | --- | --- |\n");
        for d in &parsed.discrepancies {
            out.push_str(&format!(
                "| {} | {} | {} | {} | {} |\n",
                d.item, d.expected, d.found, d.kind, d.severity
            ));
        }
    }

    if let Some(structure) = &parsed.machine_structure {
        out.push_str("\n## Machine Structure\n");
        out.push_str("| Rows | Columns | Row Labels |\n");
        out.push_str("| --- | --- | --- |\n");
        out.push_str(&format!(
            "| {} | {} | {} |\n",
            structure.row_count,
            structure.column_count,
            structure.row_labels.join(", ")
        ));
    }

    if !parsed.row_status.is_empty() {
        out.push_str("\n## Row Status\n");
        out.push_str("| Row | Status | Notes |\n");
        out.push_str("| --- | --- | --- |\n");
        for entry in &parsed.row_status {
            out.push_str(&format!(
                "| {} | {} | {} |\n",
                entry.row, entry.status, entry.notes
            ));
        }
    }

    out
}
