//! Template variables for a turn.

use optic_protocol::{TurnId, TurnResponse, VerificationContext, VerificationType};
use std::collections::BTreeMap;

/// Longest Turn-1 excerpt carried into the Turn-2 prompt, characters.
const MAX_TURN1_EXCERPT: usize = 6000;

/// Build the variable map for the turn's template.
///
/// Every placeholder of the selected template gets a binding; data the
/// context does not carry degrades to a readable fallback rather than
/// failing the render.
pub fn prompt_variables(
    context: &VerificationContext,
    turn_id: TurnId,
    turn1: Option<&TurnResponse>,
) -> BTreeMap<String, String> {
    let mut variables = BTreeMap::new();

    let machine_id = context
        .vending_machine_id
        .clone()
        .or_else(|| {
            context
                .layout_metadata
                .as_ref()
                .map(|layout| layout.vending_machine_id.clone())
        })
        .unwrap_or_else(|| "unknown".to_string());
    variables.insert("VendingMachineId".to_string(), machine_id);

    match context.verification_type {
        VerificationType::LayoutVsChecking => {
            let layout = context.layout_metadata.as_ref();
            variables.insert(
                "Location".to_string(),
                layout
                    .map(|l| l.location.clone())
                    .filter(|location| !location.is_empty())
                    .unwrap_or_else(|| "an unknown location".to_string()),
            );
            let structure = layout.map(|l| &l.machine_structure);
            variables.insert(
                "RowCount".to_string(),
                structure
                    .map(|s| s.row_count.to_string())
                    .unwrap_or_else(|| "an unknown number of".to_string()),
            );
            variables.insert(
                "ColumnCount".to_string(),
                structure
                    .map(|s| s.column_count.to_string())
                    .unwrap_or_else(|| "an unknown number of".to_string()),
            );
            variables.insert(
                "RowLabels".to_string(),
                structure
                    .map(|s| s.row_labels.join(", "))
                    .filter(|labels| !labels.is_empty())
                    .unwrap_or_else(|| "top to bottom".to_string()),
            );
        }
        VerificationType::PreviousVsCurrent => {
            let historical = context.historical_context.as_ref();
            variables.insert(
                "PreviousOutcome".to_string(),
                historical
                    .and_then(|h| h.previous_outcome)
                    .map(|outcome| outcome.to_string())
                    .unwrap_or_else(|| "no recorded outcome".to_string()),
            );
            variables.insert(
                "PreviousSummary".to_string(),
                historical
                    .and_then(|h| h.previous_summary.clone())
                    .filter(|summary| !summary.is_empty())
                    .unwrap_or_else(|| "No prior verification was found.".to_string()),
            );
        }
    }

    if turn_id == TurnId::Turn2 {
        variables.insert(
            "Turn1Analysis".to_string(),
            turn1
                .map(|t| excerpt(&t.response.content, MAX_TURN1_EXCERPT))
                .unwrap_or_else(|| "No prior-turn analysis is available.".to_string()),
        );
    }

    variables
}

/// Take the leading `max` characters of a text, on a char boundary.
fn excerpt(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}…", &text[..end])
}
