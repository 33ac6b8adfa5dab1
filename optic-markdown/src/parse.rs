//! Event-walking parser for the comparison report.

use crate::MarkdownError;
use optic_protocol::{
    Discrepancy, MachineStructureReport, ParsedTurn2, RowStatusEntry, VerificationOutcome,
};
use pulldown_cmark::{Event, Options, Parser, Tag, TagEnd};

/// Cut the comparison report out of the model's full answer.
///
/// The report starts at the first Markdown heading whose text contains
/// "comparison" (case-insensitive) and runs to the end of the answer.
/// An answer without such a heading has no report.
pub fn extract_comparison_markdown(content: &str) -> Result<String, MarkdownError> {
    let mut start = None;
    for (index, line) in content.lines().enumerate() {
        let trimmed = line.trim_start();
        let hashes = trimmed.chars().take_while(|c| *c == '#').count();
        if (1..=6).contains(&hashes) {
            let rest = trimmed[hashes..].trim_start();
            if rest.len() < trimmed.len() - hashes
                && rest.to_ascii_lowercase().contains("comparison")
            {
                start = Some(index);
                break;
            }
        }
    }
    match start {
        Some(index) => Ok(content
            .lines()
            .skip(index)
            .collect::<Vec<_>>()
            .join("\n")),
        None => Err(MarkdownError::MissingComparisonSection),
    }
}

/// Parse the comparison report into structured data.
pub fn parse_turn2_markdown(content: &str) -> Result<ParsedTurn2, MarkdownError> {
    let section = extract_comparison_markdown(content)?;

    let mut options = Options::empty();
    options.insert(Options::ENABLE_TABLES);
    let parser = Parser::new_ext(&section, options);

    let mut current_section = String::new();
    let mut heading_buf: Option<String> = None;
    let mut paragraph_buf: Option<String> = None;
    let mut cell_buf: Option<String> = None;
    let mut row_buf: Vec<String> = Vec::new();
    let mut table_rows: Vec<Vec<String>> = Vec::new();

    let mut outcome: Option<VerificationOutcome> = None;
    let mut summary_parts: Vec<String> = Vec::new();
    let mut discrepancies: Vec<Discrepancy> = Vec::new();
    let mut machine_structure: Option<MachineStructureReport> = None;
    let mut row_status: Vec<RowStatusEntry> = Vec::new();

    for event in parser {
        match event {
            Event::Start(Tag::Heading { .. }) => heading_buf = Some(String::new()),
            Event::End(TagEnd::Heading(_)) => {
                if let Some(text) = heading_buf.take() {
                    current_section = text.trim().to_ascii_lowercase();
                }
            }
            Event::Start(Tag::Paragraph) => paragraph_buf = Some(String::new()),
            Event::End(TagEnd::Paragraph) => {
                if let Some(text) = paragraph_buf.take() {
                    let text = text.trim().to_string();
                    if let Some(value) = outcome_value(&text) {
                        outcome = Some(
                            value
                                .parse()
                                .map_err(|_| MarkdownError::InvalidOutcome(value.to_string()))?,
                        );
                    } else if current_section.contains("comparison summary") && !text.is_empty() {
                        summary_parts.push(text);
                    }
                }
            }
            Event::Start(Tag::Table(_)) => table_rows.clear(),
            Event::End(TagEnd::Table) => {
                let rows = std::mem::take(&mut table_rows);
                if current_section.contains("discrepan") {
                    discrepancies.extend(parse_discrepancy_rows(&rows)?);
                } else if current_section.contains("machine structure") {
                    machine_structure = parse_structure_rows(&rows);
                } else if current_section.contains("row status") {
                    row_status.extend(parse_row_status_rows(&rows));
                }
            }
            Event::Start(Tag::TableHead) | Event::Start(Tag::TableRow) => row_buf.clear(),
            Event::End(TagEnd::TableHead) | Event::End(TagEnd::TableRow) => {
                table_rows.push(std::mem::take(&mut row_buf));
            }
            Event::Start(Tag::TableCell) => cell_buf = Some(String::new()),
            Event::End(TagEnd::TableCell) => {
                row_buf.push(cell_buf.take().unwrap_or_default().trim().to_string());
            }
            Event::Text(text) => push_text(&mut cell_buf, &mut paragraph_buf, &mut heading_buf, &text),
            Event::Code(text) => push_text(&mut cell_buf, &mut paragraph_buf, &mut heading_buf, &text),
            Event::SoftBreak | Event::HardBreak => {
                push_text(&mut cell_buf, &mut paragraph_buf, &mut heading_buf, " ");
            }
            _ => {}
        }
    }

    Ok(ParsedTurn2 {
        verification_outcome: outcome.ok_or(MarkdownError::MissingOutcome)?,
        comparison_summary: summary_parts.join("\n\n"),
        discrepancies,
        machine_structure,
        row_status,
    })
}

/// Append text to the innermost active buffer.
fn push_text(
    cell: &mut Option<String>,
    paragraph: &mut Option<String>,
    heading: &mut Option<String>,
    text: &str,
) {
    if let Some(buf) = cell.as_mut() {
        buf.push_str(text);
    } else if let Some(buf) = paragraph.as_mut() {
        buf.push_str(text);
    } else if let Some(buf) = heading.as_mut() {
        buf.push_str(text);
    }
}

/// The value of an outcome line, if the paragraph is one.
fn outcome_value(text: &str) -> Option<&str> {
    let rest = text.strip_prefix("Verification Outcome:")?;
    Some(rest.trim())
}

fn parse_discrepancy_rows(rows: &[Vec<String>]) -> Result<Vec<Discrepancy>, MarkdownError> {
    let mut parsed = Vec::new();
    // First row is the header.
    for row in rows.iter().skip(1) {
        if row.iter().all(|cell| cell.is_empty()) {
            continue;
        }
        if row.len() < 5 {
            return Err(MarkdownError::InvalidDiscrepancyRow(row.join(" | ")));
        }
        let kind = row[3]
            .parse()
            .map_err(|_| MarkdownError::InvalidDiscrepancyRow(row.join(" | ")))?;
        let severity = row[4]
            .parse()
            .map_err(|_| MarkdownError::InvalidDiscrepancyRow(row.join(" | ")))?;
        parsed.push(Discrepancy {
            item: row[0].clone(),
            expected: row[1].clone(),
            found: row[2].clone(),
            kind,
            severity,
        });
    }
    Ok(parsed)
}

/// Machine structure is advisory; a table that does not parse is simply
/// absent.
fn parse_structure_rows(rows: &[Vec<String>]) -> Option<MachineStructureReport> {
    let row = rows.get(1)?;
    let row_count = row.first()?.parse().ok()?;
    let column_count = row.get(1)?.parse().ok()?;
    let row_labels = row
        .get(2)
        .map(|labels| {
            labels
                .split(',')
                .map(|label| label.trim().to_string())
                .filter(|label| !label.is_empty())
                .collect()
        })
        .unwrap_or_default();
    Some(MachineStructureReport {
        row_count,
        column_count,
        row_labels,
    })
}

fn parse_row_status_rows(rows: &[Vec<String>]) -> Vec<RowStatusEntry> {
    rows.iter()
        .skip(1)
        .filter(|row| row.len() >= 2 && !row[0].is_empty())
        .map(|row| RowStatusEntry {
            row: row[0].clone(),
            status: row[1].clone(),
            notes: row.get(2).cloned().unwrap_or_default(),
        })
        .collect()
}
