#![deny(missing_docs)]
//! Prompt templates for the two-turn verification conversation.
//!
//! A template is selected by `(verification type, turn)` and rendered
//! against a flat variable map. Rendering is a pure function of
//! `(template, variables)`: the same inputs produce the same text, the
//! same token estimate, and the same output hash. The
//! [`TemplateProcessor`] record produced alongside the text exists for
//! observability only.

mod templates;

pub use templates::{Template, select_template};

use optic_protocol::{ErrorCategory, TemplateProcessor, TurnId, VerificationType, WorkflowError};
use std::collections::BTreeMap;
use std::time::Instant;
use thiserror::Error;

/// Upper bound on rendered prompt length, characters.
pub const MAX_RENDERED_LEN: usize = 120_000;

/// Approximate characters per token, for estimation.
const CHARS_PER_TOKEN: usize = 4;

/// Template selection/rendering failures. All are terminal: a template
/// problem does not fix itself on retry.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// A placeholder had no binding in the variable map.
    #[error("template {template_id}: unbound variable {name}")]
    UnboundVariable {
        /// The template being rendered.
        template_id: String,
        /// The placeholder without a binding.
        name: String,
    },

    /// A placeholder was opened but never closed.
    #[error("template {template_id}: unterminated placeholder")]
    UnterminatedPlaceholder {
        /// The template being rendered.
        template_id: String,
    },

    /// The rendered output exceeded [`MAX_RENDERED_LEN`].
    #[error("template {template_id}: rendered {length} chars, maximum is {max}")]
    OversizeOutput {
        /// The template being rendered.
        template_id: String,
        /// Rendered length.
        length: usize,
        /// The configured maximum.
        max: usize,
    },
}

impl From<TemplateError> for WorkflowError {
    fn from(error: TemplateError) -> Self {
        WorkflowError::new(ErrorCategory::Template, "TEMPLATE_ERROR", error.to_string())
            .with_component("prompt_renderer")
            .with_source(error)
    }
}

/// A rendered prompt plus its observability record.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderedPrompt {
    /// The prompt text.
    pub text: String,
    /// Token estimate of the text.
    pub token_estimate: usize,
    /// Observability record to persist alongside the turn.
    pub processor: TemplateProcessor,
}

/// Estimate the token count of a text.
pub fn token_estimate(text: &str) -> usize {
    text.len() / CHARS_PER_TOKEN
}

/// Render the template selected for `(verification_type, turn)` against
/// the variable map.
pub fn render_for(
    verification_type: VerificationType,
    turn: TurnId,
    variables: &BTreeMap<String, String>,
) -> Result<RenderedPrompt, TemplateError> {
    render(select_template(verification_type, turn), variables)
}

/// Render a template against the variable map.
///
/// Placeholders are `{{Name}}`. Every placeholder must be bound;
/// variables without a matching placeholder are allowed (and recorded in
/// the processor).
pub fn render(
    template: &Template,
    variables: &BTreeMap<String, String>,
) -> Result<RenderedPrompt, TemplateError> {
    let started = Instant::now();
    let mut text = String::with_capacity(template.body.len());
    let mut rest = template.body;

    while let Some(open) = rest.find("{{") {
        text.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        let close = after_open
            .find("}}")
            .ok_or_else(|| TemplateError::UnterminatedPlaceholder {
                template_id: template.id.to_string(),
            })?;
        let name = after_open[..close].trim();
        let value = variables
            .get(name)
            .ok_or_else(|| TemplateError::UnboundVariable {
                template_id: template.id.to_string(),
                name: name.to_string(),
            })?;
        text.push_str(value);
        rest = &after_open[close + 2..];
    }
    text.push_str(rest);

    if text.len() > MAX_RENDERED_LEN {
        return Err(TemplateError::OversizeOutput {
            template_id: template.id.to_string(),
            length: text.len(),
            max: MAX_RENDERED_LEN,
        });
    }

    let input_estimate = token_estimate(template.body)
        + variables.values().map(|v| token_estimate(v)).sum::<usize>();
    let output_estimate = token_estimate(&text);
    let processor = TemplateProcessor {
        template_id: template.id.to_string(),
        variables: variables.clone(),
        processed_length: text.len(),
        processing_time_ms: started.elapsed().as_millis() as u64,
        input_token_estimate: input_estimate,
        output_token_estimate: output_estimate,
        output_hash: content_hash(&text),
    };

    Ok(RenderedPrompt {
        token_estimate: output_estimate,
        text,
        processor,
    })
}

/// Deterministic hash of rendered output, for cache keying.
fn content_hash(text: &str) -> String {
    let mut hash: u64 = 5381;
    for byte in text.as_bytes() {
        hash = hash.wrapping_mul(33).wrapping_add(*byte as u64);
    }
    format!("{hash:016x}")
}
