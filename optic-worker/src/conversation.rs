//! Building the stored conversation transcripts.

use optic_protocol::{
    ConversationBlock, ConversationMessage, ConversationRecord, ConversationRole, ModelResponse,
    TurnId, TurnResponse, VerificationContext,
};
use std::collections::BTreeMap;

/// A stored image, as it appears in a conversation message.
#[derive(Debug, Clone)]
pub struct ImageBlock {
    /// Object key of the stored base64 payload.
    pub key: String,
    /// Image format token (`jpeg`, `png`, …).
    pub format: String,
}

impl ImageBlock {
    fn block(&self) -> ConversationBlock {
        ConversationBlock::ImageRef {
            key: self.key.clone(),
            format: self.format.clone(),
        }
    }
}

fn assistant_message(response: &ModelResponse) -> ConversationMessage {
    let mut content = Vec::new();
    if let Some(thinking) = &response.thinking {
        content.push(ConversationBlock::Thinking {
            thinking: thinking.clone(),
        });
    }
    content.push(ConversationBlock::Text {
        text: response.content.clone(),
    });
    ConversationMessage {
        role: ConversationRole::Assistant,
        content,
    }
}

/// Build the Turn-1 conversation transcript: the user message with the
/// reference image and prompt, then the assistant's analysis.
pub fn build_turn1_conversation(
    context: &VerificationContext,
    system_prompt: &str,
    user_prompt: &str,
    image: &ImageBlock,
    response: &ModelResponse,
) -> ConversationRecord {
    let messages = vec![
        ConversationMessage {
            role: ConversationRole::User,
            content: vec![
                image.block(),
                ConversationBlock::Text {
                    text: user_prompt.to_string(),
                },
            ],
        },
        assistant_message(response),
    ];
    record(context, TurnId::Turn1, system_prompt, messages, response)
}

/// Build the full Turn-2 conversation transcript.
///
/// Prior messages come from the stored Turn-1 conversation when one was
/// referenced; otherwise they are synthesized from the Turn-1 raw
/// record. The Turn-2 user message carries both image blocks, then the
/// prompt; the assistant message closes the transcript.
pub fn build_turn2_conversation(
    context: &VerificationContext,
    turn1_conversation: Option<&ConversationRecord>,
    turn1_response: Option<&TurnResponse>,
    system_prompt: &str,
    user_prompt: &str,
    reference_image: Option<&ImageBlock>,
    checking_image: &ImageBlock,
    response: &ModelResponse,
) -> ConversationRecord {
    let mut messages = match (turn1_conversation, turn1_response) {
        (Some(conversation), _) => conversation.messages.clone(),
        (None, Some(turn1)) => vec![
            ConversationMessage::user_text(turn1.prompt.clone()),
            ConversationMessage {
                role: ConversationRole::Assistant,
                content: {
                    let mut content = Vec::new();
                    if let Some(thinking) = &turn1.response.thinking {
                        content.push(ConversationBlock::Thinking {
                            thinking: thinking.clone(),
                        });
                    }
                    content.push(ConversationBlock::Text {
                        text: turn1.response.content.clone(),
                    });
                    content
                },
            },
        ],
        (None, None) => Vec::new(),
    };

    let mut user_content = Vec::new();
    if let Some(reference) = reference_image {
        user_content.push(reference.block());
    }
    user_content.push(checking_image.block());
    user_content.push(ConversationBlock::Text {
        text: user_prompt.to_string(),
    });
    messages.push(ConversationMessage {
        role: ConversationRole::User,
        content: user_content,
    });
    messages.push(assistant_message(response));

    record(context, TurnId::Turn2, system_prompt, messages, response)
}

fn record(
    context: &VerificationContext,
    turn_id: TurnId,
    system_prompt: &str,
    messages: Vec<ConversationMessage>,
    response: &ModelResponse,
) -> ConversationRecord {
    let mut metadata = BTreeMap::new();
    metadata.insert(
        "verificationType".to_string(),
        serde_json::json!(context.verification_type.as_str()),
    );
    ConversationRecord {
        verification_id: context.verification_id.clone(),
        turn_id,
        system_prompt: system_prompt.to_string(),
        messages,
        token_usage: response.token_usage(),
        latency_ms: response.latency_ms,
        stop_reason: response.stop_reason.clone(),
        model_id: response.model_id.clone(),
        metadata,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};
    use optic_protocol::{AnalysisStage, ModelOutput, TokenUsage, VerificationType};

    fn context() -> VerificationContext {
        VerificationContext {
            verification_id: "verif-20250401123000".into(),
            verification_at: Utc.with_ymd_and_hms(2025, 4, 1, 12, 30, 0).unwrap(),
            verification_type: VerificationType::LayoutVsChecking,
            reference_image_url: String::new(),
            checking_image_url: String::new(),
            vending_machine_id: Some("vm-104".into()),
            layout_id: Some(23591),
            layout_prefix: Some("5560c9c9".into()),
            previous_verification_id: None,
            layout_metadata: None,
            historical_context: None,
        }
    }

    fn response(thinking: Option<&str>) -> ModelResponse {
        ModelResponse {
            content: "# Comparison Report".into(),
            thinking: thinking.map(str::to_string),
            stop_reason: "end_turn".into(),
            input_tokens: 100,
            output_tokens: 50,
            thinking_tokens: 0,
            total_tokens: 150,
            latency_ms: 900,
            model_id: "model-x".into(),
            processing_time_ms: 910,
        }
    }

    fn image(key: &str) -> ImageBlock {
        ImageBlock {
            key: key.into(),
            format: "jpeg".into(),
        }
    }

    #[test]
    fn turn1_transcript_has_user_then_assistant() {
        let conversation = build_turn1_conversation(
            &context(),
            "system",
            "analyze",
            &image("ref.base64"),
            &response(None),
        );
        assert_eq!(conversation.turn_id, TurnId::Turn1);
        assert_eq!(conversation.messages.len(), 2);
        assert_eq!(conversation.messages[0].role, ConversationRole::User);
        assert!(matches!(
            conversation.messages[0].content[0],
            ConversationBlock::ImageRef { .. }
        ));
        assert_eq!(conversation.messages[1].role, ConversationRole::Assistant);
    }

    #[test]
    fn turn2_user_message_carries_both_images() {
        let turn1 = build_turn1_conversation(
            &context(),
            "system",
            "analyze",
            &image("ref.base64"),
            &response(Some("six rows")),
        );
        let conversation = build_turn2_conversation(
            &context(),
            Some(&turn1),
            None,
            "system",
            "compare",
            Some(&image("ref.base64")),
            &image("check.base64"),
            &response(None),
        );
        assert_eq!(conversation.messages.len(), 4);
        let user = &conversation.messages[2];
        assert_eq!(user.role, ConversationRole::User);
        let image_blocks = user
            .content
            .iter()
            .filter(|block| matches!(block, ConversationBlock::ImageRef { .. }))
            .count();
        assert_eq!(image_blocks, 2);
    }

    #[test]
    fn prior_thinking_blocks_are_preserved() {
        let turn1 = build_turn1_conversation(
            &context(),
            "system",
            "analyze",
            &image("ref.base64"),
            &response(Some("six rows visible")),
        );
        let conversation = build_turn2_conversation(
            &context(),
            Some(&turn1),
            None,
            "system",
            "compare",
            None,
            &image("check.base64"),
            &response(None),
        );
        assert!(conversation.messages[1].content.iter().any(|block| {
            matches!(block, ConversationBlock::Thinking { thinking } if thinking == "six rows visible")
        }));
    }

    #[test]
    fn missing_turn1_conversation_synthesizes_from_raw_record() {
        let turn1 = TurnResponse {
            turn_id: TurnId::Turn1,
            timestamp: Utc::now(),
            prompt: "analyze the reference".into(),
            image_refs: BTreeMap::new(),
            response: ModelOutput {
                content: "# Reference Analysis".into(),
                thinking: None,
                stop_reason: "end_turn".into(),
                model_id: "model-x".into(),
            },
            latency_ms: 800,
            token_usage: TokenUsage::new(90, 40, 0),
            stage: AnalysisStage::ReferenceAnalysis,
            metadata: BTreeMap::new(),
        };
        let conversation = build_turn2_conversation(
            &context(),
            None,
            Some(&turn1),
            "system",
            "compare",
            None,
            &image("check.base64"),
            &response(None),
        );
        assert_eq!(conversation.messages.len(), 4);
        assert!(matches!(
            &conversation.messages[0].content[0],
            ConversationBlock::Text { text } if text == "analyze the reference"
        ));
    }
}
