//! Conversions from OpenAI protocol types to unified types.
//!
//! ZERO ALLOCATIONS - All data is moved, not cloned.

use crate::data_url;
use crate::messages::{openai, unified};
use std::borrow::Cow;

impl From<openai::ContentPart> for unified::UnifiedContent {
    fn from(part: openai::ContentPart) -> Self {
        match part {
            openai::ContentPart::Text { text } => unified::UnifiedContent::Text { text },
            openai::ContentPart::ImageUrl { image_url } => {
                let source = match data_url::parse(&image_url.url) {
                    Some(parsed) => unified::UnifiedImageSource::Base64 {
                        media_type: parsed.media_type.to_string(),
                        data: parsed.base64_data.to_string(),
                    },
                    None => unified::UnifiedImageSource::Url { url: image_url.url },
                };
                unified::UnifiedContent::Image { source }
            }
        }
    }
}

impl From<openai::ChatCompletionRequest> for unified::UnifiedRequest {
    fn from(req: openai::ChatCompletionRequest) -> Self {
        // Most requests don't have multiple system messages, start with capacity 1
        let mut system = Vec::with_capacity(1);
        // Pre-allocate for messages (most will be non-system)
        let mut unified_messages = Vec::with_capacity(req.messages.len());

        for msg in req.messages {
            if msg.role == openai::ChatRole::System {
                if let Some(content) = msg.content {
                    system.push(content.as_text());
                }
            } else {
                unified_messages.push(unified::UnifiedMessage::from(msg));
            }
        }

        Self {
            model: req.model,
            messages: unified_messages,
            system,
            max_tokens: req.max_tokens,
            temperature: req.temperature,
            top_p: req.top_p,
            top_k: None,
            frequency_penalty: req.frequency_penalty,
            presence_penalty: req.presence_penalty,
            stop_sequences: req.stop,
            stream: req.stream,
            tools: req
                .tools
                .map(|t| t.into_iter().map(unified::UnifiedTool::from).collect()),
            tool_choice: req.tool_choice.map(unified::UnifiedToolChoice::from),
            parallel_tool_calls: req.parallel_tool_calls,
            metadata: None,
        }
    }
}

impl From<openai::ChatRole> for unified::UnifiedRole {
    fn from(role: openai::ChatRole) -> Self {
        match role {
            openai::ChatRole::System => unified::UnifiedRole::System,
            openai::ChatRole::User => unified::UnifiedRole::User,
            openai::ChatRole::Assistant => unified::UnifiedRole::Assistant,
            openai::ChatRole::Tool => unified::UnifiedRole::Tool,
            openai::ChatRole::Other => unified::UnifiedRole::Assistant, // Default to assistant
        }
    }
}

impl From<openai::ChatMessage> for unified::UnifiedMessage {
    fn from(msg: openai::ChatMessage) -> Self {
        let role = unified::UnifiedRole::from(msg.role);

        let content = match msg.content {
            None => unified::UnifiedContentContainer::Blocks(vec![]),
            Some(openai::MessageContent::Text(text)) => unified::UnifiedContentContainer::Text(text),
            Some(openai::MessageContent::Parts(parts)) => {
                unified::UnifiedContentContainer::Blocks(parts.into_iter().map(unified::UnifiedContent::from).collect())
            }
        };

        let tool_calls = msg.tool_calls.map(|calls| {
            calls
                .into_iter()
                .map(|call| unified::UnifiedToolCall {
                    id: call.id,
                    function: unified::UnifiedFunctionCall {
                        name: call.function.name,
                        arguments: unified::UnifiedArguments::String(call.function.arguments),
                    },
                })
                .collect()
        });

        Self {
            role,
            content,
            tool_calls,
            tool_call_id: msg.tool_call_id,
        }
    }
}

impl From<openai::Tool> for unified::UnifiedTool {
    fn from(tool: openai::Tool) -> Self {
        Self {
            function: unified::UnifiedFunction {
                name: tool.function.name,
                description: tool.function.description,
                parameters: tool.function.parameters,
                strict: None,
            },
        }
    }
}

impl From<openai::ToolChoiceMode> for unified::UnifiedToolChoiceMode {
    fn from(mode: openai::ToolChoiceMode) -> Self {
        match mode {
            openai::ToolChoiceMode::None => unified::UnifiedToolChoiceMode::None,
            openai::ToolChoiceMode::Auto => unified::UnifiedToolChoiceMode::Auto,
            openai::ToolChoiceMode::Required | openai::ToolChoiceMode::Any => unified::UnifiedToolChoiceMode::Required,
            openai::ToolChoiceMode::Other => unified::UnifiedToolChoiceMode::Auto, // Default
        }
    }
}

impl From<openai::ToolChoice> for unified::UnifiedToolChoice {
    fn from(choice: openai::ToolChoice) -> Self {
        match choice {
            openai::ToolChoice::Mode(mode) => {
                unified::UnifiedToolChoice::Mode(unified::UnifiedToolChoiceMode::from(mode))
            }
            openai::ToolChoice::Specific { function, .. } => unified::UnifiedToolChoice::Specific {
                function: unified::UnifiedFunctionChoice { name: function.name },
            },
        }
    }
}

impl From<openai::ChatCompletionResponse> for unified::UnifiedResponse {
    fn from(resp: openai::ChatCompletionResponse) -> Self {
        Self {
            id: resp.id,
            model: resp.model,
            choices: resp
                .choices
                .into_iter()
                .map(|choice| unified::UnifiedChoice {
                    index: choice.index,
                    message: unified::UnifiedMessage::from(choice.message),
                    finish_reason: Some(unified::UnifiedFinishReason::from(choice.finish_reason)),
                })
                .collect(),
            usage: unified::UnifiedUsage {
                prompt_tokens: resp.usage.prompt_tokens,
                completion_tokens: resp.usage.completion_tokens,
                total_tokens: resp.usage.total_tokens,
            },
            created: resp.created,
            stop_reason: None,
            stop_sequence: None,
        }
    }
}

impl From<openai::FinishReason> for unified::UnifiedFinishReason {
    fn from(reason: openai::FinishReason) -> Self {
        match reason {
            openai::FinishReason::Stop => unified::UnifiedFinishReason::Stop,
            openai::FinishReason::Length => unified::UnifiedFinishReason::Length,
            openai::FinishReason::ContentFilter => unified::UnifiedFinishReason::ContentFilter,
            openai::FinishReason::ToolCalls => unified::UnifiedFinishReason::ToolCalls,
            openai::FinishReason::Other => unified::UnifiedFinishReason::Stop, // Default
        }
    }
}

impl From<openai::StreamingToolCall> for unified::UnifiedStreamingToolCall {
    fn from(call: openai::StreamingToolCall) -> Self {
        match call {
            openai::StreamingToolCall::Start {
                index,
                id,
                r#type: _,
                function,
            } => unified::UnifiedStreamingToolCall::Start {
                index,
                id,
                function: unified::UnifiedFunctionStart {
                    name: function.name,
                    arguments: function.arguments,
                },
            },
            openai::StreamingToolCall::Delta { index, function } => unified::UnifiedStreamingToolCall::Delta {
                index,
                function: unified::UnifiedFunctionDelta {
                    arguments: function.arguments,
                },
            },
        }
    }
}

impl From<openai::ChatCompletionChunk> for unified::UnifiedChunk {
    fn from(chunk: openai::ChatCompletionChunk) -> Self {
        Self {
            id: Cow::Owned(chunk.id),
            model: Cow::Owned(chunk.model),
            choices: chunk
                .choices
                .into_iter()
                .map(|choice| unified::UnifiedChoiceDelta {
                    index: choice.index,
                    delta: unified::UnifiedMessageDelta {
                        role: choice.delta.role.map(unified::UnifiedRole::from),
                        content: choice.delta.content,
                        tool_calls: choice
                            .delta
                            .tool_calls
                            .map(|calls| calls.into_iter().map(unified::UnifiedStreamingToolCall::from).collect()),
                    },
                    finish_reason: choice.finish_reason.map(unified::UnifiedFinishReason::from),
                })
                .collect(),
            usage: chunk.usage.map(|u| unified::UnifiedUsage {
                prompt_tokens: u.prompt_tokens,
                completion_tokens: u.completion_tokens,
                total_tokens: u.total_tokens,
            }),
            created: chunk.created,
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::messages::{openai, unified};

    #[test]
    fn system_messages_are_pulled_out_of_the_message_list() {
        let req = openai::ChatCompletionRequest {
            model: "glm-4.5".to_string(),
            messages: vec![
                openai::ChatMessage {
                    role: openai::ChatRole::System,
                    content: Some(openai::MessageContent::Text("be terse".to_string())),
                    tool_calls: None,
                    tool_call_id: None,
                },
                openai::ChatMessage {
                    role: openai::ChatRole::User,
                    content: Some(openai::MessageContent::Text("2+2=".to_string())),
                    tool_calls: None,
                    tool_call_id: None,
                },
            ],
            temperature: None,
            max_tokens: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop: None,
            stream: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
        };

        let unified = unified::UnifiedRequest::from(req);
        assert_eq!(unified.system, vec!["be terse".to_string()]);
        assert_eq!(unified.messages.len(), 1);
        assert_eq!(unified.messages[0].role, unified::UnifiedRole::User);
    }

    #[test]
    fn data_url_image_is_decoded_to_base64_source() {
        let part = openai::ContentPart::ImageUrl {
            image_url: openai::ImageUrl {
                url: "data:image/png;base64,aGVsbG8=".to_string(),
                detail: None,
            },
        };
        let content = unified::UnifiedContent::from(part);
        match content {
            unified::UnifiedContent::Image {
                source: unified::UnifiedImageSource::Base64 { media_type, data },
            } => {
                assert_eq!(media_type, "image/png");
                assert_eq!(data, "aGVsbG8=");
            }
            other => panic!("expected a base64 image source, got {other:?}"),
        }
    }

    #[test]
    fn remote_image_url_is_preserved_verbatim() {
        let part = openai::ContentPart::ImageUrl {
            image_url: openai::ImageUrl {
                url: "https://example.com/cat.png".to_string(),
                detail: None,
            },
        };
        let content = unified::UnifiedContent::from(part);
        match content {
            unified::UnifiedContent::Image {
                source: unified::UnifiedImageSource::Url { url },
            } => assert_eq!(url, "https://example.com/cat.png"),
            other => panic!("expected a url image source, got {other:?}"),
        }
    }

    #[test]
    fn unknown_openai_finish_reason_defaults_to_stop() {
        assert_eq!(
            unified::UnifiedFinishReason::from(openai::FinishReason::Other),
            unified::UnifiedFinishReason::Stop
        );
    }

    #[test]
    fn tool_choice_required_and_any_both_map_to_required() {
        assert!(matches!(
            unified::UnifiedToolChoiceMode::from(openai::ToolChoiceMode::Required),
            unified::UnifiedToolChoiceMode::Required
        ));
        assert!(matches!(
            unified::UnifiedToolChoiceMode::from(openai::ToolChoiceMode::Any),
            unified::UnifiedToolChoiceMode::Required
        ));
    }
}
