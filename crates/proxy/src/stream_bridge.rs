//! Stateful framing for the Anthropic SSE grammar.
//!
//! The Schema Mapper's `From<UnifiedChunk> for AnthropicStreamEvent` impl
//! translates a single chunk in isolation; it has no memory of whether a
//! `message_start` was already sent or whether a content block is open.
//! Anthropic's wire format requires exactly that framing around the raw
//! deltas, so this module layers a small state machine on top of the
//! per-chunk conversion rather than teaching the conversion itself to
//! remember things.
use crate::messages::{anthropic, unified};

/// Wraps a stream of [`unified::UnifiedChunk`]s and emits a properly framed
/// sequence of [`anthropic::AnthropicStreamEvent`]s: one `message_start` up
/// front, a lazily-opened content block per distinct index, and
/// `content_block_stop` / `message_delta` / `message_stop` once the terminal
/// chunk (the one carrying a `finish_reason`) arrives.
pub(crate) struct AnthropicSequencer {
    started: bool,
    open_block: Option<u32>,
}

impl AnthropicSequencer {
    pub(crate) fn new() -> Self {
        Self {
            started: false,
            open_block: None,
        }
    }

    /// Feed one upstream-agnostic chunk, returning zero or more framed
    /// events to forward to the client.
    pub(crate) fn push(&mut self, chunk: unified::UnifiedChunk) -> Vec<anthropic::AnthropicStreamEvent> {
        let mut events = Vec::new();

        if !self.started {
            self.started = true;
            events.push(anthropic::AnthropicStreamEvent::MessageStart {
                message: anthropic::AnthropicStreamMessageStart {
                    id: chunk.id.clone().into_owned(),
                    message_type: "message".to_string(),
                    role: anthropic::AnthropicRole::Assistant,
                    content: Vec::new(),
                    model: chunk.model.clone().into_owned(),
                    usage: anthropic::AnthropicUsage {
                        input_tokens: 0,
                        output_tokens: 0,
                        cache_creation_input_tokens: None,
                        cache_read_input_tokens: None,
                    },
                },
            });
        }

        let Some(choice) = chunk.choices.into_iter().next() else {
            return events;
        };

        let finish_reason = choice.finish_reason;

        if let Some(text) = choice.delta.content {
            self.open_block(&mut events, 0, anthropic::AnthropicContent::Text { text: String::new() });
            events.push(anthropic::AnthropicStreamEvent::ContentBlockDelta {
                index: 0,
                delta: anthropic::AnthropicContentDelta::TextDelta { text },
            });
        } else if let Some(tool_calls) = choice.delta.tool_calls {
            for call in tool_calls {
                match call {
                    unified::UnifiedStreamingToolCall::Start { index, id, function } => {
                        let input = normalize_tool_input(parse_argument_string(&function.arguments));
                        let index = index as u32;
                        self.open_block(
                            &mut events,
                            index,
                            anthropic::AnthropicContent::ToolUse {
                                id,
                                name: function.name,
                                input,
                            },
                        );
                    }
                    unified::UnifiedStreamingToolCall::Delta { index, function } => {
                        events.push(anthropic::AnthropicStreamEvent::ContentBlockDelta {
                            index: index as u32,
                            delta: anthropic::AnthropicContentDelta::InputJsonDelta {
                                partial_json: function.arguments,
                            },
                        });
                    }
                }
            }
        }

        if let Some(reason) = finish_reason {
            if let Some(index) = self.open_block.take() {
                events.push(anthropic::AnthropicStreamEvent::ContentBlockStop { index });
            }

            let usage = chunk.usage.unwrap_or(unified::UnifiedUsage {
                prompt_tokens: 0,
                completion_tokens: 0,
                total_tokens: 0,
            });

            events.push(anthropic::AnthropicStreamEvent::MessageDelta {
                delta: anthropic::AnthropicMessageDelta {
                    stop_reason: Some(stop_reason_for(reason)),
                    stop_sequence: None,
                },
                usage: anthropic::AnthropicUsage {
                    input_tokens: usage.prompt_tokens as i32,
                    output_tokens: usage.completion_tokens as i32,
                    cache_creation_input_tokens: None,
                    cache_read_input_tokens: None,
                },
            });
            events.push(anthropic::AnthropicStreamEvent::MessageStop);
        }

        events
    }

    /// Closes whatever block is currently open (if its index differs) and
    /// opens `index`, recording it so a matching `content_block_stop` is
    /// emitted later.
    fn open_block(&mut self, events: &mut Vec<anthropic::AnthropicStreamEvent>, index: u32, block: anthropic::AnthropicContent) {
        if self.open_block == Some(index) {
            return;
        }

        if let Some(previous) = self.open_block.take() {
            events.push(anthropic::AnthropicStreamEvent::ContentBlockStop { index: previous });
        }

        events.push(anthropic::AnthropicStreamEvent::ContentBlockStart {
            index,
            content_block: block,
        });
        self.open_block = Some(index);
    }
}

fn stop_reason_for(reason: unified::UnifiedFinishReason) -> anthropic::AnthropicStopReason {
    match reason {
        unified::UnifiedFinishReason::Stop => anthropic::AnthropicStopReason::EndTurn,
        unified::UnifiedFinishReason::Length => anthropic::AnthropicStopReason::MaxTokens,
        unified::UnifiedFinishReason::ToolCalls => anthropic::AnthropicStopReason::ToolUse,
        unified::UnifiedFinishReason::ContentFilter => anthropic::AnthropicStopReason::EndTurn,
    }
}

fn normalize_tool_input(input: serde_json::Value) -> serde_json::Value {
    if input.is_null() {
        serde_json::Value::Object(serde_json::Map::new())
    } else {
        input
    }
}

fn parse_argument_string(raw: &str) -> serde_json::Value {
    if raw.is_empty() {
        return serde_json::Value::Object(serde_json::Map::new());
    }

    serde_json::from_str(raw).unwrap_or_else(|_| serde_json::Value::String(raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    fn chunk(content: Option<&str>, finish: Option<unified::UnifiedFinishReason>, usage: Option<(u32, u32)>) -> unified::UnifiedChunk {
        unified::UnifiedChunk {
            id: Cow::Borrowed("msg_1"),
            model: Cow::Borrowed("claude-3-opus"),
            choices: vec![unified::UnifiedChoiceDelta {
                index: 0,
                delta: unified::UnifiedMessageDelta {
                    role: None,
                    content: content.map(|s| s.to_string()),
                    tool_calls: None,
                },
                finish_reason: finish,
            }],
            usage: usage.map(|(p, c)| unified::UnifiedUsage {
                prompt_tokens: p,
                completion_tokens: c,
                total_tokens: p + c,
            }),
            created: 0,
        }
    }

    #[test]
    fn first_chunk_opens_message_and_block() {
        let mut seq = AnthropicSequencer::new();
        let events = seq.push(chunk(Some("hi"), None, None));

        assert!(matches!(events[0], anthropic::AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events[1], anthropic::AnthropicStreamEvent::ContentBlockStart { index: 0, .. }));
        assert!(matches!(events[2], anthropic::AnthropicStreamEvent::ContentBlockDelta { index: 0, .. }));
        assert_eq!(events.len(), 3);
    }

    #[test]
    fn subsequent_chunk_does_not_reopen_message_or_block() {
        let mut seq = AnthropicSequencer::new();
        seq.push(chunk(Some("hi"), None, None));
        let events = seq.push(chunk(Some(" there"), None, None));

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], anthropic::AnthropicStreamEvent::ContentBlockDelta { .. }));
    }

    #[test]
    fn terminal_chunk_closes_block_and_stops_message() {
        let mut seq = AnthropicSequencer::new();
        seq.push(chunk(Some("hi"), None, None));
        let events = seq.push(chunk(None, Some(unified::UnifiedFinishReason::Stop), Some((10, 5))));

        assert!(matches!(events[0], anthropic::AnthropicStreamEvent::ContentBlockStop { index: 0 }));
        match &events[1] {
            anthropic::AnthropicStreamEvent::MessageDelta { delta, usage } => {
                assert_eq!(delta.stop_reason, Some(anthropic::AnthropicStopReason::EndTurn));
                assert_eq!(usage.input_tokens, 10);
                assert_eq!(usage.output_tokens, 5);
            }
            other => panic!("expected message_delta, got {other:?}"),
        }
        assert!(matches!(events[2], anthropic::AnthropicStreamEvent::MessageStop));
    }

    #[test]
    fn empty_stream_still_emits_message_start_and_stop() {
        let mut seq = AnthropicSequencer::new();
        let mut events = seq.push(chunk(None, None, None));
        events.extend(seq.push(chunk(None, Some(unified::UnifiedFinishReason::Stop), None)));

        assert!(matches!(events[0], anthropic::AnthropicStreamEvent::MessageStart { .. }));
        assert!(matches!(events.last(), Some(anthropic::AnthropicStreamEvent::MessageStop)));
    }
}
