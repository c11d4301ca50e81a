//! Deterministic token counting over heterogeneous message content.
//!
//! Counts are approximate by design (matching a provider's own accounting
//! closely enough for routing and condensation decisions), not a guarantee
//! of billed token counts.

use mini_moka::sync::Cache;
use tiktoken_rs::CoreBPE;

use crate::family::EndpointFamily;
use crate::messages::unified::{
    UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRole, UnifiedToolResultContent,
};

/// Token surcharge for an image part with no caller-supplied description.
const BASE_IMAGE_TOKENS: u32 = 85;
/// Additional surcharge when the image source declares a media type.
const IMAGE_MEDIA_TYPE_SURCHARGE: u32 = 10;
/// Additional surcharge for the source-type tag itself.
const IMAGE_SOURCE_TAG_SURCHARGE: u32 = 5;
/// Fixed per-message overhead for role delimiters.
const MESSAGE_OVERHEAD: u32 = 3;
/// Structural surcharge per tool-use/tool-call part.
const TOOL_CALL_SURCHARGE: u32 = 20;
/// Capacity of the text-encode LRU cache.
const CACHE_CAPACITY: u64 = 1000;

/// Counts tokens over unified messages.
///
/// Holds a cl100k-family BPE encoder and an LRU cache on text encodes,
/// keyed by `(endpoint family, text)` since the same text can legitimately
/// produce different counts depending on which dialect's accounting is
/// being approximated in a mixed workload. Safe for concurrent callers.
pub struct Tokenizer {
    encoder: Option<CoreBPE>,
    cache: Cache<(EndpointFamily, String), u32>,
}

impl Default for Tokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tokenizer {
    /// Builds a tokenizer, falling back to byte-length estimation if the
    /// BPE encoder can't be constructed. Construction never fails: a
    /// catastrophic tokenizer must never fail a user request.
    pub fn new() -> Self {
        let encoder = match tiktoken_rs::cl100k_base() {
            Ok(encoder) => Some(encoder),
            Err(error) => {
                log::warn!("failed to construct cl100k_base encoder, falling back to byte-length estimate: {error}");
                None
            }
        };

        Self {
            encoder,
            cache: Cache::builder().max_capacity(CACHE_CAPACITY).build(),
        }
    }

    /// Counts tokens in a single string, via the cache.
    pub fn count_text(&self, family: EndpointFamily, text: &str) -> u32 {
        if text.is_empty() {
            return 0;
        }

        let key = (family, text.to_string());
        if let Some(count) = self.cache.get(&key) {
            return count;
        }

        let count = self.encode_len(text);
        self.cache.insert(key, count);
        count
    }

    fn encode_len(&self, text: &str) -> u32 {
        match &self.encoder {
            Some(encoder) => encoder.encode_with_special_tokens(text).len() as u32,
            None => ((text.len() as u32) / 4).max(1),
        }
    }

    /// Counts tokens over a full message list.
    pub fn count_messages(&self, family: EndpointFamily, messages: &[UnifiedMessage]) -> u32 {
        messages.iter().map(|message| self.count_message(family, message)).sum()
    }

    fn count_message(&self, family: EndpointFamily, message: &UnifiedMessage) -> u32 {
        let role_tokens = MESSAGE_OVERHEAD + self.count_text(family, role_name(&message.role));

        let content_tokens = match &message.content {
            UnifiedContentContainer::Text(text) => self.count_text(family, text),
            UnifiedContentContainer::Blocks(blocks) => {
                blocks.iter().map(|block| self.count_content(family, block)).sum()
            }
        };

        let tool_call_tokens: u32 = message
            .tool_calls
            .iter()
            .flatten()
            .map(|call| {
                let arguments = match &call.function.arguments {
                    crate::messages::unified::UnifiedArguments::String(raw) => raw.clone(),
                    crate::messages::unified::UnifiedArguments::Value(value) => value.to_string(),
                };

                self.count_text(family, &call.function.name) + self.count_text(family, &arguments) + TOOL_CALL_SURCHARGE
            })
            .sum();

        role_tokens + content_tokens + tool_call_tokens
    }

    fn count_content(&self, family: EndpointFamily, content: &UnifiedContent) -> u32 {
        match content {
            UnifiedContent::Text { text } => self.count_text(family, text),
            UnifiedContent::Image { source } => self.count_image(family, source),
            UnifiedContent::ToolUse { name, input, .. } => {
                self.count_text(family, name) + self.count_text(family, &input.to_string()) + TOOL_CALL_SURCHARGE
            }
            UnifiedContent::ToolResult { content, .. } => {
                let text = match content {
                    UnifiedToolResultContent::Text(text) => text.clone(),
                    UnifiedToolResultContent::Multiple(parts) => parts.join("\n"),
                };
                self.count_text(family, &text)
            }
        }
    }

    fn count_image(&self, family: EndpointFamily, source: &crate::messages::unified::UnifiedImageSource) -> u32 {
        use crate::messages::unified::UnifiedImageSource;

        // No description is carried on an image part in the unified model,
        // so every image takes the without-description surcharge; the
        // media-type bonus only applies to inline data, which is the only
        // variant that declares one.
        match source {
            UnifiedImageSource::Base64 { .. } => {
                BASE_IMAGE_TOKENS + IMAGE_MEDIA_TYPE_SURCHARGE + IMAGE_SOURCE_TAG_SURCHARGE
            }
            UnifiedImageSource::Url { url } => {
                BASE_IMAGE_TOKENS + IMAGE_SOURCE_TAG_SURCHARGE + self.count_text(family, url) / 20
            }
        }
    }
}

fn role_name(role: &UnifiedRole) -> &'static str {
    match role {
        UnifiedRole::System => "system",
        UnifiedRole::User => "user",
        UnifiedRole::Assistant => "assistant",
        UnifiedRole::Tool => "tool",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedContentContainer, UnifiedImageSource, UnifiedMessage, UnifiedRole};

    fn text_message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn counts_are_positive_for_nonempty_text() {
        let tokenizer = Tokenizer::new();
        let count = tokenizer.count_text(EndpointFamily::Anthropic, "hello world");
        assert!(count > 0);
    }

    #[test]
    fn empty_text_counts_zero() {
        let tokenizer = Tokenizer::new();
        assert_eq!(tokenizer.count_text(EndpointFamily::Anthropic, ""), 0);
    }

    #[test]
    fn cache_returns_consistent_counts() {
        let tokenizer = Tokenizer::new();
        let first = tokenizer.count_text(EndpointFamily::OpenAi, "the quick brown fox");
        let second = tokenizer.count_text(EndpointFamily::OpenAi, "the quick brown fox");
        assert_eq!(first, second);
    }

    #[test]
    fn message_overhead_is_applied_per_message() {
        let tokenizer = Tokenizer::new();
        let messages = vec![text_message(UnifiedRole::User, "hi")];
        let total = tokenizer.count_messages(EndpointFamily::Anthropic, &messages);
        let bare = tokenizer.count_text(EndpointFamily::Anthropic, "hi");
        assert!(total > bare);
    }

    #[test]
    fn image_blocks_add_base_surcharge() {
        let tokenizer = Tokenizer::new();
        let messages = vec![UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::Image {
                source: UnifiedImageSource::Base64 { media_type: "image/png".to_string(), data: "AA".to_string() },
            }]),
            tool_calls: None,
            tool_call_id: None,
        }];

        let total = tokenizer.count_messages(EndpointFamily::Anthropic, &messages);
        assert!(total >= BASE_IMAGE_TOKENS);
    }

    #[test]
    fn fallback_encoder_never_panics_on_empty_bpe() {
        let tokenizer = Tokenizer { encoder: None, cache: Cache::builder().max_capacity(10).build() };
        let count = tokenizer.count_text(EndpointFamily::Anthropic, "abcd");
        assert_eq!(count, 1);
    }
}
