//! Shrinks an over-budget message list down to a target token count.
//!
//! Four strategies trade off fidelity against cost: three ask the upstream
//! model to summarize parts of the conversation, the fourth (smart
//! truncation) is a pure, local fallback used whenever an upstream call
//! fails or isn't worth the round trip. Results are cached since the same
//! (messages, strategy, target) triple recurs across retries within one
//! request and across turns of a long-running conversation.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::family::EndpointFamily;
use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRole};
use crate::token_counter::Tokenizer;

const CACHE_CAPACITY: usize = 100;
const SEGMENT_TOKEN_BUDGET: u32 = 4_000;
const CONDENSER_MAX_TOKENS: u32 = 600;
const CONDENSER_TEMPERATURE: f32 = 0.3;

/// Calls the same upstream family the live request is bound for, so a
/// condensation pass never crosses between Anthropic and OpenAI dialects.
///
/// Implemented by the upstream client; kept as a trait here so the
/// condenser can be tested without a live HTTP dependency.
#[async_trait]
pub(crate) trait Summarizer: Send + Sync {
    async fn summarize(&self, family: EndpointFamily, system_prompt: &str, content: &str) -> anyhow::Result<String>;
}

/// Outcome of a condensation pass.
pub(crate) struct CondenseResult {
    pub messages: Vec<UnifiedMessage>,
    pub strategy: String,
    pub tokens_saved: u32,
}

struct CacheEntry {
    result: Vec<UnifiedMessage>,
    tokens_saved: u32,
    inserted_at: Instant,
}

/// Caches condensation results and dispatches to one of the four
/// strategies, always degrading to [`smart_truncation`] on failure.
pub(crate) struct Condenser {
    cache: Mutex<HashMap<String, CacheEntry>>,
    cache_ttl: Duration,
    min_messages: usize,
}

impl Condenser {
    pub(crate) fn new(config: &config::CondensationConfig) -> Self {
        Self {
            cache: Mutex::new(HashMap::new()),
            cache_ttl: Duration::from_secs(3_600),
            min_messages: config.min_messages,
        }
    }

    /// True iff condensation should even be attempted: the conversation is
    /// long enough and utilization has crossed the caution threshold.
    pub(crate) fn should_condense(&self, utilization: f64, caution_threshold: f64, message_count: usize) -> bool {
        utilization >= caution_threshold && message_count >= self.min_messages
    }

    /// Condenses `messages` toward `target_tokens`, using `preferred` if
    /// given or the selection rule otherwise. Any upstream failure for an
    /// AI-backed strategy falls back to smart truncation rather than
    /// failing the request.
    pub(crate) async fn condense(
        &self,
        tokenizer: &Tokenizer,
        family: EndpointFamily,
        messages: &[UnifiedMessage],
        current_tokens: u32,
        target_tokens: u32,
        preferred: Option<&str>,
        summarizer: &dyn Summarizer,
    ) -> CondenseResult {
        let cache_key = cache_key(messages, preferred.unwrap_or(""), target_tokens);
        if let Some(cached) = self.cached(&cache_key) {
            return cached;
        }

        let strategy = preferred
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| select_strategy(messages.len(), current_tokens, target_tokens));

        let (result_messages, tokens_saved) = match strategy.as_str() {
            "progressive_summarization" => {
                match progressive_summarization(tokenizer, family, messages, target_tokens, summarizer).await {
                    Ok(out) => out,
                    Err(_) => smart_truncation(tokenizer, family, messages, target_tokens),
                }
            }
            "conversation_summary" => match conversation_summary(tokenizer, family, messages, target_tokens, summarizer).await {
                Ok(out) => out,
                Err(_) => smart_truncation(tokenizer, family, messages, target_tokens),
            },
            "key_point_extraction" => match key_point_extraction(tokenizer, family, messages, target_tokens, summarizer).await {
                Ok(out) => out,
                Err(_) => smart_truncation(tokenizer, family, messages, target_tokens),
            },
            _ => smart_truncation(tokenizer, family, messages, target_tokens),
        };

        self.store(&cache_key, &result_messages, tokens_saved);

        CondenseResult {
            messages: result_messages,
            strategy,
            tokens_saved,
        }
    }

    fn cached(&self, key: &str) -> Option<CondenseResult> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > self.cache_ttl {
            cache.remove(key);
            return None;
        }

        Some(CondenseResult {
            messages: entry.result.clone(),
            strategy: "cached".to_string(),
            tokens_saved: entry.tokens_saved,
        })
    }

    fn store(&self, key: &str, messages: &[UnifiedMessage], tokens_saved: u32) {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= CACHE_CAPACITY && !cache.contains_key(key) {
            if let Some(oldest) = cache.iter().min_by_key(|(_, e)| e.inserted_at).map(|(k, _)| k.clone()) {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key.to_string(),
            CacheEntry {
                result: messages.to_vec(),
                tokens_saved,
                inserted_at: Instant::now(),
            },
        );
    }
}

fn cache_key(messages: &[UnifiedMessage], strategy: &str, target_tokens: u32) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(role_tag(message));
        if let Ok(json) = serde_json::to_string(&message.content) {
            hasher.update(json);
        }
    }
    hasher.update(strategy);
    hasher.update(target_tokens.to_le_bytes());
    hex_encode(&hasher.finalize())
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn role_tag(message: &UnifiedMessage) -> &'static str {
    match message.role {
        UnifiedRole::System => "system",
        UnifiedRole::User => "user",
        UnifiedRole::Assistant => "assistant",
        UnifiedRole::Tool => "tool",
    }
}

fn select_strategy(message_count: usize, current_tokens: u32, target_tokens: u32) -> String {
    let strategy = if message_count > 20 {
        "progressive_summarization"
    } else if message_count > 10 {
        "conversation_summary"
    } else if target_tokens > 0 && (current_tokens as f64) > 0.9 * target_tokens as f64 {
        "smart_truncation"
    } else {
        "key_point_extraction"
    };
    strategy.to_string()
}

/// 30·(role=user) + 40·(has tool-use) + 50·recency_rank/n +
/// min(len/1000, 20) + 15·contains('?') + 20·contains('```')
fn importance_score(message: &UnifiedMessage, position: usize, total: usize) -> f64 {
    let mut score = 0.0;

    if message.role == UnifiedRole::User {
        score += 30.0;
    }

    let has_tool_use = match &message.content {
        UnifiedContentContainer::Blocks(blocks) => blocks.iter().any(|b| matches!(b, UnifiedContent::ToolUse { .. })),
        UnifiedContentContainer::Text(_) => false,
    } || message.tool_calls.is_some();
    if has_tool_use {
        score += 40.0;
    }

    let recency_rank = position as f64 + 1.0;
    score += 50.0 * recency_rank / total.max(1) as f64;

    let len = message_text(message).len();
    score += (len as f64 / 1_000.0).min(20.0);

    let text = message_text(message);
    if text.contains('?') {
        score += 15.0;
    }
    if text.contains("```") {
        score += 20.0;
    }

    score
}

fn is_preserved(message: &UnifiedMessage, position: usize, total: usize) -> bool {
    message.role == UnifiedRole::System || importance_score(message, position, total) >= 50.0
}

fn message_text(message: &UnifiedMessage) -> String {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.clone(),
        UnifiedContentContainer::Blocks(blocks) => blocks.iter().filter_map(UnifiedContent::as_text).collect::<Vec<_>>().join("\n"),
    }
}

fn synthetic_assistant(text: String) -> UnifiedMessage {
    UnifiedMessage {
        role: UnifiedRole::Assistant,
        content: UnifiedContentContainer::Text(text),
        tool_calls: None,
        tool_call_id: None,
    }
}

/// No upstream call: keeps system messages, walks the rest newest-first
/// admitting whole messages under `target_tokens`, truncating the first
/// one that would overflow.
pub(crate) fn smart_truncation(
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    messages: &[UnifiedMessage],
    target_tokens: u32,
) -> (Vec<UnifiedMessage>, u32) {
    let before_tokens = tokenizer.count_messages(family, messages);

    let system: Vec<UnifiedMessage> = messages.iter().filter(|m| m.role == UnifiedRole::System).cloned().collect();
    let rest: Vec<&UnifiedMessage> = messages.iter().filter(|m| m.role != UnifiedRole::System).collect();

    let mut used = tokenizer.count_messages(family, &system);
    let mut kept: Vec<UnifiedMessage> = Vec::new();

    for message in rest.iter().rev() {
        let message_tokens = tokenizer.count_messages(family, std::slice::from_ref(*message));

        if used + message_tokens <= target_tokens {
            used += message_tokens;
            kept.push((*message).clone());
            continue;
        }

        let target_remaining = target_tokens.saturating_sub(used);
        if target_remaining > 0 {
            kept.push(truncate_message(message, target_remaining));
        }
        break;
    }

    kept.reverse();
    let mut result = system;
    result.extend(kept);

    let after_tokens = tokenizer.count_messages(family, &result);
    (result, before_tokens.saturating_sub(after_tokens))
}

fn truncate_message(message: &UnifiedMessage, target_remaining: u32) -> UnifiedMessage {
    match &message.content {
        UnifiedContentContainer::Text(text) => {
            let char_budget = (target_remaining as usize) * 3;
            let truncated = if text.len() > char_budget {
                format!("{}... [truncated]", &text[..floor_char_boundary(text, char_budget)])
            } else {
                text.clone()
            };
            UnifiedMessage {
                content: UnifiedContentContainer::Text(truncated),
                ..message.clone()
            }
        }
        UnifiedContentContainer::Blocks(blocks) => {
            let keep = ((target_remaining as usize) / 1_000).max(1);
            let mut kept: Vec<UnifiedContent> = blocks.iter().take(keep).cloned().collect();
            if blocks.len() > keep {
                kept.push(UnifiedContent::Text {
                    text: "[truncated]".to_string(),
                });
            }
            UnifiedMessage {
                content: UnifiedContentContainer::Blocks(kept),
                ..message.clone()
            }
        }
    }
}

async fn key_point_extraction(
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    messages: &[UnifiedMessage],
    target_tokens: u32,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<(Vec<UnifiedMessage>, u32)> {
    let before_tokens = tokenizer.count_messages(family, messages);
    let total = messages.len();

    let (preserved, rest): (Vec<_>, Vec<_>) = messages
        .iter()
        .enumerate()
        .partition(|(i, m)| is_preserved(m, *i, total));

    if rest.is_empty() {
        let result: Vec<UnifiedMessage> = preserved.into_iter().map(|(_, m)| m.clone()).collect();
        return Ok((result, 0));
    }

    let remainder_text = rest.iter().map(|(_, m)| message_text(m)).collect::<Vec<_>>().join("\n---\n");
    let bullets = summarizer
        .summarize(
            family,
            "Extract the key points of this conversation excerpt as a concise bulleted list.",
            &remainder_text,
        )
        .await?;

    let mut result: Vec<UnifiedMessage> = preserved.into_iter().map(|(_, m)| m.clone()).collect();
    result.push(synthetic_assistant(format!("[condensed key points]\n{bullets}")));

    let after_tokens = tokenizer.count_messages(family, &result);
    let _ = target_tokens;
    Ok((result, before_tokens.saturating_sub(after_tokens)))
}

async fn conversation_summary(
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    messages: &[UnifiedMessage],
    target_tokens: u32,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<(Vec<UnifiedMessage>, u32)> {
    let before_tokens = tokenizer.count_messages(family, messages);
    let total = messages.len();

    let (preserved, rest): (Vec<_>, Vec<_>) = messages
        .iter()
        .enumerate()
        .partition(|(i, m)| is_preserved(m, *i, total));

    let segments = segment_by_tokens(tokenizer, family, &rest.iter().map(|(_, m)| (*m).clone()).collect::<Vec<_>>(), SEGMENT_TOKEN_BUDGET);

    let mut summaries = Vec::with_capacity(segments.len());
    for segment in &segments {
        let text = segment.iter().map(message_text).collect::<Vec<_>>().join("\n---\n");
        let summary = summarizer
            .summarize(
                family,
                "Summarize this conversation segment: note decisions made, questions asked and answered, and technical details needed to continue.",
                &text,
            )
            .await
            .unwrap_or_else(|_| heuristic_excerpt(&text));
        summaries.push(synthetic_assistant(format!("[condensed summary]\n{summary}")));
    }

    let (system_preserved, recent_preserved): (Vec<_>, Vec<_>) = preserved
        .into_iter()
        .map(|(_, m)| m.clone())
        .partition(|m| m.role == UnifiedRole::System);

    let mut result = system_preserved;
    result.extend(summaries);
    result.extend(recent_preserved);

    let after_tokens = tokenizer.count_messages(family, &result);
    let _ = target_tokens;
    Ok((result, before_tokens.saturating_sub(after_tokens)))
}

async fn progressive_summarization(
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    messages: &[UnifiedMessage],
    target_tokens: u32,
    summarizer: &dyn Summarizer,
) -> anyhow::Result<(Vec<UnifiedMessage>, u32)> {
    let before_tokens = tokenizer.count_messages(family, messages);
    let total = messages.len();

    let (preserved, rest): (Vec<UnifiedMessage>, Vec<UnifiedMessage>) = messages
        .iter()
        .enumerate()
        .map(|(i, m)| (i, m.clone()))
        .fold((Vec::new(), Vec::new()), |(mut preserved, mut rest), (i, m)| {
            if is_preserved(&m, i, total) {
                preserved.push(m);
            } else {
                rest.push(m);
            }
            (preserved, rest)
        });

    let layer_size = rest.len().div_ceil(3).max(1);
    let mut layers: Vec<&[UnifiedMessage]> = rest.chunks(layer_size).collect();
    layers.truncate(3);

    let mut summaries = Vec::new();
    for layer in layers {
        let text = layer.iter().map(message_text).collect::<Vec<_>>().join("\n---\n");
        if text.trim().is_empty() {
            continue;
        }
        let summary = summarizer
            .summarize(family, "Summarize this layer of the conversation concisely.", &text)
            .await
            .unwrap_or_else(|_| heuristic_excerpt(&text));
        summaries.push(synthetic_assistant(format!("[condensed layer]\n{summary}")));
    }

    let mut result = preserved;
    result.splice(0..0, summaries);

    let after_tokens = tokenizer.count_messages(family, &result);
    let _ = target_tokens;
    Ok((result, before_tokens.saturating_sub(after_tokens)))
}

fn segment_by_tokens(tokenizer: &Tokenizer, family: EndpointFamily, messages: &[UnifiedMessage], budget: u32) -> Vec<Vec<UnifiedMessage>> {
    let mut segments = Vec::new();
    let mut current = Vec::new();
    let mut current_tokens = 0u32;

    for message in messages {
        let tokens = tokenizer.count_messages(family, std::slice::from_ref(message));
        if current_tokens + tokens > budget && !current.is_empty() {
            segments.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(message.clone());
    }
    if !current.is_empty() {
        segments.push(current);
    }

    segments
}

/// Local fallback for a single segment's summarization failure: a
/// heuristic excerpt rather than a full re-truncation pass.
fn heuristic_excerpt(text: &str) -> String {
    const EXCERPT_CHARS: usize = 500;
    if text.len() <= EXCERPT_CHARS {
        text.to_string()
    } else {
        format!("{}...", &text[..floor_char_boundary(text, EXCERPT_CHARS)])
    }
}

/// Largest byte index `<= limit` that lies on a UTF-8 char boundary, so
/// truncation never splits a multi-byte character.
fn floor_char_boundary(s: &str, limit: usize) -> usize {
    if limit >= s.len() {
        return s.len();
    }
    (0..=limit).rev().find(|&i| s.is_char_boundary(i)).unwrap_or(0)
}

pub(crate) const MAX_TOKENS: u32 = CONDENSER_MAX_TOKENS;
pub(crate) const TEMPERATURE: f32 = CONDENSER_TEMPERATURE;

/// Condenses `messages` chunk-by-chunk through `chunk_store`, reusing any
/// fresh `Condensed` content and only paying for a fresh condensation pass
/// on chunks the store doesn't already have. Returns the reconstructed
/// message list, the strategy label (`"chunk_cached"` when every chunk was
/// already fresh), and total tokens saved.
pub(crate) async fn condense_via_chunks(
    chunk_store: &super::chunk_store::ChunkStore,
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    messages: &[UnifiedMessage],
    is_vision: bool,
    global_target: u32,
    summarizer: &dyn Summarizer,
) -> (Vec<UnifiedMessage>, String, u32) {
    let chunks = chunk_store.split(tokenizer, family, messages, is_vision);
    if chunks.is_empty() {
        return (messages.to_vec(), "chunk_cached".to_string(), 0);
    }

    let per_chunk_target = (global_target / chunks.len() as u32).max(1);

    let mut result = Vec::new();
    let mut tokens_saved = 0u32;
    let mut all_cached = true;

    for chunk in &chunks {
        use super::chunk_store::ChunkState;

        let chunk_tokens = tokenizer.count_messages(family, &chunk.messages);
        let target = per_chunk_target.max(chunk_tokens / 2).max(1);

        let condensed_text = match chunk_store.state(&chunk.chunk_id) {
            ChunkState::Condensed => chunk_store.condensed_content(&chunk.chunk_id).await,
            _ => None,
        };

        let condensed_text = match condensed_text {
            Some(text) => text,
            None => {
                all_cached = false;
                let before = chunk_tokens;
                let prompt = format!(
                    "Summarize this conversation chunk in roughly {target} tokens, preserving decisions, open questions, and technical details."
                );
                let summarize_result = chunk_store
                    .condense_with(&chunk.chunk_id, "chunk_summary", || async move {
                        let text = summarizer
                            .summarize(
                                family,
                                &prompt,
                                &chunk.messages.iter().map(message_text).collect::<Vec<_>>().join("\n---\n"),
                            )
                            .await
                            .unwrap_or_else(|_| heuristic_excerpt(&chunk.messages.iter().map(message_text).collect::<Vec<_>>().join("\n")));

                        let after = tokenizer.count_text(family, &text);
                        Ok((text, before.saturating_sub(after)))
                    })
                    .await;

                match summarize_result {
                    Ok(text) => text,
                    Err(_) => chunk.messages.iter().map(message_text).collect::<Vec<_>>().join("\n"),
                }
            }
        };

        tokens_saved += chunk_tokens.saturating_sub(tokenizer.count_text(family, &condensed_text));
        result.push(synthetic_assistant(format!("[condensed chunk {}]\n{}", chunk.chunk_id, condensed_text)));
    }

    let strategy = if all_cached { "chunk_cached" } else { "chunk_condensed" };
    (result, strategy.to_string(), tokens_saved)
}

#[cfg(test)]
mod tests {
    use super::*;

    struct FailingSummarizer;
    #[async_trait]
    impl Summarizer for FailingSummarizer {
        async fn summarize(&self, _family: EndpointFamily, _system_prompt: &str, _content: &str) -> anyhow::Result<String> {
            Err(anyhow::anyhow!("upstream unavailable"))
        }
    }

    struct EchoSummarizer;
    #[async_trait]
    impl Summarizer for EchoSummarizer {
        async fn summarize(&self, _family: EndpointFamily, _system_prompt: &str, content: &str) -> anyhow::Result<String> {
            Ok(format!("summary-of({})", content.len()))
        }
    }

    fn message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn condenser() -> Condenser {
        Condenser::new(&config::CondensationConfig::default())
    }

    #[test]
    fn select_strategy_picks_progressive_for_long_conversations() {
        assert_eq!(select_strategy(25, 1000, 2000), "progressive_summarization");
    }

    #[test]
    fn select_strategy_picks_smart_truncation_when_near_target() {
        assert_eq!(select_strategy(5, 950, 1000), "smart_truncation");
    }

    #[test]
    fn select_strategy_defaults_to_key_point_extraction() {
        assert_eq!(select_strategy(5, 100, 1000), "key_point_extraction");
    }

    #[test]
    fn should_condense_requires_both_utilization_and_length() {
        let c = condenser();
        assert!(!c.should_condense(0.9, 0.7, 1));
        assert!(c.should_condense(0.9, 0.7, c.min_messages));
        assert!(!c.should_condense(0.5, 0.7, 20));
    }

    #[test]
    fn smart_truncation_preserves_system_messages() {
        let tokenizer = Tokenizer::new();
        let messages = vec![
            message(UnifiedRole::System, "be nice"),
            message(UnifiedRole::User, &"x".repeat(5000)),
            message(UnifiedRole::Assistant, "ok"),
        ];
        let (result, _saved) = smart_truncation(&tokenizer, EndpointFamily::Anthropic, &messages, 50);
        assert_eq!(result[0].role, UnifiedRole::System);
    }

    #[tokio::test]
    async fn condense_falls_back_to_smart_truncation_on_summarizer_failure() {
        let tokenizer = Tokenizer::new();
        let c = condenser();
        let messages: Vec<_> = (0..15).map(|i| message(UnifiedRole::User, &format!("message {i}"))).collect();
        let summarizer = FailingSummarizer;

        let result = c
            .condense(&tokenizer, EndpointFamily::Anthropic, &messages, 1000, 200, None, &summarizer)
            .await;

        assert!(!result.messages.is_empty());
    }

    #[tokio::test]
    async fn condense_uses_cache_on_second_call() {
        let tokenizer = Tokenizer::new();
        let c = condenser();
        let messages = vec![message(UnifiedRole::User, "hello")];
        let summarizer = EchoSummarizer;

        let first = c
            .condense(&tokenizer, EndpointFamily::Anthropic, &messages, 10, 5, Some("key_point_extraction"), &summarizer)
            .await;
        let second = c
            .condense(&tokenizer, EndpointFamily::Anthropic, &messages, 10, 5, Some("key_point_extraction"), &summarizer)
            .await;

        assert_eq!(second.strategy, "cached");
        assert_eq!(first.messages.len(), second.messages.len());
    }
}
