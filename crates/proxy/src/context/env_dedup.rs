//! Detects and removes redundant `<environment_details>` blocks that
//! clients (commonly coding-agent harnesses) inject into user messages on
//! every turn.

use std::collections::HashSet;
use std::sync::LazyLock;

use regex::Regex;

use crate::family::EndpointFamily;
use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedMessage, UnifiedRole};
use crate::token_counter::Tokenizer;

static ENV_BLOCK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)<environment_details>.*?</environment_details>").expect("valid regex"));

/// A single `<environment_details>` detection within one message.
#[derive(Debug, Clone)]
struct EnvBlock {
    message_index: usize,
    /// `None` when the message's content is the plain-text container;
    /// `Some(i)` when it's a text part within a block list.
    part_index: Option<usize>,
    start: usize,
    end: usize,
    text: String,
}

/// Outcome of a deduplication pass.
pub(crate) struct DedupResult {
    /// Number of blocks removed.
    pub blocks_removed: usize,
    /// Tokens saved, measured by re-tokenizing before and after.
    pub tokens_saved: u32,
}

/// Removes redundant environment-details blocks from `messages` in place,
/// per the configured strategy, and reports how many tokens that saved.
pub(crate) fn dedupe(
    tokenizer: &Tokenizer,
    family: EndpointFamily,
    config: &config::EnvDedupConfig,
    messages: &mut Vec<UnifiedMessage>,
) -> DedupResult {
    let blocks = detect(messages);
    if blocks.len() <= 1 {
        return DedupResult { blocks_removed: 0, tokens_saved: 0 };
    }

    let before_tokens = tokenizer.count_messages(family, messages);

    let decision = match config.strategy.as_str() {
        "keep_most_relevant" => keep_most_relevant(&blocks, messages.len()),
        "merge" => merge(&blocks),
        "selective" => selective(&blocks),
        _ => keep_latest(&blocks),
    };

    let removed = apply_decision(messages, blocks, decision);

    let after_tokens = tokenizer.count_messages(family, messages);

    DedupResult {
        blocks_removed: removed,
        tokens_saved: before_tokens.saturating_sub(after_tokens),
    }
}

/// Per-block strategy decision: either drop it, or keep it with the byte
/// range replaced by `Some(text)` (used by `merge`).
enum Decision {
    Drop,
    Keep(Option<String>),
}

fn detect(messages: &[UnifiedMessage]) -> Vec<EnvBlock> {
    let mut blocks = Vec::new();

    for (message_index, message) in messages.iter().enumerate() {
        if message.role != UnifiedRole::User {
            continue;
        }

        match &message.content {
            UnifiedContentContainer::Text(text) => push_matches(&mut blocks, message_index, None, text),
            UnifiedContentContainer::Blocks(parts) => {
                for (part_index, part) in parts.iter().enumerate() {
                    if let UnifiedContent::Text { text } = part {
                        push_matches(&mut blocks, message_index, Some(part_index), text);
                    }
                }
            }
        }
    }

    blocks
}

fn push_matches(blocks: &mut Vec<EnvBlock>, message_index: usize, part_index: Option<usize>, text: &str) {
    for found in ENV_BLOCK.find_iter(text) {
        blocks.push(EnvBlock {
            message_index,
            part_index,
            start: found.start(),
            end: found.end(),
            text: found.as_str().to_string(),
        });
    }
}

/// Keeps only the block with the highest `(message_index, start)`, i.e.
/// the most recently injected one.
fn keep_latest(blocks: &[EnvBlock]) -> Vec<Decision> {
    let keep_index = blocks
        .iter()
        .enumerate()
        .max_by_key(|(_, b)| (b.message_index, b.start))
        .map(|(i, _)| i);

    blocks
        .iter()
        .enumerate()
        .map(|(i, _)| if Some(i) == keep_index { Decision::Keep(None) } else { Decision::Drop })
        .collect()
}

fn keep_most_relevant(blocks: &[EnvBlock], _total_messages: usize) -> Vec<Decision> {
    let recencies = recency_ranks(blocks);

    let keep_index = blocks
        .iter()
        .zip(&recencies)
        .enumerate()
        .max_by(|(_, (a, ra)), (_, (b, rb))| relevance_score(a, **ra).total_cmp(&relevance_score(b, **rb)))
        .map(|(i, _)| i);

    blocks
        .iter()
        .enumerate()
        .map(|(i, _)| if Some(i) == keep_index { Decision::Keep(None) } else { Decision::Drop })
        .collect()
}

/// Recency as a rank fraction among the detected blocks themselves, not
/// wall-clock time (environment blocks carry no timestamp of their own).
/// When every block embeds an explicit `Timestamp:` line, that's used to
/// order them instead of their position in the conversation.
fn recency_ranks(blocks: &[EnvBlock]) -> Vec<f64> {
    let timestamps: Vec<Option<&str>> = blocks.iter().map(|b| extract_timestamp(&b.text)).collect();
    let total = blocks.len() as f64;

    if !blocks.is_empty() && timestamps.iter().all(Option::is_some) {
        let mut order: Vec<usize> = (0..blocks.len()).collect();
        order.sort_by_key(|&i| timestamps[i]);

        let mut ranks = vec![0.0; blocks.len()];
        for (rank, index) in order.into_iter().enumerate() {
            ranks[index] = (rank + 1) as f64 / total;
        }
        ranks
    } else {
        (0..blocks.len()).map(|i| (i + 1) as f64 / total).collect()
    }
}

fn extract_timestamp(text: &str) -> Option<&str> {
    text.lines().find_map(|line| {
        let (key, value) = line.split_once(':')?;
        key.trim().eq_ignore_ascii_case("timestamp").then(|| value.trim())
    })
}

fn relevance_score(block: &EnvBlock, recency: f64) -> f64 {
    let length_norm = (block.text.len() as f64 / 500.0).min(1.0);
    let structure = structure_score(&block.text);

    0.4 * recency + 0.3 * length_norm + 0.3 * structure
}

fn structure_score(text: &str) -> f64 {
    const CREDIT: f64 = 0.2;
    let mut score = 0.0;

    if text.contains(':') {
        score += CREDIT;
    }
    if text.lines().count() > 1 {
        score += CREDIT;
    }
    if text.contains('/') || text.contains('\\') {
        score += CREDIT;
    }
    if text.contains("://") {
        score += CREDIT;
    }
    if text.contains('{') || text.contains('[') {
        score += CREDIT;
    }

    score.min(1.0)
}

/// Keeps the newest block as a base, appending any line from each older
/// block absent from the running merged text.
fn merge(blocks: &[EnvBlock]) -> Vec<Decision> {
    let newest_index = blocks
        .iter()
        .enumerate()
        .max_by_key(|(_, b)| (b.message_index, b.start))
        .map(|(i, _)| i)
        .expect("non-empty blocks");

    let mut seen_lines: HashSet<&str> = blocks[newest_index].text.lines().collect();
    let mut merged = blocks[newest_index].text.clone();

    let mut older: Vec<usize> = (0..blocks.len()).filter(|&i| i != newest_index).collect();
    older.sort_by_key(|&i| (blocks[i].message_index, blocks[i].start));

    for &i in &older {
        for line in blocks[i].text.lines() {
            if !seen_lines.contains(line) {
                merged.push('\n');
                merged.push_str(line);
                seen_lines.insert(line);
            }
        }
    }

    blocks
        .iter()
        .enumerate()
        .map(|(i, _)| if i == newest_index { Decision::Keep(Some(merged.clone())) } else { Decision::Drop })
        .collect()
}

/// Groups blocks by pairwise word-Jaccard similarity >= 0.9; within each
/// group keeps only the newest, leaving singleton blocks untouched.
fn selective(blocks: &[EnvBlock]) -> Vec<Decision> {
    let word_sets: Vec<HashSet<&str>> = blocks.iter().map(|b| b.text.split_whitespace().collect()).collect();

    let mut group_of: Vec<Option<usize>> = vec![None; blocks.len()];
    let mut groups: Vec<Vec<usize>> = Vec::new();

    for i in 0..blocks.len() {
        if group_of[i].is_some() {
            continue;
        }

        let mut group = vec![i];
        for j in (i + 1)..blocks.len() {
            if group_of[j].is_some() {
                continue;
            }
            if jaccard(&word_sets[i], &word_sets[j]) >= 0.9 {
                group.push(j);
            }
        }

        let group_id = groups.len();
        for &member in &group {
            group_of[member] = Some(group_id);
        }
        groups.push(group);
    }

    let mut decisions: Vec<Decision> = (0..blocks.len()).map(|_| Decision::Keep(None)).collect();

    for group in &groups {
        if group.len() < 2 {
            continue;
        }
        let newest = *group
            .iter()
            .max_by_key(|&&i| (blocks[i].message_index, blocks[i].start))
            .expect("non-empty group");

        for &i in group {
            decisions[i] = if i == newest { Decision::Keep(None) } else { Decision::Drop };
        }
    }

    decisions
}

fn jaccard(a: &HashSet<&str>, b: &HashSet<&str>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 { 0.0 } else { intersection / union }
}

/// Applies per-block decisions to the message list, splicing byte ranges
/// out (or replacing them, for `merge`) in descending start order so
/// earlier splices in the same text don't invalidate later offsets.
fn apply_decision(messages: &mut [UnifiedMessage], mut blocks: Vec<EnvBlock>, decisions: Vec<Decision>) -> usize {
    let mut removed = 0;

    // Pair blocks with decisions, then group by (message_index, part_index)
    // and apply each group's edits from the highest start offset down.
    let mut edits: Vec<(EnvBlock, Decision)> = blocks.drain(..).zip(decisions).collect();
    edits.sort_by(|a, b| {
        (a.0.message_index, a.0.part_index, std::cmp::Reverse(a.0.start)).cmp(&(
            b.0.message_index,
            b.0.part_index,
            std::cmp::Reverse(b.0.start),
        ))
    });

    for (block, decision) in edits {
        let replacement = match decision {
            Decision::Drop => {
                removed += 1;
                String::new()
            }
            Decision::Keep(Some(text)) => text,
            Decision::Keep(None) => continue,
        };

        splice(messages, &block, &replacement);
    }

    removed
}

fn splice(messages: &mut [UnifiedMessage], block: &EnvBlock, replacement: &str) {
    let message = &mut messages[block.message_index];

    match (&mut message.content, block.part_index) {
        (UnifiedContentContainer::Text(text), None) => {
            text.replace_range(block.start..block.end, replacement);
        }
        (UnifiedContentContainer::Blocks(parts), Some(part_index)) => {
            if let Some(UnifiedContent::Text { text }) = parts.get_mut(part_index) {
                text.replace_range(block.start..block.end, replacement);
                if text.trim().is_empty() {
                    parts.remove(part_index);
                }
            }
        }
        _ => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::UnifiedMessage;

    fn config(strategy: &str) -> config::EnvDedupConfig {
        config::EnvDedupConfig { strategy: strategy.to_string(), max_age: std::time::Duration::from_secs(1800) }
    }

    fn user_text(text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    fn as_text(message: &UnifiedMessage) -> String {
        match &message.content {
            UnifiedContentContainer::Text(text) => text.clone(),
            UnifiedContentContainer::Blocks(parts) => parts
                .iter()
                .filter_map(|part| match part {
                    UnifiedContent::Text { text } => Some(text.clone()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }

    #[test]
    fn keeps_only_latest_block_by_default() {
        let tokenizer = Tokenizer::new();
        let mut messages = vec![
            user_text("<environment_details>old: a</environment_details> first question"),
            user_text("some reply"),
            user_text("<environment_details>new: b</environment_details> second question"),
        ];

        let result = dedupe(&tokenizer, EndpointFamily::Anthropic, &config("keep_latest"), &mut messages);

        assert_eq!(result.blocks_removed, 1);
        assert!(!as_text(&messages[0]).contains("environment_details"));
        assert!(as_text(&messages[2]).contains("new: b"));
    }

    #[test]
    fn single_block_is_left_untouched() {
        let tokenizer = Tokenizer::new();
        let mut messages = vec![user_text("<environment_details>solo</environment_details> hi")];

        let result = dedupe(&tokenizer, EndpointFamily::Anthropic, &config("keep_latest"), &mut messages);

        assert_eq!(result.blocks_removed, 0);
        assert!(as_text(&messages[0]).contains("environment_details"));
    }

    #[test]
    fn merge_keeps_lines_unique_to_older_blocks() {
        let tokenizer = Tokenizer::new();
        let mut messages = vec![
            user_text("<environment_details>cwd: /a\nbranch: main</environment_details>"),
            user_text("<environment_details>cwd: /a</environment_details>"),
        ];

        dedupe(&tokenizer, EndpointFamily::Anthropic, &config("merge"), &mut messages);

        assert!(as_text(&messages[1]).contains("branch: main"));
        assert!(!as_text(&messages[0]).contains("environment_details"));
    }

    #[test]
    fn whitespace_only_part_is_removed_entirely() {
        let tokenizer = Tokenizer::new();
        let mut messages = vec![UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![
                UnifiedContent::Text { text: "<environment_details>old</environment_details>".to_string() },
                UnifiedContent::Text { text: "<environment_details>new</environment_details>".to_string() },
            ]),
            tool_calls: None,
            tool_call_id: None,
        }];

        dedupe(&tokenizer, EndpointFamily::Anthropic, &config("keep_latest"), &mut messages);

        let UnifiedContentContainer::Blocks(parts) = &messages[0].content else {
            unreachable!("expected blocks container");
        };
        assert_eq!(parts.len(), 1);
    }
}
