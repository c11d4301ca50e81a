//! Decides how aggressively to shrink a conversation before it is sent
//! upstream, based on how full the target context window already is.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use sha2::{Digest, Sha256};

use crate::context::chunk_store::ChunkStore;
use crate::context::condenser::{Condenser, Summarizer};
use crate::family::EndpointFamily;
use crate::messages::unified::{UnifiedContentContainer, UnifiedMessage, UnifiedRole};
use crate::token_counter::Tokenizer;

const ANALYSIS_CACHE_CAPACITY: usize = 100;
const ANALYSIS_CACHE_TTL: Duration = Duration::from_secs(300);
const EMERGENCY_MARGIN: u32 = 100;

/// How close a conversation is to its context window, and what that
/// implies should happen to it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RiskLevel {
    Safe,
    Caution,
    Warning,
    Critical,
    Overflow,
}

/// The action a [`RiskLevel`] implies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Action {
    MonitorOnly,
    CondensationLight,
    CondensationAggressive,
    EmergencyTruncation,
}

/// Result of [`ContextManager::analyze`].
#[derive(Debug, Clone)]
pub(crate) struct ContextAnalysis {
    pub current_tokens: u32,
    pub limit: u32,
    pub utilization: f64,
    pub risk: RiskLevel,
    pub action: Action,
}

/// Result of [`ContextManager::apply`].
pub(crate) struct ApplyResult {
    pub messages: Vec<UnifiedMessage>,
    pub strategy: String,
    pub tokens_saved: u32,
    /// Set when the pipeline had to fall back after an internal error;
    /// callers may want to surface this in diagnostics without failing
    /// the request.
    pub degraded: bool,
}

struct AnalysisCacheEntry {
    analysis: ContextAnalysis,
    inserted_at: Instant,
}

/// Owns the condensation policy: analyzes how full a window is and, when
/// asked to apply, runs the env-dedup → condense → truncate pipeline,
/// never letting an internal failure surface as a request failure.
pub(crate) struct ContextManager {
    condenser: Condenser,
    thresholds: config::CondensationThresholds,
    analysis_cache: Mutex<HashMap<String, AnalysisCacheEntry>>,
    chunk_store: Option<Arc<ChunkStore>>,
    chunk_based_enabled: bool,
    chunk_trigger_messages: usize,
}

impl ContextManager {
    pub(crate) fn new(config: &config::CondensationConfig) -> Self {
        Self {
            condenser: Condenser::new(config),
            thresholds: config.thresholds,
            analysis_cache: Mutex::new(HashMap::new()),
            chunk_store: None,
            chunk_based_enabled: config.chunk_based_enabled,
            chunk_trigger_messages: config.max_messages_to_condense,
        }
    }

    /// Attaches the persistent chunk store, switching condensation onto the
    /// chunked path once a conversation grows past
    /// [`CondensationConfig::max_messages_to_condense`].
    pub(crate) fn with_chunk_store(mut self, chunk_store: Arc<ChunkStore>) -> Self {
        self.chunk_store = Some(chunk_store);
        self
    }

    /// Measures `messages` against `limit` and classifies the risk level,
    /// memoizing on a digest of the conversation.
    pub(crate) fn analyze(&self, tokenizer: &Tokenizer, family: EndpointFamily, messages: &[UnifiedMessage], limit: u32) -> ContextAnalysis {
        let key = digest(messages, limit);

        if let Some(analysis) = self.cached_analysis(&key) {
            return analysis;
        }

        let current_tokens = tokenizer.count_messages(family, messages);
        let analysis = classify(current_tokens, limit, &self.thresholds);

        let mut cache = self.analysis_cache.lock().unwrap_or_else(|e| e.into_inner());
        if cache.len() >= ANALYSIS_CACHE_CAPACITY && !cache.contains_key(&key) {
            if let Some(oldest) = cache.iter().min_by_key(|(_, e)| e.inserted_at).map(|(k, _)| k.clone()) {
                cache.remove(&oldest);
            }
        }
        cache.insert(
            key,
            AnalysisCacheEntry {
                analysis: analysis.clone(),
                inserted_at: Instant::now(),
            },
        );

        analysis
    }

    fn cached_analysis(&self, key: &str) -> Option<ContextAnalysis> {
        let mut cache = self.analysis_cache.lock().unwrap_or_else(|e| e.into_inner());
        let entry = cache.get(key)?;
        if entry.inserted_at.elapsed() > ANALYSIS_CACHE_TTL {
            cache.remove(key);
            return None;
        }
        Some(entry.analysis.clone())
    }

    /// Runs the full apply pipeline: env-dedup, re-analyze, and escalate
    /// through condensation to emergency truncation as the risk demands.
    pub(crate) async fn apply(
        &self,
        tokenizer: &Tokenizer,
        family: EndpointFamily,
        env_dedup_config: &config::EnvDedupConfig,
        mut messages: Vec<UnifiedMessage>,
        limit: u32,
        is_vision: bool,
        summarizer: &dyn Summarizer,
    ) -> ApplyResult {
        let dedup = crate::context::env_dedup::dedupe(tokenizer, family, env_dedup_config, &mut messages);

        let analysis = self.analyze(tokenizer, family, &messages, limit);

        match analysis.risk {
            RiskLevel::Safe | RiskLevel::Caution => ApplyResult {
                messages,
                strategy: "monitor_only".to_string(),
                tokens_saved: dedup.tokens_saved,
                degraded: false,
            },
            RiskLevel::Warning | RiskLevel::Critical => {
                let target = if analysis.risk == RiskLevel::Warning {
                    (limit as f64 * self.thresholds.warning) as u32
                } else {
                    (limit as f64 * self.thresholds.caution) as u32
                };

                let condensed = if self.chunk_based_enabled && messages.len() > self.chunk_trigger_messages {
                    match &self.chunk_store {
                        Some(chunk_store) => {
                            let (messages, strategy, tokens_saved) = crate::context::condenser::condense_via_chunks(
                                chunk_store,
                                tokenizer,
                                family,
                                &messages,
                                is_vision,
                                target,
                                summarizer,
                            )
                            .await;
                            crate::context::condenser::CondenseResult { messages, strategy, tokens_saved }
                        }
                        None => {
                            self.condenser
                                .condense(tokenizer, family, &messages, analysis.current_tokens, target, None, summarizer)
                                .await
                        }
                    }
                } else {
                    self.condenser
                        .condense(tokenizer, family, &messages, analysis.current_tokens, target, None, summarizer)
                        .await
                };

                let after_tokens = tokenizer.count_messages(family, &condensed.messages);
                if after_tokens <= limit {
                    ApplyResult {
                        messages: condensed.messages,
                        strategy: condensed.strategy,
                        tokens_saved: dedup.tokens_saved + condensed.tokens_saved,
                        degraded: false,
                    }
                } else {
                    let (truncated, truncated_saved) =
                        crate::context::condenser::smart_truncation(tokenizer, family, &condensed.messages, limit.saturating_sub(EMERGENCY_MARGIN));
                    ApplyResult {
                        messages: truncated,
                        strategy: "emergency_truncation".to_string(),
                        tokens_saved: dedup.tokens_saved + condensed.tokens_saved + truncated_saved,
                        degraded: false,
                    }
                }
            }
            RiskLevel::Overflow => {
                let (truncated, truncated_saved) = crate::context::condenser::smart_truncation(tokenizer, family, &messages, limit.saturating_sub(EMERGENCY_MARGIN));
                ApplyResult {
                    messages: truncated,
                    strategy: "emergency_truncation".to_string(),
                    tokens_saved: dedup.tokens_saved + truncated_saved,
                    degraded: false,
                }
            }
        }
    }
}

fn classify(current_tokens: u32, limit: u32, thresholds: &config::CondensationThresholds) -> ContextAnalysis {
    let utilization = if limit == 0 { 1.0 } else { current_tokens as f64 / limit as f64 };

    let (risk, action) = if utilization >= thresholds.overflow {
        (RiskLevel::Overflow, Action::EmergencyTruncation)
    } else if utilization >= thresholds.critical {
        (RiskLevel::Critical, Action::CondensationAggressive)
    } else if utilization >= thresholds.warning {
        (RiskLevel::Warning, Action::CondensationLight)
    } else if utilization >= thresholds.caution {
        (RiskLevel::Caution, Action::MonitorOnly)
    } else {
        (RiskLevel::Safe, Action::MonitorOnly)
    };

    ContextAnalysis {
        current_tokens,
        limit,
        utilization,
        risk,
        action,
    }
}

fn digest(messages: &[UnifiedMessage], limit: u32) -> String {
    let mut hasher = Sha256::new();
    for message in messages {
        hasher.update(role_byte(message));
        if let UnifiedContentContainer::Text(text) = &message.content {
            hasher.update((text.len() as u64).to_le_bytes());
        } else if let Ok(json) = serde_json::to_string(&message.content) {
            hasher.update((json.len() as u64).to_le_bytes());
        }
    }
    hasher.update(limit.to_le_bytes());
    hasher.finalize().iter().map(|b| format!("{b:02x}")).collect()
}

fn role_byte(message: &UnifiedMessage) -> u8 {
    match message.role {
        UnifiedRole::System => 0,
        UnifiedRole::User => 1,
        UnifiedRole::Assistant => 2,
        UnifiedRole::Tool => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    struct NoopSummarizer;
    #[async_trait]
    impl Summarizer for NoopSummarizer {
        async fn summarize(&self, _family: EndpointFamily, _system_prompt: &str, _content: &str) -> anyhow::Result<String> {
            Ok("summary".to_string())
        }
    }

    fn manager() -> ContextManager {
        ContextManager::new(&config::CondensationConfig::default())
    }

    fn message(role: UnifiedRole, text: &str) -> UnifiedMessage {
        UnifiedMessage {
            role,
            content: UnifiedContentContainer::Text(text.to_string()),
            tool_calls: None,
            tool_call_id: None,
        }
    }

    #[test]
    fn classify_assigns_overflow_at_full_utilization() {
        let thresholds = config::CondensationThresholds::default();
        let analysis = classify(1000, 1000, &thresholds);
        assert_eq!(analysis.risk, RiskLevel::Overflow);
        assert_eq!(analysis.action, Action::EmergencyTruncation);
    }

    #[test]
    fn classify_assigns_safe_below_caution() {
        let thresholds = config::CondensationThresholds::default();
        let analysis = classify(100, 1000, &thresholds);
        assert_eq!(analysis.risk, RiskLevel::Safe);
    }

    #[tokio::test]
    async fn apply_returns_unmodified_messages_when_safe() {
        let tokenizer = Tokenizer::new();
        let manager = manager();
        let summarizer = NoopSummarizer;
        let messages = vec![message(UnifiedRole::User, "hi")];

        let result = manager
            .apply(
                &tokenizer,
                EndpointFamily::Anthropic,
                &config::EnvDedupConfig::default(),
                messages,
                200_000,
                false,
                &summarizer,
            )
            .await;

        assert_eq!(result.strategy, "monitor_only");
        assert!(!result.degraded);
    }

    #[tokio::test]
    async fn apply_emergency_truncates_on_overflow() {
        let tokenizer = Tokenizer::new();
        let manager = manager();
        let summarizer = NoopSummarizer;
        let messages: Vec<_> = (0..20).map(|i| message(UnifiedRole::User, &"word ".repeat(500 + i))).collect();

        let result = manager
            .apply(
                &tokenizer,
                EndpointFamily::Anthropic,
                &config::EnvDedupConfig::default(),
                messages,
                100,
                false,
                &summarizer,
            )
            .await;

        assert_eq!(result.strategy, "emergency_truncation");
    }
}
