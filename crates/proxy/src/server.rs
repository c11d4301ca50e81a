//! Wires the building blocks other modules own — tokenizer, context
//! manager, router, upstream client, log sink — into the single handler the
//! HTTP layer calls into.

use std::borrow::Cow;
use std::sync::Arc;
use std::time::Instant;

use futures::StreamExt;

use crate::context::chunk_store::ChunkStore;
use crate::context::context_manager::ContextManager;
use crate::error::LlmError;
use crate::family::EndpointFamily;
use crate::log_sink::LogSink;
use crate::messages::openai;
use crate::messages::unified::{
    UnifiedChoiceDelta, UnifiedChunk, UnifiedContentContainer, UnifiedMessage, UnifiedMessageDelta, UnifiedObjectType, UnifiedRequest, UnifiedResponse,
    UnifiedRole,
};
use crate::provider::{ChunkStream, UpstreamClient};
use crate::request::RequestContext;
use crate::router::{self, RouteDecision};
use crate::token_counter::Tokenizer;
use crate::token_scaler;

/// The rescale factor `/v1/messages/count_tokens` applies to vision-routed
/// requests when `SCALE_COUNT_TOKENS_FOR_VISION` is enabled. The real
/// upstream's own count endpoint doesn't itself rescale for vision, so the
/// observable default is a no-op factor; operators who've measured a
/// different vision overhead can still flip the toggle off entirely.
const VISION_COUNT_SCALE: f64 = 1.0;

/// Result of [`LlmHandler::count_tokens`].
pub(crate) struct CountTokens {
    pub token_count: u32,
    pub vision_scaled: bool,
}

/// Builds an [`LlmHandler`] from process configuration.
pub(crate) struct LlmServerBuilder<'a> {
    config: &'a config::Config,
}

impl<'a> LlmServerBuilder<'a> {
    pub(crate) fn new(config: &'a config::Config) -> Self {
        Self { config }
    }

    pub(crate) async fn build(self) -> anyhow::Result<LlmHandler> {
        let config = self.config;
        let upstream = UpstreamClient::new(config)?;
        let tokenizer = Tokenizer::new();

        let chunk_store = Arc::new(ChunkStore::new(&config.condensation, &config.cache_dir));
        let _cleaner = chunk_store.clone().spawn_cleaner();

        let context_manager = ContextManager::new(&config.condensation).with_chunk_store(chunk_store);
        let log_sink = LogSink::spawn(config.log_dir.clone(), config.logging_profile);

        Ok(LlmHandler {
            upstream,
            tokenizer,
            context_manager,
            log_sink,
            model_map: config.model.clone(),
            env_dedup: config.env_dedup.clone(),
        })
    }
}

/// Owns every request-scoped collaborator and exposes the four operations
/// the HTTP layer drives: completing (streaming or not), counting tokens,
/// and listing models.
pub(crate) struct LlmHandler {
    upstream: UpstreamClient,
    tokenizer: Tokenizer,
    context_manager: ContextManager,
    log_sink: LogSink,
    model_map: config::ModelMapConfig,
    env_dedup: config::EnvDedupConfig,
}

impl LlmHandler {
    /// Non-streaming completion: route, shrink the conversation to fit the
    /// target window if needed, call upstream, rescale reported usage into
    /// the client-facing dialect's own window.
    pub(crate) async fn completions(&self, request: UnifiedRequest, context: &RequestContext, downstream: EndpointFamily) -> Result<UnifiedResponse, LlmError> {
        let (decision, prepared) = self.prepare(request, &context.correlation_id).await;
        self.log_upstream_request(&context.correlation_id, &decision, &prepared, false);

        let started = Instant::now();
        let result = self.upstream.chat_completion(prepared, decision.family, context).await;
        self.log_completion(&context.correlation_id, decision.family, started, &result);

        let mut response = result?;
        response.usage = token_scaler::scale_usage(response.usage, decision.family, downstream, decision.is_vision);
        Ok(response)
    }

    /// Streaming completion. When upstream answers a streaming request with
    /// a non-event-stream body, synthesizes the three-frame fallback
    /// (role, full content, terminal-with-usage) instead of surfacing an
    /// error — the client still gets a complete, well-formed stream.
    pub(crate) async fn completions_stream(
        &self,
        request: UnifiedRequest,
        context: &RequestContext,
        downstream: EndpointFamily,
    ) -> Result<ChunkStream, LlmError> {
        let (decision, prepared) = self.prepare(request, &context.correlation_id).await;
        self.log_upstream_request(&context.correlation_id, &decision, &prepared, true);

        let started = Instant::now();
        let outcome = self.upstream.chat_completion_stream(prepared, decision.family, context).await;
        log::debug!(
            "correlation_id={} upstream stream dispatch for {} took {:?}",
            context.correlation_id,
            decision.family.as_str(),
            started.elapsed()
        );

        let family = decision.family;
        let is_vision = decision.is_vision;

        match outcome? {
            Ok(stream) => {
                let rescaled = stream.map(move |item| {
                    item.map(|mut chunk| {
                        if let Some(usage) = chunk.usage.take() {
                            chunk.usage = Some(token_scaler::scale_usage(usage, family, downstream, is_vision));
                        }
                        chunk
                    })
                });
                Ok(Box::pin(rescaled))
            }
            Err(fallback) => Ok(synthesize_fallback_stream(fallback.response, family, downstream, is_vision)),
        }
    }

    /// `/v1/messages/count_tokens`: counts without mutating the
    /// conversation (no dedup/condensation applied), rescaling for vision
    /// only when the caller opted into `SCALE_COUNT_TOKENS_FOR_VISION`.
    pub(crate) async fn count_tokens(&self, request: UnifiedRequest, _context: &RequestContext) -> Result<CountTokens, LlmError> {
        let decision = router::route(&request, &self.model_map);

        let mut raw = self.tokenizer.count_messages(decision.family, &request.messages);
        raw += request
            .system
            .iter()
            .map(|block| self.tokenizer.count_text(decision.family, block))
            .sum::<u32>();

        let vision_scaled = decision.is_vision && self.model_map.scale_count_tokens_for_vision;
        let token_count = if vision_scaled { ((raw as f64) * VISION_COUNT_SCALE).round() as u32 } else { raw };

        Ok(CountTokens { token_count, vision_scaled })
    }

    pub(crate) async fn models(&self) -> openai::ModelsResponse {
        let mut ids: Vec<String> = self.model_map.model_map.values().cloned().collect();
        ids.extend(self.model_map.autotext_model.clone());
        ids.extend(self.model_map.autovision_model.clone());
        ids.sort();
        ids.dedup();

        let models = ids
            .into_iter()
            .map(|id| crate::messages::unified::UnifiedModel {
                display_name: id.clone(),
                id,
                object_type: UnifiedObjectType::Model,
                created: 0,
                owned_by: "proxy".to_string(),
            })
            .collect();

        openai::ModelsResponse::from(crate::messages::unified::UnifiedModelsResponse {
            object_type: UnifiedObjectType::List,
            models,
            has_more: false,
        })
    }

    /// Routes the request, folds the system prompt into the message list so
    /// it's counted and preserved by the same preserve-system-messages
    /// invariant the condensation pipeline already honors, runs the
    /// dedup/condense/truncate pipeline, then splits the (possibly
    /// condensed) system messages back out before handing the request to
    /// the upstream client.
    async fn prepare(&self, mut request: UnifiedRequest, correlation_id: &str) -> (RouteDecision, UnifiedRequest) {
        let decision = router::route(&request, &self.model_map);
        let regime = window_regime_for(decision.family, decision.is_vision);
        let limit = self.model_map.windows.get(regime);

        let system_tokens: u32 = request
            .system
            .iter()
            .map(|block| self.tokenizer.count_text(decision.family, block))
            .sum();
        let effective_limit = limit.saturating_sub(system_tokens);

        let mut combined: Vec<UnifiedMessage> = request.system.drain(..).map(system_message).collect();
        combined.append(&mut request.messages);

        let apply_result = self
            .context_manager
            .apply(
                &self.tokenizer,
                decision.family,
                &self.env_dedup,
                combined,
                effective_limit,
                decision.is_vision,
                &self.upstream,
            )
            .await;

        if apply_result.tokens_saved > 0 || apply_result.strategy != "monitor_only" {
            self.log_sink.performance_metric(
                correlation_id,
                serde_json::json!({
                    "strategy": apply_result.strategy,
                    "tokens_saved": apply_result.tokens_saved,
                    "degraded": apply_result.degraded,
                    "family": decision.family.as_str(),
                }),
            );
        }

        let (system_msgs, rest): (Vec<_>, Vec<_>) = apply_result.messages.into_iter().partition(|m| m.role == UnifiedRole::System);

        request.system = system_msgs.iter().map(message_text).collect();
        request.messages = rest;
        request.model = decision.upstream_model.clone();

        (decision, request)
    }

    fn log_upstream_request(&self, correlation_id: &str, decision: &RouteDecision, request: &UnifiedRequest, streaming: bool) {
        let preview = request.messages.last().map(message_text).map(|text| self.log_sink.truncate_body(&text));

        self.log_sink.upstream_request(
            correlation_id,
            serde_json::json!({
                "family": decision.family.as_str(),
                "model": request.model,
                "message_count": request.messages.len(),
                "streaming": streaming,
                "is_vision": decision.is_vision,
                "last_message_preview": preview,
            }),
        );
    }

    fn log_completion(&self, correlation_id: &str, family: EndpointFamily, started: Instant, result: &Result<UnifiedResponse, LlmError>) {
        let elapsed_ms = started.elapsed().as_millis() as u64;
        match result {
            Ok(response) => self.log_sink.upstream_response(
                correlation_id,
                serde_json::json!({
                    "family": family.as_str(),
                    "elapsed_ms": elapsed_ms,
                    "prompt_tokens": response.usage.prompt_tokens,
                    "completion_tokens": response.usage.completion_tokens,
                }),
            ),
            Err(e) => self.log_sink.error(
                correlation_id,
                serde_json::json!({
                    "family": family.as_str(),
                    "elapsed_ms": elapsed_ms,
                    "error": e.to_string(),
                }),
            ),
        }
    }
}

fn window_regime_for(family: EndpointFamily, is_vision: bool) -> config::WindowRegime {
    match (family, is_vision) {
        (EndpointFamily::Anthropic, _) => config::WindowRegime::AnthropicText,
        (EndpointFamily::OpenAi, true) => config::WindowRegime::OpenAiVision,
        (EndpointFamily::OpenAi, false) => config::WindowRegime::OpenAiText,
    }
}

fn system_message(text: String) -> UnifiedMessage {
    UnifiedMessage {
        role: UnifiedRole::System,
        content: UnifiedContentContainer::Text(text),
        tool_calls: None,
        tool_call_id: None,
    }
}

fn message_text(message: &UnifiedMessage) -> String {
    match &message.content {
        UnifiedContentContainer::Text(text) => text.clone(),
        UnifiedContentContainer::Blocks(blocks) => blocks
            .iter()
            .filter_map(crate::messages::unified::UnifiedContent::as_text)
            .collect::<Vec<_>>()
            .join("\n"),
    }
}

/// Builds the three-frame stream (role, full content, terminal-with-usage)
/// a non-streaming upstream reply is turned into when the caller asked for
/// streaming but the upstream didn't deliver an event-stream body.
fn synthesize_fallback_stream(response: UnifiedResponse, upstream: EndpointFamily, downstream: EndpointFamily, is_vision: bool) -> ChunkStream {
    let choice = response.choices.into_iter().next();
    let text = choice.as_ref().map(|c| message_text(&c.message)).unwrap_or_default();
    let finish_reason = choice.and_then(|c| c.finish_reason);
    let usage = token_scaler::scale_usage(response.usage, upstream, downstream, is_vision);

    let id: Cow<'static, str> = Cow::Owned(response.id);
    let model: Cow<'static, str> = Cow::Owned(response.model);

    let role_chunk = UnifiedChunk {
        id: id.clone(),
        model: model.clone(),
        choices: vec![UnifiedChoiceDelta {
            index: 0,
            delta: UnifiedMessageDelta {
                role: Some(UnifiedRole::Assistant),
                content: None,
                tool_calls: None,
            },
            finish_reason: None,
        }],
        usage: None,
        created: response.created,
    };

    let content_chunk = UnifiedChunk {
        id: id.clone(),
        model: model.clone(),
        choices: vec![UnifiedChoiceDelta {
            index: 0,
            delta: UnifiedMessageDelta {
                role: None,
                content: Some(text),
                tool_calls: None,
            },
            finish_reason: None,
        }],
        usage: None,
        created: response.created,
    };

    let terminal_chunk = UnifiedChunk {
        id,
        model,
        choices: vec![UnifiedChoiceDelta {
            index: 0,
            delta: UnifiedMessageDelta {
                role: None,
                content: None,
                tool_calls: None,
            },
            finish_reason,
        }],
        usage: Some(usage),
        created: response.created,
    };

    Box::pin(futures::stream::iter(vec![Ok(role_chunk), Ok(content_chunk), Ok(terminal_chunk)]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_regime_picks_anthropic_text_regardless_of_vision_flag() {
        assert_eq!(window_regime_for(EndpointFamily::Anthropic, true), config::WindowRegime::AnthropicText);
        assert_eq!(window_regime_for(EndpointFamily::Anthropic, false), config::WindowRegime::AnthropicText);
    }

    #[test]
    fn window_regime_distinguishes_openai_vision_from_text() {
        assert_eq!(window_regime_for(EndpointFamily::OpenAi, true), config::WindowRegime::OpenAiVision);
        assert_eq!(window_regime_for(EndpointFamily::OpenAi, false), config::WindowRegime::OpenAiText);
    }

    #[test]
    fn message_text_joins_block_text_parts() {
        let message = UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![
                crate::messages::unified::UnifiedContent::Text { text: "a".to_string() },
                crate::messages::unified::UnifiedContent::Text { text: "b".to_string() },
            ]),
            tool_calls: None,
            tool_call_id: None,
        };
        assert_eq!(message_text(&message), "a\nb");
    }
}
