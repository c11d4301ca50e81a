//! Talks to the single upstream model family in whichever dialect the live
//! request is bound for.
//!
//! Unlike a multi-provider gateway, this proxy has exactly one upstream: a
//! model provider that happens to expose both an Anthropic-compatible base
//! and an OpenAI-compatible base for the same models. [`UpstreamClient`]
//! picks the base and wire dialect from the [`EndpointFamily`] the router
//! already decided on, POSTs the translated request, retries transport and
//! 5xx failures with doubling backoff, and turns upstream SSE (of either
//! grammar) into the protocol-agnostic [`UnifiedChunk`] stream the bridge
//! consumes.

use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::{Stream, StreamExt};
use reqwest::Client;
use reqwest::header::{AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use secrecy::{ExposeSecret, SecretString};

use crate::context::condenser::{self, Summarizer};
use crate::error::LlmError;
use crate::family::EndpointFamily;
use crate::http_client::default_http_client_builder;
use crate::messages::unified::{UnifiedChunk, UnifiedRequest, UnifiedResponse};
use crate::messages::{anthropic, openai};
use crate::request::RequestContext;

const ANTHROPIC_VERSION: &str = "2023-06-01";
/// Fallback condensation model when no `AUTOTEXT_MODEL` alias is configured.
const DEFAULT_ANTHROPIC_SUMMARY_MODEL: &str = "claude-3-5-haiku-20241022";
/// Fallback condensation model for the OpenAI dialect.
const DEFAULT_OPENAI_SUMMARY_MODEL: &str = "gpt-4o-mini";

/// The stream type handed back to the bridge: protocol-agnostic chunks,
/// already decoupled from whichever upstream grammar produced them.
pub(crate) type ChunkStream = Pin<Box<dyn Stream<Item = Result<UnifiedChunk, LlmError>> + Send>>;

/// A non-streaming upstream response that arrived with the wrong
/// content-type for the streaming request that asked for it, so the caller
/// can fall back to synthesizing a three-frame stream from it.
pub(crate) struct NonStreamFallback {
    pub response: UnifiedResponse,
}

pub(crate) struct UpstreamClient {
    client: Client,
    anthropic_base: String,
    openai_base: String,
    upstream_key: Option<SecretString>,
    forward_client_key: Option<SecretString>,
    /// Model used for the condenser's own summarization calls, which carry
    /// no client-declared model of their own.
    autotext_model: Option<String>,
    timeouts: config::TimeoutConfig,
    retry: config::RetryConfig,
    force_cache_control_beta: bool,
    cache_control_beta_value: String,
}

impl UpstreamClient {
    pub(crate) fn new(config: &config::Config) -> anyhow::Result<Self> {
        let client = default_http_client_builder()
            .connect_timeout(config.timeouts.connect)
            .timeout(config.timeouts.request)
            .build()?;

        Ok(Self {
            client,
            anthropic_base: config.upstream.anthropic_base.clone(),
            openai_base: config
                .upstream
                .openai_base
                .clone()
                .unwrap_or_else(|| config.upstream.anthropic_base.clone()),
            upstream_key: config.upstream.upstream_key.clone(),
            forward_client_key: config.upstream.forward_client_key.clone(),
            autotext_model: config.model.autotext_model.clone(),
            timeouts: config.timeouts,
            retry: config.retry,
            force_cache_control_beta: config.upstream.force_cache_control_beta,
            cache_control_beta_value: config.upstream.cache_control_beta_value.clone(),
        })
    }

    fn base_url(&self, family: EndpointFamily) -> &str {
        match family {
            EndpointFamily::Anthropic => &self.anthropic_base,
            EndpointFamily::OpenAi => &self.openai_base,
        }
    }

    /// Caller-supplied credential first, then the key configured to forward
    /// on clients' behalf, then the proxy's own upstream key.
    fn resolve_key(&self, caller: Option<&SecretString>) -> Option<SecretString> {
        caller
            .cloned()
            .or_else(|| self.forward_client_key.clone())
            .or_else(|| self.upstream_key.clone())
    }

    fn anthropic_headers(&self, context: Option<&RequestContext>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        let version = context.map(|c| c.anthropic_version.as_str()).unwrap_or(ANTHROPIC_VERSION);
        if let Ok(value) = HeaderValue::from_str(version) {
            headers.insert("anthropic-version", value);
        }

        if let Some(beta) = context.and_then(|c| c.anthropic_beta.as_deref()) {
            if let Ok(value) = HeaderValue::from_str(beta) {
                headers.insert("anthropic-beta", value);
            }
        } else if self.force_cache_control_beta
            && context.is_some_and(|c| c.has_cache_control)
            && let Ok(value) = HeaderValue::from_str(&self.cache_control_beta_value)
        {
            headers.insert("anthropic-beta", value);
        }

        let key = self.resolve_key(context.and_then(|c| c.api_key.as_ref()));
        if let Some(key) = key
            && let Ok(value) = HeaderValue::from_str(key.expose_secret())
        {
            headers.insert("x-api-key", value);
        }

        headers
    }

    fn openai_headers(&self, context: Option<&RequestContext>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        if let Some(authorization) = context.and_then(|c| c.authorization.as_ref()) {
            if let Ok(value) = HeaderValue::from_str(authorization.expose_secret()) {
                headers.insert(AUTHORIZATION, value);
            }
            return headers;
        }

        let key = self.resolve_key(None);
        if let Some(key) = key
            && let Ok(value) = HeaderValue::from_str(&format!("Bearer {}", key.expose_secret()))
        {
            headers.insert(AUTHORIZATION, value);
        }

        headers
    }

    /// Non-streaming completion: translates, dispatches with retry, and
    /// translates the response back.
    pub(crate) async fn chat_completion(
        &self,
        request: UnifiedRequest,
        family: EndpointFamily,
        context: &RequestContext,
    ) -> Result<UnifiedResponse, LlmError> {
        match family {
            EndpointFamily::Anthropic => {
                let url = format!("{}/v1/messages", self.base_url(family));
                let mut wire = anthropic::AnthropicChatRequest::from(request);
                wire.stream = Some(false);
                let headers = self.anthropic_headers(Some(context));
                let body = sonic_rs::to_vec(&wire).map_err(|e| {
                    log::error!("failed to serialize anthropic chat request: {e}");
                    LlmError::InternalError(None)
                })?;

                let response = self.post_with_retry(&url, headers, body, self.timeouts.request).await?;
                let response_text = read_body(response).await?;

                let anthropic_response: anthropic::AnthropicChatResponse = sonic_rs::from_str(&response_text).map_err(|e| {
                    log::error!("failed to parse anthropic chat response: {e}");
                    log::error!("raw response: {response_text}");
                    LlmError::InternalError(None)
                })?;

                Ok(UnifiedResponse::from(anthropic_response))
            }
            EndpointFamily::OpenAi => {
                let url = format!("{}/v1/chat/completions", self.base_url(family));
                let mut wire = openai::ChatCompletionRequest::from(request);
                wire.stream = Some(false);
                let headers = self.openai_headers(Some(context));
                let body = sonic_rs::to_vec(&wire).map_err(|e| {
                    log::error!("failed to serialize openai chat request: {e}");
                    LlmError::InternalError(None)
                })?;

                let response = self.post_with_retry(&url, headers, body, self.timeouts.request).await?;
                let response_text = read_body(response).await?;

                let openai_response: openai::ChatCompletionResponse = sonic_rs::from_str(&response_text).map_err(|e| {
                    log::error!("failed to parse openai chat response: {e}");
                    log::error!("raw response: {response_text}");
                    LlmError::InternalError(None)
                })?;

                Ok(UnifiedResponse::from(openai_response))
            }
        }
    }

    /// Streaming completion: on success, consumes upstream SSE frame by
    /// frame, translating each into [`UnifiedChunk`]s as they arrive. If the
    /// upstream answers with a non-event-stream body, falls back to the
    /// non-streaming path so the caller can synthesize a three-frame stream.
    pub(crate) async fn chat_completion_stream(
        &self,
        request: UnifiedRequest,
        family: EndpointFamily,
        context: &RequestContext,
    ) -> Result<Result<ChunkStream, NonStreamFallback>, LlmError> {
        match family {
            EndpointFamily::Anthropic => {
                let url = format!("{}/v1/messages", self.base_url(family));
                let mut wire = anthropic::AnthropicChatRequest::from(request);
                wire.stream = Some(true);
                let headers = self.anthropic_headers(Some(context));
                let body = sonic_rs::to_vec(&wire).map_err(|e| {
                    log::error!("failed to serialize anthropic streaming request: {e}");
                    LlmError::InternalError(None)
                })?;

                let response = self.post_with_retry(&url, headers, body, self.timeouts.stream).await?;
                // Classify the status before inspecting content-type: an error body
                // is never event-stream-shaped and must not be treated as a
                // successful non-streaming fallback.
                let response = map_status_error(response).await?;

                if !is_event_stream(&response) {
                    let response_text = response.text().await.map_err(|e| {
                        log::error!("failed to read upstream response body: {e}");
                        LlmError::InternalError(None)
                    })?;
                    let parsed: anthropic::AnthropicChatResponse = sonic_rs::from_str(&response_text).map_err(|e| {
                        log::error!("failed to parse anthropic non-stream fallback body: {e}");
                        LlmError::InternalError(None)
                    })?;
                    return Ok(Err(NonStreamFallback {
                        response: UnifiedResponse::from(parsed),
                    }));
                }

                let byte_stream = response.bytes_stream();
                let event_stream = byte_stream.eventsource();

                let chunk_stream = futures::stream::unfold(Box::pin(event_stream), |mut stream| async move {
                    loop {
                        let event = stream.next().await?;

                        let Ok(event) = event else {
                            log::warn!("SSE parsing error in anthropic upstream stream");
                            return Some((Err(LlmError::ConnectionError("upstream stream closed unexpectedly".to_string())), stream));
                        };

                        let Ok(parsed) = sonic_rs::from_str::<anthropic::AnthropicStreamEvent>(&event.data) else {
                            log::warn!("failed to parse anthropic streaming event: {}", event.data);
                            continue;
                        };

                        if let anthropic::AnthropicStreamEvent::Error { error } = &parsed {
                            log::error!("anthropic stream error event: {} - {}", error.error_type, error.message);
                            return Some((Err(LlmError::ProviderApiError { status: 0, message: error.message.clone() }), stream));
                        }

                        return Some((Ok(UnifiedChunk::from(parsed)), stream));
                    }
                });

                Ok(Ok(Box::pin(chunk_stream)))
            }
            EndpointFamily::OpenAi => {
                let url = format!("{}/v1/chat/completions", self.base_url(family));
                let mut wire = openai::ChatCompletionRequest::from(request);
                wire.stream = Some(true);
                let headers = self.openai_headers(Some(context));
                let body = sonic_rs::to_vec(&wire).map_err(|e| {
                    log::error!("failed to serialize openai streaming request: {e}");
                    LlmError::InternalError(None)
                })?;

                let response = self.post_with_retry(&url, headers, body, self.timeouts.stream).await?;
                let response = map_status_error(response).await?;

                if !is_event_stream(&response) {
                    let response_text = response.text().await.map_err(|e| {
                        log::error!("failed to read upstream response body: {e}");
                        LlmError::InternalError(None)
                    })?;
                    let parsed: openai::ChatCompletionResponse = sonic_rs::from_str(&response_text).map_err(|e| {
                        log::error!("failed to parse openai non-stream fallback body: {e}");
                        LlmError::InternalError(None)
                    })?;
                    return Ok(Err(NonStreamFallback {
                        response: UnifiedResponse::from(parsed),
                    }));
                }

                let byte_stream = response.bytes_stream();
                let event_stream = byte_stream.eventsource();

                let chunk_stream = futures::stream::unfold(Box::pin(event_stream), |mut stream| async move {
                    loop {
                        let event = stream.next().await?;

                        let Ok(event) = event else {
                            log::warn!("SSE parsing error in openai upstream stream");
                            return Some((Err(LlmError::ConnectionError("upstream stream closed unexpectedly".to_string())), stream));
                        };

                        if event.data == "[DONE]" {
                            return None;
                        }

                        let Ok(parsed) = sonic_rs::from_str::<openai::ChatCompletionChunk>(&event.data) else {
                            log::warn!("failed to parse openai streaming chunk: {}", event.data);
                            continue;
                        };

                        return Some((Ok(UnifiedChunk::from(parsed)), stream));
                    }
                });

                Ok(Ok(Box::pin(chunk_stream)))
            }
        }
    }

    /// POSTs with doubling backoff. Retries transport failures and 5xx
    /// responses only; 4xx responses are returned unmodified for the caller
    /// to classify. On exhaustion, returns [`LlmError::ConnectionError`],
    /// which the client-facing error mapping turns into a 502.
    async fn post_with_retry(&self, url: &str, headers: HeaderMap, body: Vec<u8>, timeout: Duration) -> Result<reqwest::Response, LlmError> {
        let mut backoff = self.retry.backoff_base;

        for attempt in 1..=self.retry.max_attempts {
            let result = self
                .client
                .post(url)
                .headers(headers.clone())
                .timeout(timeout)
                .body(body.clone())
                .send()
                .await;

            match result {
                Ok(response) if response.status().is_server_error() => {
                    if attempt >= self.retry.max_attempts {
                        let status = response.status();
                        let text = response.text().await.unwrap_or_default();
                        log::error!("upstream server error after {attempt} attempts ({status}): {text}");
                        return Err(LlmError::ConnectionError(format!("upstream returned {status} after {attempt} attempts")));
                    }
                    log::warn!("upstream server error ({}), retrying in {backoff:?} (attempt {attempt}/{})", response.status(), self.retry.max_attempts);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
                Ok(response) => return Ok(response),
                Err(e) => {
                    if attempt >= self.retry.max_attempts {
                        log::error!("upstream transport error after {attempt} attempts: {e}");
                        return Err(LlmError::ConnectionError(e.to_string()));
                    }
                    log::warn!("upstream transport error, retrying in {backoff:?} (attempt {attempt}/{}): {e}", self.retry.max_attempts);
                    tokio::time::sleep(backoff).await;
                    backoff *= 2;
                }
            }
        }

        unreachable!("retry loop always returns within max_attempts iterations")
    }
}

/// Returns `Ok(response)` when the response is a success; otherwise consumes
/// it and classifies the status into a typed, non-retried error.
async fn map_status_error(response: reqwest::Response) -> Result<reqwest::Response, LlmError> {
    if response.status().is_success() {
        return Ok(response);
    }

    let status = response.status();
    let error_text = response.text().await.unwrap_or_else(|_| "unknown error".to_string());
    log::error!("upstream API error ({status}): {error_text}");

    Err(match status.as_u16() {
        401 => LlmError::AuthenticationFailed(error_text),
        403 => LlmError::InsufficientQuota(error_text),
        404 => LlmError::ModelNotFound(error_text),
        429 => LlmError::RateLimitExceeded { message: error_text },
        400 => LlmError::InvalidRequest(error_text),
        500 => LlmError::InternalError(Some(error_text)),
        _ => LlmError::ProviderApiError {
            status: status.as_u16(),
            message: error_text,
        },
    })
}

async fn read_body(response: reqwest::Response) -> Result<String, LlmError> {
    let response = match map_status_error(response).await {
        Ok(response) => response,
        Err(e) => return Err(e),
    };

    response.text().await.map_err(|e| {
        log::error!("failed to read upstream response body: {e}");
        LlmError::InternalError(None)
    })
}

fn is_event_stream(response: &reqwest::Response) -> bool {
    response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.starts_with("text/event-stream"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> UpstreamClient {
        UpstreamClient {
            client: Client::new(),
            anthropic_base: "https://api.anthropic.com".to_string(),
            openai_base: "https://api.anthropic.com".to_string(),
            upstream_key: None,
            forward_client_key: None,
            autotext_model: None,
            timeouts: config::TimeoutConfig::default(),
            retry: config::RetryConfig::default(),
            force_cache_control_beta: true,
            cache_control_beta_value: "prompt-caching-2024-07-31".to_string(),
        }
    }

    fn context_with_cache_control(has_cache_control: bool) -> RequestContext {
        crate::request::extract_context(&HeaderMap::new()).with_cache_control(has_cache_control)
    }

    #[test]
    fn forces_beta_header_when_cache_control_detected_and_none_supplied() {
        let context = context_with_cache_control(true);
        let headers = client().anthropic_headers(Some(&context));
        assert_eq!(headers.get("anthropic-beta").unwrap(), "prompt-caching-2024-07-31");
    }

    #[test]
    fn does_not_force_beta_header_without_cache_control() {
        let context = context_with_cache_control(false);
        let headers = client().anthropic_headers(Some(&context));
        assert!(headers.get("anthropic-beta").is_none());
    }

    #[test]
    fn caller_supplied_beta_header_is_never_overridden() {
        let mut context = context_with_cache_control(true);
        context.anthropic_beta = Some("custom-beta".to_string());
        let headers = client().anthropic_headers(Some(&context));
        assert_eq!(headers.get("anthropic-beta").unwrap(), "custom-beta");
    }

    #[test]
    fn forcing_disabled_never_adds_the_header() {
        let mut c = client();
        c.force_cache_control_beta = false;
        let context = context_with_cache_control(true);
        let headers = c.anthropic_headers(Some(&context));
        assert!(headers.get("anthropic-beta").is_none());
    }
}

/// Implements condensation's upstream-backed summarization strategies as a
/// same-family, single-turn chat completion: short, deterministic, and
/// never streamed.
#[async_trait]
impl Summarizer for UpstreamClient {
    async fn summarize(&self, family: EndpointFamily, system_prompt: &str, content: &str) -> anyhow::Result<String> {
        let model = self.autotext_model.clone().unwrap_or_else(|| match family {
            EndpointFamily::Anthropic => DEFAULT_ANTHROPIC_SUMMARY_MODEL.to_string(),
            EndpointFamily::OpenAi => DEFAULT_OPENAI_SUMMARY_MODEL.to_string(),
        });
        let request = UnifiedRequest {
            model,
            messages: vec![crate::messages::unified::UnifiedMessage {
                role: crate::messages::unified::UnifiedRole::User,
                content: crate::messages::unified::UnifiedContentContainer::Text(content.to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            system: vec![system_prompt.to_string()],
            max_tokens: Some(condenser::MAX_TOKENS),
            temperature: Some(condenser::TEMPERATURE),
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: None,
            stream: Some(false),
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            metadata: None,
        };

        let headers = match family {
            EndpointFamily::Anthropic => self.anthropic_headers(None),
            EndpointFamily::OpenAi => self.openai_headers(None),
        };

        let url = match family {
            EndpointFamily::Anthropic => format!("{}/v1/messages", self.base_url(family)),
            EndpointFamily::OpenAi => format!("{}/v1/chat/completions", self.base_url(family)),
        };

        let body = match family {
            EndpointFamily::Anthropic => sonic_rs::to_vec(&anthropic::AnthropicChatRequest::from(request))?,
            EndpointFamily::OpenAi => sonic_rs::to_vec(&openai::ChatCompletionRequest::from(request))?,
        };

        let response = self
            .post_with_retry(&url, headers, body, self.timeouts.request)
            .await
            .map_err(|e| anyhow::anyhow!("summarization call failed: {e}"))?;
        let response_text = read_body(response).await.map_err(|e| anyhow::anyhow!("summarization call failed: {e}"))?;

        let unified = match family {
            EndpointFamily::Anthropic => {
                let parsed: anthropic::AnthropicChatResponse = sonic_rs::from_str(&response_text)?;
                UnifiedResponse::from(parsed)
            }
            EndpointFamily::OpenAi => {
                let parsed: openai::ChatCompletionResponse = sonic_rs::from_str(&response_text)?;
                UnifiedResponse::from(parsed)
            }
        };

        let text = unified
            .choices
            .first()
            .and_then(|choice| match &choice.message.content {
                crate::messages::unified::UnifiedContentContainer::Text(text) => Some(text.clone()),
                crate::messages::unified::UnifiedContentContainer::Blocks(blocks) => {
                    let joined = blocks
                        .iter()
                        .filter_map(crate::messages::unified::UnifiedContent::as_text)
                        .collect::<Vec<_>>()
                        .join("\n");
                    (!joined.is_empty()).then_some(joined)
                }
            })
            .unwrap_or_default();

        Ok(text)
    }
}
