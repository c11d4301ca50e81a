use std::{convert::Infallible, sync::Arc};

use axum::{
    Router,
    body::Bytes,
    extract::{Json, Path, State},
    http::{HeaderMap, HeaderValue},
    response::{IntoResponse, Sse, sse::Event},
    routing::{get, post},
};
use axum_serde::Sonic;
use futures::StreamExt;
use messages::{anthropic, openai};

mod cache_control;
mod context;
mod data_url;
mod error;
mod family;
mod http_client;
mod log_sink;
mod messages;
mod provider;
mod request;
mod router;
mod server;
mod stream_bridge;
mod token_counter;
mod token_scaler;

use crate::family::EndpointFamily;

pub use error::{AnthropicResult, LlmError, LlmResult as Result};
use server::{LlmHandler, LlmServerBuilder};

use crate::messages::unified;

/// Builds the axum router exposing both client-facing dialects over the
/// same [`LlmHandler`].
///
/// Route paths match the two upstream APIs' own conventions verbatim, so a
/// client pointed at this proxy only has to change its base URL.
pub async fn router(config: &config::Config) -> anyhow::Result<Router> {
    let server = Arc::new(
        LlmServerBuilder::new(config)
            .build()
            .await
            .map_err(|e| anyhow::anyhow!("failed to initialize proxy server: {e}"))?,
    );

    let router = Router::new()
        .route("/v1/messages", post(anthropic_messages))
        .route("/v1/messages/count_tokens", post(anthropic_count_tokens))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/v1/models/{id}", get(get_model))
        .with_state(server)
        .route("/health", get(health));

    Ok(router)
}

async fn health() -> impl IntoResponse {
    Json(serde_json::json!({ "ok": true }))
}

/// Handle chat completion requests.
///
/// Supports both streaming and non-streaming responses: when `stream: true`
/// is set, the response is sent as Server-Sent Events (SSE) terminated by a
/// `[DONE]` marker; otherwise a standard JSON response is returned.
async fn chat_completions(
    State(server): State<Arc<LlmHandler>>,
    headers: HeaderMap,
    Sonic(request): Sonic<openai::ChatCompletionRequest>,
) -> Result<impl IntoResponse> {
    log::debug!("chat completions handler called for model: {}", request.model);
    log::debug!("request has {} messages", request.messages.len());

    let context = request::extract_context(&headers);
    let stream_requested = request.stream.unwrap_or(false);
    let unified_request = unified::UnifiedRequest::from(request);

    if stream_requested {
        let stream = server.completions_stream(unified_request, &context, EndpointFamily::OpenAi).await?;

        let event_stream = stream.map(move |result| {
            let event = match result {
                Ok(unified_chunk) => {
                    let openai_chunk = openai::ChatCompletionChunk::from(unified_chunk);
                    let json = sonic_rs::to_string(&openai_chunk).unwrap_or_else(|e| {
                        log::error!("failed to serialize chunk: {e}");
                        r#"{"error":"serialization failed"}"#.to_string()
                    });

                    Event::default().data(json)
                }
                Err(e) => {
                    log::error!("stream error: {e}");
                    Event::default().data(format!(r#"{{"error":"{e}"}}"#))
                }
            };

            Ok::<_, Infallible>(event)
        });

        let with_done = event_stream.chain(futures::stream::once(async {
            Ok::<_, Infallible>(Event::default().data("[DONE]"))
        }));

        log::debug!("returning streaming chat completion");
        Ok(Sse::new(with_done).into_response())
    } else {
        let unified_response = server.completions(unified_request, &context, EndpointFamily::OpenAi).await?;
        let response = openai::ChatCompletionResponse::from(unified_response);

        log::debug!("chat completion returned {} choices", response.choices.len());

        Ok(Json(response).into_response())
    }
}

/// Handle Anthropic Messages requests.
///
/// Supports both streaming and non-streaming responses: when `stream: true`
/// is set, the response is sent as Server-Sent Events mirroring Anthropic's
/// typed event grammar; otherwise a standard JSON response is returned.
async fn anthropic_messages(
    State(server): State<Arc<LlmHandler>>,
    headers: HeaderMap,
    body: Bytes,
) -> AnthropicResult<impl IntoResponse> {
    let request = parse_anthropic_body(&body)?;
    log::debug!("anthropic messages handler called for model: {}", request.model);
    log::debug!("request has {} messages", request.messages.len());

    let context = request::extract_context(&headers).with_cache_control(has_cache_control(&body));
    let unified_request = unified::UnifiedRequest::from(request);

    if unified_request.stream.unwrap_or(false) {
        let stream = server.completions_stream(unified_request, &context, EndpointFamily::Anthropic).await?;
        let mut sequencer = stream_bridge::AnthropicSequencer::new();

        // Anthropic's grammar requires message_start/content_block_start/stop
        // framing that the raw per-chunk mapping doesn't carry; the
        // sequencer reconstructs it, so one incoming chunk can expand into
        // several outgoing events.
        let event_stream = stream.flat_map(move |result| {
            let events: Vec<std::result::Result<Event, Infallible>> = match result {
                Ok(chunk) => sequencer
                    .push(chunk)
                    .into_iter()
                    .map(|event| {
                        let json = sonic_rs::to_string(&event).unwrap_or_else(|e| {
                            log::error!("failed to serialize anthropic streaming event: {e}");
                            r#"{"error":"serialization failed"}"#.to_string()
                        });

                        Ok(Event::default().data(json))
                    })
                    .collect(),
                Err(e) => {
                    log::error!("stream error: {e}");
                    let anthropic_error = anthropic::AnthropicError::from(e);
                    let error_event = anthropic::AnthropicStreamEvent::Error {
                        error: anthropic_error.error,
                    };
                    let json = sonic_rs::to_string(&error_event).unwrap_or_else(|se| {
                        log::error!("failed to serialize anthropic stream error event: {se}");
                        r#"{"type":"error","error":{"type":"internal_error","message":"serialization failed"}}"#
                            .to_string()
                    });

                    vec![Ok(Event::default().data(json))]
                }
            };

            futures::stream::iter(events)
        });

        // Anthropic's grammar has no [DONE] marker; the stream simply ends.
        log::debug!("returning streaming anthropic messages response");

        Ok(Sse::new(event_stream).into_response())
    } else {
        let unified_response = server.completions(unified_request, &context, EndpointFamily::Anthropic).await?;
        let anthropic_response = anthropic::AnthropicChatResponse::from(unified_response);

        log::debug!("anthropic messages completion returned");

        Ok(Json(anthropic_response).into_response())
    }
}

fn parse_anthropic_body(body: &[u8]) -> Result<anthropic::AnthropicChatRequest> {
    sonic_rs::from_slice(body).map_err(|e| {
        log::warn!("failed to parse anthropic messages request body: {e}");
        LlmError::InvalidRequest(format!("invalid request body: {e}"))
    })
}

/// Scans the raw request body for a `cache_control` key before it's
/// discarded by typed parsing, so upstream forwarding can add the caching
/// beta header on the caller's behalf. A body that fails to parse as JSON
/// (already reported by [`parse_anthropic_body`]) is treated as not having
/// one.
fn has_cache_control(body: &[u8]) -> bool {
    sonic_rs::from_slice::<sonic_rs::Value>(body)
        .map(|value| cache_control::contains_cache_control(&value))
        .unwrap_or(false)
}

/// Handle `/v1/messages/count_tokens`.
///
/// Counts are reported in the window that the request will actually be
/// served on (text vs. vision), and `X-Proxy-Count-Scaled: VISION` is set
/// whenever the vision rescale was applied, per the configured
/// `SCALE_COUNT_TOKENS_FOR_VISION` toggle.
async fn anthropic_count_tokens(
    State(server): State<Arc<LlmHandler>>,
    headers: HeaderMap,
    Sonic(request): Sonic<anthropic::AnthropicChatRequest>,
) -> AnthropicResult<impl IntoResponse> {
    let context = request::extract_context(&headers);
    let unified_request = unified::UnifiedRequest::from(request);

    let counted = server.count_tokens(unified_request, &context).await?;

    let mut response = Json(anthropic::CountTokensResponse::new(counted.token_count)).into_response();

    if counted.vision_scaled {
        response
            .headers_mut()
            .insert("x-proxy-count-scaled", HeaderValue::from_static("VISION"));
    }

    Ok(response)
}

/// Handle `GET /v1/models`: a static list assembled from configured model
/// aliases plus the alias table's keys.
async fn list_models(State(server): State<Arc<LlmHandler>>) -> Result<impl IntoResponse> {
    let response = server.models().await;

    log::debug!("returning {} models", response.data.len());
    Ok(Json(response))
}

/// Handle `GET /v1/models/{id}`.
async fn get_model(State(server): State<Arc<LlmHandler>>, Path(id): Path<String>) -> Result<impl IntoResponse> {
    let model = server
        .models()
        .await
        .data
        .into_iter()
        .find(|model| model.id == id)
        .ok_or_else(|| LlmError::ModelNotFound(format!("model '{id}' not found")))?;

    Ok(Json(model))
}
