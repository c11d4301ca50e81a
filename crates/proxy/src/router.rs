//! Selects which upstream family serves a request and resolves the
//! client-declared model alias to an upstream model id.
//!
//! Anthropic and OpenAI are exposed as a single logical service, but only
//! one of the two actual upstreams backs any given request: text-only
//! traffic goes to the Anthropic-compatible upstream, anything carrying an
//! image goes to the OpenAI-compatible one. Routing is decided against the
//! model the client asked for, before alias resolution rewrites it, so a
//! caller naming an explicit upstream id never gets silently redirected.
use crate::family::EndpointFamily;
use crate::messages::unified::{UnifiedContent, UnifiedContentContainer, UnifiedRequest};

/// Outcome of routing a single request: which upstream to call, the model
/// id to send it, and whether the response should be priced against the
/// vision-sized context window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RouteDecision {
    pub(crate) family: EndpointFamily,
    pub(crate) upstream_model: String,
    pub(crate) is_vision: bool,
}

/// Routes a request using the client-declared model and the request body.
pub(crate) fn route(request: &UnifiedRequest, model_map: &config::ModelMapConfig) -> RouteDecision {
    resolve(&request.model, has_image(request), model_map)
}

/// Core resolution logic, taking `has_image` separately so `/count_tokens`
/// can share it without re-deriving image presence from a full request.
pub(crate) fn resolve(declared_model: &str, has_image: bool, model_map: &config::ModelMapConfig) -> RouteDecision {
    let is_vision = has_image || model_map.autovision_model.as_deref() == Some(declared_model);
    let family = if is_vision { EndpointFamily::OpenAi } else { EndpointFamily::Anthropic };

    let mut upstream_model = model_map
        .model_map
        .get(declared_model)
        .cloned()
        .unwrap_or_else(|| fallback_model(declared_model, is_vision, model_map));

    // A caller naming the text target explicitly but attaching an image (or
    // vice versa) wants the matching variant, not the target they typed.
    if has_image
        && model_map.autotext_model.as_deref() == Some(upstream_model.as_str())
        && let Some(autovision) = &model_map.autovision_model
    {
        upstream_model = autovision.clone();
    } else if !has_image
        && model_map.autovision_model.as_deref() == Some(upstream_model.as_str())
        && let Some(autotext) = &model_map.autotext_model
    {
        upstream_model = autotext.clone();
    }

    RouteDecision {
        family,
        upstream_model,
        is_vision,
    }
}

fn fallback_model(declared_model: &str, is_vision: bool, model_map: &config::ModelMapConfig) -> String {
    let configured = if is_vision {
        &model_map.autovision_model
    } else {
        &model_map.autotext_model
    };

    configured.clone().unwrap_or_else(|| declared_model.to_string())
}

/// True iff any message carries an image block with a usable source.
pub(crate) fn has_image(request: &UnifiedRequest) -> bool {
    request.messages.iter().any(|message| match &message.content {
        UnifiedContentContainer::Text(_) => false,
        UnifiedContentContainer::Blocks(blocks) => blocks.iter().any(|block| matches!(block, UnifiedContent::Image { .. })),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::unified::{UnifiedImageSource, UnifiedMessage, UnifiedRole};
    use std::collections::HashMap;

    fn model_map() -> config::ModelMapConfig {
        config::ModelMapConfig {
            model_map: HashMap::from([("glm-4.5".to_string(), "glm-4.5-upstream".to_string())]),
            autotext_model: Some("auto-text".to_string()),
            autovision_model: Some("auto-vision".to_string()),
            scale_count_tokens_for_vision: true,
            windows: config::TokenWindows::default(),
        }
    }

    fn text_request(model: &str) -> UnifiedRequest {
        UnifiedRequest {
            model: model.to_string(),
            messages: vec![UnifiedMessage {
                role: UnifiedRole::User,
                content: UnifiedContentContainer::Text("hi".to_string()),
                tool_calls: None,
                tool_call_id: None,
            }],
            system: Vec::new(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            top_k: None,
            frequency_penalty: None,
            presence_penalty: None,
            stop_sequences: None,
            stream: None,
            tools: None,
            tool_choice: None,
            parallel_tool_calls: None,
            metadata: None,
        }
    }

    fn image_request(model: &str) -> UnifiedRequest {
        let mut request = text_request(model);
        request.messages.push(UnifiedMessage {
            role: UnifiedRole::User,
            content: UnifiedContentContainer::Blocks(vec![UnifiedContent::Image {
                source: UnifiedImageSource::Url {
                    url: "https://example.com/cat.png".to_string(),
                },
            }]),
            tool_calls: None,
            tool_call_id: None,
        });
        request
    }

    #[test]
    fn text_only_routes_to_anthropic_family() {
        let decision = route(&text_request("glm-4.5"), &model_map());
        assert_eq!(decision.family, EndpointFamily::Anthropic);
        assert_eq!(decision.upstream_model, "glm-4.5-upstream");
        assert!(!decision.is_vision);
    }

    #[test]
    fn image_present_routes_to_openai_family() {
        let decision = route(&image_request("glm-4.5"), &model_map());
        assert_eq!(decision.family, EndpointFamily::OpenAi);
        assert!(decision.is_vision);
    }

    #[test]
    fn declaring_autovision_model_routes_openai_even_without_image() {
        let decision = route(&text_request("auto-vision"), &model_map());
        assert_eq!(decision.family, EndpointFamily::OpenAi);
        assert!(decision.is_vision);
    }

    #[test]
    fn unmapped_text_model_falls_back_to_autotext() {
        let decision = route(&text_request("unknown-model"), &model_map());
        assert_eq!(decision.upstream_model, "auto-text");
    }

    #[test]
    fn autotext_target_with_image_rewrites_to_autovision() {
        let decision = route(&image_request("auto-text"), &model_map());
        assert_eq!(decision.upstream_model, "auto-vision");
        assert_eq!(decision.family, EndpointFamily::OpenAi);
    }

    #[test]
    fn autovision_target_without_image_rewrites_to_autotext() {
        let decision = route(&text_request("auto-vision"), &model_map());
        assert_eq!(decision.upstream_model, "auto-text");
    }

    #[test]
    fn has_image_ignores_text_only_blocks() {
        let request = text_request("glm-4.5");
        assert!(!has_image(&request));
    }
}
