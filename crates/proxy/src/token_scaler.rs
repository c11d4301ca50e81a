//! Rescales token counts when usage crosses from one upstream's context
//! window into a client-visible dialect backed by a different window size.
//!
//! Anthropic and OpenAI upstreams quote token counts against their own
//! tokenizer and window, so a raw count from one is not directly meaningful
//! to a client expecting the other's accounting. Rather than re-tokenizing
//! the whole conversation against both vocabularies, usage is scaled by the
//! ratio of the two windows.
use crate::family::EndpointFamily;

/// Scales a single raw token count from the family that generated it to the
/// family the client is speaking, honoring the `is_vision` window split on
/// the OpenAI side.
///
/// Returns `raw` unchanged when `raw` is zero (nothing to scale) and
/// otherwise never rounds down to zero, since a non-empty count scaled to
/// "zero tokens" would misrepresent real usage.
pub(crate) fn scale(raw: u32, upstream: EndpointFamily, downstream: EndpointFamily, is_vision: bool) -> u32 {
    if raw == 0 {
        return 0;
    }

    let factor = factor_for(upstream, downstream, is_vision);
    let scaled = (raw as f64 * factor).floor() as u32;

    scaled.max(1)
}

/// Scales a full usage triple, applying [`scale`] field-wise.
pub(crate) fn scale_usage(
    usage: crate::messages::unified::UnifiedUsage,
    upstream: EndpointFamily,
    downstream: EndpointFamily,
    is_vision: bool,
) -> crate::messages::unified::UnifiedUsage {
    let prompt_tokens = scale(usage.prompt_tokens, upstream, downstream, is_vision);
    let completion_tokens = scale(usage.completion_tokens, upstream, downstream, is_vision);
    let total_tokens = scale(usage.total_tokens, upstream, downstream, is_vision);

    crate::messages::unified::UnifiedUsage {
        prompt_tokens,
        completion_tokens,
        total_tokens,
    }
}

fn factor_for(upstream: EndpointFamily, downstream: EndpointFamily, is_vision: bool) -> f64 {
    use EndpointFamily::{Anthropic, OpenAi};

    match (upstream, downstream, is_vision) {
        (Anthropic, OpenAi, false) => 131_072.0 / 200_000.0,
        (Anthropic, OpenAi, true) => 65_535.0 / 200_000.0,
        (OpenAi, Anthropic, false) => 200_000.0 / 131_072.0,
        (OpenAi, OpenAi, true) => 131_072.0 / 65_535.0,
        _ => 1.0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anthropic_to_openai_text_scales_down() {
        assert_eq!(scale(5, EndpointFamily::Anthropic, EndpointFamily::OpenAi, false), 3);
    }

    #[test]
    fn anthropic_to_openai_vision_scales_down_further() {
        assert_eq!(scale(100, EndpointFamily::Anthropic, EndpointFamily::OpenAi, true), 32);
    }

    #[test]
    fn openai_to_anthropic_text_scales_up() {
        assert_eq!(scale(100, EndpointFamily::OpenAi, EndpointFamily::Anthropic, false), 152);
    }

    #[test]
    fn openai_vision_to_openai_text_doubles() {
        assert_eq!(scale(50, EndpointFamily::OpenAi, EndpointFamily::OpenAi, true), 100);
    }

    #[test]
    fn same_family_non_vision_is_unscaled() {
        assert_eq!(scale(42, EndpointFamily::Anthropic, EndpointFamily::Anthropic, false), 42);
    }

    #[test]
    fn zero_is_preserved_not_floored_to_one() {
        assert_eq!(scale(0, EndpointFamily::Anthropic, EndpointFamily::OpenAi, false), 0);
    }

    #[test]
    fn small_nonzero_counts_never_scale_to_zero() {
        assert_eq!(scale(1, EndpointFamily::Anthropic, EndpointFamily::OpenAi, true), 1);
    }

    #[test]
    fn scale_usage_applies_factor_field_wise() {
        let usage = crate::messages::unified::UnifiedUsage {
            prompt_tokens: 10,
            completion_tokens: 4,
            total_tokens: 14,
        };
        let scaled = scale_usage(usage, EndpointFamily::Anthropic, EndpointFamily::OpenAi, false);
        assert_eq!(scaled.prompt_tokens, 6);
        assert_eq!(scaled.completion_tokens, 2);
        assert_eq!(scaled.total_tokens, 9);
    }
}
