//! Detects whether an inbound request body asks for prompt caching.
//!
//! Anthropic's `cache_control` block can appear on a system block, a
//! message's content block, or a tool definition, nested arbitrarily deep
//! inside whatever shape the caller sent. Rather than trust a client-picked
//! depth, the scan below is bounded and treats anything past the cap as
//! absent.

/// Recursion cap for [`contains_cache_control`]. Chosen generously above any
/// plausible real payload shape; past this, a `cache_control` key can't be
/// found and isn't searched for.
const MAX_DEPTH: usize = 32;

/// Scans `value` for an object key literally named `cache_control`, at any
/// depth up to [`MAX_DEPTH`].
pub(crate) fn contains_cache_control(value: &sonic_rs::Value) -> bool {
    scan(value, 0)
}

fn scan(value: &sonic_rs::Value, depth: usize) -> bool {
    use sonic_rs::{JsonContainerTrait, JsonValueTrait};

    if depth >= MAX_DEPTH {
        return false;
    }

    if let Some(object) = value.as_object() {
        for (key, nested) in object.iter() {
            if key.to_string() == "cache_control" {
                return true;
            }
            if scan(nested, depth + 1) {
                return true;
            }
        }
        return false;
    }

    if let Some(array) = value.as_array() {
        return array.iter().any(|item| scan(item, depth + 1));
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(json: &str) -> sonic_rs::Value {
        sonic_rs::from_str(json).unwrap()
    }

    #[test]
    fn absent_in_flat_request() {
        let value = parse(r#"{"model":"claude-3","messages":[{"role":"user","content":"hi"}]}"#);
        assert!(!contains_cache_control(&value));
    }

    #[test]
    fn present_on_nested_content_block() {
        let value = parse(
            r#"{"model":"claude-3","messages":[{"role":"user","content":[
                {"type":"text","text":"hi","cache_control":{"type":"ephemeral"}}
            ]}]}"#,
        );
        assert!(contains_cache_control(&value));
    }

    #[test]
    fn present_on_system_blocks() {
        let value = parse(r#"{"system":[{"type":"text","text":"be terse","cache_control":{"type":"ephemeral"}}]}"#);
        assert!(contains_cache_control(&value));
    }

    #[test]
    fn does_not_search_past_the_depth_cap() {
        // Build a chain of MAX_DEPTH + 5 nested objects, with the key only
        // reachable at the very bottom.
        let mut json = String::from(r#"{"cache_control":{"type":"ephemeral"}}"#);
        for _ in 0..MAX_DEPTH + 5 {
            json = format!(r#"{{"wrap":{json}}}"#);
        }
        let value = parse(&json);
        assert!(!contains_cache_control(&value));
    }

    #[test]
    fn finds_key_within_the_depth_cap() {
        let mut json = String::from(r#"{"cache_control":{"type":"ephemeral"}}"#);
        for _ in 0..MAX_DEPTH - 2 {
            json = format!(r#"{{"wrap":{json}}}"#);
        }
        let value = parse(&json);
        assert!(contains_cache_control(&value));
    }
}
