use axum::http::HeaderMap;
use secrecy::SecretString;
use uuid::Uuid;

const DEFAULT_ANTHROPIC_VERSION: &str = "2023-06-01";

/// Per-request context extracted from inbound headers.
///
/// Carries caller-supplied credentials (forwarded upstream verbatim when
/// present, falling back to the configured server key otherwise) plus a
/// correlation id threaded through the async log sink and error responses
/// so a single request's trail can be reassembled after the fact.
#[derive(Debug, Clone)]
pub(crate) struct RequestContext {
    /// Correlation id for this request, used in log entries and in the
    /// body of any 5xx response caused by a framework-level panic.
    pub correlation_id: String,

    /// Caller-supplied `x-api-key`, when present.
    pub api_key: Option<SecretString>,

    /// Caller-supplied `authorization` header, when present (includes the
    /// `Bearer ` prefix as sent).
    pub authorization: Option<SecretString>,

    /// `anthropic-version`, defaulting to the last version this proxy was
    /// verified against when the caller doesn't set one.
    pub anthropic_version: String,

    /// `anthropic-beta`, forwarded verbatim when present.
    pub anthropic_beta: Option<String>,

    /// Whether a `cache_control` key was found anywhere in the request body.
    /// Set after header extraction, once the body has been parsed; defaults
    /// to `false` until [`RequestContext::with_cache_control`] runs.
    pub has_cache_control: bool,
}

impl RequestContext {
    /// Records whether the request body contained a `cache_control` key.
    pub(crate) fn with_cache_control(mut self, has_cache_control: bool) -> Self {
        self.has_cache_control = has_cache_control;
        self
    }
}

/// Extracts caller-supplied credentials and protocol headers, and mints a
/// correlation id for the request.
pub(super) fn extract_context(headers: &HeaderMap) -> RequestContext {
    let api_key = header_str(headers, "x-api-key").map(SecretString::from);
    let authorization = header_str(headers, "authorization").map(SecretString::from);
    let anthropic_version = header_str(headers, "anthropic-version").unwrap_or_else(|| DEFAULT_ANTHROPIC_VERSION.to_string());
    let anthropic_beta = header_str(headers, "anthropic-beta");

    RequestContext {
        correlation_id: Uuid::new_v4().to_string(),
        api_key,
        authorization,
        anthropic_version,
        anthropic_beta,
        has_cache_control: false,
    }
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers.get(name).and_then(|value| value.to_str().ok()).map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.insert(axum::http::HeaderName::from_bytes(name.as_bytes()).unwrap(), value.parse().unwrap());
        }
        headers
    }

    #[test]
    fn defaults_anthropic_version_when_absent() {
        let context = extract_context(&headers(&[]));
        assert_eq!(context.anthropic_version, DEFAULT_ANTHROPIC_VERSION);
    }

    #[test]
    fn preserves_caller_supplied_anthropic_version() {
        let context = extract_context(&headers(&[("anthropic-version", "2024-10-22")]));
        assert_eq!(context.anthropic_version, "2024-10-22");
    }

    #[test]
    fn mints_distinct_correlation_ids() {
        let a = extract_context(&headers(&[]));
        let b = extract_context(&headers(&[]));
        assert_ne!(a.correlation_id, b.correlation_id);
    }

    #[test]
    fn extracts_x_api_key() {
        let context = extract_context(&headers(&[("x-api-key", "sk-test-123")]));
        assert!(context.api_key.is_some());
    }

    #[test]
    fn has_cache_control_defaults_to_false_and_is_settable() {
        let context = extract_context(&headers(&[]));
        assert!(!context.has_cache_control);

        let context = context.with_cache_control(true);
        assert!(context.has_cache_control);
    }
}
