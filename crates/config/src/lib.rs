//! Runtime configuration for the proxy, assembled entirely from environment
//! variables. There is no file loader: the process reads its environment
//! once at startup and carries the result for its lifetime.

#![deny(missing_docs)]

mod env_source;
mod error;

use std::{collections::HashMap, time::Duration};

use secrecy::SecretString;

pub use env_source::EnvSource;
pub use error::ConfigError;

/// The three token-accounting regimes a request can be rescaled between.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WindowRegime {
    /// Anthropic's text-only context window.
    AnthropicText,
    /// OpenAI's text-only context window.
    OpenAiText,
    /// OpenAI's context window when the request carries image content.
    OpenAiVision,
}

/// The context-window sizes used to rescale token counts reported by one
/// dialect into the equivalent for another.
#[derive(Debug, Clone, Copy)]
pub struct TokenWindows {
    /// Window used when presenting usage to an Anthropic-dialect client.
    pub anthropic_text: u32,
    /// Window used when presenting usage to an OpenAI-dialect client with
    /// no image content in the conversation.
    pub openai_text: u32,
    /// Window used when presenting usage to an OpenAI-dialect client whose
    /// conversation carries image content.
    pub openai_vision: u32,
}

impl TokenWindows {
    /// Look up the configured window size for a regime.
    pub fn get(&self, regime: WindowRegime) -> u32 {
        match regime {
            WindowRegime::AnthropicText => self.anthropic_text,
            WindowRegime::OpenAiText => self.openai_text,
            WindowRegime::OpenAiVision => self.openai_vision,
        }
    }
}

impl Default for TokenWindows {
    fn default() -> Self {
        Self {
            anthropic_text: 200_000,
            openai_text: 131_072,
            openai_vision: 65_535,
        }
    }
}

/// Risk thresholds, as a fraction of a model's context window, that drive
/// the context manager's escalating responses.
#[derive(Debug, Clone, Copy)]
pub struct CondensationThresholds {
    /// Fraction of the context window at which condensation is first
    /// attempted in the background.
    pub caution: f64,
    /// Fraction at which condensation is attempted synchronously.
    pub warning: f64,
    /// Fraction at which condensation is mandatory before the request is
    /// forwarded upstream.
    pub critical: f64,
    /// Fraction at which condensation is skipped in favor of emergency
    /// truncation.
    pub overflow: f64,
}

impl Default for CondensationThresholds {
    fn default() -> Self {
        Self {
            caution: 0.70,
            warning: 0.80,
            critical: 0.90,
            overflow: 1.00,
        }
    }
}

/// Configuration for the chunk-based condensation subsystem.
#[derive(Debug, Clone)]
pub struct CondensationConfig {
    /// Risk thresholds that gate condensation behavior.
    pub thresholds: CondensationThresholds,
    /// Minimum number of messages a conversation must contain before
    /// condensation is considered at all.
    pub min_messages: usize,
    /// Maximum number of most-recent messages condensation will ever leave
    /// untouched.
    pub max_messages_to_condense: usize,
    /// Wall-clock budget for a single condensation pass before it is
    /// abandoned in favor of emergency truncation.
    pub timeout: Duration,
    /// Default summarization strategy name, passed through to the
    /// condenser's prompt template selection.
    pub default_strategy: String,
    /// Whether chunk-based (as opposed to whole-conversation) condensation
    /// is enabled.
    pub chunk_based_enabled: bool,
    /// Number of messages per chunk.
    pub chunk_size_messages: usize,
    /// Maximum tokens a chunk may hold before it is split.
    pub chunk_max_tokens: u32,
    /// Number of messages of overlap between adjacent chunks.
    pub chunk_overlap_messages: usize,
    /// How long a condensed chunk remains valid in the cache.
    pub chunk_cache_ttl: Duration,
    /// Age beyond which an unprocessed chunk becomes eligible for
    /// background condensation regardless of risk level.
    pub chunk_age_threshold: Duration,
}

impl Default for CondensationConfig {
    fn default() -> Self {
        Self {
            thresholds: CondensationThresholds::default(),
            min_messages: 6,
            max_messages_to_condense: 200,
            timeout: Duration::from_secs(30),
            default_strategy: "balanced".to_string(),
            chunk_based_enabled: true,
            chunk_size_messages: 20,
            chunk_max_tokens: 4_000,
            chunk_overlap_messages: 2,
            chunk_cache_ttl: Duration::from_secs(3_600),
            chunk_age_threshold: Duration::from_secs(600),
        }
    }
}

/// Configuration for deduplicating repeated environment-details blocks
/// injected by the client into the conversation.
#[derive(Debug, Clone)]
pub struct EnvDedupConfig {
    /// Strategy name: one of `"keep_latest"`, `"keep_most_relevant"`,
    /// `"merge"`, or `"selective"`.
    pub strategy: String,
    /// Age beyond which even the most recent environment-details block is
    /// considered stale and eligible for removal.
    pub max_age: Duration,
}

impl Default for EnvDedupConfig {
    fn default() -> Self {
        Self {
            strategy: "keep_latest".to_string(),
            max_age: Duration::from_secs(30 * 60),
        }
    }
}

/// Timeouts applied to the upstream HTTP client.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutConfig {
    /// TCP connect timeout.
    pub connect: Duration,
    /// Read timeout for a non-streaming upstream response.
    pub request: Duration,
    /// Read timeout between chunks of a streaming upstream response.
    pub stream: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            connect: Duration::from_secs(10),
            request: Duration::from_secs(120),
            stream: Duration::from_secs(300),
        }
    }
}

/// Retry policy applied to upstream requests.
#[derive(Debug, Clone, Copy)]
pub struct RetryConfig {
    /// Number of attempts, including the first, before giving up.
    pub max_attempts: u32,
    /// Base delay used for doubling backoff between attempts.
    pub backoff_base: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_base: Duration::from_millis(100),
        }
    }
}

/// Verbosity/performance profile for the async log sink.
///
/// Each profile trades off how much of a request/response body is captured
/// against how much work the sink does per entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggingProfile {
    /// Capture full bodies and flush aggressively. Intended for debugging.
    MaxDetail,
    /// Capture truncated bodies with a moderate batch size. Default.
    Balanced,
    /// Capture only metadata and use large batches, for high-throughput
    /// deployments.
    Performance,
    /// Capture nothing beyond counters.
    Minimal,
}

impl Default for LoggingProfile {
    fn default() -> Self {
        Self::Balanced
    }
}

impl LoggingProfile {
    fn parse(raw: &str) -> Result<Self, ConfigError> {
        match raw.to_ascii_lowercase().as_str() {
            "max_detail" | "max-detail" | "maxdetail" => Ok(Self::MaxDetail),
            "balanced" => Ok(Self::Balanced),
            "performance" => Ok(Self::Performance),
            "minimal" => Ok(Self::Minimal),
            _ => Err(ConfigError::InvalidValue {
                key: "LOGGING_PERFORMANCE_LEVEL",
                value: raw.to_string(),
            }),
        }
    }

    /// Maximum number of entries buffered before the sink force-flushes.
    pub fn batch_size(self) -> usize {
        match self {
            Self::MaxDetail => 1,
            Self::Balanced => 25,
            Self::Performance => 200,
            Self::Minimal => 500,
        }
    }

    /// Maximum time an entry waits in the buffer before the sink flushes
    /// regardless of batch size.
    pub fn flush_interval(self) -> Duration {
        match self {
            Self::MaxDetail => Duration::from_millis(50),
            Self::Balanced => Duration::from_secs(2),
            Self::Performance => Duration::from_secs(10),
            Self::Minimal => Duration::from_secs(30),
        }
    }

    /// Number of bytes of a request/response body retained per log entry,
    /// or `Some(0)` when only metadata is captured.
    pub fn body_capture_limit(self) -> Option<usize> {
        match self {
            Self::MaxDetail => None,
            Self::Balanced => Some(4_096),
            Self::Performance => Some(256),
            Self::Minimal => Some(0),
        }
    }
}

/// Credentials and base URLs for the single upstream model family exposed
/// through both dialects.
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the upstream Anthropic-compatible endpoint.
    pub anthropic_base: String,
    /// Base URL of the upstream OpenAI-compatible endpoint, when the
    /// upstream exposes a distinct one from the Anthropic-compatible base.
    pub openai_base: Option<String>,
    /// API key presented to the upstream.
    pub upstream_key: Option<SecretString>,
    /// API key this proxy requires from its own clients, when set.
    pub server_key: Option<SecretString>,
    /// Key forwarded to the upstream on behalf of clients, used when the
    /// upstream requires a key the client itself doesn't send.
    pub forward_client_key: Option<SecretString>,
    /// When true, a detected `cache_control` key anywhere in an outbound
    /// Anthropic-dialect request body adds `anthropic_beta` automatically,
    /// provided the caller didn't already supply one of their own.
    pub force_cache_control_beta: bool,
    /// The `anthropic-beta` header value added when `force_cache_control_beta`
    /// fires.
    pub cache_control_beta_value: String,
}

/// Model aliasing and token-window-scaling configuration.
#[derive(Debug, Clone)]
pub struct ModelMapConfig {
    /// Client-facing model name to upstream model name, parsed from
    /// `MODEL_MAP_JSON`.
    pub model_map: HashMap<String, String>,
    /// Model substituted for a text-only request when the client's model
    /// isn't present in `model_map`.
    pub autotext_model: Option<String>,
    /// Model substituted for a request that carries image content.
    pub autovision_model: Option<String>,
    /// Whether token counts reported to vision-capable clients should be
    /// rescaled against the vision window rather than the text window.
    pub scale_count_tokens_for_vision: bool,
    /// The real context windows backing the rescaling math.
    pub windows: TokenWindows,
}

/// Top-level configuration for the proxy, built once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream connectivity and credentials.
    pub upstream: UpstreamConfig,
    /// Model aliasing and window sizes.
    pub model: ModelMapConfig,
    /// Condensation and chunking behavior.
    pub condensation: CondensationConfig,
    /// Environment-details deduplication behavior.
    pub env_dedup: EnvDedupConfig,
    /// Directory backing the persistent chunk store.
    pub cache_dir: String,
    /// Directory the async log sink writes its NDJSON files under.
    pub log_dir: String,
    /// HTTP client timeouts.
    pub timeouts: TimeoutConfig,
    /// Upstream retry policy.
    pub retry: RetryConfig,
    /// Async log sink verbosity/performance profile.
    pub logging_profile: LoggingProfile,
}

impl Config {
    /// Build a [`Config`] from the process environment.
    ///
    /// Fails if a variable that is present cannot be parsed into its
    /// expected shape, e.g. `MODEL_MAP_JSON` isn't valid JSON or a
    /// numeric/duration variable isn't a valid number.
    pub fn from_env() -> Result<Config, ConfigError> {
        Self::from_source(&env_source::ProcessEnv)
    }

    /// Build a [`Config`] from an explicit set of key/value pairs,
    /// bypassing the process environment. Used by tests.
    #[cfg(test)]
    pub fn from_map(vars: HashMap<String, String>) -> Result<Config, ConfigError> {
        Self::from_source(&vars)
    }

    fn from_source(source: &dyn EnvSource) -> Result<Config, ConfigError> {
        let upstream = UpstreamConfig {
            anthropic_base: source
                .get("UPSTREAM_BASE")
                .unwrap_or_else(|| "https://api.anthropic.com".to_string()),
            openai_base: source.get("OPENAI_UPSTREAM_BASE"),
            upstream_key: source.get("UPSTREAM_API_KEY").map(SecretString::from),
            server_key: source.get("SERVER_API_KEY").map(SecretString::from),
            forward_client_key: source.get("FORWARD_CLIENT_KEY").map(SecretString::from),
            force_cache_control_beta: parse_bool_or(source, "FORCE_CACHE_CONTROL_BETA", false)?,
            cache_control_beta_value: source
                .get("CACHE_CONTROL_BETA_HEADER")
                .unwrap_or_else(|| "prompt-caching-2024-07-31".to_string()),
        };

        let model_map = match source.get("MODEL_MAP_JSON") {
            Some(raw) => serde_json::from_str(&raw).map_err(|source| ConfigError::InvalidJson {
                key: "MODEL_MAP_JSON",
                source,
            })?,
            None => HashMap::new(),
        };

        let mut windows = TokenWindows::default();
        if let Some(raw) = source.get("REAL_TEXT_MODEL_TOKENS") {
            windows.anthropic_text = parse_u32(&raw, "REAL_TEXT_MODEL_TOKENS")?;
        }
        if let Some(raw) = source.get("REAL_VISION_MODEL_TOKENS") {
            windows.openai_vision = parse_u32(&raw, "REAL_VISION_MODEL_TOKENS")?;
        }

        let model = ModelMapConfig {
            model_map,
            autotext_model: source.get("AUTOTEXT_MODEL"),
            autovision_model: source.get("AUTOVISION_MODEL"),
            scale_count_tokens_for_vision: parse_bool_or(source, "SCALE_COUNT_TOKENS_FOR_VISION", true)?,
            windows,
        };

        let mut thresholds = CondensationThresholds::default();
        if let Some(raw) = source.get("CONDENSATION_CAUTION_THRESHOLD") {
            thresholds.caution = parse_f64(&raw, "CONDENSATION_CAUTION_THRESHOLD")?;
        }
        if let Some(raw) = source.get("CONDENSATION_WARNING_THRESHOLD") {
            thresholds.warning = parse_f64(&raw, "CONDENSATION_WARNING_THRESHOLD")?;
        }
        if let Some(raw) = source.get("CONDENSATION_CRITICAL_THRESHOLD") {
            thresholds.critical = parse_f64(&raw, "CONDENSATION_CRITICAL_THRESHOLD")?;
        }
        if let Some(raw) = source.get("CONDENSATION_OVERFLOW_THRESHOLD") {
            thresholds.overflow = parse_f64(&raw, "CONDENSATION_OVERFLOW_THRESHOLD")?;
        }

        let condensation = CondensationConfig {
            thresholds,
            min_messages: parse_usize_or(source, "CONDENSATION_MIN_MESSAGES", 6)?,
            max_messages_to_condense: parse_usize_or(source, "CONDENSATION_MAX_MESSAGES", 200)?,
            timeout: parse_secs_or(source, "CONDENSATION_TIMEOUT_SECONDS", 30)?,
            default_strategy: source
                .get("CONDENSATION_DEFAULT_STRATEGY")
                .unwrap_or_else(|| "balanced".to_string()),
            chunk_based_enabled: parse_bool_or(source, "ENABLE_CHUNK_BASED_CONDENSATION", true)?,
            chunk_size_messages: parse_usize_or(source, "CHUNK_SIZE_MESSAGES", 20)?,
            chunk_max_tokens: parse_u32_or(source, "CHUNK_MAX_TOKENS", 4_000)?,
            chunk_overlap_messages: parse_usize_or(source, "CHUNK_OVERLAP_MESSAGES", 2)?,
            chunk_cache_ttl: parse_secs_or(source, "CHUNK_CACHE_TTL", 3_600)?,
            chunk_age_threshold: parse_secs_or(source, "CHUNK_AGE_THRESHOLD", 600)?,
        };

        let env_dedup = EnvDedupConfig {
            strategy: source
                .get("ENV_DEDUPLICATION_STRATEGY")
                .unwrap_or_else(|| "keep_latest".to_string()),
            max_age: Duration::from_secs(60 * parse_u64_or(source, "ENV_DETAILS_MAX_AGE_MINUTES", 30)?),
        };

        let cache_dir = source.get("CACHE_DIR").unwrap_or_else(|| "/tmp/proxy-chunks".to_string());
        let log_dir = source.get("LOG_DIR").unwrap_or_else(|| "./logs".to_string());

        let timeouts = TimeoutConfig {
            connect: parse_secs_or(source, "CONNECT_TIMEOUT", 10)?,
            request: parse_secs_or(source, "REQUEST_TIMEOUT", 120)?,
            stream: parse_secs_or(source, "STREAM_TIMEOUT", 300)?,
        };

        let retry = RetryConfig {
            max_attempts: parse_u32_or(source, "RETRY_MAX_ATTEMPTS", 3)?,
            backoff_base: match source.get("RETRY_BACKOFF") {
                Some(raw) => Duration::from_secs_f64(parse_f64(&raw, "RETRY_BACKOFF")?),
                None => Duration::from_millis(100),
            },
        };

        let logging_profile = match source.get("LOGGING_PERFORMANCE_LEVEL") {
            Some(raw) => LoggingProfile::parse(&raw)?,
            None => LoggingProfile::default(),
        };

        Ok(Config {
            upstream,
            model,
            condensation,
            env_dedup,
            cache_dir,
            log_dir,
            timeouts,
            retry,
            logging_profile,
        })
    }
}

fn parse_bool_or(source: &dyn EnvSource, key: &'static str, default: bool) -> Result<bool, ConfigError> {
    match source.get(key) {
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" => Ok(false),
            _ => Err(ConfigError::InvalidValue { key, value: raw }),
        },
        None => Ok(default),
    }
}

fn parse_u32(raw: &str, key: &'static str) -> Result<u32, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
}

fn parse_u32_or(source: &dyn EnvSource, key: &'static str, default: u32) -> Result<u32, ConfigError> {
    match source.get(key) {
        Some(raw) => parse_u32(&raw, key),
        None => Ok(default),
    }
}

fn parse_u64_or(source: &dyn EnvSource, key: &'static str, default: u64) -> Result<u64, ConfigError> {
    match source.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_usize_or(source: &dyn EnvSource, key: &'static str, default: usize) -> Result<usize, ConfigError> {
    match source.get(key) {
        Some(raw) => raw.trim().parse().map_err(|_| ConfigError::InvalidValue { key, value: raw }),
        None => Ok(default),
    }
}

fn parse_f64(raw: &str, key: &'static str) -> Result<f64, ConfigError> {
    raw.trim()
        .parse()
        .map_err(|_| ConfigError::InvalidValue { key, value: raw.to_string() })
}

fn parse_secs_or(source: &dyn EnvSource, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
    Ok(Duration::from_secs(parse_u64_or(source, key, default)?))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn defaults_with_empty_environment() {
        let config = Config::from_map(HashMap::new()).unwrap();

        assert_eq!(config.upstream.anthropic_base, "https://api.anthropic.com");
        assert!(config.upstream.openai_base.is_none());
        assert!(config.model.model_map.is_empty());
        assert_eq!(config.condensation.thresholds.caution, 0.70);
        assert_eq!(config.condensation.thresholds.overflow, 1.00);
        assert_eq!(config.cache_dir, "/tmp/proxy-chunks");
        assert_eq!(config.logging_profile, LoggingProfile::Balanced);
        assert_eq!(config.retry.max_attempts, 3);
        assert!(!config.upstream.force_cache_control_beta);
        assert_eq!(config.upstream.cache_control_beta_value, "prompt-caching-2024-07-31");
    }

    #[test]
    fn cache_control_beta_forcing_is_configurable() {
        let vars = map(&[
            ("FORCE_CACHE_CONTROL_BETA", "true"),
            ("CACHE_CONTROL_BETA_HEADER", "prompt-caching-2025-01-01"),
        ]);
        let config = Config::from_map(vars).unwrap();

        assert!(config.upstream.force_cache_control_beta);
        assert_eq!(config.upstream.cache_control_beta_value, "prompt-caching-2025-01-01");
    }

    #[test]
    fn model_map_json_is_parsed() {
        let vars = map(&[("MODEL_MAP_JSON", r#"{"gpt-4":"claude-sonnet"}"#)]);
        let config = Config::from_map(vars).unwrap();

        assert_eq!(
            config.model.model_map.get("gpt-4").map(String::as_str),
            Some("claude-sonnet")
        );
    }

    #[test]
    fn invalid_model_map_json_is_rejected() {
        let vars = map(&[("MODEL_MAP_JSON", "not json")]);
        let err = Config::from_map(vars).unwrap_err();

        assert!(matches!(err, ConfigError::InvalidJson { key: "MODEL_MAP_JSON", .. }));
    }

    #[test]
    fn logging_profile_is_case_insensitive() {
        let vars = map(&[("LOGGING_PERFORMANCE_LEVEL", "PERFORMANCE")]);
        let config = Config::from_map(vars).unwrap();

        assert_eq!(config.logging_profile, LoggingProfile::Performance);
    }

    #[test]
    fn unknown_logging_profile_is_rejected() {
        let vars = map(&[("LOGGING_PERFORMANCE_LEVEL", "turbo")]);
        let err = Config::from_map(vars).unwrap_err();

        assert!(matches!(err, ConfigError::InvalidValue { key: "LOGGING_PERFORMANCE_LEVEL", .. }));
    }

    #[test]
    fn secrets_are_not_exposed_via_debug() {
        let vars = map(&[("SERVER_API_KEY", "sk-super-secret")]);
        let config = Config::from_map(vars).unwrap();

        let rendered = format!("{:?}", config.upstream.server_key);
        assert!(!rendered.contains("sk-super-secret"));
    }
}
