use thiserror::Error;

/// Failure building a [`crate::Config`] from its environment.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A variable held a value that didn't parse as the type it's
    /// supposed to hold (a number, duration, or enum-like name).
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue {
        /// Name of the offending environment variable.
        key: &'static str,
        /// The raw value that failed to parse.
        value: String,
    },

    /// A variable expected to hold JSON didn't parse as JSON.
    #[error("invalid JSON in {key}")]
    InvalidJson {
        /// Name of the offending environment variable.
        key: &'static str,
        /// Underlying parse error.
        #[source]
        source: serde_json::Error,
    },
}
