use std::collections::HashMap;

/// A source of configuration key/value pairs.
///
/// Lets [`crate::Config::from_source`] be exercised against a plain map in
/// tests without reaching into the real process environment.
pub trait EnvSource {
    /// Look up a variable by name, returning `None` if it is unset.
    fn get(&self, key: &str) -> Option<String>;
}

pub(crate) struct ProcessEnv;

impl EnvSource for ProcessEnv {
    fn get(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

impl EnvSource for HashMap<String, String> {
    fn get(&self, key: &str) -> Option<String> {
        self.get(key).cloned()
    }
}
