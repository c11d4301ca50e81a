//! Logger initialization for the gateway process.

use logforth::{append::Stderr, filter::EnvFilter};
use std::str::FromStr;

/// Initialize stderr logging filtered by `log_filter` (an `env_filter`-style
/// string, e.g. "info" or "proxy=debug,gateway=info").
pub fn init(log_filter: &str) {
    let log_filter = log_filter.to_owned();

    logforth::builder()
        .dispatch(move |d| {
            let filter = EnvFilter::from_str(&log_filter)
                .unwrap_or_else(|_| EnvFilter::from_str("info").expect("default filter is valid"));

            d.filter(filter).append(Stderr::default())
        })
        .apply();
}
