use clap::Parser;

/// Command-line arguments for the gateway process.
///
/// The bulk of configuration (upstream bases, credentials, condensation
/// thresholds, ...) comes from environment variables via `config::Config`;
/// these flags only cover process-level concerns that make sense to set at
/// launch time.
#[derive(Parser, Debug)]
#[command(version, about = "Anthropic / OpenAI protocol-bridging proxy")]
pub struct Args {
    /// Log filter, e.g. "info" or "proxy=debug,gateway=info".
    #[arg(long, env = "LOG_FILTER", default_value = "info")]
    pub log_filter: String,

    /// Address to bind the HTTP listener to.
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:8000")]
    pub bind_addr: String,
}
