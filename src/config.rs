use clap::{Parser, ValueEnum};
use std::path::PathBuf;

/// Gateway settings, resolved from CLI flags and environment variables.
///
/// Every security knob has an environment name so deployments can configure
/// the gateway without a config file.
#[derive(Parser, Debug, Clone)]
#[command(name = "warden", about = "A security gateway for LLM APIs")]
pub struct Settings {
    /// Address to listen on
    #[arg(long, env = "LISTEN_ADDR", default_value = "127.0.0.1:8080")]
    pub listen_addr: String,

    /// Comma-separated legacy gateway API keys (fallback when no client
    /// store entry matches)
    #[arg(long, env = "GATEWAY_API_KEYS", default_value = "dev-key-1")]
    pub gateway_api_keys: String,

    /// Base URL of the OpenAI-compatible upstream
    #[arg(long, env = "UPSTREAM_BASE_URL", default_value = "https://api.openai.com")]
    pub upstream_base_url: String,

    /// Default upstream credential when a client has none of its own
    #[arg(long, env = "UPSTREAM_API_KEY", default_value = "")]
    pub upstream_api_key: String,

    /// Upstream request deadline in seconds
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 60)]
    pub upstream_timeout_secs: u64,

    /// Injection risk score at which requests are denied
    #[arg(long, env = "INJECTION_THRESHOLD", default_value_t = 0.7)]
    pub injection_threshold: f64,

    /// What to do when PII is found in a request
    #[arg(long, env = "PII_ACTION", value_enum, default_value_t = PiiAction::Redact)]
    pub pii_action: PiiAction,

    /// What to do when PII is found in a response
    #[arg(long, env = "RESPONSE_PII_ACTION", value_enum, default_value_t = PiiAction::LogOnly)]
    pub response_pii_action: PiiAction,

    /// Default requests-per-minute limit for clients without an override
    #[arg(long, env = "RATE_LIMIT_RPM", default_value_t = 60)]
    pub rate_limit_rpm: u32,

    /// Client store backend
    #[arg(long, env = "CLIENT_STORE_BACKEND", value_enum, default_value_t = StoreBackend::Json)]
    pub client_store_backend: StoreBackend,

    /// Path to the JSON client config document (json backend)
    #[arg(long, env = "CLIENT_CONFIG_PATH", default_value = "clients.json")]
    pub client_config_path: PathBuf,

    /// Base URL of the remote client table (http backend)
    #[arg(long, env = "CLIENT_STORE_URL")]
    pub client_store_url: Option<String>,

    /// AWS region for the Bedrock provider
    #[arg(long, env = "AWS_REGION", default_value = "us-east-1")]
    pub aws_region: String,

    /// Log verbosity (used as the default tracing filter)
    #[arg(long, env = "LOG_LEVEL", default_value = "INFO")]
    pub log_level: String,

    /// Optional file the audit sink appends to, in addition to stdout
    #[arg(long, env = "AUDIT_LOG_FILE")]
    pub audit_log_file: Option<PathBuf>,

    /// Reject streaming requests regardless of platform. Set automatically
    /// on platforms whose HTTP binding buffers whole responses.
    #[arg(long, env = "DISABLE_STREAMING", default_value_t = false)]
    pub disable_streaming: bool,

    /// Output logs as JSON (default: human-readable)
    #[arg(long)]
    pub json: bool,
}

/// Action taken when a scanner finds PII.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum PiiAction {
    /// Substitute placeholders for matches and continue.
    Redact,
    /// Deny the request (or block the response terminal).
    Block,
    /// Record findings in the audit log, deliver bytes unchanged.
    #[value(name = "log_only")]
    LogOnly,
}

/// Selectable client store backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum StoreBackend {
    /// Static JSON document on disk.
    Json,
    /// Remote key-indexed table queried over HTTP.
    Http,
}

impl Settings {
    /// Default tracing filter derived from LOG_LEVEL.
    pub fn log_filter(&self) -> String {
        self.log_level.to_lowercase()
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:8080".to_string(),
            gateway_api_keys: "dev-key-1".to_string(),
            upstream_base_url: "https://api.openai.com".to_string(),
            upstream_api_key: String::new(),
            upstream_timeout_secs: 60,
            injection_threshold: 0.7,
            pii_action: PiiAction::Redact,
            response_pii_action: PiiAction::LogOnly,
            rate_limit_rpm: 60,
            client_store_backend: StoreBackend::Json,
            client_config_path: PathBuf::from("clients.json"),
            client_store_url: None,
            aws_region: "us-east-1".to_string(),
            log_level: "INFO".to_string(),
            audit_log_file: None,
            disable_streaming: false,
            json: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.gateway_api_keys, "dev-key-1");
        assert_eq!(settings.upstream_base_url, "https://api.openai.com");
        assert_eq!(settings.injection_threshold, 0.7);
        assert_eq!(settings.pii_action, PiiAction::Redact);
        assert_eq!(settings.response_pii_action, PiiAction::LogOnly);
        assert_eq!(settings.rate_limit_rpm, 60);
        assert_eq!(settings.client_store_backend, StoreBackend::Json);
        assert_eq!(settings.client_config_path, PathBuf::from("clients.json"));
    }

    #[test]
    fn cli_defaults_agree_with_default_impl() {
        let parsed = Settings::parse_from(["warden"]);
        let default = Settings::default();
        assert_eq!(parsed.listen_addr, default.listen_addr);
        assert_eq!(parsed.rate_limit_rpm, default.rate_limit_rpm);
        assert_eq!(parsed.pii_action, default.pii_action);
        assert_eq!(parsed.response_pii_action, default.response_pii_action);
    }

    #[test]
    fn pii_action_accepts_snake_case_value() {
        let parsed = Settings::parse_from(["warden", "--response-pii-action", "log_only"]);
        assert_eq!(parsed.response_pii_action, PiiAction::LogOnly);
    }
}
