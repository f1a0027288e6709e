//! Runtime configuration, loaded from the environment, in the
//! style of `notify::Notifier::from_env()`.

use std::time::Duration;

use crate::error::ConfigError;
use crate::providers::{Capability, ProviderConfig};

/// Environment variable names.
mod env_keys {
    pub const RETRY_LIMIT: &str = "AGENT_RETRY_LIMIT";
    pub const WORKSPACE: &str = "AGENT_WORKSPACE";
    pub const API_TIMEOUT: &str = "API_TIMEOUT";
    pub const GITHUB_TOKEN: &str = "GITHUB_TOKEN";
    pub const GITHUB_CI_TIMEOUT: &str = "GITHUB_CI_TIMEOUT";
    pub const WALL_CLOCK_LIMIT: &str = "AGENT_WALL_CLOCK_LIMIT";
    pub const HISTORY_LOG: &str = "AGENT_HISTORY_LOG";
}

/// Fully resolved runtime configuration for one process.
#[derive(Debug, Clone)]
pub struct Config {
    pub retry_limit: u32,
    pub workspace: String,
    pub api_timeout: Duration,
    pub github_token: Option<String>,
    pub github_ci_timeout: Duration,
    pub wall_clock_limit: Duration,
    pub history_log_path: String,
    pub providers: Vec<ProviderConfig>,
}

fn env_or_default<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Config {
    /// Load configuration from the process environment. Returns
    /// [`ConfigError::NoProviders`] if no provider credential is present:
    /// at least one must be present at startup or the core refuses to
    /// initialize.
    pub fn from_env() -> Result<Self, ConfigError> {
        let retry_limit = env_or_default(env_keys::RETRY_LIMIT, 5u32);
        let workspace =
            std::env::var(env_keys::WORKSPACE).unwrap_or_else(|_| "./workspace".to_string());
        let api_timeout = Duration::from_secs(env_or_default(env_keys::API_TIMEOUT, 25u64));
        let github_token = std::env::var(env_keys::GITHUB_TOKEN).ok();
        let github_ci_timeout =
            Duration::from_secs(env_or_default(env_keys::GITHUB_CI_TIMEOUT, 300u64));
        let wall_clock_limit =
            Duration::from_secs(env_or_default(env_keys::WALL_CLOCK_LIMIT, 900u64));
        let history_log_path = std::env::var(env_keys::HISTORY_LOG)
            .unwrap_or_else(|_| format!("{workspace}/.agent-history.jsonl"));

        let providers = configured_providers();
        if providers.is_empty() {
            return Err(ConfigError::NoProviders);
        }

        Ok(Self {
            retry_limit,
            workspace,
            api_timeout,
            github_token,
            github_ci_timeout,
            wall_clock_limit,
            history_log_path,
            providers,
        })
    }
}

/// Build the provider list from whichever credentials are present.
/// `openrouter`/`openai` and `gemini` are tagged `reasoning`, `groq` is
/// tagged `fast`, and a configured local endpoint is tagged `local`.
fn configured_providers() -> Vec<ProviderConfig> {
    let mut providers = Vec::new();

    if let Ok(key) = std::env::var("OPENROUTER_API_KEY") {
        providers.push(ProviderConfig {
            name: "openrouter".to_string(),
            base_url: "https://openrouter.ai/api/v1".to_string(),
            credential: key,
            capability: Capability::Reasoning,
            default_model: "anthropic/claude-3.5-sonnet".to_string(),
        });
    }
    if let Ok(key) = std::env::var("OPENAI_API_KEY") {
        providers.push(ProviderConfig {
            name: "openai".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            credential: key,
            capability: Capability::Reasoning,
            default_model: "gpt-4o".to_string(),
        });
    }
    if let Ok(key) = std::env::var("GEMINI_API_KEY") {
        providers.push(ProviderConfig {
            name: "gemini".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta/openai".to_string(),
            credential: key,
            capability: Capability::Reasoning,
            default_model: "gemini-1.5-pro".to_string(),
        });
    }
    if let Ok(key) = std::env::var("GROQ_API_KEY") {
        providers.push(ProviderConfig {
            name: "groq".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            credential: key,
            capability: Capability::Fast,
            default_model: "llama-3.3-70b-versatile".to_string(),
        });
    }
    if let Ok(url) = std::env::var("LOCAL_MODEL_URL") {
        let credential = std::env::var("LOCAL_MODEL_KEY").unwrap_or_default();
        providers.push(ProviderConfig {
            name: "local".to_string(),
            base_url: url,
            credential,
            capability: Capability::Local,
            default_model: "local-model".to_string(),
        });
    }

    providers
}
