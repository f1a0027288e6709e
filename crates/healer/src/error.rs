//! Error taxonomy for the healing loop.
//!
//! Most of these are recovered locally (providers dropped, fixes skipped);
//! only [`HealError::Config`], [`HealError::Clone`], [`HealError::Push`]
//! and repeated runner startup failure end a run outright.

use thiserror::Error;

/// Top-level errors the core can raise.
#[derive(Debug, Error)]
pub enum HealError {
    /// No providers configured, or a malformed request. Fatal: no run.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Cloning the repository failed. Terminal for the run.
    #[error("failed to clone {url}: {source}")]
    Clone {
        url: String,
        #[source]
        source: anyhow::Error,
    },

    /// Pushing the healing branch failed. Terminal for the run.
    #[error("failed to push branch {branch}: {source}")]
    Push {
        branch: String,
        #[source]
        source: anyhow::Error,
    },

    /// The test runner failed to start at all. All failures are
    /// unclassifiable; the loop exits FAILED.
    #[error("test runner failed to start: {0}")]
    Runner(String),
}

/// Configuration errors surfaced to the caller before any run starts.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// No LLM provider credentials were found in the environment.
    #[error("no LLM provider credentials configured; set at least one of OPENROUTER_API_KEY, OPENAI_API_KEY, GEMINI_API_KEY, GROQ_API_KEY, LOCAL_MODEL_URL")]
    NoProviders,

    /// The incoming `RunRequest` was malformed.
    #[error("malformed run request: {0}")]
    MalformedRequest(String),
}

/// Errors raised by an individual LLM provider call.
#[derive(Debug, Error, Clone)]
pub enum ProviderError {
    /// Network/transport failure.
    #[error("transport error calling {provider}: {message}")]
    Transport { provider: String, message: String },

    /// Authentication/credential rejection.
    #[error("auth error calling {provider}: {message}")]
    Auth { provider: String, message: String },

    /// Provider rate-limited the request.
    #[error("rate limited by {provider}")]
    RateLimited { provider: String },

    /// The call exceeded its deadline.
    #[error("{provider} timed out after {elapsed_ms}ms")]
    Timeout { provider: String, elapsed_ms: u64 },
}

impl ProviderError {
    /// Name of the provider that raised this error.
    #[must_use]
    pub fn provider(&self) -> &str {
        match self {
            Self::Transport { provider, .. }
            | Self::Auth { provider, .. }
            | Self::RateLimited { provider }
            | Self::Timeout { provider, .. } => provider,
        }
    }
}

/// A patch failed static validation.
#[derive(Debug, Error, Clone)]
#[error("validation failed for {language}: {message}")]
pub struct ValidationError {
    pub language: String,
    pub message: String,
}

/// A blocking operation exceeded its allotted deadline.
#[derive(Debug, Error, Clone)]
#[error("{operation} timed out after {elapsed_ms}ms")]
pub struct TimeoutError {
    pub operation: String,
    pub elapsed_ms: u64,
}

/// Internal signal: an iteration's failure count grew. Triggers rollback;
/// never surfaced to the caller as a run-ending error.
#[derive(Debug, Error, Clone)]
#[error("regression detected: {errors_before} -> {errors_after} failures")]
pub struct RegressionDetected {
    pub errors_before: usize,
    pub errors_after: usize,
}
