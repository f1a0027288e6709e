//! Provider Registry & Model Selector: the `LLM` port, the set
//! of configured providers, and the BugType -> ordered (provider, model)
//! candidate list with ensemble width.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ProviderError;
use crate::failure::BugType;

/// Capability tag used by the Model Selector's preferred-order fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Fast,
    Reasoning,
    Code,
    Local,
}

/// A configured LLM provider: name, base URL, credential, capability tag.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub credential: String,
    pub capability: Capability,
    pub default_model: String,
}

/// The `LLM` port: send a prompt to a named provider+model, get a text
/// completion within a deadline. This is the seam the core depends on;
/// the concrete network client is treated as an external collaborator.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;
    fn capability(&self) -> Capability;
    /// The model identifier to request when none is otherwise specified.
    fn default_model(&self) -> &str;

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        deadline: Duration,
    ) -> Result<String, ProviderError>;
}

/// A real provider talking to an OpenAI-compatible chat-completions
/// endpoint (covers OpenRouter, OpenAI, Groq, and local servers).
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    #[must_use]
    pub fn new(config: ProviderConfig) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
        }
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl LlmProvider for HttpProvider {
    fn name(&self) -> &str {
        &self.config.name
    }

    fn capability(&self) -> Capability {
        self.config.capability
    }

    fn default_model(&self) -> &str {
        &self.config.default_model
    }

    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        deadline: Duration,
    ) -> Result<String, ProviderError> {
        let started = Instant::now();
        let body = ChatRequest {
            model,
            messages: vec![ChatMessage {
                role: "user",
                content: prompt,
            }],
        };

        let result = self
            .client
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(&self.config.credential)
            .json(&body)
            .timeout(deadline)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                return Err(ProviderError::Timeout {
                    provider: self.config.name.clone(),
                    elapsed_ms: started.elapsed().as_millis() as u64,
                })
            }
            Err(e) => {
                return Err(ProviderError::Transport {
                    provider: self.config.name.clone(),
                    message: e.to_string(),
                })
            }
        };

        if response.status() == reqwest::StatusCode::UNAUTHORIZED
            || response.status() == reqwest::StatusCode::FORBIDDEN
        {
            return Err(ProviderError::Auth {
                provider: self.config.name.clone(),
                message: format!("status {}", response.status()),
            });
        }
        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(ProviderError::RateLimited {
                provider: self.config.name.clone(),
            });
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| ProviderError::Transport {
            provider: self.config.name.clone(),
            message: e.to_string(),
        })?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| ProviderError::Transport {
                provider: self.config.name.clone(),
                message: "empty choices array".to_string(),
            })
    }
}

/// Role a candidate plays in an ensemble call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Primary,
    Secondary,
}

/// One candidate slot from the Model Selector: a concrete provider index
/// into [`ProviderRegistry`], the model name to request, and its role.
#[derive(Debug, Clone)]
pub struct Candidate {
    pub provider_index: usize,
    pub model: String,
    pub role: Role,
}

/// Holds all configured providers, ordered by priority (configuration
/// order; the first provider sharing a capability tag wins tie-breaks in
/// reconciliation).
pub struct ProviderRegistry {
    providers: Vec<Box<dyn LlmProvider>>,
}

impl ProviderRegistry {
    #[must_use]
    pub fn new(providers: Vec<Box<dyn LlmProvider>>) -> Self {
        Self { providers }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.providers.len()
    }

    #[must_use]
    pub fn get(&self, index: usize) -> Option<&dyn LlmProvider> {
        self.providers.get(index).map(std::convert::AsRef::as_ref)
    }

    /// Preferred capability order per BugType, before
    /// width reduction and fallback substitution.
    fn preferred_capabilities(bug_type: BugType) -> &'static [Capability] {
        match bug_type {
            BugType::Logic => &[Capability::Reasoning, Capability::Reasoning, Capability::Reasoning],
            BugType::TypeError => &[Capability::Reasoning, Capability::Reasoning],
            BugType::Syntax => &[Capability::Reasoning, Capability::Fast],
            BugType::Import | BugType::Indentation => &[Capability::Fast],
            BugType::Linting => &[],
        }
    }

    /// Yield an ordered list of (provider, model) candidates for
    /// `bug_type`, reduced to the number of providers actually available
    /// (minimum 1, unless the preferred list itself is empty i.e. LINTING).
    #[must_use]
    pub fn select(&self, bug_type: BugType) -> Vec<Candidate> {
        let preferred = Self::preferred_capabilities(bug_type);
        if preferred.is_empty() || self.providers.is_empty() {
            return vec![];
        }

        let mut used = std::collections::HashSet::new();
        let mut candidates = Vec::new();

        for (slot, capability) in preferred.iter().enumerate() {
            if used.len() >= self.providers.len() {
                // Every configured provider already holds a slot; width
                // caps at the number of providers actually available.
                break;
            }

            // Try the exact capability first among unused providers; fall
            // back to any other unused provider (keeps width from
            // collapsing to zero when the exact tag isn't configured).
            let index = self
                .providers
                .iter()
                .enumerate()
                .find(|(i, p)| p.capability() == *capability && !used.contains(i))
                .map(|(i, _)| i)
                .or_else(|| {
                    self.providers
                        .iter()
                        .enumerate()
                        .find(|(i, _)| !used.contains(i))
                        .map(|(i, _)| i)
                });

            let Some(index) = index else { break };
            used.insert(index);

            let role = if slot == 0 { Role::Primary } else { Role::Secondary };
            candidates.push(Candidate {
                provider_index: index,
                model: self.providers[index].default_model().to_string(),
                role,
            });
        }

        candidates
    }

    /// Ensemble width for `bug_type`, i.e. `select(bug_type).len()`.
    #[must_use]
    pub fn width(&self, bug_type: BugType) -> usize {
        self.select(bug_type).len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubProvider {
        name: &'static str,
        capability: Capability,
    }

    #[async_trait]
    impl LlmProvider for StubProvider {
        fn name(&self) -> &str {
            self.name
        }
        fn capability(&self) -> Capability {
            self.capability
        }
        fn default_model(&self) -> &str {
            "stub-model"
        }
        async fn complete(
            &self,
            _model: &str,
            _prompt: &str,
            _deadline: Duration,
        ) -> Result<String, ProviderError> {
            Ok("stub".to_string())
        }
    }

    fn registry(caps: &[Capability]) -> ProviderRegistry {
        let providers = caps
            .iter()
            .enumerate()
            .map(|(i, cap)| {
                let name: &'static str = Box::leak(format!("provider-{i}").into_boxed_str());
                Box::new(StubProvider {
                    name,
                    capability: *cap,
                }) as Box<dyn LlmProvider>
            })
            .collect();
        ProviderRegistry::new(providers)
    }

    #[test]
    fn logic_wants_width_three_when_available() {
        let reg = registry(&[Capability::Reasoning, Capability::Reasoning, Capability::Reasoning]);
        assert_eq!(reg.width(BugType::Logic), 3);
    }

    #[test]
    fn width_reduced_to_available_minimum_one() {
        let reg = registry(&[Capability::Reasoning]);
        assert_eq!(reg.width(BugType::Logic), 1);
    }

    #[test]
    fn linting_never_selects_providers() {
        let reg = registry(&[Capability::Reasoning, Capability::Fast]);
        assert_eq!(reg.width(BugType::Linting), 0);
    }

    #[test]
    fn import_prefers_fast() {
        let reg = registry(&[Capability::Reasoning, Capability::Fast]);
        let candidates = reg.select(BugType::Import);
        assert_eq!(candidates.len(), 1);
        assert_eq!(reg.get(candidates[0].provider_index).unwrap().capability(), Capability::Fast);
    }

    #[test]
    fn missing_capability_falls_back_to_any_provider() {
        let reg = registry(&[Capability::Code]);
        let candidates = reg.select(BugType::Import);
        assert_eq!(candidates.len(), 1);
    }
}
