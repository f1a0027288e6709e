//! Ensemble Engine: parallel LLM calls with a shared deadline,
//! reconciliation by deterministic tie-break, and a bounded self-repair
//! loop. The only place in the core where concurrency is allowed to leak
//! outward from a single logical operation; cancellation is not
//! propagated outward past `run`.

use std::time::Duration;

use futures::future::join_all;
use tracing::{info, warn};

use crate::error::ProviderError;
use crate::failure::{BugType, Failure};
use crate::history::HistoryEntry;
use crate::providers::{Candidate, ProviderRegistry, Role};
use crate::validator::{validate, ValidationOutcome};

/// Default total deadline for one ensemble call.
pub const DEFAULT_DEADLINE: Duration = Duration::from_secs(25);

/// Maximum self-repair rounds after every response fails validation.
const MAX_REPAIR_ROUNDS: u32 = 3;

/// A single provider's raw response, kept for debugging
/// (`FixRecord.raw_per_provider_responses`).
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub provider: String,
    pub content: String,
}

/// Outcome of one ensemble call.
pub struct EnsembleResult {
    pub winning_contents: Option<String>,
    pub providers_used: Vec<String>,
    pub raw_responses: Vec<RawResponse>,
    pub repair_rounds: u32,
}

/// Build the language-agnostic prompt contract: full current
/// file contents, failure file/line/message, bug type, up to K=5 matching
/// few-shot history entries, and an explicit "emit file contents only"
/// instruction.
#[must_use]
pub fn build_prompt(
    current_contents: &str,
    failure: &Failure,
    bug_type: BugType,
    history: &[HistoryEntry],
) -> String {
    let mut prompt = String::new();
    prompt.push_str("You are fixing a CI test failure. Respond with the complete new ");
    prompt.push_str("contents of the file, and nothing else: no prose, no markdown code ");
    prompt.push_str("fences, no explanation.\n\n");

    prompt.push_str(&format!("Bug type: {}\n", bug_type.as_str()));
    prompt.push_str(&format!("File: {}\n", failure.file));
    if let Some(line) = failure.line {
        prompt.push_str(&format!("Line: {line}\n"));
    }
    prompt.push_str(&format!("Error: {}\n", failure.error_kind));
    prompt.push_str(&format!("Message: {}\n\n", failure.message));

    let matching: Vec<&HistoryEntry> = history
        .iter()
        .filter(|h| h.bug_type == bug_type)
        .rev()
        .take(5)
        .collect();
    if !matching.is_empty() {
        prompt.push_str("Similar fixes from past runs:\n");
        for entry in matching.iter().rev() {
            prompt.push_str(&format!(
                "- {} in {}: {}\n",
                entry.bug_type.as_str(),
                entry.file,
                entry.summary
            ));
        }
        prompt.push('\n');
    }

    prompt.push_str("Current file contents:\n");
    prompt.push_str(current_contents);
    prompt.push('\n');

    prompt
}

/// Run one ensemble attempt for `failure`/`bug_type`, against
/// `current_contents`, using up to `width` (provider, model) candidates.
pub async fn run(
    registry: &ProviderRegistry,
    bug_type: BugType,
    failure: &Failure,
    current_contents: &str,
    history: &[HistoryEntry],
    deadline: Duration,
) -> EnsembleResult {
    let candidates = registry.select(bug_type);
    if candidates.is_empty() {
        return EnsembleResult {
            winning_contents: None,
            providers_used: vec![],
            raw_responses: vec![],
            repair_rounds: 0,
        };
    }

    let prompt = build_prompt(current_contents, failure, bug_type, history);
    let (raw_responses, valid) = call_and_validate(registry, &candidates, &prompt, failure.language, deadline).await;

    if let Some(winners) = reconcile(&valid, registry, &candidates) {
        let winning_contents = winners.first().map(|w| w.content.clone());
        let providers_used = winners.iter().map(|w| w.provider.clone()).collect();
        return EnsembleResult {
            winning_contents,
            providers_used,
            raw_responses,
            repair_rounds: 0,
        };
    }

    // All responses failed validation: bounded self-repair with the
    // highest-priority (first) candidate.
    let Some(primary) = candidates.first() else {
        return EnsembleResult {
            winning_contents: None,
            providers_used: vec![],
            raw_responses,
            repair_rounds: 0,
        };
    };
    let Some(provider) = registry.get(primary.provider_index) else {
        return EnsembleResult {
            winning_contents: None,
            providers_used: vec![],
            raw_responses,
            repair_rounds: 0,
        };
    };

    let mut last_invalid = raw_responses
        .iter()
        .find(|r| r.provider == provider.name())
        .map(|r| r.content.clone());

    for round in 1..=MAX_REPAIR_ROUNDS {
        let Some(invalid_output) = last_invalid.clone() else {
            break;
        };
        let repair_prompt = format!(
            "{prompt}\n\nYour previous fix introduced a syntax error; fix it without \
             removing existing structure. Your previous (invalid) output was:\n{invalid_output}"
        );

        let result = provider.complete(&primary.model, &repair_prompt, deadline).await;
        match result {
            Ok(content) => {
                let mut all_responses = raw_responses.clone();
                all_responses.push(RawResponse {
                    provider: provider.name().to_string(),
                    content: content.clone(),
                });

                if let ValidationOutcome::Valid = validate(&content, failure.language).await {
                    info!(round, provider = provider.name(), "self-repair succeeded");
                    return EnsembleResult {
                        winning_contents: Some(content),
                        providers_used: vec![provider.name().to_string()],
                        raw_responses: all_responses,
                        repair_rounds: round,
                    };
                }
                last_invalid = Some(content);
            }
            Err(e) => {
                warn!(round, provider = provider.name(), error = %e, "self-repair call failed");
                break;
            }
        }
    }

    EnsembleResult {
        winning_contents: None,
        providers_used: vec![],
        raw_responses,
        repair_rounds: MAX_REPAIR_ROUNDS,
    }
}

/// Issue all candidate calls in parallel, collecting responses as they
/// arrive and stopping at `deadline`. Returns all raw responses plus the
/// subset that passes the Validator.
async fn call_and_validate(
    registry: &ProviderRegistry,
    candidates: &[Candidate],
    prompt: &str,
    language: crate::failure::Language,
    deadline: Duration,
) -> (Vec<RawResponse>, Vec<RawResponse>) {
    let futures = candidates.iter().map(|candidate| {
        let provider = registry.get(candidate.provider_index);
        let model = candidate.model.clone();
        async move {
            let Some(provider) = provider else {
                return None;
            };
            match provider.complete(&model, prompt, deadline).await {
                Ok(content) => Some(RawResponse {
                    provider: provider.name().to_string(),
                    content,
                }),
                // Retried once on transport error, not on semantic
                // rejection. Auth/rate-limit errors are not transport
                // failures and drop the provider for this call immediately.
                Err(ProviderError::Transport { .. } | ProviderError::Timeout { .. }) => {
                    warn!(provider = provider.name(), "transport error, retrying once");
                    match provider.complete(&model, prompt, deadline).await {
                        Ok(content) => Some(RawResponse {
                            provider: provider.name().to_string(),
                            content,
                        }),
                        Err(e) => {
                            warn!(provider = provider.name(), error = %e, "retry failed, dropping provider for this call");
                            None
                        }
                    }
                }
                Err(e) => {
                    warn!(provider = provider.name(), error = %e, "provider call failed, dropping for this call");
                    None
                }
            }
        }
    });

    let results: Vec<Option<RawResponse>> = join_all(futures).await;
    let raw_responses: Vec<RawResponse> = results.into_iter().flatten().collect();

    let mut valid: Vec<RawResponse> = Vec::new();
    for response in &raw_responses {
        if validate(&response.content, language).await.is_valid() {
            valid.push(response.clone());
        }
    }

    (raw_responses, valid)
}

/// Deterministic tie-break over the validator-passing responses:
/// majority group on whitespace-normalized byte-identity, else
/// longest response, ties broken by provider priority order.
fn reconcile<'a>(
    valid: &'a [RawResponse],
    registry: &ProviderRegistry,
    candidates: &[Candidate],
) -> Option<Vec<&'a RawResponse>> {
    if valid.is_empty() {
        return None;
    }
    if valid.len() == 1 {
        return Some(vec![valid.first()?]);
    }

    let priority = |provider_name: &str| -> usize {
        candidates
            .iter()
            .position(|c| registry.get(c.provider_index).map(crate::providers::LlmProvider::name) == Some(provider_name))
            .unwrap_or(usize::MAX)
    };

    // Group by whitespace-normalized content.
    let mut groups: Vec<(String, Vec<&RawResponse>)> = Vec::new();
    for response in valid {
        let normalized = normalize_whitespace(&response.content);
        if let Some(group) = groups.iter_mut().find(|(key, _)| *key == normalized) {
            group.1.push(response);
        } else {
            groups.push((normalized, vec![response]));
        }
    }

    let max_size = groups.iter().map(|(_, g)| g.len()).max().unwrap_or(0);
    if max_size > 1 {
        let mut majority_groups: Vec<&(String, Vec<&RawResponse>)> =
            groups.iter().filter(|(_, g)| g.len() == max_size).collect();
        majority_groups.sort_by_key(|(_, g)| {
            g.iter().map(|r| priority(&r.provider)).min().unwrap_or(usize::MAX)
        });
        let winning_group = majority_groups.first()?;
        let mut members = winning_group.1.clone();
        members.sort_by_key(|r| priority(&r.provider));
        return Some(members);
    }

    // No majority: longest response, ties by provider priority.
    let mut sorted = valid.iter().collect::<Vec<_>>();
    sorted.sort_by(|a, b| {
        b.content
            .len()
            .cmp(&a.content.len())
            .then_with(|| priority(&a.provider).cmp(&priority(&b.provider)))
    });
    Some(vec![sorted.into_iter().next()?])
}

fn normalize_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(provider: &str, content: &str) -> RawResponse {
        RawResponse {
            provider: provider.to_string(),
            content: content.to_string(),
        }
    }

    #[test]
    fn single_valid_response_wins() {
        let registry = ProviderRegistry::new(vec![]);
        let candidates = vec![];
        let valid = vec![raw("a", "fix")];
        let winners = reconcile(&valid, &registry, &candidates).unwrap();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].provider, "a");
    }

    #[test]
    fn majority_group_wins_over_singleton_and_lists_both_contributors() {
        let registry = ProviderRegistry::new(vec![]);
        let candidates = vec![];
        let valid = vec![
            raw("a", "def f():\n  return 1\n"),
            raw("b", "def f():\n  return 1\n"),
            raw("c", "def f():\n    return 2\n"),
        ];
        let winners = reconcile(&valid, &registry, &candidates).unwrap();
        let providers: Vec<&str> = winners.iter().map(|w| w.provider.as_str()).collect();
        assert_eq!(providers.len(), 2);
        assert!(providers.contains(&"a"));
        assert!(providers.contains(&"b"));
    }

    #[test]
    fn whitespace_normalization_groups_equivalent_patches() {
        let registry = ProviderRegistry::new(vec![]);
        let candidates = vec![];
        let valid = vec![
            raw("a", "def f():\n    return 1"),
            raw("b", "def f():\n  return 1 "),
        ];
        // Both normalize to the same token stream -> majority group of 2.
        let winners = reconcile(&valid, &registry, &candidates);
        assert_eq!(winners.map(|w| w.len()), Some(2));
    }

    #[test]
    fn no_majority_picks_longest() {
        let registry = ProviderRegistry::new(vec![]);
        let candidates = vec![];
        let valid = vec![raw("a", "short"), raw("b", "a much longer response body")];
        let winners = reconcile(&valid, &registry, &candidates).unwrap();
        assert_eq!(winners.len(), 1);
        assert_eq!(winners[0].provider, "b");
    }

    #[test]
    fn empty_valid_set_yields_none() {
        let registry = ProviderRegistry::new(vec![]);
        let candidates = vec![];
        let valid: Vec<RawResponse> = vec![];
        assert!(reconcile(&valid, &registry, &candidates).is_none());
    }
}
