//! CI Poll Adapter: optional, polls the upstream CI
//! system for a pushed commit's status within a timeout. Uses the `gh`
//! CLI the same way the VCS adapter's fork/push path does for its own
//! escalation calls.

use std::process::Command;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, info};

use crate::report::GithubCiStatus;

/// Poll interval between CI status checks.
const POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Port for polling an upstream CI system for a commit's conclusion.
#[async_trait]
pub trait CiPoller: Send + Sync {
    /// Poll up to `timeout` for `repository`/`commit_sha`'s CI status.
    /// Returns `None` if no conclusive status arrived before the timeout.
    async fn poll(
        &self,
        repository: &str,
        commit_sha: &str,
        timeout: Duration,
    ) -> Option<GithubCiStatus>;
}

/// Polls GitHub Actions via `gh api` for the combined status of a commit.
pub struct GithubCiPoller;

#[derive(Deserialize)]
struct CombinedStatus {
    state: String,
}

impl GithubCiPoller {
    fn fetch_once(repository: &str, commit_sha: &str) -> Option<CombinedStatus> {
        let output = Command::new("gh")
            .args([
                "api",
                &format!("repos/{repository}/commits/{commit_sha}/status"),
            ])
            .output()
            .ok()?;
        if !output.status.success() {
            return None;
        }
        serde_json::from_slice(&output.stdout).ok()
    }
}

#[async_trait]
impl CiPoller for GithubCiPoller {
    async fn poll(
        &self,
        repository: &str,
        commit_sha: &str,
        timeout: Duration,
    ) -> Option<GithubCiStatus> {
        let started = Instant::now();
        loop {
            if let Some(status) = Self::fetch_once(repository, commit_sha) {
                match status.state.as_str() {
                    "success" => {
                        info!(repository, commit_sha, "upstream CI passed");
                        return Some(GithubCiStatus {
                            status: "success".to_string(),
                            message: "upstream CI passed".to_string(),
                        });
                    }
                    "failure" | "error" => {
                        return Some(GithubCiStatus {
                            status: status.state,
                            message: "upstream CI reported failure".to_string(),
                        });
                    }
                    _ => debug!(state = %status.state, "upstream CI still pending"),
                }
            }

            if started.elapsed() >= timeout {
                return None;
            }
            tokio::time::sleep(POLL_INTERVAL.min(timeout.saturating_sub(started.elapsed()).max(Duration::from_millis(1))))
                .await;
        }
    }
}
