//! VCS Adapter: the `Vcs` port and a `git`/`gh`-shelling
//! implementation. The core treats the underlying network fetch used to
//! clone as an external collaborator — this adapter drives it
//! by shelling out to the `git` and `gh` binaries, the same way other
//! escalation paths in this codebase shell out to `gh pr comment`/`gh
//! issue create`.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::{info, warn};

use crate::error::TimeoutError;

/// Per-operation timeout: every VCS op gets a 30 s wall-clock cap.
const VCS_OP_TIMEOUT: Duration = Duration::from_secs(30);

/// Commit message prefix required on every core-authored commit.
pub const COMMIT_PREFIX: &str = "[AI-AGENT] ";

/// Spawn `cmd` with output piped and a hard wall-clock cap: on expiry the
/// child is killed (`kill_on_drop`) rather than left to run past the
/// deadline, matching the per-op budget every `Vcs` method is held to.
async fn run_with_timeout(cmd: &mut Command, label: &str) -> Result<std::process::Output> {
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);
    let child = cmd.spawn().with_context(|| format!("spawning {label}"))?;

    match timeout(VCS_OP_TIMEOUT, child.wait_with_output()).await {
        Ok(result) => result.with_context(|| format!("waiting on {label}")),
        Err(_) => Err(TimeoutError {
            operation: label.to_string(),
            elapsed_ms: VCS_OP_TIMEOUT.as_millis() as u64,
        }
        .into()),
    }
}

/// The `Vcs` port: clone / diff / commit / push / current-commit /
/// reset-to-commit, exactly the primitives the healing loop needs.
///
/// Automocked behind `test-util` (see `[dev-dependencies] healer` in this
/// crate's `Cargo.toml`) so the healing loop's state-machine scenarios
/// can be driven against a `MockVcs` from the `tests/` integration suite.
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait Vcs: Send + Sync {
    async fn clone_repo(&mut self, url: &str, dest: &Path, token: Option<&str>) -> Result<()>;
    async fn snapshot(&self) -> Result<String>;
    async fn reset_to(&self, hash: &str) -> Result<()>;
    async fn commit(&self, message: &str) -> Result<()>;
    async fn push(&self, branch: &str) -> Result<()>;
    async fn current_branch(&self) -> Result<String>;
    async fn create_branch(&self, name: &str) -> Result<()>;
}

/// `git`/`gh`-backed implementation operating on a single working directory.
pub struct GitVcs {
    work_dir: PathBuf,
    token: Option<String>,
    /// When set, `commit`/`push` log what they would have done and return
    /// without touching the repository or any remote (`--dry-run`).
    dry_run: bool,
}

impl GitVcs {
    #[must_use]
    pub fn new(work_dir: impl Into<PathBuf>) -> Self {
        Self {
            work_dir: work_dir.into(),
            token: None,
            dry_run: false,
        }
    }

    /// Consuming builder: commit/push become no-ops that only log.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.dry_run = true;
        self
    }

    async fn run(&self, args: &[&str]) -> Result<std::process::Output> {
        run_with_timeout(
            Command::new("git").current_dir(&self.work_dir).args(args),
            &format!("git {}", args.join(" ")),
        )
        .await
    }

    async fn run_checked(&self, args: &[&str]) -> Result<String> {
        let output = self.run(args).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {stderr}", args.join(" ")));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn authenticated_url(url: &str, token: Option<&str>) -> String {
        let Some(token) = token else {
            return url.to_string();
        };
        if let Some(rest) = url.strip_prefix("https://") {
            format!("https://x-access-token:{token}@{rest}")
        } else {
            url.to_string()
        }
    }

    /// Fork the repository under the configured hosting account and
    /// return the fork's push URL. Used only when the remote rejects a
    /// push because we don't own the upstream.
    async fn fork_via_hosting_api(&self, repository_slug: &str) -> Result<String> {
        let output = run_with_timeout(
            Command::new("gh").args(["repo", "fork", repository_slug, "--remote=false"]),
            "gh repo fork",
        )
        .await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("gh repo fork failed: {stderr}"));
        }
        let whoami = run_with_timeout(Command::new("gh").args(["api", "user", "--jq", ".login"]), "gh api user")
            .await?;
        let login = String::from_utf8_lossy(&whoami.stdout).trim().to_string();
        let repo_name = repository_slug.rsplit('/').next().unwrap_or(repository_slug);
        Ok(format!("https://github.com/{login}/{repo_name}.git"))
    }
}

#[async_trait]
impl Vcs for GitVcs {
    async fn clone_repo(&mut self, url: &str, dest: &Path, token: Option<&str>) -> Result<()> {
        self.token = token.map(ToString::to_string);
        self.work_dir = dest.to_path_buf();
        let auth_url = Self::authenticated_url(url, token);

        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let output = run_with_timeout(
            Command::new("git").args(["clone", "--depth", "1", &auth_url, &dest.to_string_lossy()]),
            "git clone",
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git clone failed: {stderr}"));
        }
        info!(url, dest = %dest.display(), "cloned repository");
        Ok(())
    }

    async fn snapshot(&self) -> Result<String> {
        self.run_checked(&["rev-parse", "HEAD"]).await
    }

    async fn reset_to(&self, hash: &str) -> Result<()> {
        self.run_checked(&["reset", "--hard", hash]).await?;
        self.run_checked(&["clean", "-fd"]).await?;
        Ok(())
    }

    async fn commit(&self, message: &str) -> Result<()> {
        let full_message = if message.starts_with(COMMIT_PREFIX) {
            message.to_string()
        } else {
            format!("{COMMIT_PREFIX}{message}")
        };

        if self.dry_run {
            info!(message = %full_message, "dry-run: skipping commit");
            return Ok(());
        }

        self.run_checked(&["add", "-A"]).await?;
        let output = self.run(&["commit", "-m", &full_message]).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            // "nothing to commit" is not an error for our purposes.
            if stderr.contains("nothing to commit") {
                return Ok(());
            }
            return Err(anyhow!("git commit failed: {stderr}"));
        }
        Ok(())
    }

    async fn push(&self, branch: &str) -> Result<()> {
        if self.dry_run {
            info!(branch, "dry-run: skipping push");
            return Ok(());
        }

        let output = self.run(&["push", "-u", "origin", branch]).await?;
        if output.status.success() {
            return Ok(());
        }

        let stderr = String::from_utf8_lossy(&output.stderr);
        warn!(branch, error = %stderr, "push rejected, attempting fork+retarget");

        let origin_url = self.run_checked(&["remote", "get-url", "origin"]).await?;
        let slug = origin_url
            .trim_end_matches(".git")
            .rsplit("github.com/")
            .next()
            .ok_or_else(|| anyhow!("could not parse repository slug from {origin_url}"))?;

        let fork_url = self.fork_via_hosting_api(slug).await?;
        match self.run_checked(&["remote", "add", "fork", &fork_url]).await {
            Ok(_) => {}
            Err(_) => {
                self.run_checked(&["remote", "set-url", "fork", &fork_url]).await?;
            }
        }
        self.run_checked(&["push", "-u", "fork", branch]).await?;
        Ok(())
    }

    async fn current_branch(&self) -> Result<String> {
        self.run_checked(&["rev-parse", "--abbrev-ref", "HEAD"]).await
    }

    async fn create_branch(&self, name: &str) -> Result<()> {
        self.run_checked(&["checkout", "-B", name]).await?;
        Ok(())
    }
}

/// Derive the healing branch name from team/leader fields.
/// The `team_name`/`team_leader` portion is uppercased with any run of
/// non-alphanumerics collapsed to a single underscore; the literal
/// `_AI_Fix` suffix (matching `^[A-Z0-9_]+_AI_Fix$`) is kept as
/// written rather than uppercased, so the produced name always matches
/// that grammar.
#[must_use]
pub fn branch_name(team_name: &str, team_leader: &str) -> String {
    let raw = format!("{team_name}_{team_leader}").to_uppercase();
    let mut collapsed = String::with_capacity(raw.len());
    let mut last_was_sep = false;
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            collapsed.push(ch);
            last_was_sep = false;
        } else if !last_was_sep {
            collapsed.push('_');
            last_was_sep = true;
        }
    }
    let trimmed = collapsed.trim_matches('_');
    format!("{trimmed}_AI_Fix")
}

#[cfg(test)]
mod tests {
    use super::*;
    use regex::Regex;

    #[test]
    fn branch_name_matches_grammar() {
        let name = branch_name("AcmeTeam", "Jane Doe");
        let re = Regex::new(r"^[A-Z0-9_]+_AI_Fix$").unwrap();
        assert!(re.is_match(&name), "{name} did not match grammar");
    }

    #[test]
    fn branch_name_is_idempotent() {
        let a = branch_name("Acme Team", "jane-doe");
        let b = branch_name("Acme Team", "jane-doe");
        assert_eq!(a, b);
    }

    #[test]
    fn branch_name_collapses_non_alphanumerics() {
        let name = branch_name("Acme--Team!!", "Jane__Doe");
        assert!(!name.contains("__"));
        assert!(!name.contains("--"));
    }

    #[test]
    fn commit_message_gets_prefixed() {
        assert!(format!("{COMMIT_PREFIX}fix LINTING in f.py").starts_with(COMMIT_PREFIX));
    }
}
