//! Healing Loop: the orchestrator. `INIT -> CLONING ->
//! ITERATING -> FINALIZING -> DONE`. Drives detect -> classify -> repair
//! -> validate -> commit cycles while enforcing progress (no infinite
//! loops, no repeated re-fix of the same site) and non-regression (a
//! patch set that increases the failure count is rolled back).

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use chrono::Utc;
use tracing::{info, warn};

use crate::ci_poll::CiPoller;
use crate::ensemble;
use crate::error::{HealError, RegressionDetected};
use crate::failure::{classify, BugType, Failure};
use crate::history::{HistoryEntry, HistoryLog};
use crate::providers::ProviderRegistry;
use crate::report::{
    CiStatus, FixRecord, Iteration, IterationDecision, ReportAssembler, RunReport,
    ValidationOutcome as RecordOutcome,
};
use crate::runner::Runner;
use crate::tools::ToolRegistry;
use crate::vcs::{branch_name, Vcs};

/// States of the healing loop's state machine. Logged as each
/// transition happens; not otherwise observable by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    Cloning,
    Iterating,
    Finalizing,
    Done,
}

/// Input to the core: the repository to heal and who's requesting it.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub repo_url: String,
    pub team_name: String,
    pub team_leader: String,
    pub upstream_token: Option<String>,
}

/// Orchestrates one run of the healing loop against its three ports:
/// `Vcs`, `Runner`, and the `LlmProvider`s behind `ProviderRegistry`.
pub struct HealingLoop<V: Vcs, R: Runner> {
    pub vcs: V,
    pub runner: R,
    pub providers: ProviderRegistry,
    pub history: HistoryLog,
    pub ci_poller: Option<Box<dyn CiPoller>>,
    pub retry_limit: u32,
    pub wall_clock_limit: Duration,
    pub ensemble_deadline: Duration,
    pub workspace_root: PathBuf,
    pub github_ci_timeout: Duration,
}

impl<V: Vcs, R: Runner> HealingLoop<V, R> {
    pub async fn run(&mut self, request: RunRequest) -> RunReport {
        let wall_clock_start = Instant::now();
        let branch = branch_name(&request.team_name, &request.team_leader);
        let mut assembler = ReportAssembler::new(
            request.repo_url.clone(),
            request.team_name.clone(),
            request.team_leader.clone(),
            branch.clone(),
            self.retry_limit,
        );

        log_transition(State::Init, State::Cloning);
        let repo_root = self.workspace_root.join(sanitize_dir_name(&request.repo_url));

        if let Err(source) = self
            .vcs
            .clone_repo(&request.repo_url, &repo_root, request.upstream_token.as_deref())
            .await
        {
            let err = HealError::Clone {
                url: request.repo_url.clone(),
                source,
            };
            warn!(error = %err, "clone failed, run ends FAILED");
            return assembler.assemble(CiStatus::Failed, wall_clock_start.elapsed().as_secs_f64());
        }
        if let Err(e) = self.vcs.create_branch(&branch).await {
            warn!(error = %e, "could not create healing branch, run ends FAILED");
            return assembler.assemble(CiStatus::Failed, wall_clock_start.elapsed().as_secs_f64());
        }

        log_transition(State::Cloning, State::Iterating);
        let mut fix_sites: HashSet<(String, u32)> = HashSet::new();
        let mut errors_before_history: Vec<usize> = Vec::new();
        let mut last_snapshot: Option<String> = None;
        let mut iteration_index: u32 = 1;
        let mut ci_status = CiStatus::Failed;

        'iterating: loop {
            if wall_clock_start.elapsed() > self.wall_clock_limit {
                warn!("wall-clock cap reached, run ends FAILED with partial report");
                break 'iterating;
            }

            let failures = match self.runner.run(&repo_root).await {
                Ok(f) => f,
                Err(e) => {
                    warn!(error = %e, "runner failed to start, run ends FAILED");
                    break 'iterating;
                }
            };
            let errors_before = failures.len();
            assembler.record_failures_observed(errors_before);

            if errors_before == 0 {
                let snapshot = self.vcs.snapshot().await.unwrap_or_default();
                assembler.push_iteration(Iteration {
                    index: iteration_index,
                    failures_before: 0,
                    failures_after: 0,
                    timestamp: Utc::now(),
                    snapshot_commit: snapshot,
                    decision: IterationDecision::Passed,
                });
                ci_status = CiStatus::Passed;
                break 'iterating;
            }

            if iteration_index > self.retry_limit {
                info!(iteration_index, "retry limit exhausted, run ends FAILED");
                break 'iterating;
            }

            if errors_before_history.len() >= 2 {
                let n = errors_before_history.len();
                if errors_before == errors_before_history[n - 1] && errors_before == errors_before_history[n - 2] {
                    let snapshot = self.vcs.snapshot().await.unwrap_or_default();
                    assembler.push_iteration(Iteration {
                        index: iteration_index,
                        failures_before: errors_before,
                        failures_after: errors_before,
                        timestamp: Utc::now(),
                        snapshot_commit: snapshot,
                        decision: IterationDecision::Stuck,
                    });
                    info!(iteration_index, errors_before, "convergence stuck, run ends FAILED");
                    break 'iterating;
                }
            }

            if let Some(&prev) = errors_before_history.last() {
                if prev > 0 && (errors_before as f64) > 1.5 * (prev as f64) {
                    if let Some(snapshot) = &last_snapshot {
                        warn!(iteration_index, errors_before, prev, "latent regression from prior iteration, resetting");
                        if self.vcs.reset_to(snapshot).await.is_ok() {
                            assembler.note_regression_prevented();
                            continue 'iterating;
                        }
                    }
                }
            }

            let snapshot_i = match self.vcs.snapshot().await {
                Ok(s) => s,
                Err(e) => {
                    warn!(error = %e, "could not snapshot before iteration, run ends FAILED");
                    break 'iterating;
                }
            };
            last_snapshot = Some(snapshot_i.clone());

            let fixes_mark = assembler.fix_count();
            let mut sorted_failures = failures;
            sorted_failures.sort_by(|a, b| {
                classify(a)
                    .cmp(&classify(b))
                    .then_with(|| a.file.cmp(&b.file))
                    .then_with(|| a.line.cmp(&b.line))
            });

            let mut accepted_this_iteration: Vec<(BugType, String)> = Vec::new();

            for failure in &sorted_failures {
                let site = failure.site();
                if fix_sites.contains(&site) {
                    continue;
                }
                // Locked unconditionally, not only on success: no two
                // FixRecords in one run may share the same (file, line)
                // pair, and a site is never re-fixed once attempted, so a
                // failed attempt must not leave the site open to a second
                // FixRecord later.
                fix_sites.insert(site.clone());

                let bug_type = classify(failure);
                let record = self.attempt_fix(&repo_root, failure, bug_type).await;
                if record.validation_outcome == RecordOutcome::Applied {
                    accepted_this_iteration.push((bug_type, failure.file.clone()));
                }
                assembler.push_fixes(vec![record]);
            }

            let committed_this_iteration = !accepted_this_iteration.is_empty();

            if committed_this_iteration {
                let commit_message = build_commit_message(&accepted_this_iteration);
                stamp_commit_message(&mut assembler, fixes_mark, &commit_message);

                if let Err(source) = self.vcs.commit(&commit_message).await {
                    warn!(error = %source, "commit failed, run ends FAILED");
                    break 'iterating;
                }
                if let Err(source) = self.vcs.push(&branch).await {
                    let err = HealError::Push {
                        branch: branch.clone(),
                        source,
                    };
                    warn!(error = %err, "push failed, run ends FAILED");
                    break 'iterating;
                }

                if let Some(poller) = &self.ci_poller {
                    if let Some(repo_slug) = github_slug(&request.repo_url) {
                        if let Ok(commit_sha) = self.vcs.snapshot().await {
                            if let Some(status) = poller
                                .poll(&repo_slug, &commit_sha, self.github_ci_timeout)
                                .await
                            {
                                let passed = status.status == "success";
                                assembler.set_github_ci(status);
                                if passed {
                                    info!("upstream CI passed, short-circuiting to FINALIZING");
                                    assembler.push_iteration(Iteration {
                                        index: iteration_index,
                                        failures_before: errors_before,
                                        failures_after: 0,
                                        timestamp: Utc::now(),
                                        snapshot_commit: snapshot_i.clone(),
                                        decision: IterationDecision::Applied,
                                    });
                                    ci_status = CiStatus::Passed;
                                    break 'iterating;
                                }
                            }
                        }
                    }
                }
            }

            // Runner.run() is called once before fixes (above) and exactly
            // once more here regardless of whether anything was accepted:
            // an iteration that fixed nothing still needs an observed
            // errors_after to feed the convergence-stuck and latent-
            // regression checks on the next pass.
            let errors_after = match self.runner.run(&repo_root).await {
                Ok(f) => f.len(),
                Err(e) => {
                    warn!(error = %e, "runner failed post-iteration, run ends FAILED");
                    break 'iterating;
                }
            };

            let decision = if !committed_this_iteration {
                // Nothing was committed, so there is nothing to roll back.
                IterationDecision::Applied
            } else if errors_after > errors_before {
                let regression = RegressionDetected {
                    errors_before,
                    errors_after,
                };
                warn!(iteration_index, error = %regression, "rolling back");
                if let Err(e) = self.vcs.reset_to(&snapshot_i).await {
                    warn!(error = %e, "rollback itself failed");
                }
                assembler.truncate_fixes(fixes_mark);
                assembler.note_regression_prevented();
                IterationDecision::RolledBack
            } else {
                IterationDecision::Applied
            };

            assembler.push_iteration(Iteration {
                index: iteration_index,
                failures_before: errors_before,
                failures_after: errors_after,
                timestamp: Utc::now(),
                snapshot_commit: snapshot_i,
                decision,
            });

            errors_before_history.push(errors_before);
            iteration_index += 1;
        }

        log_transition(State::Iterating, State::Finalizing);
        let report = assembler.assemble(ci_status, wall_clock_start.elapsed().as_secs_f64());
        log_transition(State::Finalizing, State::Done);
        report
    }

    /// Consult the Tool Registry first; fall back to the Ensemble. Always
    /// returns a `FixRecord` (applied or failed) so the site's single
    /// attempt is durably recorded even when nothing could be fixed.
    async fn attempt_fix(&self, repo_root: &Path, failure: &Failure, bug_type: BugType) -> FixRecord {
        let all_lines: Vec<u32> = failure.line.into_iter().collect();

        if let Some(outcome) = ToolRegistry::apply(repo_root, &failure.file, failure.language, bug_type).await {
            if let Some(contents) = outcome.new_contents {
                return FixRecord {
                    file: failure.file.clone(),
                    bug_type,
                    line: failure.line,
                    all_lines,
                    error_message: failure.message.clone(),
                    commit_message: String::new(),
                    providers_used: vec![],
                    raw_responses: vec![],
                    origin: format!("tool:{}", outcome.tool_name),
                    validation_outcome: RecordOutcome::Applied,
                    error: None,
                    debug: std::collections::HashMap::new(),
                };
            }
            // Report-only tool (e.g. mypy): diagnostics feed the ensemble below.
            return self
                .attempt_ensemble_fix(repo_root, failure, bug_type, Some(outcome.diagnostics))
                .await;
        }

        self.attempt_ensemble_fix(repo_root, failure, bug_type, None).await
    }

    async fn attempt_ensemble_fix(
        &self,
        repo_root: &Path,
        failure: &Failure,
        bug_type: BugType,
        tool_diagnostics: Option<String>,
    ) -> FixRecord {
        let all_lines: Vec<u32> = failure.line.into_iter().collect();
        let path = repo_root.join(&failure.file);
        let current_contents = match std::fs::read_to_string(&path) {
            Ok(c) => c,
            Err(e) => {
                return FixRecord {
                    file: failure.file.clone(),
                    bug_type,
                    line: failure.line,
                    all_lines,
                    error_message: failure.message.clone(),
                    commit_message: String::new(),
                    providers_used: vec![],
                    raw_responses: vec![],
                    origin: "ensemble".to_string(),
                    validation_outcome: RecordOutcome::Failed,
                    error: Some(format!("could not read {}: {e}", failure.file)),
                    debug: std::collections::HashMap::new(),
                };
            }
        };

        let history = self.history.read_all().unwrap_or_default();
        let mut debug = std::collections::HashMap::new();

        // A report-only tool (e.g. mypy) ran first; fold its diagnostics
        // into the failure description so the ensemble prompt sees them.
        let failure_for_prompt = if let Some(diag) = &tool_diagnostics {
            debug.insert("tool_diagnostics".to_string(), diag.clone());
            let mut annotated = failure.clone();
            annotated.message = format!("{}\n\nStatic checker output:\n{diag}", annotated.message);
            annotated
        } else {
            failure.clone()
        };

        let result = ensemble::run(
            &self.providers,
            bug_type,
            &failure_for_prompt,
            &current_contents,
            &history,
            self.ensemble_deadline,
        )
        .await;

        debug.insert("repair_rounds".to_string(), result.repair_rounds.to_string());

        match result.winning_contents {
            Some(contents) => {
                if let Err(e) = std::fs::write(&path, &contents) {
                    return FixRecord {
                        file: failure.file.clone(),
                        bug_type,
                        line: failure.line,
                        all_lines,
                        error_message: failure.message.clone(),
                        commit_message: String::new(),
                        providers_used: result.providers_used,
                        raw_responses: result.raw_responses.into_iter().map(|r| r.content).collect(),
                        origin: "ensemble".to_string(),
                        validation_outcome: RecordOutcome::Failed,
                        error: Some(format!("could not write {}: {e}", failure.file)),
                        debug,
                    };
                }
                let _ = self.history.append(&HistoryEntry {
                    bug_type,
                    file: failure.file.clone(),
                    summary: failure.error_kind.clone(),
                });
                FixRecord {
                    file: failure.file.clone(),
                    bug_type,
                    line: failure.line,
                    all_lines,
                    error_message: failure.message.clone(),
                    commit_message: String::new(),
                    providers_used: result.providers_used,
                    raw_responses: result.raw_responses.into_iter().map(|r| r.content).collect(),
                    origin: "ensemble".to_string(),
                    validation_outcome: RecordOutcome::Applied,
                    error: None,
                    debug,
                }
            }
            None => FixRecord {
                file: failure.file.clone(),
                bug_type,
                line: failure.line,
                all_lines,
                error_message: failure.message.clone(),
                commit_message: String::new(),
                providers_used: result.providers_used,
                raw_responses: result.raw_responses.into_iter().map(|r| r.content).collect(),
                origin: "ensemble".to_string(),
                validation_outcome: RecordOutcome::Failed,
                error: Some("no provider returned a response that passed validation".to_string()),
                debug,
            },
        }
    }
}

/// Retroactively stamp the commit message onto every `FixRecord` appended
/// since `from_index` (they share the single commit made for this
/// iteration).
fn stamp_commit_message(assembler: &mut ReportAssembler, from_index: usize, message: &str) {
    assembler.stamp_commit_message(from_index, message);
}

fn build_commit_message(accepted: &[(BugType, String)]) -> String {
    let mut bug_types: Vec<&str> = accepted.iter().map(|(b, _)| b.as_str()).collect();
    bug_types.sort_unstable();
    bug_types.dedup();

    let mut files: Vec<&str> = accepted.iter().map(|(_, f)| f.as_str()).collect();
    files.sort_unstable();
    files.dedup();

    format!(
        "{}fix {} in {}",
        crate::vcs::COMMIT_PREFIX,
        bug_types.join(", "),
        files.join(", ")
    )
}

fn log_transition(from: State, to: State) {
    info!(?from, ?to, "healing loop state transition");
}

fn sanitize_dir_name(url: &str) -> String {
    url.rsplit('/')
        .next()
        .unwrap_or("repo")
        .trim_end_matches(".git")
        .to_string()
}

fn github_slug(url: &str) -> Option<String> {
    let trimmed = url.trim_end_matches(".git");
    trimmed
        .rsplit_once("github.com/")
        .or_else(|| trimmed.rsplit_once("github.com:"))
        .map(|(_, slug)| slug.to_string())
}
