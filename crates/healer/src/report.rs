//! Report Assembler and the run's core data model: `FixRecord`,
//! `Iteration`, `RunReport`, and the score formula.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::ser::SerializeStruct;
use serde::{Deserialize, Serialize, Serializer};

use crate::failure::BugType;

/// Outcome of validating/applying a patch against a `FixRecord`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationOutcome {
    Applied,
    Failed,
}

/// One accepted or attempted fix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRecord {
    pub file: String,
    pub bug_type: BugType,
    pub line: Option<u32>,
    /// All lines that shared this error type in the same file.
    pub all_lines: Vec<u32>,
    pub error_message: String,
    pub commit_message: String,
    pub providers_used: Vec<String>,
    /// Raw per-provider responses, kept for debugging only.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub raw_responses: Vec<String>,
    /// "tool:<name>" or "ensemble".
    pub origin: String,
    pub validation_outcome: ValidationOutcome,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub debug: HashMap<String, String>,
}

/// Terminal decision recorded for one iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IterationDecision {
    Applied,
    RolledBack,
    Stuck,
    Passed,
}

/// One pass through the detect -> classify -> repair -> validate cycle.
#[derive(Debug, Clone, Deserialize)]
pub struct Iteration {
    pub index: u32,
    pub failures_before: usize,
    pub failures_after: usize,
    pub timestamp: DateTime<Utc>,
    pub snapshot_commit: String,
    pub decision: IterationDecision,
}

/// Wire status for one timeline entry: `Applied`/`Passed` iterations read
/// back as `PASSED`, `RolledBack`/`Stuck` as `FAILED`.
impl Iteration {
    fn wire_status(&self) -> &'static str {
        match self.decision {
            IterationDecision::Applied | IterationDecision::Passed => "PASSED",
            IterationDecision::RolledBack | IterationDecision::Stuck => "FAILED",
        }
    }
}

/// Serializes with the stable timeline-entry keys (`iteration`, `status`,
/// `failures_count`, `timestamp`) alongside the richer internal fields, so
/// a client reading only the documented keys still gets what it expects.
impl Serialize for Iteration {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut state = serializer.serialize_struct("Iteration", 7)?;
        state.serialize_field("iteration", &self.index)?;
        state.serialize_field("status", self.wire_status())?;
        state.serialize_field("failures_count", &self.failures_after)?;
        state.serialize_field("timestamp", &self.timestamp)?;
        state.serialize_field("failures_before", &self.failures_before)?;
        state.serialize_field("snapshot_commit", &self.snapshot_commit)?;
        state.serialize_field("decision", &self.decision)?;
        state.end()
    }
}

/// CI status the run concluded with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CiStatus {
    Passed,
    Failed,
}

/// Score breakdown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Score {
    pub base: i64,
    pub speed_bonus: i64,
    pub efficiency_penalty: i64,
    pub total: i64,
}

impl Score {
    /// `base = 100`, `speed_bonus = 10 if wall_clock < 300s else 0`,
    /// `efficiency_penalty = 2 * max(0, commits_made - 20)`. The 300s
    /// threshold is treated as strict `<`.
    #[must_use]
    pub fn compute(wall_clock_seconds: f64, commits_made: u32) -> Self {
        let base = 100;
        let speed_bonus = if wall_clock_seconds < 300.0 { 10 } else { 0 };
        let efficiency_penalty = 2 * i64::from(commits_made.saturating_sub(20));
        let total = base + speed_bonus - efficiency_penalty;
        Self {
            base,
            speed_bonus,
            efficiency_penalty,
            total,
        }
    }
}

/// GitHub (or other hosting) CI status, when the CI Poll Adapter ran.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GithubCiStatus {
    pub status: String,
    pub message: String,
}

/// Final result document for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub repo_url: String,
    pub team_name: String,
    pub team_leader: String,
    pub branch_name: String,
    pub total_failures_detected: usize,
    pub total_fixes_applied: usize,
    pub regressions_prevented: usize,
    pub total_time_seconds: f64,
    pub ci_status: CiStatus,
    pub retry_limit: u32,
    pub score: Score,
    pub fixes: Vec<FixRecord>,
    pub timeline: Vec<Iteration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub github_ci: Option<GithubCiStatus>,
}

/// Accumulates iterations and fixes over a run, then assembles the final
/// [`RunReport`].
pub struct ReportAssembler {
    pub repo_url: String,
    pub team_name: String,
    pub team_leader: String,
    pub branch_name: String,
    pub retry_limit: u32,
    total_failures_detected: usize,
    regressions_prevented: usize,
    fixes: Vec<FixRecord>,
    timeline: Vec<Iteration>,
    commits_made: u32,
    github_ci: Option<GithubCiStatus>,
}

impl ReportAssembler {
    #[must_use]
    pub fn new(
        repo_url: impl Into<String>,
        team_name: impl Into<String>,
        team_leader: impl Into<String>,
        branch_name: impl Into<String>,
        retry_limit: u32,
    ) -> Self {
        Self {
            repo_url: repo_url.into(),
            team_name: team_name.into(),
            team_leader: team_leader.into(),
            branch_name: branch_name.into(),
            retry_limit,
            total_failures_detected: 0,
            regressions_prevented: 0,
            fixes: Vec::new(),
            timeline: Vec::new(),
            commits_made: 0,
            github_ci: None,
        }
    }

    pub fn record_failures_observed(&mut self, count: usize) {
        self.total_failures_detected += count;
    }

    pub fn push_iteration(&mut self, iteration: Iteration) {
        if iteration.decision == IterationDecision::Applied {
            self.commits_made += 1;
        }
        self.timeline.push(iteration);
    }

    pub fn push_fixes(&mut self, fixes: impl IntoIterator<Item = FixRecord>) {
        self.fixes.extend(fixes);
    }

    /// Drop every `FixRecord` appended after `from_index` (used when an
    /// iteration is rolled back).
    pub fn truncate_fixes(&mut self, from_index: usize) {
        self.fixes.truncate(from_index);
    }

    #[must_use]
    pub fn fix_count(&self) -> usize {
        self.fixes.len()
    }

    pub fn note_regression_prevented(&mut self) {
        self.regressions_prevented += 1;
    }

    /// Stamp `message` onto every `FixRecord` appended since `from_index`
    /// (they share the single commit made for the iteration that produced
    /// them).
    pub fn stamp_commit_message(&mut self, from_index: usize, message: &str) {
        for record in self.fixes.iter_mut().skip(from_index) {
            record.commit_message = message.to_string();
        }
    }

    pub fn set_github_ci(&mut self, status: GithubCiStatus) {
        self.github_ci = Some(status);
    }

    #[must_use]
    pub fn assemble(self, ci_status: CiStatus, wall_clock_seconds: f64) -> RunReport {
        let score = Score::compute(wall_clock_seconds, self.commits_made);
        RunReport {
            repo_url: self.repo_url,
            team_name: self.team_name,
            team_leader: self.team_leader,
            branch_name: self.branch_name,
            total_failures_detected: self.total_failures_detected,
            total_fixes_applied: self.fixes.len(),
            regressions_prevented: self.regressions_prevented,
            total_time_seconds: wall_clock_seconds,
            ci_status,
            retry_limit: self.retry_limit,
            score,
            fixes: self.fixes,
            timeline: self.timeline,
            github_ci: self.github_ci,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn score_formula_holds() {
        let score = Score::compute(120.0, 5);
        assert_eq!(score.total, score.base + score.speed_bonus - score.efficiency_penalty);
        assert_eq!(score.speed_bonus, 10);
        assert_eq!(score.efficiency_penalty, 0);
    }

    #[test]
    fn speed_bonus_is_strict_less_than() {
        assert_eq!(Score::compute(299.999, 0).speed_bonus, 10);
        assert_eq!(Score::compute(300.0, 0).speed_bonus, 0);
        assert_eq!(Score::compute(300.1, 0).speed_bonus, 0);
    }

    #[test]
    fn efficiency_penalty_only_above_twenty_commits() {
        assert_eq!(Score::compute(10.0, 20).efficiency_penalty, 0);
        assert_eq!(Score::compute(10.0, 25).efficiency_penalty, 10);
    }

    #[test]
    fn truncate_fixes_removes_tail() {
        let mut assembler = ReportAssembler::new("u", "t", "l", "b", 5);
        assembler.push_fixes(vec![
            FixRecord {
                file: "a.py".into(),
                bug_type: BugType::Logic,
                line: Some(1),
                all_lines: vec![1],
                error_message: String::new(),
                commit_message: String::new(),
                providers_used: vec![],
                raw_responses: vec![],
                origin: "ensemble".into(),
                validation_outcome: ValidationOutcome::Applied,
                error: None,
                debug: HashMap::new(),
            },
        ]);
        let mark = assembler.fix_count();
        assembler.push_fixes(vec![
            FixRecord {
                file: "b.py".into(),
                bug_type: BugType::Logic,
                line: Some(2),
                all_lines: vec![2],
                error_message: String::new(),
                commit_message: String::new(),
                providers_used: vec![],
                raw_responses: vec![],
                origin: "ensemble".into(),
                validation_outcome: ValidationOutcome::Applied,
                error: None,
                debug: HashMap::new(),
            },
        ]);
        assembler.truncate_fixes(mark);
        assert_eq!(assembler.fix_count(), 1);
    }
}
