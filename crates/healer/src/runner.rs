//! The `Runner` port: detect project type, run tests, return a
//! structured failure list. The concrete test-runner integration is an
//! external collaborator the core depends on through this trait, so the
//! shell-based implementation here stays intentionally shallow (enough
//! to drive the loop end to end, not a general multi-language
//! test-output parser).

use std::path::Path;
use std::process::Command;

use async_trait::async_trait;
use regex::Regex;

use crate::failure::Failure;

/// Project type a [`Runner`] detected in the working directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProjectKind {
    Python,
    Node,
    Ruby,
    Unknown,
}

/// The `Runner` port: detect the project type, execute its tests, and
/// return the structured failures observed. Automocked behind
/// `test-util`, mirroring [`crate::vcs::Vcs`].
#[cfg_attr(feature = "test-util", mockall::automock)]
#[async_trait]
pub trait Runner: Send + Sync {
    async fn detect(&self, repo_root: &Path) -> ProjectKind;
    async fn run(&self, repo_root: &Path) -> Result<Vec<Failure>, crate::error::HealError>;
}

/// Shells out to the ecosystem-standard test command for the detected
/// project type and heuristically parses failures out of its output.
pub struct ShellRunner;

#[async_trait]
impl Runner for ShellRunner {
    async fn detect(&self, repo_root: &Path) -> ProjectKind {
        if repo_root.join("requirements.txt").exists() || repo_root.join("pyproject.toml").exists() {
            ProjectKind::Python
        } else if repo_root.join("package.json").exists() {
            ProjectKind::Node
        } else if repo_root.join("Gemfile").exists() {
            ProjectKind::Ruby
        } else {
            ProjectKind::Unknown
        }
    }

    async fn run(&self, repo_root: &Path) -> Result<Vec<Failure>, crate::error::HealError> {
        let kind = self.detect(repo_root).await;
        let (program, args): (&str, &[&str]) = match kind {
            ProjectKind::Python => ("pytest", &["-q"]),
            ProjectKind::Node => ("npm", &["test", "--silent"]),
            ProjectKind::Ruby => ("rspec", &[]),
            ProjectKind::Unknown => {
                return Err(crate::error::HealError::Runner(
                    "could not detect a supported project type".to_string(),
                ))
            }
        };

        let output = Command::new(program)
            .args(args)
            .current_dir(repo_root)
            .output()
            .map_err(|e| crate::error::HealError::Runner(format!("{program}: {e}")))?;

        let combined = format!(
            "{}{}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        );

        Ok(parse_failures(&combined, kind))
    }
}

/// Heuristically extract `file:line: kind: message` style failures from
/// combined stdout/stderr. Good enough to drive the healing loop's
/// detect/classify/repair cycle without claiming to be a real multi-
/// language test-report parser.
fn parse_failures(output: &str, kind: ProjectKind) -> Vec<Failure> {
    let Some(pattern) = (match kind {
        ProjectKind::Python => Regex::new(
            r#"(?m)^\s*File "(?P<file>[^"]+)", line (?P<line>\d+).*\n.*\n(?P<kind>\w+Error|AssertionError): ?(?P<message>.*)$"#,
        )
        .ok(),
        ProjectKind::Node => Regex::new(r"(?m)^\s*at .*\((?P<file>[^:()]+):(?P<line>\d+):\d+\)").ok(),
        ProjectKind::Ruby | ProjectKind::Unknown => None,
    }) else {
        return vec![];
    };

    pattern
        .captures_iter(output)
        .map(|caps| {
            let file = caps.name("file").map_or(String::new(), |m| m.as_str().to_string());
            let line = caps.name("line").and_then(|m| m.as_str().parse().ok());
            let kind_str = caps.name("kind").map_or("TestFailure", |m| m.as_str()).to_string();
            let message = caps.name("message").map_or(String::new(), |m| m.as_str().to_string());
            Failure::new(file, line, kind_str, message)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_python_traceback_style_failures() {
        let output = concat!(
            "  File \"app.py\", line 12, in f\n",
            "    return 1 / 0\n",
            "ZeroDivisionError: division by zero\n"
        );
        let failures = parse_failures(output, ProjectKind::Python);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].file, "app.py");
        assert_eq!(failures[0].line, Some(12));
        assert_eq!(failures[0].error_kind, "ZeroDivisionError");
    }

    #[test]
    fn unknown_project_kind_parses_nothing() {
        assert!(parse_failures("anything", ProjectKind::Unknown).is_empty());
    }
}
