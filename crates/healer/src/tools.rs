//! Tool Registry: deterministic external fixer invocations,
//! tried before the Ensemble is ever consulted.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::failure::{BugType, Language};
use crate::validator::{validate, ValidationOutcome};

/// Per-invocation timeout.
const TOOL_TIMEOUT: Duration = Duration::from_secs(30);

/// A single deterministic fixer command.
#[derive(Debug, Clone)]
pub struct Tool {
    pub name: &'static str,
    program: &'static str,
    args: &'static [&'static str],
    /// Appends the target file path as the final argument when true.
    takes_file_arg: bool,
    /// Tools that never rewrite the file in place (e.g. `mypy`), used only
    /// for report-only diagnostics fed forward to the LLM as context.
    report_only: bool,
}

/// Outcome of attempting a single tool.
pub struct ToolOutcome {
    pub tool_name: &'static str,
    pub new_contents: Option<String>,
    pub diagnostics: String,
}

/// Maps (language, bug type) to an ordered list of fixer commands.
pub struct ToolRegistry;

impl ToolRegistry {
    /// Ordered list of tools to try for `(language, bug_type)`. Empty for
    /// bug types that are LLM-only (SYNTAX, IMPORT, LOGIC).
    #[must_use]
    pub fn tools_for(language: Language, bug_type: BugType) -> Vec<Tool> {
        match (language, bug_type) {
            (Language::Python, BugType::Linting | BugType::Indentation) => vec![
                Tool {
                    name: "autopep8",
                    program: "autopep8",
                    args: &["--in-place", "--aggressive"],
                    takes_file_arg: true,
                    report_only: false,
                },
                Tool {
                    name: "black",
                    program: "black",
                    args: &["--quiet"],
                    takes_file_arg: true,
                    report_only: false,
                },
            ],
            (Language::JavaScript | Language::TypeScript, BugType::Linting | BugType::Indentation) => {
                vec![
                    Tool {
                        name: "eslint --fix",
                        program: "eslint",
                        args: &["--fix"],
                        takes_file_arg: true,
                        report_only: false,
                    },
                    Tool {
                        name: "prettier",
                        program: "prettier",
                        args: &["--write"],
                        takes_file_arg: true,
                        report_only: false,
                    },
                ]
            }
            (Language::Ruby, BugType::Linting | BugType::Indentation) => vec![Tool {
                name: "rubocop -A",
                program: "rubocop",
                args: &["-A"],
                takes_file_arg: true,
                report_only: false,
            }],
            (Language::Python, BugType::TypeError) => vec![Tool {
                name: "mypy",
                program: "mypy",
                args: &[],
                takes_file_arg: true,
                report_only: true,
            }],
            _ => vec![],
        }
    }

    /// Try each tool in order against `file` (relative to `repo_root`),
    /// applying the first that exits zero and still parses per the
    /// Validator. Returns `None` if the list is exhausted or empty, in
    /// which case the caller should fall through to the Ensemble.
    pub async fn apply(
        repo_root: &Path,
        file: &str,
        language: Language,
        bug_type: BugType,
    ) -> Option<ToolOutcome> {
        let tools = Self::tools_for(language, bug_type);
        if tools.is_empty() {
            return None;
        }

        let abs_path = repo_root.join(file);

        for tool in tools {
            let mut cmd = Command::new(tool.program);
            cmd.current_dir(repo_root)
                .args(tool.args)
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true);
            if tool.takes_file_arg {
                cmd.arg(&abs_path);
            }

            let child = match cmd.spawn() {
                Ok(c) => c,
                Err(e) => {
                    warn!(tool = tool.name, error = %e, "tool not available, skipping");
                    continue;
                }
            };

            let output = match timeout(TOOL_TIMEOUT, child.wait_with_output()).await {
                Ok(Ok(o)) => o,
                Ok(Err(e)) => {
                    warn!(tool = tool.name, error = %e, "tool process failed, skipping");
                    continue;
                }
                Err(_) => {
                    warn!(tool = tool.name, "tool exceeded timeout, killed, treating as failure");
                    continue;
                }
            };

            let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
            let diagnostics = format!("{stdout}{stderr}");

            if tool.report_only {
                debug!(tool = tool.name, "report-only tool ran, feeding diagnostics forward");
                return Some(ToolOutcome {
                    tool_name: tool.name,
                    new_contents: None,
                    diagnostics,
                });
            }

            if !output.status.success() {
                debug!(tool = tool.name, "tool exited non-zero, trying next");
                continue;
            }

            let new_contents = match std::fs::read_to_string(&abs_path) {
                Ok(c) => c,
                Err(e) => {
                    warn!(tool = tool.name, error = %e, "could not read tool output, trying next");
                    continue;
                }
            };

            match validate(&new_contents, language).await {
                ValidationOutcome::Valid => {
                    info!(tool = tool.name, file, "tool fix applied");
                    return Some(ToolOutcome {
                        tool_name: tool.name,
                        new_contents: Some(new_contents),
                        diagnostics,
                    });
                }
                ValidationOutcome::Invalid(err) => {
                    warn!(tool = tool.name, error = %err.message, "tool output failed validation, trying next");
                }
            }
        }

        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn linting_and_indentation_share_tool_chain() {
        let a = ToolRegistry::tools_for(Language::Python, BugType::Linting);
        let b = ToolRegistry::tools_for(Language::Python, BugType::Indentation);
        assert_eq!(a.len(), b.len());
        assert_eq!(a[0].name, "autopep8");
        assert_eq!(a[1].name, "black");
    }

    #[test]
    fn js_tools_in_order() {
        let tools = ToolRegistry::tools_for(Language::JavaScript, BugType::Linting);
        assert_eq!(tools[0].name, "eslint --fix");
        assert_eq!(tools[1].name, "prettier");
    }

    #[test]
    fn ruby_tools() {
        let tools = ToolRegistry::tools_for(Language::Ruby, BugType::Linting);
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].name, "rubocop -A");
    }

    #[test]
    fn mypy_is_report_only() {
        let tools = ToolRegistry::tools_for(Language::Python, BugType::TypeError);
        assert_eq!(tools.len(), 1);
        assert!(tools[0].report_only);
    }

    #[test]
    fn llm_only_classes_have_no_tools() {
        for bug_type in [BugType::Syntax, BugType::Import, BugType::Logic] {
            assert!(ToolRegistry::tools_for(Language::Python, bug_type).is_empty());
        }
    }
}
