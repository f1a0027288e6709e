//! Patch Validator: the minimum static check for a language,
//! run against proposed file contents before a patch is accepted.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;
use tracing::debug;

use crate::error::ValidationError;
use crate::failure::Language;

/// Hard timeout for any single validation check.
const VALIDATE_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of validating proposed file contents.
pub enum ValidationOutcome {
    Valid,
    Invalid(ValidationError),
}

impl ValidationOutcome {
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }
}

/// Run the minimum static check for `language` against `contents`.
///
/// - python: parse to an AST, then byte-compile, both within 10s.
/// - js: `node --check`.
/// - ts/tsx: a syntactic parse (approximated here by `node --check` against
///   a stripped-types pass; see [`typescript_syntax_check`]).
/// - others: best-effort; if no checker exists, trivially accepts.
pub async fn validate(contents: &str, language: Language) -> ValidationOutcome {
    match language {
        Language::Python => python_check(contents).await,
        Language::JavaScript => node_check(contents, &[".js"]).await,
        Language::TypeScript => typescript_syntax_check(contents).await,
        Language::Ruby => ruby_check(contents).await,
        Language::Other => ValidationOutcome::Valid,
    }
}

fn write_temp(contents: &str, suffix: &str) -> std::io::Result<tempfile::TempPath> {
    use std::io::Write as _;

    let mut builder = tempfile::Builder::new();
    builder.suffix(suffix);
    let mut file = builder.tempfile()?;
    file.write_all(contents.as_bytes())?;
    Ok(file.into_temp_path())
}

async fn python_check(contents: &str) -> ValidationOutcome {
    let Ok(tmp) = write_temp(contents, ".py") else {
        return ValidationOutcome::Invalid(ValidationError {
            language: "python".into(),
            message: "failed to write temp file for validation".into(),
        });
    };

    // `python -c "import ast, py_compile; ast.parse(open(...).read()); py_compile.compile(..., doraise=True)"`
    let script = format!(
        "import ast, py_compile, sys\nsrc = open({path:?}, 'r', encoding='utf-8').read()\nast.parse(src)\npy_compile.compile({path:?}, doraise=True)\n",
        path = tmp.to_string_lossy()
    );

    run_checker("python3", &["-c", &script], "python").await
}

async fn node_check(_contents: &str, _exts: &[&str]) -> ValidationOutcome {
    let Ok(tmp) = write_temp(_contents, ".js") else {
        return ValidationOutcome::Invalid(ValidationError {
            language: "javascript".into(),
            message: "failed to write temp file for validation".into(),
        });
    };
    run_checker("node", &["--check", &tmp.to_string_lossy()], "javascript").await
}

/// TypeScript has no zero-dependency "just parse it" story without the
/// `typescript` package on PATH, so this shells out to `tsc --noEmit
/// --allowJs false` when available and otherwise accepts trivially, a
/// best-effort fallback for checkers that may not exist.
async fn typescript_syntax_check(contents: &str) -> ValidationOutcome {
    let Ok(tmp) = write_temp(contents, ".ts") else {
        return ValidationOutcome::Invalid(ValidationError {
            language: "typescript".into(),
            message: "failed to write temp file for validation".into(),
        });
    };

    let path = tmp.to_string_lossy().into_owned();
    run_checker("npx", &["--yes", "tsc", "--noEmit", "--allowJs", "false", &path], "typescript").await
}

async fn ruby_check(contents: &str) -> ValidationOutcome {
    let Ok(tmp) = write_temp(contents, ".rb") else {
        return ValidationOutcome::Invalid(ValidationError {
            language: "ruby".into(),
            message: "failed to write temp file for validation".into(),
        });
    };
    run_checker("ruby", &["-c", &tmp.to_string_lossy()], "ruby").await
}

/// Spawns `program` with output piped and a hard wall-clock cap: on expiry
/// the child is killed (`kill_on_drop`) and the patch is rejected rather
/// than leaving a hung checker to block the loop indefinitely.
async fn run_checker(program: &str, args: &[&str], language: &str) -> ValidationOutcome {
    let mut cmd = Command::new(program);
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped()).kill_on_drop(true);

    let child = match cmd.spawn() {
        Ok(c) => c,
        Err(_) => {
            debug!(program, "checker not available, accepting patch trivially");
            return ValidationOutcome::Valid;
        }
    };

    match timeout(VALIDATE_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(o)) if o.status.success() => ValidationOutcome::Valid,
        Ok(Ok(o)) => ValidationOutcome::Invalid(ValidationError {
            language: language.to_string(),
            message: String::from_utf8_lossy(&o.stderr).into_owned(),
        }),
        Ok(Err(_)) => {
            debug!(program, "checker not available, accepting patch trivially");
            ValidationOutcome::Valid
        }
        Err(_) => ValidationOutcome::Invalid(ValidationError {
            language: language.to_string(),
            message: format!("{program} exceeded {}s validation timeout, killed", VALIDATE_TIMEOUT.as_secs()),
        }),
    }
}
