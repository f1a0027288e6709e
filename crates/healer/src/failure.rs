//! Failure model and classifier.
//!
//! Normalizes heterogeneous test-runner output into a uniform [`Failure`]
//! record and assigns one of the closed [`BugType`] classes. Deterministic
//! and pure: the same `(message, language)` pair always yields the same
//! `BugType`.

use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

/// Source language a failure was detected in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    JavaScript,
    TypeScript,
    Ruby,
    /// Anything not covered above; tool-assisted auto-fix never applies.
    Other,
}

impl Language {
    /// Detect a language from a repo-relative file path's extension.
    #[must_use]
    pub fn detect(path: &str) -> Self {
        match path.rsplit('.').next().unwrap_or("") {
            "py" => Self::Python,
            "js" | "jsx" | "mjs" | "cjs" => Self::JavaScript,
            "ts" | "tsx" => Self::TypeScript,
            "rb" => Self::Ruby,
            _ => Self::Other,
        }
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Ruby => "ruby",
            Self::Other => "other",
        }
    }
}

/// A single normalized test-runner failure. Immutable once produced.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Failure {
    /// Repo-relative file path.
    pub file: String,
    /// 1-based line number, if the runner reported one.
    pub line: Option<u32>,
    /// Error-kind string as produced by the tool (e.g. "SyntaxError").
    pub error_kind: String,
    /// Raw message text.
    pub message: String,
    /// Detected language of `file`.
    pub language: Language,
}

impl Failure {
    #[must_use]
    pub fn new(
        file: impl Into<String>,
        line: Option<u32>,
        error_kind: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let file = file.into();
        let language = Language::detect(&file);
        Self {
            file,
            line,
            error_kind: error_kind.into(),
            message: message.into(),
            language,
        }
    }

    /// The `(file, line)` pair the healing loop locks once a fix is
    /// attempted. Failures without a line number lock on line 0 of their
    /// file, which still prevents repeated re-fix of the same unlocated
    /// site.
    #[must_use]
    pub fn site(&self) -> (String, u32) {
        (self.file.clone(), self.line.unwrap_or(0))
    }
}

/// Closed enumeration of bug classes. Declaration order is severity order
/// (lowest variant = fix first): syntax/indentation errors mask everything
/// else, so they must clear before other classes are attempted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BugType {
    Syntax,
    Indentation,
    Import,
    TypeError,
    Logic,
    Linting,
}

impl BugType {
    #[must_use]
    pub fn all() -> [Self; 6] {
        [
            Self::Syntax,
            Self::Indentation,
            Self::Import,
            Self::TypeError,
            Self::Logic,
            Self::Linting,
        ]
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Syntax => "SYNTAX",
            Self::Indentation => "INDENTATION",
            Self::Import => "IMPORT",
            Self::TypeError => "TYPE_ERROR",
            Self::Logic => "LOGIC",
            Self::Linting => "LINTING",
        }
    }
}

static SYNTAX_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)SyntaxError").unwrap(),
        Regex::new(r"(?i)Unexpected token").unwrap(),
        Regex::new(r"missing\s*;").unwrap(),
        Regex::new(r"(?i)ParseError").unwrap(),
    ]
});

static INDENTATION_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)IndentationError").unwrap(),
        Regex::new(r"(?i)expected an indented block").unwrap(),
        Regex::new(r"(?i)unindent does not match").unwrap(),
        Regex::new(r"\bindent\b").unwrap(), // eslint "indent" rule
    ]
});

static IMPORT_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)ModuleNotFoundError").unwrap(),
        Regex::new(r"(?i)Cannot find module").unwrap(),
        Regex::new(r"(?i)ImportError").unwrap(),
        Regex::new(r"(?i)no module named").unwrap(),
    ]
});

static TYPE_ERROR_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"(?i)\bTypeError\b").unwrap(),
        Regex::new(r"TS2322|TS2345").unwrap(),
        Regex::new(r"(?i)incompatible types?").unwrap(),
        Regex::new(r"error:\s*\[mypy\]|\[mypy\]").unwrap(),
    ]
});

static LINTING_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    vec![
        Regex::new(r"^[EWF]\d{3}\b").unwrap(), // flake8 codes
        Regex::new(r"(?i)eslint").unwrap(),
        Regex::new(r"(?i)rubocop").unwrap(),
        Regex::new(r"(?i)style/").unwrap(), // rubocop cop namespace
    ]
});

/// Deterministic, pure classification from a raw failure's error kind and
/// message. Rules are applied in order; first match wins.
#[must_use]
pub fn classify(failure: &Failure) -> BugType {
    let haystack = format!("{} {}", failure.error_kind, failure.message);

    if SYNTAX_PATTERNS.iter().any(|p| p.is_match(&haystack)) {
        return BugType::Syntax;
    }
    if INDENTATION_PATTERNS.iter().any(|p| p.is_match(&haystack)) {
        return BugType::Indentation;
    }
    if IMPORT_PATTERNS.iter().any(|p| p.is_match(&haystack)) {
        return BugType::Import;
    }
    if TYPE_ERROR_PATTERNS.iter().any(|p| p.is_match(&haystack)) {
        return BugType::TypeError;
    }
    if LINTING_PATTERNS.iter().any(|p| p.is_match(&haystack)) {
        return BugType::Linting;
    }
    BugType::Logic
}

#[cfg(test)]
mod tests {
    use super::*;

    fn failure(kind: &str, message: &str) -> Failure {
        Failure::new("app.py", Some(10), kind, message)
    }

    #[test]
    fn classifies_syntax_first() {
        let f = failure("SyntaxError", "invalid syntax and also IndentationError");
        assert_eq!(classify(&f), BugType::Syntax);
    }

    #[test]
    fn classifies_indentation() {
        let f = failure("IndentationError", "expected an indented block");
        assert_eq!(classify(&f), BugType::Indentation);
    }

    #[test]
    fn classifies_import() {
        let f = failure("ModuleNotFoundError", "No module named 'foo'");
        assert_eq!(classify(&f), BugType::Import);
    }

    #[test]
    fn classifies_type_error() {
        let f = failure("TypeError", "unsupported operand type(s)");
        assert_eq!(classify(&f), BugType::TypeError);
    }

    #[test]
    fn classifies_ts_type_error() {
        let f = failure("", "TS2322: Type 'string' is not assignable to type 'number'");
        assert_eq!(classify(&f), BugType::TypeError);
    }

    #[test]
    fn classifies_linting() {
        let f = failure("W291", "trailing whitespace");
        assert_eq!(classify(&f), BugType::Linting);
    }

    #[test]
    fn classifies_assertion_as_logic() {
        let f = failure("AssertionError", "assert 1 == 2");
        assert_eq!(classify(&f), BugType::Logic);
    }

    #[test]
    fn severity_order_matches_listing() {
        let order = BugType::all();
        assert_eq!(
            order,
            [
                BugType::Syntax,
                BugType::Indentation,
                BugType::Import,
                BugType::TypeError,
                BugType::Logic,
                BugType::Linting,
            ]
        );
        assert!(BugType::Syntax < BugType::Logic);
    }

    #[test]
    fn deterministic_for_same_input() {
        let f1 = failure("SyntaxError", "invalid syntax");
        let f2 = failure("SyntaxError", "invalid syntax");
        assert_eq!(classify(&f1), classify(&f2));
    }

    #[test]
    fn language_detection() {
        assert_eq!(Language::detect("foo/bar.py"), Language::Python);
        assert_eq!(Language::detect("foo/bar.ts"), Language::TypeScript);
        assert_eq!(Language::detect("foo/bar.rb"), Language::Ruby);
        assert_eq!(Language::detect("foo/bar.rs"), Language::Other);
    }
}
