//! Property tests for the core's testable invariants that benefit from
//! randomized input rather than a handful of fixed examples: branch-name
//! grammar and idempotence, classifier determinism, and the score
//! formula's monotonicity ("speed_bonus"/"efficiency_penalty" shape).

use proptest::prelude::*;

use healer::failure::{classify, BugType, Failure, Language};
use healer::report::Score;
use healer::vcs::branch_name;

fn arb_identifier_fragment() -> impl Strategy<Value = String> {
    // Mix of alphanumerics and separator-ish characters a team/leader name
    // could plausibly contain; deliberately includes runs of separators to
    // exercise the collapsing rule.
    "[A-Za-z0-9 _\\-\\.]{0,24}"
}

proptest! {
    #[test]
    fn branch_name_always_matches_grammar(team in arb_identifier_fragment(), leader in arb_identifier_fragment()) {
        let name = branch_name(&team, &leader);
        prop_assert!(name.ends_with("_AI_Fix"));
        let head = &name[..name.len() - "_AI_Fix".len()];
        prop_assert!(head.chars().all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_'));
        prop_assert!(!head.contains("__"));
    }

    #[test]
    fn branch_name_is_idempotent_for_any_input(team in arb_identifier_fragment(), leader in arb_identifier_fragment()) {
        prop_assert_eq!(branch_name(&team, &leader), branch_name(&team, &leader));
    }

    #[test]
    fn branch_name_is_insensitive_to_input_case(team in "[a-zA-Z]{1,12}", leader in "[a-zA-Z]{1,12}") {
        prop_assert_eq!(branch_name(&team, &leader), branch_name(&team.to_uppercase(), &leader.to_uppercase()));
    }

    /// Classifier determinism: same (error_kind,
    /// message, file-implied-language) always yields the same `BugType`.
    #[test]
    fn classify_is_deterministic(
        error_kind in "[A-Za-z]{0,20}",
        message in "[A-Za-z0-9 :._-]{0,60}",
        ext in prop::sample::select(vec!["py", "js", "ts", "rb", "txt"]),
    ) {
        let file = format!("sample.{ext}");
        let f1 = Failure::new(file.clone(), Some(1), error_kind.clone(), message.clone());
        let f2 = Failure::new(file, Some(1), error_kind, message);
        prop_assert_eq!(classify(&f1), classify(&f2));
    }

    /// Every failure classifies to exactly one of the six closed variants;
    /// `classify` never panics regardless of input shape.
    #[test]
    fn classify_always_yields_a_known_variant(error_kind in ".{0,40}", message in ".{0,80}") {
        let f = Failure::new("f.py", None, error_kind, message);
        let bug_type = classify(&f);
        prop_assert!(BugType::all().contains(&bug_type));
    }

    /// Score total is always `base + speed_bonus - efficiency_penalty`, the
    /// speed bonus is binary, and the efficiency penalty never goes
    /// negative regardless of how few commits were made.
    #[test]
    fn score_formula_holds_for_any_input(wall_clock in 0.0f64..10_000.0, commits in 0u32..500) {
        let score = Score::compute(wall_clock, commits);
        prop_assert_eq!(score.total, score.base + score.speed_bonus - score.efficiency_penalty);
        prop_assert!(score.speed_bonus == 0 || score.speed_bonus == 10);
        prop_assert!(score.efficiency_penalty >= 0);
        if commits <= 20 {
            prop_assert_eq!(score.efficiency_penalty, 0);
        }
    }

    #[test]
    fn language_detection_never_panics(path in ".{0,40}") {
        let _ = Language::detect(&path);
    }
}
