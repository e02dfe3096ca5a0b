use crate::model::Verdict;

/// Comparison prompt asking the model to emit exactly one of the two
/// verdict tokens. Pure and byte-deterministic.
pub fn build_comparison_prompt(generated: &str, ground_truth: &str) -> String {
    format!(
        "Compare these two answers for semantic equivalence:\n\nAnswer 1: {generated}\nAnswer 2: {ground_truth}\n\nAre these answers semantically equivalent? Answer only \"CORRECT\" if they are equivalent or \"INCORRECT\" if they are not. Do not elaborate."
    )
}

/// Extracts the verdict from the judge's raw response. INCORRECT is checked
/// first since CORRECT is a substring of it. A response without an
/// unambiguous token yields None and is counted as ungraded by the caller,
/// never mapped to a default verdict.
pub fn parse_verdict(response: &str) -> Option<Verdict> {
    let normalized = response.trim().to_uppercase();

    if normalized.contains("INCORRECT") {
        Some(Verdict::Incorrect)
    } else if normalized.contains("CORRECT") {
        Some(Verdict::Correct)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn comparison_prompt_is_byte_deterministic() {
        let first = build_comparison_prompt("Paris", "Paris, France");
        let second = build_comparison_prompt("Paris", "Paris, France");
        assert_eq!(first, second);
        assert!(first.contains("Answer 1: Paris\nAnswer 2: Paris, France"));
    }

    #[test]
    fn bare_correct_token_parses() {
        assert_eq!(parse_verdict("CORRECT"), Some(Verdict::Correct));
        assert_eq!(parse_verdict("  correct \n"), Some(Verdict::Correct));
        assert_eq!(parse_verdict("Correct."), Some(Verdict::Correct));
    }

    #[test]
    fn incorrect_token_wins_over_embedded_correct() {
        assert_eq!(parse_verdict("INCORRECT"), Some(Verdict::Incorrect));
        assert_eq!(parse_verdict("incorrect"), Some(Verdict::Incorrect));
        assert_eq!(
            parse_verdict("The answers are INCORRECT."),
            Some(Verdict::Incorrect)
        );
    }

    #[test]
    fn verdict_inside_a_sentence_still_parses() {
        assert_eq!(
            parse_verdict("These answers are CORRECT, both name Paris."),
            Some(Verdict::Correct)
        );
    }

    #[test]
    fn ambiguous_responses_yield_no_verdict() {
        assert_eq!(parse_verdict(""), None);
        assert_eq!(parse_verdict("I am not sure about these answers."), None);
        assert_eq!(parse_verdict("Yes, they match."), None);
    }
}
