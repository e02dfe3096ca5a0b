use std::io::Write;

use anyhow::Result;

use crate::model::{
    AccuracySummary, EvalRunManifest, GradingResult, Mode, ModeComparison, Verdict,
};

/// Tallies one mode's verdicts. `total` counts graded pairs only; failed and
/// ungraded questions never enter the accuracy denominator.
pub fn summarize_mode(mode: Mode, gradings: &[GradingResult], ungraded: usize) -> AccuracySummary {
    let correct = gradings
        .iter()
        .filter(|grading| grading.mode == mode && grading.verdict == Verdict::Correct)
        .count();
    let incorrect = gradings
        .iter()
        .filter(|grading| grading.mode == mode && grading.verdict == Verdict::Incorrect)
        .count();
    let total = correct + incorrect;

    let accuracy_pct = if total == 0 {
        0.0
    } else {
        100.0 * correct as f64 / total as f64
    };

    AccuracySummary {
        mode,
        total,
        correct,
        incorrect,
        ungraded,
        accuracy_pct,
    }
}

/// Cross-mode deltas. The relative delta is undefined when baseline accuracy
/// is zero and reported as n/a.
pub fn compare_modes(baseline: &AccuracySummary, rag: &AccuracySummary) -> ModeComparison {
    let absolute_delta_pp = rag.accuracy_pct - baseline.accuracy_pct;
    let relative_delta_pct = if baseline.accuracy_pct == 0.0 {
        None
    } else {
        Some(100.0 * absolute_delta_pp / baseline.accuracy_pct)
    };

    ModeComparison {
        absolute_delta_pp,
        relative_delta_pct,
    }
}

/// Human-readable comparative block. Accuracy figures are always printed
/// next to their denominator provenance (failed and ungraded counts).
pub fn render_text_report(manifest: &EvalRunManifest, out: &mut impl Write) -> Result<()> {
    writeln!(out, "Comparative evaluation results")?;
    writeln!(
        out,
        "Questions: attempted={} failed={} cancelled={}",
        manifest.attempted, manifest.failed, manifest.cancelled
    )?;

    for summary in [&manifest.baseline, &manifest.rag] {
        writeln!(
            out,
            "{:<9} total={} correct={} incorrect={} ungraded={} accuracy={:.1}%",
            format!("{}:", summary.mode.as_str()),
            summary.total,
            summary.correct,
            summary.incorrect,
            summary.ungraded,
            summary.accuracy_pct
        )?;
    }

    let relative = match manifest.comparison.relative_delta_pct {
        Some(value) => format!("{value:+.1}%"),
        None => "n/a".to_string(),
    };

    if manifest.comparison.absolute_delta_pp > 0.0 {
        writeln!(
            out,
            "RAG improved accuracy by {:.1} percentage points (relative {relative})",
            manifest.comparison.absolute_delta_pp
        )?;
    } else if manifest.comparison.absolute_delta_pp < 0.0 {
        writeln!(
            out,
            "RAG decreased accuracy by {:.1} percentage points (relative {relative})",
            manifest.comparison.absolute_delta_pp.abs()
        )?;
    } else {
        writeln!(out, "RAG and baseline accuracy are equal")?;
    }

    if !manifest.warnings.is_empty() {
        writeln!(out, "Warnings: {}", manifest.warnings.len())?;
        for warning in &manifest.warnings {
            writeln!(out, "\t{warning}")?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grading(question_id: &str, mode: Mode, verdict: Verdict) -> GradingResult {
        GradingResult {
            question_id: question_id.to_string(),
            mode,
            verdict,
        }
    }

    fn scenario_gradings(baseline_correct: usize, rag_correct: usize, total: usize) -> Vec<GradingResult> {
        let mut gradings = Vec::new();
        for index in 0..total {
            let id = format!("q{index}");
            gradings.push(grading(
                &id,
                Mode::Baseline,
                if index < baseline_correct {
                    Verdict::Correct
                } else {
                    Verdict::Incorrect
                },
            ));
            gradings.push(grading(
                &id,
                Mode::Rag,
                if index < rag_correct {
                    Verdict::Correct
                } else {
                    Verdict::Incorrect
                },
            ));
        }
        gradings
    }

    #[test]
    fn six_of_ten_versus_eight_of_ten_scenario() {
        let gradings = scenario_gradings(6, 8, 10);

        let baseline = summarize_mode(Mode::Baseline, &gradings, 0);
        let rag = summarize_mode(Mode::Rag, &gradings, 0);

        assert_eq!(baseline.total, 10);
        assert_eq!(baseline.correct, 6);
        assert_eq!(baseline.incorrect, 4);
        assert!((baseline.accuracy_pct - 60.0).abs() < 1e-9);
        assert!((rag.accuracy_pct - 80.0).abs() < 1e-9);

        let comparison = compare_modes(&baseline, &rag);
        assert!((comparison.absolute_delta_pp - 20.0).abs() < 1e-9);
        let relative = comparison.relative_delta_pct.expect("baseline is nonzero");
        assert!((relative - 100.0 * 20.0 / 60.0).abs() < 1e-9);
        assert!((relative - 33.333).abs() < 0.01);
    }

    #[test]
    fn summary_invariant_correct_plus_incorrect_equals_total() {
        let gradings = scenario_gradings(3, 5, 7);
        for mode in [Mode::Baseline, Mode::Rag] {
            let summary = summarize_mode(mode, &gradings, 0);
            assert_eq!(summary.correct + summary.incorrect, summary.total);
        }
    }

    #[test]
    fn zero_baseline_accuracy_makes_relative_delta_undefined() {
        let gradings = scenario_gradings(0, 2, 4);

        let baseline = summarize_mode(Mode::Baseline, &gradings, 0);
        let rag = summarize_mode(Mode::Rag, &gradings, 0);
        let comparison = compare_modes(&baseline, &rag);

        assert!((comparison.absolute_delta_pp - 50.0).abs() < 1e-9);
        assert_eq!(comparison.relative_delta_pct, None);
    }

    #[test]
    fn empty_mode_reports_zero_accuracy_without_dividing() {
        let summary = summarize_mode(Mode::Baseline, &[], 0);
        assert_eq!(summary.total, 0);
        assert_eq!(summary.accuracy_pct, 0.0);
    }

    #[test]
    fn ungraded_pairs_are_reported_but_excluded_from_total() {
        let gradings = vec![grading("q0", Mode::Rag, Verdict::Correct)];
        let summary = summarize_mode(Mode::Rag, &gradings, 2);

        assert_eq!(summary.total, 1);
        assert_eq!(summary.ungraded, 2);
        assert!((summary.accuracy_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn text_report_carries_denominator_provenance() {
        let gradings = scenario_gradings(6, 8, 10);
        let baseline = summarize_mode(Mode::Baseline, &gradings, 0);
        let rag = summarize_mode(Mode::Rag, &gradings, 0);
        let comparison = compare_modes(&baseline, &rag);

        let manifest = EvalRunManifest {
            manifest_version: 1,
            run_id: "eval-test".to_string(),
            generated_at: "2026-01-01T00:00:00Z".to_string(),
            questions_path: "questions.json".to_string(),
            questions_sha256: "0".repeat(64),
            search_url: "http://localhost:9200".to_string(),
            llm_url: "http://localhost:11434".to_string(),
            llm_model: "gemma3".to_string(),
            index_name: "rag-passages".to_string(),
            embedding_model_id: "m-1".to_string(),
            top_k: 10,
            fail_fast: false,
            attempted: 10,
            failed: 0,
            cancelled: false,
            baseline,
            rag,
            comparison,
            answers: Vec::new(),
            gradings,
            duration_ms: 1234,
            status: "completed".to_string(),
            warnings: Vec::new(),
        };

        let mut rendered = Vec::<u8>::new();
        render_text_report(&manifest, &mut rendered).expect("render report");
        let text = String::from_utf8(rendered).expect("utf8 report");

        assert!(text.contains("attempted=10 failed=0"));
        assert!(text.contains("accuracy=60.0%"));
        assert!(text.contains("accuracy=80.0%"));
        assert!(text.contains("RAG improved accuracy by 20.0 percentage points"));
        assert!(text.contains("relative +33.3%"));
    }
}
