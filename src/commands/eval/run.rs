use std::io::{self, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::EvalArgs;
use crate::dataset::load_questions;
use crate::llm::LlmClient;
use crate::model::{
    AnswerRecord, EvalRunManifest, GradingResult, Mode, Question, SetupManifest,
};
use crate::search::SearchClient;
use crate::util::{
    RetryPolicy, ensure_directory, now_utc_string, sha256_file, utc_compact_string,
    write_json_pretty,
};

use crate::commands::load_setup_manifest;

use super::{grading, prompts, report};

const PROGRESS_EVERY_QUESTIONS: usize = 10;

/// Run-level cancellation: once set, no new service request is issued; the
/// question in flight finishes or fails and nothing partial is recorded for
/// the rest.
#[derive(Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Everything one question produced: both answer records, the verdicts that
/// parsed, and the modes left ungraded.
struct QuestionOutcome {
    answers: Vec<AnswerRecord>,
    gradings: Vec<GradingResult>,
    ungraded: Vec<(String, Mode)>,
}

/// Sole mutation point for the run's accumulating state. Questions append
/// atomically (a whole outcome or a whole failure), which keeps the
/// accounting invariants intact if the loop is ever parallelized over
/// disjoint questions.
struct EvalContext {
    attempted: usize,
    answers: Vec<AnswerRecord>,
    gradings: Vec<GradingResult>,
    ungraded: Vec<(String, Mode)>,
    failed: Vec<String>,
    warnings: Vec<String>,
    cancel: CancelFlag,
    cancelled: bool,
}

impl EvalContext {
    fn new(cancel: CancelFlag) -> Self {
        Self {
            attempted: 0,
            answers: Vec::new(),
            gradings: Vec::new(),
            ungraded: Vec::new(),
            failed: Vec::new(),
            warnings: Vec::new(),
            cancel,
            cancelled: false,
        }
    }

    fn record_outcome(&mut self, outcome: QuestionOutcome) {
        self.attempted += 1;
        self.answers.extend(outcome.answers);
        self.gradings.extend(outcome.gradings);
        self.ungraded.extend(outcome.ungraded);
    }

    fn record_failure(&mut self, question_id: &str, error: &anyhow::Error) {
        self.attempted += 1;
        self.failed.push(question_id.to_string());
        self.warnings
            .push(format!("question {question_id} failed: {error:#}"));
    }

    fn ungraded_count(&self, mode: Mode) -> usize {
        self.ungraded.iter().filter(|(_, m)| *m == mode).count()
    }
}

pub fn run(args: EvalArgs) -> Result<()> {
    let started = Instant::now();
    let started_at = now_utc_string();
    let run_id = format!("eval-{}", utc_compact_string(Utc::now()));

    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let setup = load_setup_manifest(&args.cache_root)?;
    let questions = load_questions(&args.questions, args.num_questions)?;
    let questions_sha256 = sha256_file(&args.questions)?;

    info!(
        question_count = questions.len(),
        index_name = %setup.index_name,
        model_id = %setup.embedding_model_id,
        llm_model = %args.llm_model,
        top_k = args.k,
        fail_fast = args.fail_fast,
        "evaluation run starting"
    );

    let retry = RetryPolicy::new(args.retry_attempts, args.retry_backoff_ms);
    let search = SearchClient::new(&args.search_url, args.request_timeout_secs, retry)?;
    let llm = LlmClient::new(&args.llm_url, &args.llm_model, args.request_timeout_secs, retry)?;

    let cancel = CancelFlag::default();
    let mut context = EvalContext::new(cancel);
    let total = questions.len();

    for (index, question) in questions.iter().enumerate() {
        if context.cancel.is_cancelled() {
            context.cancelled = true;
            warn!(
                processed = context.attempted,
                total, "run cancelled, skipping remaining questions"
            );
            break;
        }

        if index % PROGRESS_EVERY_QUESTIONS == 0 || index + 1 == total {
            info!(question = index + 1, total, "processing questions");
        }

        match run_question(&search, &llm, &setup, &args, question) {
            Ok(outcome) => context.record_outcome(outcome),
            Err(err) => {
                if args.fail_fast {
                    return Err(
                        err.context(format!("question {} failed irrecoverably", question.id))
                    );
                }
                warn!(question_id = %question.id, error = %err, "question failed, excluding from both modes");
                context.record_failure(&question.id, &err);
            }
        }
    }

    let baseline = report::summarize_mode(
        Mode::Baseline,
        &context.gradings,
        context.ungraded_count(Mode::Baseline),
    );
    let rag = report::summarize_mode(
        Mode::Rag,
        &context.gradings,
        context.ungraded_count(Mode::Rag),
    );
    let comparison = report::compare_modes(&baseline, &rag);

    let status = if context.warnings.is_empty() {
        "completed"
    } else {
        "completed-with-warnings"
    };

    let manifest = EvalRunManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        questions_path: args.questions.display().to_string(),
        questions_sha256,
        search_url: args.search_url.clone(),
        llm_url: args.llm_url.clone(),
        llm_model: args.llm_model.clone(),
        index_name: setup.index_name.clone(),
        embedding_model_id: setup.embedding_model_id.clone(),
        top_k: args.k,
        fail_fast: args.fail_fast,
        attempted: context.attempted,
        failed: context.failed.len(),
        cancelled: context.cancelled,
        baseline,
        rag,
        comparison,
        answers: context.answers,
        gradings: context.gradings,
        duration_ms: started.elapsed().as_millis(),
        status: status.to_string(),
        warnings: context.warnings,
    };

    let manifest_path = manifest_dir.join(format!(
        "eval_run_{}.json",
        utc_compact_string(Utc::now())
    ));
    write_json_pretty(&manifest_path, &manifest)?;

    let mut output = io::BufWriter::new(io::stdout().lock());
    report::render_text_report(&manifest, &mut output)?;
    output.flush()?;

    info!(
        path = %manifest_path.display(),
        attempted = manifest.attempted,
        failed = manifest.failed,
        "evaluation run completed"
    );

    Ok(())
}

/// One question through the full pipeline: retrieve, generate in both modes,
/// grade both answers. An error here means the question is irrecoverable
/// (both modes excluded); a judge that answers but cannot be parsed only
/// marks that mode ungraded.
fn run_question(
    search: &SearchClient,
    llm: &LlmClient,
    setup: &SetupManifest,
    args: &EvalArgs,
    question: &Question,
) -> Result<QuestionOutcome> {
    let retrieval = search.semantic_query(
        &setup.index_name,
        &setup.embedding_model_id,
        &question.question_text,
        args.k,
    )?;
    if retrieval.is_empty() {
        info!(question_id = %question.id, "no passages retrieved, rag prompt falls back to baseline");
    }

    let baseline_prompt = prompts::build_baseline_prompt(question);
    let baseline_text = llm
        .complete(&baseline_prompt)
        .with_context(|| format!("baseline generation for question {}", question.id))?;

    let rag_prompt = prompts::build_rag_prompt(question, &retrieval);
    let rag_text = llm
        .complete(&rag_prompt)
        .with_context(|| format!("rag generation for question {}", question.id))?;

    let mut outcome = QuestionOutcome {
        answers: vec![
            AnswerRecord {
                question_id: question.id.clone(),
                mode: Mode::Baseline,
                generated_text: baseline_text.clone(),
            },
            AnswerRecord {
                question_id: question.id.clone(),
                mode: Mode::Rag,
                generated_text: rag_text.clone(),
            },
        ],
        gradings: Vec::new(),
        ungraded: Vec::new(),
    };

    for (mode, generated) in [(Mode::Baseline, &baseline_text), (Mode::Rag, &rag_text)] {
        let comparison_prompt =
            grading::build_comparison_prompt(generated, &question.ground_truth_answer);

        match llm.complete(&comparison_prompt) {
            Ok(response) => match grading::parse_verdict(&response) {
                Some(verdict) => outcome.gradings.push(GradingResult {
                    question_id: question.id.clone(),
                    mode,
                    verdict,
                }),
                None => {
                    warn!(
                        question_id = %question.id,
                        mode = mode.as_str(),
                        "judge response lacked an unambiguous verdict token"
                    );
                    outcome.ungraded.push((question.id.clone(), mode));
                }
            },
            Err(err) => {
                warn!(
                    question_id = %question.id,
                    mode = mode.as_str(),
                    error = %err,
                    "judge call failed, marking pair ungraded"
                );
                outcome.ungraded.push((question.id.clone(), mode));
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Verdict;

    fn outcome_for(question_id: &str, verdicts: &[(Mode, Option<Verdict>)]) -> QuestionOutcome {
        let answers = [Mode::Baseline, Mode::Rag]
            .into_iter()
            .map(|mode| AnswerRecord {
                question_id: question_id.to_string(),
                mode,
                generated_text: "answer".to_string(),
            })
            .collect();

        let mut gradings = Vec::new();
        let mut ungraded = Vec::new();
        for (mode, verdict) in verdicts {
            match verdict {
                Some(verdict) => gradings.push(GradingResult {
                    question_id: question_id.to_string(),
                    mode: *mode,
                    verdict: *verdict,
                }),
                None => ungraded.push((question_id.to_string(), *mode)),
            }
        }

        QuestionOutcome {
            answers,
            gradings,
            ungraded,
        }
    }

    #[test]
    fn per_mode_totals_account_for_failed_and_ungraded() {
        let mut context = EvalContext::new(CancelFlag::default());

        context.record_outcome(outcome_for(
            "q0",
            &[
                (Mode::Baseline, Some(Verdict::Correct)),
                (Mode::Rag, Some(Verdict::Correct)),
            ],
        ));
        context.record_outcome(outcome_for(
            "q1",
            &[
                (Mode::Baseline, Some(Verdict::Incorrect)),
                (Mode::Rag, None),
            ],
        ));
        context.record_failure("q2", &anyhow::anyhow!("llm unreachable"));

        assert_eq!(context.attempted, 3);
        assert_eq!(context.failed.len(), 1);

        for mode in [Mode::Baseline, Mode::Rag] {
            let summary =
                report::summarize_mode(mode, &context.gradings, context.ungraded_count(mode));
            assert_eq!(
                summary.total + summary.ungraded + context.failed.len(),
                context.attempted
            );
        }
    }

    #[test]
    fn failed_question_is_excluded_from_both_modes_and_counted_once() {
        let mut context = EvalContext::new(CancelFlag::default());

        for index in 0..3 {
            context.record_outcome(outcome_for(
                &format!("q{index}"),
                &[
                    (Mode::Baseline, Some(Verdict::Correct)),
                    (Mode::Rag, Some(Verdict::Correct)),
                ],
            ));
        }
        context.record_failure("q3", &anyhow::anyhow!("exhausted retries"));

        let baseline = report::summarize_mode(
            Mode::Baseline,
            &context.gradings,
            context.ungraded_count(Mode::Baseline),
        );
        let rag = report::summarize_mode(
            Mode::Rag,
            &context.gradings,
            context.ungraded_count(Mode::Rag),
        );

        assert_eq!(baseline.total, 3);
        assert_eq!(rag.total, 3);
        assert_eq!(context.failed.len(), 1);
        assert!((baseline.accuracy_pct - 100.0).abs() < 1e-9);
        assert!((rag.accuracy_pct - 100.0).abs() < 1e-9);
    }

    #[test]
    fn cancel_flag_is_shared_across_clones() {
        let flag = CancelFlag::default();
        let observer = flag.clone();

        assert!(!observer.is_cancelled());
        flag.cancel();
        assert!(observer.is_cancelled());
    }

    #[test]
    fn each_answered_question_yields_two_answer_records() {
        let mut context = EvalContext::new(CancelFlag::default());
        context.record_outcome(outcome_for(
            "q0",
            &[
                (Mode::Baseline, Some(Verdict::Correct)),
                (Mode::Rag, Some(Verdict::Incorrect)),
            ],
        ));

        assert_eq!(context.answers.len(), 2);
        assert!(context.answers.iter().any(|a| a.mode == Mode::Baseline));
        assert!(context.answers.iter().any(|a| a.mode == Mode::Rag));
    }
}
