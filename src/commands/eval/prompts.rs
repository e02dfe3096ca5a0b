use crate::model::{Question, RetrievalResult};

/// Retrieved passages longer than this are clipped before entering the
/// context block, keeping the augmented prompt bounded.
pub const MAX_CONTEXT_CHARS: usize = 300;

const ANSWER_STYLE: &str =
    "Answer in a single word or a short sentence. Do not ask follow-up questions or make suggestions.";

/// Unaugmented prompt: the question plus the concise-answer instruction.
/// Pure and byte-deterministic.
pub fn build_baseline_prompt(question: &Question) -> String {
    format!("{}\n\n{ANSWER_STYLE}", question.question_text)
}

/// Context-augmented prompt: question, enumerated context block in rank
/// order, then the grounding instructions. With no retrieved passages the
/// prompt degrades to the baseline template.
pub fn build_rag_prompt(question: &Question, retrieval: &RetrievalResult) -> String {
    if retrieval.is_empty() {
        return build_baseline_prompt(question);
    }

    let context_block = retrieval
        .hits
        .iter()
        .enumerate()
        .map(|(rank, hit)| format!("Context {}: {}", rank + 1, clip_context(&hit.passage.text)))
        .collect::<Vec<String>>()
        .join("\n\n");

    format!(
        "QUESTION:\n{}\n\nCONTEXT:\n{}\n\nUsing the CONTEXT provided, answer the QUESTION. Keep your answer grounded in the facts of the CONTEXT. If the CONTEXT doesn't contain the answer to the QUESTION, say you don't know.\n{ANSWER_STYLE}",
        question.question_text, context_block
    )
}

fn clip_context(text: &str) -> String {
    if text.chars().count() <= MAX_CONTEXT_CHARS {
        return text.to_string();
    }

    let clipped = text.chars().take(MAX_CONTEXT_CHARS).collect::<String>();
    format!("{clipped}...")
}
