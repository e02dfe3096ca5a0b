use std::fs;
use std::path::Path;

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::model::{Passage, Question};

#[derive(Debug, Clone, Deserialize)]
struct CorpusRecord {
    id: Option<String>,
    passage: String,
    source_title: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
struct QuestionRecord {
    question: String,
    answer: String,
}

/// Loads the passage corpus, preserving file order. Records without an id
/// get a positional one so bulk ingestion stays deterministic.
pub fn load_corpus(path: &Path) -> Result<Vec<Passage>> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read corpus file: {}", path.display()))?;
    let records: Vec<CorpusRecord> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse corpus file: {}", path.display()))?;

    if records.is_empty() {
        bail!("corpus file is empty: {}", path.display());
    }

    let passages = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| Passage {
            id: record.id.unwrap_or_else(|| index.to_string()),
            text: record.passage,
            source_title: record.source_title,
        })
        .collect();

    Ok(passages)
}

/// Loads the evaluation dataset in file order, truncated to the first
/// `limit` questions when set.
pub fn load_questions(path: &Path, limit: Option<usize>) -> Result<Vec<Question>> {
    let raw = fs::read(path)
        .with_context(|| format!("failed to read questions file: {}", path.display()))?;
    let records: Vec<QuestionRecord> = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse questions file: {}", path.display()))?;

    if records.is_empty() {
        bail!("questions file is empty: {}", path.display());
    }

    let mut questions = records
        .into_iter()
        .enumerate()
        .map(|(index, record)| Question {
            id: format!("q{index}"),
            question_text: record.question,
            ground_truth_answer: record.answer,
        })
        .collect::<Vec<Question>>();

    if let Some(limit) = limit {
        questions.truncate(limit);
    }

    Ok(questions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        let mut file = std::fs::File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes()).expect("write temp file");
        path
    }

    #[test]
    fn corpus_preserves_order_and_assigns_positional_ids() {
        let path = write_temp(
            "ragcheck_corpus_order.json",
            r#"[
                {"passage": "Abraham Lincoln was the 16th president."},
                {"id": "paris", "passage": "Paris is the capital of France.", "source_title": "Paris"},
                {"passage": "Photosynthesis converts light into energy."}
            ]"#,
        );

        let passages = load_corpus(&path).expect("load corpus");
        assert_eq!(passages.len(), 3);
        assert_eq!(passages[0].id, "0");
        assert_eq!(passages[1].id, "paris");
        assert_eq!(passages[1].source_title.as_deref(), Some("Paris"));
        assert_eq!(passages[2].id, "2");
    }

    #[test]
    fn empty_corpus_is_an_error() {
        let path = write_temp("ragcheck_corpus_empty.json", "[]");
        assert!(load_corpus(&path).is_err());
    }

    #[test]
    fn questions_truncate_to_first_n_in_order() {
        let path = write_temp(
            "ragcheck_questions_truncate.json",
            r#"[
                {"question": "Q one?", "answer": "A one"},
                {"question": "Q two?", "answer": "A two"},
                {"question": "Q three?", "answer": "A three"}
            ]"#,
        );

        let questions = load_questions(&path, Some(2)).expect("load questions");
        assert_eq!(questions.len(), 2);
        assert_eq!(questions[0].id, "q0");
        assert_eq!(questions[0].question_text, "Q one?");
        assert_eq!(questions[1].ground_truth_answer, "A two");
    }

    #[test]
    fn questions_limit_beyond_len_keeps_all() {
        let path = write_temp(
            "ragcheck_questions_all.json",
            r#"[{"question": "Q?", "answer": "A"}]"#,
        );

        let questions = load_questions(&path, Some(10)).expect("load questions");
        assert_eq!(questions.len(), 1);
    }
}
