use serde::{Deserialize, Serialize};

/// A single indexed unit of source text. Immutable once ingested; the
/// embedding vector is attached server-side by the ingest pipeline and never
/// travels through this struct.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Passage {
    pub id: String,
    pub text: String,
    pub source_title: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Question {
    pub id: String,
    pub question_text: String,
    pub ground_truth_answer: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Baseline,
    Rag,
}

impl Mode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Baseline => "baseline",
            Self::Rag => "rag",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrievedPassage {
    pub passage: Passage,
    pub score: f64,
}

/// Ranked retrieval output for one question: at most k passages, descending
/// score, ties left in backend hit order.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrievalResult {
    pub hits: Vec<RetrievedPassage>,
}

impl RetrievalResult {
    pub fn is_empty(&self) -> bool {
        self.hits.is_empty()
    }

    pub fn len(&self) -> usize {
        self.hits.len()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnswerRecord {
    pub question_id: String,
    pub mode: Mode,
    pub generated_text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Correct,
    Incorrect,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GradingResult {
    pub question_id: String,
    pub mode: Mode,
    pub verdict: Verdict,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccuracySummary {
    pub mode: Mode,
    pub total: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub ungraded: usize,
    pub accuracy_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModeComparison {
    pub absolute_delta_pp: f64,
    /// None when baseline accuracy is zero; rendered as n/a.
    pub relative_delta_pct: Option<f64>,
}

/// Written by `setup` so later commands can recover the deployed model id
/// and index layout without re-provisioning.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SetupManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub search_url: String,
    pub index_name: String,
    pub pipeline_id: String,
    pub embedding_model_name: String,
    pub embedding_model_id: String,
    pub embedding_dim: usize,
    pub corpus_path: String,
    pub corpus_sha256: String,
    pub passage_count: usize,
    pub ingested_count: usize,
    pub failed_count: usize,
    pub duration_ms: u128,
    pub status: String,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EvalRunManifest {
    pub manifest_version: u32,
    pub run_id: String,
    pub generated_at: String,
    pub questions_path: String,
    pub questions_sha256: String,
    pub search_url: String,
    pub llm_url: String,
    pub llm_model: String,
    pub index_name: String,
    pub embedding_model_id: String,
    pub top_k: usize,
    pub fail_fast: bool,
    pub attempted: usize,
    pub failed: usize,
    pub cancelled: bool,
    pub baseline: AccuracySummary,
    pub rag: AccuracySummary,
    pub comparison: ModeComparison,
    pub answers: Vec<AnswerRecord>,
    pub gradings: Vec<GradingResult>,
    pub duration_ms: u128,
    pub status: String,
    pub warnings: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_round_trips_through_serde_lowercase() {
        let encoded = serde_json::to_string(&Mode::Rag).expect("serialize mode");
        assert_eq!(encoded, "\"rag\"");

        let decoded: Mode = serde_json::from_str("\"baseline\"").expect("deserialize mode");
        assert_eq!(decoded, Mode::Baseline);
    }

    #[test]
    fn verdict_serializes_lowercase() {
        let encoded = serde_json::to_string(&Verdict::Incorrect).expect("serialize verdict");
        assert_eq!(encoded, "\"incorrect\"");
    }
}
