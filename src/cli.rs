use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

pub const DEFAULT_SEARCH_URL: &str = "http://localhost:9200";
pub const DEFAULT_LLM_URL: &str = "http://localhost:11434";

#[derive(Parser, Debug)]
#[command(
    name = "ragcheck",
    version,
    about = "RAG retrieval and evaluation pipeline tooling"
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    Setup(SetupArgs),
    Query(QueryArgs),
    Eval(EvalArgs),
    Status(StatusArgs),
}

#[derive(Args, Debug, Clone)]
pub struct SetupArgs {
    #[arg(long, default_value = ".cache/ragcheck")]
    pub cache_root: PathBuf,

    /// JSON array of passage records to index.
    #[arg(long)]
    pub corpus: PathBuf,

    #[arg(long, default_value = DEFAULT_SEARCH_URL)]
    pub search_url: String,

    #[arg(long, default_value = "rag-passages")]
    pub index_name: String,

    #[arg(long, default_value = "rag-ingest-pipeline")]
    pub pipeline_id: String,

    #[arg(
        long,
        default_value = "huggingface/sentence-transformers/all-MiniLM-L6-v2"
    )]
    pub embedding_model_name: String,

    #[arg(long, default_value = "1.0.1")]
    pub embedding_model_version: String,

    #[arg(long, default_value_t = 384)]
    pub embedding_dim: usize,

    #[arg(long, default_value_t = 100)]
    pub batch_size: usize,

    #[arg(long, default_value_t = 120)]
    pub ready_timeout_secs: u64,

    #[arg(long, default_value_t = 300)]
    pub task_timeout_secs: u64,

    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub retry_attempts: usize,

    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct QueryArgs {
    #[arg(long, default_value = ".cache/ragcheck")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = DEFAULT_SEARCH_URL)]
    pub search_url: String,

    #[arg(long)]
    pub query: String,

    #[arg(long, default_value_t = 10)]
    pub k: usize,

    #[arg(long, default_value_t = 30)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub retry_attempts: usize,

    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,

    #[arg(long, default_value_t = false)]
    pub json: bool,
}

#[derive(Args, Debug, Clone)]
pub struct EvalArgs {
    #[arg(long, default_value = ".cache/ragcheck")]
    pub cache_root: PathBuf,

    /// JSON array of question/answer records, evaluated in file order.
    #[arg(long)]
    pub questions: PathBuf,

    /// Truncate the dataset to the first N questions.
    #[arg(long)]
    pub num_questions: Option<usize>,

    #[arg(long, default_value = DEFAULT_SEARCH_URL)]
    pub search_url: String,

    #[arg(long, default_value = DEFAULT_LLM_URL)]
    pub llm_url: String,

    #[arg(long, default_value = "gemma3")]
    pub llm_model: String,

    #[arg(long, default_value_t = 10)]
    pub k: usize,

    /// Abort the run on the first irrecoverable question failure instead of
    /// excluding the question and continuing.
    #[arg(long, default_value_t = false)]
    pub fail_fast: bool,

    #[arg(long, default_value_t = 120)]
    pub request_timeout_secs: u64,

    #[arg(long, default_value_t = 3)]
    pub retry_attempts: usize,

    #[arg(long, default_value_t = 500)]
    pub retry_backoff_ms: u64,
}

#[derive(Args, Debug, Clone)]
pub struct StatusArgs {
    #[arg(long, default_value = ".cache/ragcheck")]
    pub cache_root: PathBuf,

    #[arg(long, default_value = DEFAULT_SEARCH_URL)]
    pub search_url: String,

    #[arg(long, default_value = DEFAULT_LLM_URL)]
    pub llm_url: String,

    #[arg(long, default_value = "gemma3")]
    pub llm_model: String,
}
