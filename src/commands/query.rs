use std::io::{self, Write};
use std::time::Instant;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::info;

use crate::cli::QueryArgs;
use crate::model::RetrievalResult;
use crate::search::SearchClient;
use crate::util::RetryPolicy;

use super::load_setup_manifest;

const DISPLAY_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone, Serialize)]
struct QueryResultRow {
    rank: usize,
    id: String,
    score: f64,
    source_title: Option<String>,
    text: String,
}

#[derive(Debug, Clone, Serialize)]
struct QueryResponse {
    query: String,
    k: usize,
    returned: usize,
    index_name: String,
    results: Vec<QueryResultRow>,
}

pub fn run(args: QueryArgs) -> Result<()> {
    let manifest = load_setup_manifest(&args.cache_root)?;

    let retry = RetryPolicy::new(args.retry_attempts, args.retry_backoff_ms);
    let search = SearchClient::new(&args.search_url, args.request_timeout_secs, retry)?;

    let started = Instant::now();
    let retrieval = search.semantic_query(
        &manifest.index_name,
        &manifest.embedding_model_id,
        &args.query,
        args.k,
    )?;
    let duration_ms = started.elapsed().as_millis();

    info!(
        returned = retrieval.len(),
        k = args.k,
        duration_ms,
        "semantic query completed"
    );

    if args.json {
        write_json_response(&args, &manifest.index_name, &retrieval)
    } else {
        write_text_response(&args.query, &retrieval)
    }
}

fn write_json_response(
    args: &QueryArgs,
    index_name: &str,
    retrieval: &RetrievalResult,
) -> Result<()> {
    let results = retrieval
        .hits
        .iter()
        .enumerate()
        .map(|(index, hit)| QueryResultRow {
            rank: index + 1,
            id: hit.passage.id.clone(),
            score: hit.score,
            source_title: hit.passage.source_title.clone(),
            text: hit.passage.text.clone(),
        })
        .collect::<Vec<QueryResultRow>>();

    let response = QueryResponse {
        query: args.query.clone(),
        k: args.k,
        returned: results.len(),
        index_name: index_name.to_string(),
        results,
    };

    let mut output = io::BufWriter::new(io::stdout().lock());
    serde_json::to_writer_pretty(&mut output, &response)
        .context("failed to serialize query json output")?;
    writeln!(output)?;
    output.flush()?;
    Ok(())
}

fn write_text_response(query_text: &str, retrieval: &RetrievalResult) -> Result<()> {
    let mut output = io::BufWriter::new(io::stdout().lock());

    writeln!(output, "Query: {query_text}")?;
    writeln!(output, "Results: {}", retrieval.len())?;

    for (index, hit) in retrieval.hits.iter().enumerate() {
        writeln!(
            output,
            "{}.\tscore={:.4}\tid={}",
            index + 1,
            hit.score,
            hit.passage.id
        )?;
        if let Some(title) = &hit.passage.source_title {
            writeln!(output, "\tsource: {title}")?;
        }
        writeln!(output, "\tpassage: {}", display_snippet(&hit.passage.text))?;
    }

    output.flush()?;
    Ok(())
}

fn display_snippet(text: &str) -> String {
    if text.chars().count() <= DISPLAY_SNIPPET_CHARS {
        return text.to_string();
    }

    let clipped = text.chars().take(DISPLAY_SNIPPET_CHARS).collect::<String>();
    format!("{clipped}...")
}
