use std::cmp::Ordering;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde_json::{Value, json};
use tracing::{info, warn};

use crate::model::{Passage, RetrievalResult, RetrievedPassage};
use crate::util::RetryPolicy;

const READY_POLL_INTERVAL: Duration = Duration::from_secs(2);
const TASK_POLL_INTERVAL: Duration = Duration::from_secs(5);
const MAX_BULK_ERROR_SAMPLES: usize = 5;

/// Blocking client for the Document Index Service (OpenSearch-compatible
/// REST API with the ML-commons and k-NN plugins).
pub struct SearchClient {
    http: Client,
    base_url: String,
    retry: RetryPolicy,
}

#[derive(Debug, Clone)]
pub struct BulkOutcome {
    pub ingested: usize,
    pub failed: usize,
    pub error_samples: Vec<String>,
}

#[derive(Debug, Clone)]
enum TaskState {
    Completed { model_id: Option<String> },
    Failed(String),
    Pending(String),
}

impl SearchClient {
    pub fn new(base_url: &str, timeout_secs: u64, retry: RetryPolicy) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .context("failed to build search http client")?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            retry,
        })
    }

    /// Single non-retried liveness probe; returns the cluster info document.
    pub fn ping(&self) -> Result<Value> {
        let response = self
            .http
            .get(&self.base_url)
            .send()
            .with_context(|| format!("search service unreachable at {}", self.base_url))?;
        read_success_json(response, "cluster info")
    }

    /// Polls the cluster root until it answers, or the timeout elapses.
    pub fn wait_until_ready(&self, timeout: Duration) -> Result<Value> {
        let started = Instant::now();

        loop {
            match self.http.get(&self.base_url).send() {
                Ok(response) if response.status().is_success() => {
                    let info: Value = response
                        .json()
                        .context("cluster info: invalid json response")?;
                    return Ok(info);
                }
                Ok(response) => {
                    warn!(status = %response.status(), "search service not ready");
                }
                Err(err) => {
                    warn!(error = %err, "search service unreachable");
                }
            }

            if started.elapsed() >= timeout {
                bail!(
                    "search service at {} did not become ready within {}s",
                    self.base_url,
                    timeout.as_secs()
                );
            }

            thread::sleep(READY_POLL_INTERVAL);
        }
    }

    pub fn apply_ml_settings(&self) -> Result<()> {
        let url = format!("{}/_cluster/settings", self.base_url);
        let body = json!({
            "persistent": {
                "plugins.ml_commons.only_run_on_ml_node": "false",
                "plugins.ml_commons.native_memory_threshold": "99",
            }
        });

        let response = self.execute("apply ml cluster settings", || {
            self.http.put(&url).json(&body)
        })?;
        let value = read_success_json(response, "apply ml cluster settings")?;

        if value.get("acknowledged").and_then(Value::as_bool) != Some(true) {
            warn!("ml cluster settings were not acknowledged");
        }

        Ok(())
    }

    /// Looks up an already-registered embedding model by name so setup can
    /// reuse it instead of registering a duplicate. Returns the model id and
    /// its reported state.
    pub fn find_model(&self, model_name: &str) -> Result<Option<(String, String)>> {
        let url = format!("{}/_plugins/_ml/models/_search", self.base_url);
        let body = json!({
            "size": 10,
            "query": { "match_phrase": { "name": model_name } }
        });

        let response = self.execute("search registered models", || {
            self.http.post(&url).json(&body)
        })?;

        let status = response.status();
        let value: Value = response
            .json()
            .context("search registered models: invalid json response")?;
        if !status.is_success() {
            // A cluster without any registered model yet answers with an
            // index_not_found error; treat that as "no model".
            warn!(status = %status, "model search unavailable, assuming no registered model");
            return Ok(None);
        }

        Ok(parse_model_search(&value, model_name))
    }

    /// Starts model registration; returns the backend task id.
    pub fn register_model(&self, model_name: &str, model_version: &str) -> Result<String> {
        let url = format!("{}/_plugins/_ml/models/_register", self.base_url);
        let body = json!({
            "name": model_name,
            "version": model_version,
            "model_format": "TORCH_SCRIPT",
        });

        let response = self.execute("register embedding model", || {
            self.http.post(&url).json(&body)
        })?;
        let value = read_success_json(response, "register embedding model")?;

        value
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("register embedding model: response carried no task_id"))
    }

    /// Starts model deployment; returns the backend task id.
    pub fn deploy_model(&self, model_id: &str) -> Result<String> {
        let url = format!("{}/_plugins/_ml/models/{model_id}/_deploy", self.base_url);

        let response = self.execute("deploy embedding model", || self.http.post(&url))?;
        let value = read_success_json(response, "deploy embedding model")?;

        value
            .get("task_id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| anyhow!("deploy embedding model: response carried no task_id"))
    }

    /// Polls a model task until completion. Registration tasks resolve to a
    /// model id; deployment tasks resolve to None.
    pub fn wait_for_task(
        &self,
        task_id: &str,
        operation: &str,
        timeout: Duration,
    ) -> Result<Option<String>> {
        let url = format!("{}/_plugins/_ml/tasks/{task_id}", self.base_url);
        let started = Instant::now();

        loop {
            let response = self.execute("poll model task", || self.http.get(&url))?;
            let value = read_success_json(response, "poll model task")?;

            match parse_task_state(&value) {
                TaskState::Completed { model_id } => {
                    info!(task_id, operation, "model task completed");
                    return Ok(model_id);
                }
                TaskState::Failed(reason) => {
                    bail!("model {operation} failed: {reason}");
                }
                TaskState::Pending(state) => {
                    info!(task_id, operation, state = %state, "model task in progress");
                }
            }

            if started.elapsed() >= timeout {
                bail!(
                    "model {operation} did not complete within {}s",
                    timeout.as_secs()
                );
            }

            thread::sleep(TASK_POLL_INTERVAL);
        }
    }

    pub fn model_state(&self, model_id: &str) -> Result<String> {
        let url = format!("{}/_plugins/_ml/models/{model_id}", self.base_url);

        let response = self.execute("fetch model state", || self.http.get(&url))?;
        let value = read_success_json(response, "fetch model state")?;

        Ok(value
            .get("model_state")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string())
    }

    /// Waits until the model reports DEPLOYED and is usable for inference.
    pub fn verify_model_deployed(&self, model_id: &str, timeout: Duration) -> Result<()> {
        let started = Instant::now();

        loop {
            let state = self.model_state(model_id)?;
            match state.as_str() {
                "DEPLOYED" => {
                    info!(model_id, "embedding model ready for inference");
                    return Ok(());
                }
                "DEPLOYING" | "PARTIALLY_DEPLOYED" | "REGISTERED" => {
                    info!(model_id, state = %state, "model deployment in progress");
                }
                other => {
                    warn!(model_id, state = %other, "unexpected model state");
                }
            }

            if started.elapsed() >= timeout {
                bail!("model {model_id} not deployed within {}s", timeout.as_secs());
            }

            thread::sleep(TASK_POLL_INTERVAL);
        }
    }

    /// Declares the ingest pipeline that embeds passage text on write.
    /// Re-issuing the same pipeline id overwrites in place, so the call is
    /// idempotent.
    pub fn put_ingest_pipeline(&self, pipeline_id: &str, model_id: &str) -> Result<()> {
        let url = format!("{}/_ingest/pipeline/{pipeline_id}", self.base_url);
        let body = json!({
            "description": "Embeds passage text into a dense vector on ingestion",
            "processors": [
                {
                    "text_embedding": {
                        "model_id": model_id,
                        "field_map": { "text": "embedding" },
                    }
                }
            ]
        });

        let response = self.execute("create ingest pipeline", || {
            self.http.put(&url).json(&body)
        })?;
        let value = read_success_json(response, "create ingest pipeline")?;

        if value.get("acknowledged").and_then(Value::as_bool) != Some(true) {
            bail!("create ingest pipeline: not acknowledged: {value}");
        }

        Ok(())
    }

    pub fn index_exists(&self, index_name: &str) -> Result<bool> {
        let url = format!("{}/{index_name}", self.base_url);

        let response = self.execute("check index existence", || self.http.head(&url))?;
        let status = response.status();

        if status.is_success() {
            Ok(true)
        } else if status.as_u16() == 404 {
            Ok(false)
        } else {
            bail!("check index existence: unexpected status {status}");
        }
    }

    /// Fetches the mappings object of an existing index for schema
    /// comparison.
    pub fn index_mappings(&self, index_name: &str) -> Result<Value> {
        let url = format!("{}/{index_name}/_mapping", self.base_url);

        let response = self.execute("fetch index mappings", || self.http.get(&url))?;
        let value = read_success_json(response, "fetch index mappings")?;

        value
            .get(index_name)
            .and_then(|entry| entry.get("mappings"))
            .cloned()
            .ok_or_else(|| anyhow!("fetch index mappings: no mappings for index {index_name}"))
    }

    pub fn create_index(
        &self,
        index_name: &str,
        pipeline_id: &str,
        dimension: usize,
    ) -> Result<()> {
        let url = format!("{}/{index_name}", self.base_url);
        let body = index_schema_body(pipeline_id, dimension);

        let response = self.execute("create index", || self.http.put(&url).json(&body))?;
        let value = read_success_json(response, "create index")?;

        if value.get("acknowledged").and_then(Value::as_bool) != Some(true) {
            bail!("create index: not acknowledged: {value}");
        }

        Ok(())
    }

    /// Bulk-indexes one batch of passages through the default pipeline.
    pub fn bulk_ingest(&self, index_name: &str, passages: &[Passage]) -> Result<BulkOutcome> {
        let body = build_bulk_body(index_name, passages);
        let url = format!("{}/_bulk", self.base_url);

        let response = self.execute("bulk ingest passages", || {
            self.http
                .post(&url)
                .header("content-type", "application/x-ndjson")
                .body(body.clone())
        })?;
        let value = read_success_json(response, "bulk ingest passages")?;

        Ok(parse_bulk_response(&value))
    }

    /// One semantic query against the index: top-k passages ranked by
    /// embedding-space similarity to the question text.
    pub fn semantic_query(
        &self,
        index_name: &str,
        model_id: &str,
        query_text: &str,
        k: usize,
    ) -> Result<RetrievalResult> {
        if query_text.trim().is_empty() {
            bail!("semantic query text must not be empty");
        }
        if k == 0 {
            bail!("semantic query k must be at least 1");
        }

        let url = format!("{}/{index_name}/_search", self.base_url);
        let body = json!({
            "_source": { "excludes": ["embedding"] },
            "size": k,
            "query": {
                "neural": {
                    "embedding": {
                        "query_text": query_text,
                        "model_id": model_id,
                        "k": k,
                    }
                }
            }
        });

        let response = self.execute("semantic query", || self.http.post(&url).json(&body))?;
        let value = read_success_json(response, "semantic query")?;

        Ok(parse_search_hits(&value, k))
    }

    pub fn count_documents(&self, index_name: &str) -> Result<u64> {
        let url = format!("{}/{index_name}/_count", self.base_url);

        let response = self.execute("count indexed passages", || self.http.get(&url))?;
        let value = read_success_json(response, "count indexed passages")?;

        Ok(value.get("count").and_then(Value::as_u64).unwrap_or(0))
    }

    /// Issues a request with bounded retries. Transport errors and 5xx
    /// answers are transient; anything else is returned to the caller.
    fn execute<F>(&self, operation: &str, build: F) -> Result<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 1..=self.retry.attempts {
            match build().send() {
                Ok(response) if response.status().is_server_error() => {
                    last_error = Some(anyhow!(
                        "{operation}: server error {} from {}",
                        response.status(),
                        self.base_url
                    ));
                }
                Ok(response) => return Ok(response),
                Err(err) => {
                    last_error =
                        Some(anyhow::Error::new(err).context(format!("{operation}: request failed")));
                }
            }

            if attempt < self.retry.attempts {
                warn!(operation, attempt, "transient search failure, retrying");
                thread::sleep(self.retry.delay_for(attempt));
            }
        }

        Err(last_error
            .unwrap_or_else(|| anyhow!("{operation}: exhausted retries against {}", self.base_url)))
    }
}

fn read_success_json(response: Response, operation: &str) -> Result<Value> {
    let status = response.status();
    let value: Value = response
        .json()
        .with_context(|| format!("{operation}: invalid json response"))?;

    if !status.is_success() {
        bail!("{operation}: unexpected status {status}: {value}");
    }

    Ok(value)
}

pub fn index_schema_body(pipeline_id: &str, dimension: usize) -> Value {
    json!({
        "settings": {
            "index.knn": true,
            "default_pipeline": pipeline_id,
        },
        "mappings": {
            "properties": {
                "embedding": {
                    "type": "knn_vector",
                    "dimension": dimension,
                    "method": {
                        "name": "hnsw",
                        "space_type": "l2",
                        "engine": "nmslib",
                    }
                },
                "text": { "type": "text" },
                "source_title": { "type": "keyword" },
            }
        }
    })
}

/// Compares an existing index's mappings against the expected vector schema.
/// Only the fields the pipeline depends on are checked; extra fields on the
/// index are tolerated.
pub fn schema_matches(mappings: &Value, dimension: usize) -> bool {
    let properties = match mappings.get("properties") {
        Some(value) => value,
        None => return false,
    };

    let embedding_ok = properties
        .get("embedding")
        .map(|field| {
            field.get("type").and_then(Value::as_str) == Some("knn_vector")
                && field.get("dimension").and_then(Value::as_u64) == Some(dimension as u64)
        })
        .unwrap_or(false);

    let text_ok = properties
        .get("text")
        .and_then(|field| field.get("type"))
        .and_then(Value::as_str)
        == Some("text");

    embedding_ok && text_ok
}

fn build_bulk_body(index_name: &str, passages: &[Passage]) -> String {
    let mut body = String::new();

    for passage in passages {
        let action = json!({ "index": { "_index": index_name, "_id": passage.id } });
        let mut document = json!({ "text": passage.text });
        if let Some(title) = &passage.source_title {
            document["source_title"] = json!(title);
        }

        body.push_str(&action.to_string());
        body.push('\n');
        body.push_str(&document.to_string());
        body.push('\n');
    }

    body
}

fn parse_bulk_response(value: &Value) -> BulkOutcome {
    let mut outcome = BulkOutcome {
        ingested: 0,
        failed: 0,
        error_samples: Vec::new(),
    };

    let items = value
        .get("items")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    for item in &items {
        let entry = item
            .get("index")
            .or_else(|| item.get("create"))
            .cloned()
            .unwrap_or_default();

        if let Some(error) = entry.get("error") {
            outcome.failed += 1;
            if outcome.error_samples.len() < MAX_BULK_ERROR_SAMPLES {
                let id = entry.get("_id").and_then(Value::as_str).unwrap_or("?");
                outcome.error_samples.push(format!("{id}: {error}"));
            }
        } else {
            outcome.ingested += 1;
        }
    }

    outcome
}

/// Extracts ranked passages from a search response. Hits are re-sorted by
/// descending score with a stable sort, so equal scores keep the backend's
/// original order, and the result is clamped to k.
fn parse_search_hits(value: &Value, k: usize) -> RetrievalResult {
    let raw_hits = value
        .get("hits")
        .and_then(|hits| hits.get("hits"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();

    let mut hits = Vec::<RetrievedPassage>::with_capacity(raw_hits.len());

    for hit in &raw_hits {
        let source = hit.get("_source").cloned().unwrap_or_default();
        let text = source
            .get("text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        if text.is_empty() {
            continue;
        }

        hits.push(RetrievedPassage {
            passage: Passage {
                id: hit
                    .get("_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string(),
                text,
                source_title: source
                    .get("source_title")
                    .and_then(Value::as_str)
                    .map(str::to_string),
            },
            score: hit.get("_score").and_then(Value::as_f64).unwrap_or(0.0),
        });
    }

    hits.sort_by(|left, right| {
        right
            .score
            .partial_cmp(&left.score)
            .unwrap_or(Ordering::Equal)
    });
    hits.truncate(k);

    RetrievalResult { hits }
}

fn parse_task_state(value: &Value) -> TaskState {
    let state = value.get("state").and_then(Value::as_str).unwrap_or("UNKNOWN");

    match state {
        "COMPLETED" => TaskState::Completed {
            model_id: value
                .get("model_id")
                .and_then(Value::as_str)
                .map(str::to_string),
        },
        "FAILED" | "COMPLETED_WITH_ERROR" => TaskState::Failed(
            value
                .get("error")
                .map(Value::to_string)
                .unwrap_or_else(|| "unknown error".to_string()),
        ),
        other => TaskState::Pending(other.to_string()),
    }
}

/// Picks the model id matching `model_name` from a model-search response,
/// skipping chunk documents that share the model's name.
fn parse_model_search(value: &Value, model_name: &str) -> Option<(String, String)> {
    let hits = value
        .get("hits")
        .and_then(|hits| hits.get("hits"))
        .and_then(Value::as_array)?;

    for hit in hits {
        let Some(source) = hit.get("_source") else {
            continue;
        };
        if source.get("chunk_number").is_some_and(|chunk| !chunk.is_null()) {
            continue;
        }
        if source.get("name").and_then(Value::as_str) != Some(model_name) {
            continue;
        }

        let Some(model_id) = hit.get("_id").and_then(Value::as_str).map(str::to_string) else {
            continue;
        };
        let state = source
            .get("model_state")
            .and_then(Value::as_str)
            .unwrap_or("UNKNOWN")
            .to_string();
        return Some((model_id, state));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn passage(id: &str, text: &str) -> Passage {
        Passage {
            id: id.to_string(),
            text: text.to_string(),
            source_title: None,
        }
    }

    #[test]
    fn schema_matches_accepts_expected_vector_mapping() {
        let mappings = index_schema_body("p", 384)["mappings"].clone();
        assert!(schema_matches(&mappings, 384));
    }

    #[test]
    fn schema_matches_rejects_dimension_mismatch() {
        let mappings = index_schema_body("p", 384)["mappings"].clone();
        assert!(!schema_matches(&mappings, 768));
    }

    #[test]
    fn schema_matches_rejects_missing_vector_field() {
        let mappings = json!({ "properties": { "text": { "type": "text" } } });
        assert!(!schema_matches(&mappings, 384));
    }

    #[test]
    fn bulk_body_interleaves_action_and_document_lines() {
        let passages = vec![passage("a", "first"), passage("b", "second")];
        let body = build_bulk_body("idx", &passages);
        let lines = body.lines().collect::<Vec<&str>>();

        assert_eq!(lines.len(), 4);
        assert!(lines[0].contains("\"_id\":\"a\""));
        assert!(lines[0].contains("\"_index\":\"idx\""));
        assert!(lines[1].contains("\"text\":\"first\""));
        assert!(lines[3].contains("\"text\":\"second\""));
        assert!(body.ends_with('\n'));
    }

    #[test]
    fn bulk_response_counts_rejected_items() {
        let response = json!({
            "errors": true,
            "items": [
                { "index": { "_id": "a", "status": 201 } },
                { "index": { "_id": "b", "status": 400, "error": { "reason": "mapper_parsing" } } },
                { "index": { "_id": "c", "status": 201 } },
            ]
        });

        let outcome = parse_bulk_response(&response);
        assert_eq!(outcome.ingested, 2);
        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.error_samples.len(), 1);
        assert!(outcome.error_samples[0].starts_with("b:"));
    }

    #[test]
    fn search_hits_are_ranked_descending_and_clamped_to_k() {
        let response = json!({
            "hits": { "hits": [
                { "_id": "low", "_score": 0.2, "_source": { "text": "low scorer" } },
                { "_id": "high", "_score": 0.9, "_source": { "text": "high scorer" } },
                { "_id": "mid", "_score": 0.5, "_source": { "text": "mid scorer" } },
            ]}
        });

        let result = parse_search_hits(&response, 2);
        assert_eq!(result.len(), 2);
        assert_eq!(result.hits[0].passage.id, "high");
        assert_eq!(result.hits[1].passage.id, "mid");
        assert!(result.hits[0].score >= result.hits[1].score);
    }

    #[test]
    fn search_hits_keep_backend_order_on_tied_scores() {
        let response = json!({
            "hits": { "hits": [
                { "_id": "first", "_score": 0.7, "_source": { "text": "tied one" } },
                { "_id": "second", "_score": 0.7, "_source": { "text": "tied two" } },
            ]}
        });

        let result = parse_search_hits(&response, 10);
        assert_eq!(result.hits[0].passage.id, "first");
        assert_eq!(result.hits[1].passage.id, "second");
    }

    #[test]
    fn search_hits_empty_response_is_valid() {
        let result = parse_search_hits(&json!({ "hits": { "hits": [] } }), 5);
        assert!(result.is_empty());
    }

    #[test]
    fn task_state_completed_carries_model_id() {
        let state = parse_task_state(&json!({ "state": "COMPLETED", "model_id": "m-1" }));
        match state {
            TaskState::Completed { model_id } => assert_eq!(model_id.as_deref(), Some("m-1")),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn task_state_failed_carries_reason() {
        let state = parse_task_state(&json!({ "state": "FAILED", "error": "out of memory" }));
        match state {
            TaskState::Failed(reason) => assert!(reason.contains("out of memory")),
            other => panic!("unexpected state: {other:?}"),
        }
    }

    #[test]
    fn model_search_skips_chunk_documents() {
        let response = json!({
            "hits": { "hits": [
                { "_id": "chunk-1", "_source": { "name": "the-model", "chunk_number": 0 } },
                { "_id": "model-1", "_source": { "name": "the-model", "model_state": "DEPLOYED" } },
            ]}
        });

        let found = parse_model_search(&response, "the-model");
        assert_eq!(
            found,
            Some(("model-1".to_string(), "DEPLOYED".to_string()))
        );
    }

    #[test]
    fn model_search_ignores_other_names() {
        let response = json!({
            "hits": { "hits": [
                { "_id": "model-2", "_source": { "name": "another-model", "model_state": "DEPLOYED" } },
            ]}
        });

        assert_eq!(parse_model_search(&response, "the-model"), None);
    }
}
