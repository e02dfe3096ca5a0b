use std::time::{Duration, Instant};

use anyhow::{Result, anyhow, bail};
use chrono::Utc;
use tracing::{info, warn};

use crate::cli::SetupArgs;
use crate::dataset::load_corpus;
use crate::model::{Passage, SetupManifest};
use crate::search::{SearchClient, schema_matches};
use crate::util::{
    RetryPolicy, ensure_directory, now_utc_string, sha256_file, utc_compact_string,
    write_json_pretty,
};

pub const SETUP_MANIFEST_FILENAME: &str = "setup_manifest.json";

const MAX_RECORDED_WARNINGS: usize = 20;
const BULK_PROGRESS_EVERY_BATCHES: usize = 10;

pub fn run(args: SetupArgs) -> Result<()> {
    let started = Instant::now();
    let started_at = now_utc_string();
    let run_id = format!("setup-{}", utc_compact_string(Utc::now()));

    let manifest_dir = args.cache_root.join("manifests");
    ensure_directory(&manifest_dir)?;

    let passages = load_corpus(&args.corpus)?;
    let corpus_sha256 = sha256_file(&args.corpus)?;
    info!(
        corpus = %args.corpus.display(),
        passage_count = passages.len(),
        "corpus loaded"
    );

    let retry = RetryPolicy::new(args.retry_attempts, args.retry_backoff_ms);
    let search = SearchClient::new(&args.search_url, args.request_timeout_secs, retry)?;

    let cluster = search.wait_until_ready(Duration::from_secs(args.ready_timeout_secs))?;
    info!(
        cluster_name = %cluster.get("cluster_name").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
        version = %cluster
            .get("version")
            .and_then(|version| version.get("number"))
            .and_then(serde_json::Value::as_str)
            .unwrap_or("unknown"),
        "search service ready"
    );

    search.apply_ml_settings()?;

    let task_timeout = Duration::from_secs(args.task_timeout_secs);
    let model_id = ensure_model(&search, &args, task_timeout)?;

    search.put_ingest_pipeline(&args.pipeline_id, &model_id)?;
    info!(pipeline_id = %args.pipeline_id, model_id = %model_id, "ingest pipeline ready");

    ensure_index(&search, &args)?;

    let (ingested_count, failed_count, warnings) = ingest_corpus(&search, &args, &passages)?;
    if ingested_count == 0 {
        bail!(
            "bulk ingestion indexed zero passages out of {}",
            passages.len()
        );
    }
    if failed_count > 0 {
        warn!(failed_count, "some passages were rejected during bulk ingestion");
    }

    let status = if warnings.is_empty() {
        "completed"
    } else {
        "completed-with-warnings"
    };

    let manifest = SetupManifest {
        manifest_version: 1,
        run_id,
        generated_at: started_at,
        search_url: args.search_url.clone(),
        index_name: args.index_name.clone(),
        pipeline_id: args.pipeline_id.clone(),
        embedding_model_name: args.embedding_model_name.clone(),
        embedding_model_id: model_id.clone(),
        embedding_dim: args.embedding_dim,
        corpus_path: args.corpus.display().to_string(),
        corpus_sha256,
        passage_count: passages.len(),
        ingested_count,
        failed_count,
        duration_ms: started.elapsed().as_millis(),
        status: status.to_string(),
        warnings,
    };

    let manifest_path = manifest_dir.join(SETUP_MANIFEST_FILENAME);
    write_json_pretty(&manifest_path, &manifest)?;

    info!(
        path = %manifest_path.display(),
        index_name = %args.index_name,
        model_id = %model_id,
        ingested_count,
        failed_count,
        "setup completed"
    );

    Ok(())
}

/// Check-then-create registration: an already-registered model with the same
/// name is reused (and deployed if needed) rather than re-registered.
fn ensure_model(
    search: &SearchClient,
    args: &SetupArgs,
    task_timeout: Duration,
) -> Result<String> {
    if let Some((model_id, state)) = search.find_model(&args.embedding_model_name)? {
        info!(
            model_id = %model_id,
            state = %state,
            "embedding model already registered"
        );

        if state != "DEPLOYED" {
            let task_id = search.deploy_model(&model_id)?;
            search.wait_for_task(&task_id, "deployment", task_timeout)?;
        }
        search.verify_model_deployed(&model_id, task_timeout)?;
        return Ok(model_id);
    }

    let register_task =
        search.register_model(&args.embedding_model_name, &args.embedding_model_version)?;
    let model_id = search
        .wait_for_task(&register_task, "registration", task_timeout)?
        .ok_or_else(|| anyhow!("model registration completed without a model id"))?;
    info!(model_id = %model_id, "embedding model registered");

    let deploy_task = search.deploy_model(&model_id)?;
    search.wait_for_task(&deploy_task, "deployment", task_timeout)?;
    search.verify_model_deployed(&model_id, task_timeout)?;

    Ok(model_id)
}

/// Idempotent index declaration: an existing index with a matching schema is
/// a no-op, a mismatched one is a fatal configuration error.
fn ensure_index(search: &SearchClient, args: &SetupArgs) -> Result<()> {
    if search.index_exists(&args.index_name)? {
        let mappings = search.index_mappings(&args.index_name)?;
        if schema_matches(&mappings, args.embedding_dim) {
            info!(index_name = %args.index_name, "index already exists with matching schema");
            return Ok(());
        }
        bail!(
            "index {} exists with a mismatched schema (expected knn_vector dimension {}); refusing to overwrite",
            args.index_name,
            args.embedding_dim
        );
    }

    search.create_index(&args.index_name, &args.pipeline_id, args.embedding_dim)?;
    info!(
        index_name = %args.index_name,
        dimension = args.embedding_dim,
        "index created"
    );

    Ok(())
}

fn ingest_corpus(
    search: &SearchClient,
    args: &SetupArgs,
    passages: &[Passage],
) -> Result<(usize, usize, Vec<String>)> {
    let batch_size = args.batch_size.max(1);
    let mut ingested_count = 0usize;
    let mut failed_count = 0usize;
    let mut warnings = Vec::<String>::new();

    for (batch_index, batch) in passages.chunks(batch_size).enumerate() {
        let outcome = search.bulk_ingest(&args.index_name, batch)?;
        ingested_count += outcome.ingested;
        failed_count += outcome.failed;

        for sample in outcome.error_samples {
            if warnings.len() < MAX_RECORDED_WARNINGS {
                warnings.push(format!("bulk reject {sample}"));
            }
        }

        if (batch_index + 1) % BULK_PROGRESS_EVERY_BATCHES == 0 {
            info!(ingested_count, failed_count, "bulk ingestion progress");
        }
    }

    Ok((ingested_count, failed_count, warnings))
}
