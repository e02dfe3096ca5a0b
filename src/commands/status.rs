use anyhow::Result;
use tracing::{info, warn};

use crate::cli::StatusArgs;
use crate::llm::LlmClient;
use crate::search::SearchClient;
use crate::util::RetryPolicy;

use super::load_setup_manifest;

const PROBE_TIMEOUT_SECS: u64 = 10;

pub fn run(args: StatusArgs) -> Result<()> {
    info!(cache_root = %args.cache_root.display(), "status requested");

    let manifest = match load_setup_manifest(&args.cache_root) {
        Ok(manifest) => Some(manifest),
        Err(err) => {
            warn!(error = %err, "setup manifest unavailable");
            None
        }
    };

    if let Some(manifest) = &manifest {
        info!(
            run_id = %manifest.run_id,
            generated_at = %manifest.generated_at,
            index_name = %manifest.index_name,
            pipeline_id = %manifest.pipeline_id,
            model_id = %manifest.embedding_model_id,
            embedding_dim = manifest.embedding_dim,
            ingested_count = manifest.ingested_count,
            failed_count = manifest.failed_count,
            status = %manifest.status,
            "loaded setup manifest"
        );
    }

    let retry = RetryPolicy::new(1, 0);
    let search = SearchClient::new(&args.search_url, PROBE_TIMEOUT_SECS, retry)?;

    match search.ping() {
        Ok(cluster) => {
            info!(
                cluster_name = %cluster.get("cluster_name").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
                version = %cluster
                    .get("version")
                    .and_then(|version| version.get("number"))
                    .and_then(serde_json::Value::as_str)
                    .unwrap_or("unknown"),
                "search service reachable"
            );

            if let Some(manifest) = &manifest {
                match search.count_documents(&manifest.index_name) {
                    Ok(count) => {
                        info!(index_name = %manifest.index_name, documents = count, "index status");
                    }
                    Err(err) => {
                        warn!(
                            index_name = %manifest.index_name,
                            error = %err,
                            "failed to count indexed passages"
                        );
                    }
                }
            }
        }
        Err(err) => warn!(error = %err, "search service unreachable"),
    }

    let llm = LlmClient::new(&args.llm_url, &args.llm_model, PROBE_TIMEOUT_SECS, retry)?;
    match llm.ping() {
        Ok(()) => info!(url = %args.llm_url, model = %llm.model(), "llm service reachable"),
        Err(err) => warn!(error = %err, "llm service unreachable"),
    }

    Ok(())
}
