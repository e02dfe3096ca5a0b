use std::fs;
use std::path::Path;

use anyhow::{Context, Result};

use crate::model::SetupManifest;

pub mod eval;
pub mod query;
pub mod setup;
pub mod status;

/// Recovers the index layout and deployed model id written by `setup`.
pub(crate) fn load_setup_manifest(cache_root: &Path) -> Result<SetupManifest> {
    let path = cache_root
        .join("manifests")
        .join(setup::SETUP_MANIFEST_FILENAME);

    let raw = fs::read(&path).with_context(|| {
        format!(
            "failed to read {} (run `ragcheck setup` first)",
            path.display()
        )
    })?;
    let manifest: SetupManifest = serde_json::from_slice(&raw)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    Ok(manifest)
}
