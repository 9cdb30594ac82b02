//! `notectx index`: feed a collection's notes file through the pipeline.
//!
//! Reads the JSON export named by `[[collections]] json_file`, splits it
//! into documents, and hands them to [`notectx_core::pipeline::run_index`]
//! together with the SQLite store and the configured embedding provider.

use anyhow::{bail, Context, Result};
use serde_json::Value;
use std::path::Path;

use notectx_core::embedding::EmbeddingProvider;
use notectx_core::pipeline::{run_index, IndexOptions, RunSummary};
use notectx_core::validate::split_documents;

use crate::config::{CollectionConfig, Config};
use crate::embedding::create_provider;
use crate::sqlite_store::SqliteStore;

/// Read a notes file and split it into raw documents.
///
/// The file holds either a JSON array of notes or an object with a
/// `notes` array.
pub fn load_notes(path: &Path) -> Result<Vec<Value>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read notes file: {}", path.display()))?;
    let value: Value = serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse notes file: {}", path.display()))?;
    let docs = split_documents(value)
        .with_context(|| format!("Unexpected notes file shape: {}", path.display()))?;
    Ok(docs)
}

/// Pipeline options for one configured collection.
pub fn index_options(config: &Config, collection: &CollectionConfig, force: bool) -> IndexOptions {
    let mut opts = IndexOptions::new(collection.collection_name.clone());
    opts.description = collection.description.clone();
    opts.params = config.chunk_params(collection);
    opts.force_recreate = force || collection.force_recreate;
    opts.concurrency = config.provider.rate_limit.concurrency;
    opts
}

/// Index one configured collection.
pub async fn index_collection(
    config: &Config,
    store: &SqliteStore,
    provider: &dyn EmbeddingProvider,
    collection: &CollectionConfig,
    force: bool,
) -> Result<RunSummary> {
    if collection.skip_ai_validation {
        tracing::info!(collection = %collection.collection_name, "AI validation skipped for this collection");
    } else if let Some(llm) = &config.provider.llm_model {
        tracing::debug!(collection = %collection.collection_name, llm_model = %llm, "AI validation is handled upstream of indexing");
    }

    let raw = load_notes(&collection.json_file)?;
    let opts = index_options(config, collection, force);
    let summary = run_index(store, provider, raw, &opts).await?;
    Ok(summary)
}

/// Run `notectx index` for one named collection, or every configured one.
pub async fn run_index_cmd(config: &Config, name: Option<&str>, force: bool) -> Result<()> {
    let targets: Vec<&CollectionConfig> = match name {
        Some(name) => match config.collection(name) {
            Some(c) => vec![c],
            None => bail!(
                "Unknown collection: '{}'. Configured: {}",
                name,
                configured_names(config)
            ),
        },
        None => config.collections.iter().collect(),
    };
    if targets.is_empty() {
        bail!("No collections configured. Add a [[collections]] entry to the config.");
    }
    if !config.provider.is_enabled() {
        bail!("Indexing requires embeddings. Set [provider] type in config.");
    }

    let provider = create_provider(&config.provider)?;
    let store = SqliteStore::open(config).await?;

    let mut failed_runs = 0;
    for collection in targets {
        let summary =
            index_collection(config, &store, provider.as_ref(), collection, force).await?;
        print_summary(&summary);
        if !summary.is_committed() {
            failed_runs += 1;
        }
    }

    store.pool().close().await;

    if failed_runs > 0 {
        bail!("{} indexing run(s) failed", failed_runs);
    }
    println!("ok");
    Ok(())
}

fn configured_names(config: &Config) -> String {
    if config.collections.is_empty() {
        return "(none)".to_string();
    }
    config
        .collections
        .iter()
        .map(|c| c.collection_name.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

fn print_summary(summary: &RunSummary) {
    println!("index {} ({})", summary.collection, summary.mode.as_str());
    println!("  run: {}", summary.run_id);
    println!("  committed notes: {}", summary.committed.len());
    println!("  unchanged notes: {}", summary.skipped.len());
    println!("  removed notes: {}", summary.removed.len());
    println!("  chunks written: {}", summary.chunks_written);
    if !summary.failed.is_empty() {
        println!("  failed notes: {}", summary.failed.len());
        for f in &summary.failed {
            println!("    {} [{}]: {}", f.note_id, f.code, f.reason);
        }
    }
    match &summary.failure {
        Some(failure) => println!("  failed: [{}] {}", failure.code, failure.message),
        None => println!("  state: committed"),
    }
}
