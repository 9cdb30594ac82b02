//! `notectx search`: retrieve cited context from the command line.
//!
//! Builds a [`SearchRequest`] from CLI flags and prints the assembled
//! [`ContextResponse`](notectx_core::retrieval::ContextResponse), either as
//! the plain-text context block or as JSON with `--json`.

use anyhow::{bail, Context, Result};
use chrono::NaiveDate;

use notectx_core::models::SearchFilters;
use notectx_core::registry::CollectionTarget;
use notectx_core::retrieval::{retrieve, SearchRequest};

use crate::config::Config;
use crate::embedding::create_provider;
use crate::sqlite_store::SqliteStore;

/// CLI flags for one search.
#[derive(Debug, Default)]
pub struct SearchArgs {
    pub query: String,
    pub collections: Vec<String>,
    pub limit: Option<usize>,
    pub tags: Vec<String>,
    pub notes: Vec<String>,
    pub since: Option<String>,
    pub json: bool,
}

/// Parse a `YYYY-MM-DD` date flag.
pub fn parse_since(since: &str) -> Result<NaiveDate> {
    NaiveDate::parse_from_str(since, "%Y-%m-%d")
        .with_context(|| format!("Invalid --since date '{}', expected YYYY-MM-DD", since))
}

impl SearchArgs {
    pub fn to_request(&self, config: &Config) -> Result<SearchRequest> {
        let updated_since = self.since.as_deref().map(parse_since).transpose()?;
        Ok(SearchRequest {
            query: self.query.clone(),
            collection: CollectionTarget::from_names(self.collections.clone()),
            max_results: self.limit.unwrap_or(config.retrieval.max_results),
            filters: SearchFilters {
                tags: self.tags.clone(),
                note_ids: self.notes.clone(),
                updated_since,
            },
        })
    }
}

pub async fn run_search(config: &Config, args: &SearchArgs) -> Result<()> {
    if args.query.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    if !config.provider.is_enabled() {
        bail!("Search requires embeddings. Set [provider] type in config.");
    }

    let req = args.to_request(config)?;
    let provider = create_provider(&config.provider)?;
    let store = SqliteStore::open(config).await?;

    let response = retrieve(&store, provider.as_ref(), &req, &config.retrieval.params()).await;
    store.pool().close().await;
    let response = response?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&response)?);
        return Ok(());
    }

    println!("{}", response.render());
    if response.truncated {
        println!();
        println!("(context truncated to {} chars)", config.retrieval.max_context_chars);
    }
    if !response.collections_skipped.is_empty() {
        println!(
            "(skipped collections with other embedding dims: {})",
            response.collections_skipped.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> Config {
        toml::from_str("[db]\npath = \"x.sqlite\"\n[retrieval]\nmax_results = 7\n").unwrap()
    }

    #[test]
    fn test_request_from_flags() {
        let args = SearchArgs {
            query: "deploy".into(),
            collections: vec!["bear".into()],
            tags: vec!["ops".into()],
            since: Some("2024-03-01".into()),
            ..SearchArgs::default()
        };
        let req = args.to_request(&config()).unwrap();
        assert_eq!(req.collection, CollectionTarget::One("bear".into()));
        assert_eq!(req.max_results, 7);
        assert_eq!(req.filters.tags, vec!["ops".to_string()]);
        assert_eq!(
            req.filters.updated_since,
            NaiveDate::from_ymd_opt(2024, 3, 1)
        );
    }

    #[test]
    fn test_no_collection_flags_means_all() {
        let args = SearchArgs {
            query: "q".into(),
            limit: Some(2),
            ..SearchArgs::default()
        };
        let req = args.to_request(&config()).unwrap();
        assert_eq!(req.collection, CollectionTarget::All);
        assert_eq!(req.max_results, 2);
    }

    #[test]
    fn test_bad_since_is_rejected() {
        assert!(parse_since("03/01/2024").is_err());
    }
}
