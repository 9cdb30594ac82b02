//! Context retrieval and assembly.
//!
//! # Algorithm
//!
//! 1. Resolve the request's target collections through the registry.
//! 2. Embed the query once.
//! 3. Query every compatible collection for `max(max_results, candidate_k)`
//!    candidates.
//! 4. Merge and sort with [`compare_results`]: score (desc), note id,
//!    chunk index (asc), collection, chunk id.
//! 5. Drop chunks whose char range overlaps a better-ranked chunk of the
//!    same note in the same collection.
//! 6. Keep `max_results` and assemble greedily under the character budget.
//!
//! Similarity search is approximate in spirit, but the ordering above is a
//! total order, so equal inputs always produce identical responses.

use std::cmp::Ordering;

use futures::future::join_all;
use serde::{Deserialize, Serialize};

use crate::embedding::{embed_query, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{ChunkPosition, SearchFilters, SearchResult};
use crate::registry::{CollectionRegistry, CollectionTarget};
use crate::store::VectorStore;

pub const DEFAULT_MAX_RESULTS: usize = 5;
pub const DEFAULT_CANDIDATE_K: usize = 20;
pub const DEFAULT_MAX_CONTEXT_CHARS: usize = 6000;

fn default_max_results() -> usize {
    DEFAULT_MAX_RESULTS
}

/// A search request as received from the CLI or a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub collection: CollectionTarget,
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    #[serde(default)]
    pub filters: SearchFilters,
}

impl SearchRequest {
    pub fn new(query: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            collection: CollectionTarget::All,
            max_results: DEFAULT_MAX_RESULTS,
            filters: SearchFilters::default(),
        }
    }
}

/// Retrieval tuning, decoupled from application config.
#[derive(Debug, Clone, Copy)]
pub struct RetrievalParams {
    /// Minimum candidates fetched per collection before deduplication.
    pub candidate_k: usize,
    /// Character budget for the assembled context.
    pub max_context_chars: usize,
}

impl Default for RetrievalParams {
    fn default() -> Self {
        Self {
            candidate_k: DEFAULT_CANDIDATE_K,
            max_context_chars: DEFAULT_MAX_CONTEXT_CHARS,
        }
    }
}

/// One cited piece of context.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextItem {
    pub text: String,
    pub score: f64,
    pub note_id: String,
    pub note_title: String,
    pub collection: String,
    pub chunk_position: ChunkPosition,
    pub chunk_id: String,
}

/// The assembled answer to a [`SearchRequest`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextResponse {
    pub query: String,
    pub items: Vec<ContextItem>,
    /// Sum of item text lengths, in chars.
    pub total_chars: usize,
    /// True when the character budget cut or shortened results.
    pub truncated: bool,
    pub collections_searched: Vec<String>,
    /// Collections skipped because their dims differ from the query vector.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub collections_skipped: Vec<String>,
}

impl ContextResponse {
    fn empty(query: &str) -> Self {
        Self {
            query: query.to_string(),
            items: Vec::new(),
            total_chars: 0,
            truncated: false,
            collections_searched: Vec::new(),
            collections_skipped: Vec::new(),
        }
    }

    /// Render the items as a plain-text context block with one citation
    /// header per item.
    pub fn render(&self) -> String {
        if self.items.is_empty() {
            return format!("No results for \"{}\".", self.query);
        }
        let mut out = String::new();
        for (i, item) in self.items.iter().enumerate() {
            if i > 0 {
                out.push_str("\n\n");
            }
            let title = if item.note_title.is_empty() {
                item.note_id.as_str()
            } else {
                item.note_title.as_str()
            };
            out.push_str(&format!(
                "[{}] {} (collection: {}, note: {}, chunk {}, chars {}..{}, score {:.3})\n{}",
                i + 1,
                title,
                item.collection,
                item.note_id,
                item.chunk_position.index,
                item.chunk_position.char_start,
                item.chunk_position.char_end,
                item.score,
                item.text
            ));
        }
        out
    }
}

/// Total order used for every ranked list.
///
/// Equal scores keep a note's chunks together in reading order.
pub fn compare_results(a: &SearchResult, b: &SearchResult) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.note_id.cmp(&b.note_id))
        .then(a.position.index.cmp(&b.position.index))
        .then_with(|| a.collection.cmp(&b.collection))
        .then_with(|| a.chunk_id.cmp(&b.chunk_id))
}

/// Merge per-collection result lists into one ranked list.
pub fn rank_results(lists: Vec<Vec<SearchResult>>) -> Vec<SearchResult> {
    let mut merged: Vec<SearchResult> = lists.into_iter().flatten().collect();
    merged.sort_by(compare_results);
    merged
}

/// Drop every chunk whose char range overlaps a better-ranked chunk of the
/// same note in the same collection. `ranked` must already be in rank order.
///
/// A note indexed into two collections can appear once per collection.
pub fn dedup_overlapping(ranked: Vec<SearchResult>) -> Vec<SearchResult> {
    let mut kept: Vec<SearchResult> = Vec::with_capacity(ranked.len());
    for candidate in ranked {
        let shadowed = kept.iter().any(|k| {
            k.note_id == candidate.note_id
                && k.collection == candidate.collection
                && k.position.overlaps(&candidate.position)
        });
        if !shadowed {
            kept.push(candidate);
        }
    }
    kept
}

/// Greedy assembly under `budget` chars.
///
/// Items are taken in order until one does not fit. A first item that alone
/// exceeds the budget is cut to the budget.
pub fn assemble(ranked: Vec<SearchResult>, budget: usize) -> (Vec<ContextItem>, usize, bool) {
    let mut items = Vec::new();
    let mut total = 0usize;
    let mut truncated = false;

    for result in ranked {
        let len = result.text.chars().count();
        if total + len <= budget {
            total += len;
            items.push(to_item(result, None));
            continue;
        }
        truncated = true;
        if items.is_empty() && budget > 0 {
            total = budget;
            items.push(to_item(result, Some(budget)));
        }
        break;
    }

    (items, total, truncated)
}

fn to_item(result: SearchResult, cut_to: Option<usize>) -> ContextItem {
    let text = match cut_to {
        Some(limit) => result.text.chars().take(limit).collect(),
        None => result.text,
    };
    ContextItem {
        text,
        score: result.score,
        note_id: result.note_id,
        note_title: result.note_title,
        collection: result.collection,
        chunk_position: result.position,
        chunk_id: result.chunk_id,
    }
}

/// Answer a search request against `store`.
///
/// Collections whose dims differ from the provider's are skipped with a
/// warning; if every target is skipped the call fails with
/// `DimensionMismatch`.
pub async fn retrieve<S: VectorStore + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    req: &SearchRequest,
    params: &RetrievalParams,
) -> Result<ContextResponse> {
    if req.query.trim().is_empty() {
        return Ok(ContextResponse::empty(&req.query));
    }

    let targets = CollectionRegistry::new(store).resolve(&req.collection).await?;
    if targets.is_empty() {
        return Ok(ContextResponse::empty(&req.query));
    }

    let query_vec = embed_query(provider, &req.query).await?;
    let max_results = req.max_results.max(1);
    let k = max_results.max(params.candidate_k);

    let mut skipped = Vec::new();
    let mut compatible = Vec::new();
    for info in &targets {
        if info.dims == query_vec.len() {
            compatible.push(info.name.clone());
        } else {
            tracing::warn!(
                collection = %info.name,
                stored = info.dims,
                requested = query_vec.len(),
                "skipping collection with incompatible embedding dims"
            );
            skipped.push(info.name.clone());
        }
    }

    let outcomes = join_all(
        compatible
            .iter()
            .map(|name| store.query(name, &query_vec, k, &req.filters)),
    )
    .await;

    let mut searched = Vec::new();
    let mut lists = Vec::new();
    let mut first_mismatch = None;
    for (name, outcome) in compatible.into_iter().zip(outcomes) {
        match outcome {
            Ok(hits) => {
                searched.push(name);
                lists.push(hits);
            }
            // The collection was recreated with other dims between listing
            // and querying.
            Err(err @ Error::DimensionMismatch { .. }) => {
                tracing::warn!(collection = %name, error = %err, "skipping collection");
                first_mismatch.get_or_insert(err);
                skipped.push(name);
            }
            Err(err) => return Err(err),
        }
    }

    if searched.is_empty() {
        return Err(first_mismatch.unwrap_or_else(|| Error::DimensionMismatch {
            collection: targets[0].name.clone(),
            stored: targets[0].dims,
            requested: query_vec.len(),
        }));
    }

    let mut ranked = dedup_overlapping(rank_results(lists));
    ranked.truncate(max_results);
    let (items, total_chars, truncated) = assemble(ranked, params.max_context_chars);

    tracing::debug!(
        query = %req.query,
        collections = searched.len(),
        items = items.len(),
        total_chars,
        "assembled context"
    );

    Ok(ContextResponse {
        query: req.query.clone(),
        items,
        total_chars,
        truncated,
        collections_searched: searched,
        collections_skipped: skipped,
    })
}
