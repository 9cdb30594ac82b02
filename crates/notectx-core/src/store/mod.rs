//! Vector store abstraction for notectx.
//!
//! The [`VectorStore`] trait defines every storage operation the indexing
//! pipeline and the retrieval engine need, so the SQLite backend in the
//! application crate and the [`memory::InMemoryStore`] used by tests are
//! interchangeable.
//!
//! # Generations
//!
//! A collection name points at exactly one *generation*, the physical set
//! of chunk rows readers see. Incremental runs write into the live
//! generation note by note. A force-recreate run builds a staged generation
//! next to it and [`recreate_collection`] repoints the name in one step, so
//! readers observe either the old collection or the new one, never a mix.
//!
//! # Concurrency
//!
//! Writers are serialized per collection with
//! [`acquire_write_lock`](VectorStore::acquire_write_lock). A running writer
//! calls [`renew_write_lock`](VectorStore::renew_write_lock) before every
//! write, so a lease-based backend never mistakes a long run for an
//! abandoned one. Readers take no collection lock and may see state that is
//! one note behind a running writer.

pub mod memory;

use std::collections::HashMap;
use std::future::Future;

use async_trait::async_trait;

use crate::error::Result;
use crate::models::{
    CollectionHandle, CollectionInfo, CollectionSpec, EmbeddedChunk, NoteRecord, SearchFilters,
    SearchResult,
};

/// Abstract storage backend for collections of embedded chunks.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`create_or_open_collection`](VectorStore::create_or_open_collection) | Open the live generation, creating the collection if needed |
/// | [`upsert_chunks`](VectorStore::upsert_chunks) | Insert or replace chunks by id |
/// | [`replace_note`](VectorStore::replace_note) | Swap one note's chunk set and bookkeeping in one transaction |
/// | [`delete_by_source`](VectorStore::delete_by_source) | Remove every chunk of a note |
/// | [`note_records`](VectorStore::note_records) | Bookkeeping rows for change detection |
/// | [`query`](VectorStore::query) | Top-k cosine similarity search |
/// | [`stage_collection`](VectorStore::stage_collection) | Start an isolated rebuild |
/// | [`promote_staged`](VectorStore::promote_staged) | Atomically repoint the collection at a staged build |
/// | [`acquire_write_lock`](VectorStore::acquire_write_lock) | Per-collection writer exclusion |
#[async_trait]
pub trait VectorStore: Send + Sync {
    /// Open the live generation of `spec.name`, creating the collection when
    /// it does not exist.
    ///
    /// Fails with `DimensionMismatch` when the stored dims differ from
    /// `spec.dims`; changing dims requires [`recreate_collection`].
    async fn create_or_open_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle>;

    /// Metadata for one collection, or `None` when it does not exist.
    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>>;

    /// Every live collection, ordered by name.
    async fn list_collections(&self) -> Result<Vec<CollectionInfo>>;

    /// Insert chunks, replacing any existing chunk with the same id.
    async fn upsert_chunks(&self, handle: &CollectionHandle, chunks: &[EmbeddedChunk])
        -> Result<()>;

    /// Replace all chunks of `record.note_id` with `chunks` and store the
    /// note's bookkeeping row, atomically.
    async fn replace_note(
        &self,
        handle: &CollectionHandle,
        record: &NoteRecord,
        chunks: &[EmbeddedChunk],
    ) -> Result<()>;

    /// Remove every chunk belonging to `note_id`. Returns the number of
    /// chunks removed.
    async fn delete_by_source(&self, handle: &CollectionHandle, note_id: &str) -> Result<usize>;

    /// Note id → bookkeeping row for every note indexed in the generation.
    async fn note_records(&self, handle: &CollectionHandle) -> Result<HashMap<String, NoteRecord>>;

    /// Overwrite an indexed note's bookkeeping row, leaving its chunks as
    /// they are. Unknown notes are ignored.
    async fn update_note_record(&self, handle: &CollectionHandle, record: &NoteRecord)
        -> Result<()>;

    /// Top-`k` chunks of the live generation of `collection` by cosine
    /// similarity to `vector`, best first.
    ///
    /// Fails with `NotFound` for an unknown collection and with
    /// `DimensionMismatch` when `vector` has the wrong length.
    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>>;

    /// Create an empty generation for `spec.name` that readers cannot see.
    async fn stage_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle>;

    /// Point the collection at a staged generation and drop the previous one.
    ///
    /// The promoted collection reports the creation mode of the spec it was
    /// staged with. Fails for a handle that is not staged.
    async fn promote_staged(&self, handle: &CollectionHandle) -> Result<CollectionInfo>;

    /// Drop a staged generation without touching the live one.
    async fn discard_staged(&self, handle: &CollectionHandle) -> Result<()>;

    /// Take the collection's writer lock for `owner`, or fail with `Busy`.
    async fn acquire_write_lock(&self, collection: &str, owner: &str) -> Result<()>;

    /// Confirm `owner` still holds the writer lock and extend its lease.
    ///
    /// Fails with `Busy` when the lock was released or taken over.
    async fn renew_write_lock(&self, collection: &str, owner: &str) -> Result<()>;

    /// Release the writer lock if `owner` holds it.
    async fn release_write_lock(&self, collection: &str, owner: &str) -> Result<()>;
}

/// Rebuild a collection in isolation and swap it in.
///
/// `build` receives a staged handle and fills it. When it returns `Ok` the
/// staged generation is promoted; on `Err` it is discarded and the live
/// collection is left exactly as it was.
pub async fn recreate_collection<S, F, Fut, T>(
    store: &S,
    spec: &CollectionSpec,
    build: F,
) -> Result<(CollectionInfo, T)>
where
    S: VectorStore + ?Sized,
    F: FnOnce(CollectionHandle) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let staged = store.stage_collection(spec).await?;
    match build(staged.clone()).await {
        Ok(value) => {
            let info = store.promote_staged(&staged).await?;
            tracing::info!(
                collection = %info.name,
                chunks = info.chunk_count,
                "promoted rebuilt collection"
            );
            Ok((info, value))
        }
        Err(err) => {
            if let Err(discard_err) = store.discard_staged(&staged).await {
                tracing::warn!(
                    collection = %spec.name,
                    error = %discard_err,
                    "failed to discard staged generation"
                );
            }
            Err(err)
        }
    }
}
