//! Indexing pipeline: validate → chunk → embed → write.
//!
//! [`run_index`] is the single entry point an external trigger (CLI,
//! webhook, file watcher) calls to index a batch of raw note documents into
//! one collection.
//!
//! # Run lifecycle
//!
//! ```text
//! Pending → Validating → Chunking → Embedding → Writing → Committed
//!     └──────────┴───────────┴──────────┴──────────┴──→ Failed
//! ```
//!
//! - **Validating**: every document is checked on its own; rejects are
//!   reported, the rest continue. No valid notes fails the run.
//! - **Chunking**: notes whose content hash matches the stored one are
//!   skipped; the rest are chunked. A skipped note whose `updated_at`
//!   moved gets its stored record refreshed.
//! - **Embedding**: notes are embedded with bounded parallelism. Each note
//!   is committed (`replace_note`) as soon as its vectors arrive, so an
//!   interrupted run keeps all finished notes and the next run resumes
//!   from there.
//! - **Writing**: incremental runs prune notes that disappeared from the
//!   input; force-recreate runs promote the staged generation.
//!
//! The first run for a collection builds a staged generation and promotes
//! it once a note is committed, so a run that writes nothing leaves no
//! empty collection behind.
//!
//! The write lock is renewed before every write. A run that finds its
//! lock gone stops with `busy` and writes nothing more.
//!
//! A provider error aborts the run: notes not yet started are left
//! untouched. In force-recreate mode an abort discards the whole staged
//! build and the live collection is unchanged.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};

use futures::stream::{self, StreamExt};
use serde::Serialize;
use serde_json::Value;

use crate::chunk::{chunk_note, note_content_hash, ChunkParams};
use crate::embedding::{embed_texts, EmbeddingProvider};
use crate::error::{Error, Result};
use crate::models::{
    Chunk, CollectionHandle, CollectionSpec, CreationMode, EmbeddedChunk, NoteRecord,
};
use crate::store::{recreate_collection, VectorStore};
use crate::validate::validate_notes;

/// Options for one indexing run.
#[derive(Debug, Clone)]
pub struct IndexOptions {
    pub collection: String,
    pub description: String,
    pub params: ChunkParams,
    pub force_recreate: bool,
    /// Maximum notes embedded at the same time.
    pub concurrency: usize,
    /// Identifies this run as the holder of the collection's write lock.
    pub owner: String,
}

impl IndexOptions {
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            description: String::new(),
            params: ChunkParams::default(),
            force_recreate: false,
            concurrency: 4,
            owner: uuid::Uuid::new_v4().to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Validating,
    Chunking,
    Embedding,
    Writing,
    Committed,
    Failed,
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Committed | RunState::Failed)
    }

    pub fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        match (self, next) {
            (s, Failed) => !s.is_terminal(),
            (Pending, Validating)
            | (Validating, Chunking)
            | (Chunking, Embedding)
            | (Embedding, Writing)
            | (Writing, Committed) => true,
            _ => false,
        }
    }
}

/// A note that did not make it into the collection.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NoteFailure {
    /// The note id, or `#<index>` when the document had no readable id.
    pub note_id: String,
    pub code: &'static str,
    pub reason: String,
}

/// Why a run ended in [`RunState::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunFailure {
    pub code: &'static str,
    pub message: String,
}

impl From<&Error> for RunFailure {
    fn from(err: &Error) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
        }
    }
}

/// Outcome of one indexing run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: String,
    pub collection: String,
    pub mode: CreationMode,
    pub state: RunState,
    pub history: Vec<RunState>,
    /// Notes written by this run, in input order.
    pub committed: Vec<String>,
    /// Notes whose content hash was unchanged.
    pub skipped: Vec<String>,
    /// Notes pruned because they are no longer in the input.
    pub removed: Vec<String>,
    pub failed: Vec<NoteFailure>,
    pub chunks_written: usize,
    pub failure: Option<RunFailure>,
}

impl RunSummary {
    fn new(opts: &IndexOptions) -> Self {
        Self {
            run_id: opts.owner.clone(),
            collection: opts.collection.clone(),
            mode: if opts.force_recreate {
                CreationMode::ForceRecreate
            } else {
                CreationMode::Incremental
            },
            state: RunState::Pending,
            history: vec![RunState::Pending],
            committed: Vec::new(),
            skipped: Vec::new(),
            removed: Vec::new(),
            failed: Vec::new(),
            chunks_written: 0,
            failure: None,
        }
    }

    fn advance(&mut self, next: RunState) {
        debug_assert!(
            self.state.can_advance_to(next),
            "invalid run transition {:?} -> {:?}",
            self.state,
            next
        );
        tracing::debug!(collection = %self.collection, from = ?self.state, to = ?next, "run state");
        self.state = next;
        self.history.push(next);
    }

    fn fail(mut self, err: &Error) -> Self {
        tracing::error!(collection = %self.collection, code = err.code(), error = %err, "indexing run failed");
        self.failure = Some(RunFailure::from(err));
        self.advance(RunState::Failed);
        self
    }

    pub fn is_committed(&self) -> bool {
        self.state == RunState::Committed
    }
}

struct PendingNote {
    record: NoteRecord,
    chunks: Vec<Chunk>,
}

enum NoteOutcome {
    Committed { note_id: String, chunks: usize },
    Failed(NoteFailure),
    Aborted(Error),
    NotStarted(String),
}

#[derive(Default)]
struct NotesOutcome {
    committed: Vec<String>,
    failed: Vec<NoteFailure>,
    chunks_written: usize,
    abort: Option<Error>,
}

/// Index `raw` documents into `opts.collection`.
///
/// Returns `Err(Busy)` without touching the store when another run holds
/// the collection's write lock. Every other failure is reported in the
/// returned summary.
pub async fn run_index<S: VectorStore + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    raw: Vec<Value>,
    opts: &IndexOptions,
) -> Result<RunSummary> {
    store
        .acquire_write_lock(&opts.collection, &opts.owner)
        .await?;

    let summary = run_locked(store, provider, raw, opts).await;

    if let Err(err) = store
        .release_write_lock(&opts.collection, &opts.owner)
        .await
    {
        tracing::warn!(collection = %opts.collection, error = %err, "failed to release write lock");
    }

    tracing::info!(
        collection = %summary.collection,
        state = ?summary.state,
        committed = summary.committed.len(),
        skipped = summary.skipped.len(),
        removed = summary.removed.len(),
        failed = summary.failed.len(),
        chunks = summary.chunks_written,
        "indexing run finished"
    );
    Ok(summary)
}

async fn run_locked<S: VectorStore + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    raw: Vec<Value>,
    opts: &IndexOptions,
) -> RunSummary {
    let mut summary = RunSummary::new(opts);
    tracing::info!(
        collection = %opts.collection,
        mode = summary.mode.as_str(),
        documents = raw.len(),
        model = provider.model_name(),
        "indexing run started"
    );

    // Validating
    summary.advance(RunState::Validating);
    if let Err(msg) = opts.params.validate() {
        return summary.fail(&Error::InvalidOptions(msg));
    }
    let batch = validate_notes(raw);
    let mut rejected_ids: HashSet<String> = HashSet::new();
    for rej in batch.rejected {
        tracing::warn!(index = rej.index, note_id = ?rej.note_id, error = %rej.error, "note rejected");
        if let Some(id) = &rej.note_id {
            rejected_ids.insert(id.clone());
        }
        summary.failed.push(NoteFailure {
            note_id: rej.note_id.unwrap_or_else(|| format!("#{}", rej.index)),
            code: "validation",
            reason: rej.error.to_string(),
        });
    }
    if batch.notes.is_empty() {
        return summary.fail(&Error::NoValidNotes);
    }

    let spec = CollectionSpec {
        name: opts.collection.clone(),
        description: opts.description.clone(),
        embedding_model: provider.model_name().to_string(),
        dims: provider.dims(),
        mode: summary.mode,
    };

    // Chunking
    summary.advance(RunState::Chunking);
    let live = if opts.force_recreate {
        None
    } else {
        match store.collection_info(&opts.collection).await {
            Ok(Some(_)) => {
                let handle = match store.create_or_open_collection(&spec).await {
                    Ok(h) => h,
                    Err(err) => return summary.fail(&err),
                };
                let existing = match store.note_records(&handle).await {
                    Ok(m) => m,
                    Err(err) => return summary.fail(&err),
                };
                Some((handle, existing))
            }
            Ok(None) => None,
            Err(err) => return summary.fail(&err),
        }
    };

    let input_ids: HashSet<String> = batch.notes.iter().map(|n| n.id.clone()).collect();
    let mut pending = Vec::new();
    for note in &batch.notes {
        let record = NoteRecord {
            note_id: note.id.clone(),
            title: note.title.clone(),
            tags: note.tags.clone(),
            updated_at: note.updated_at,
            content_hash: note_content_hash(note, &opts.params),
        };
        let stored = live
            .as_ref()
            .and_then(|(handle, existing)| existing.get(&note.id).map(|s| (handle, s)))
            .filter(|(_, stored)| stored.content_hash == record.content_hash);

        let Some((handle, stored)) = stored else {
            pending.push(PendingNote {
                record,
                chunks: chunk_note(note, &opts.params),
            });
            continue;
        };

        // Same text, newer timestamp: keep the chunks, refresh the row the
        // `updated_since` filter reads.
        if stored.updated_at != record.updated_at {
            if let Err(err) = renew_lock(store, opts).await {
                return summary.fail(&err);
            }
            if let Err(err) = store.update_note_record(handle, &record).await {
                tracing::warn!(note_id = %note.id, error = %err, "note record refresh failed");
                summary.failed.push(NoteFailure {
                    note_id: note.id.clone(),
                    code: err.code(),
                    reason: format!("record refresh failed: {err}"),
                });
                continue;
            }
            tracing::debug!(note_id = %note.id, "refreshed note record");
        }
        summary.skipped.push(note.id.clone());
    }
    tracing::debug!(
        collection = %opts.collection,
        changed = pending.len(),
        unchanged = summary.skipped.len(),
        "change detection done"
    );

    // Embedding (with per-note commits)
    summary.advance(RunState::Embedding);

    match live {
        Some((handle, existing)) => {
            let outcome = commit_notes(store, provider, &handle, pending, opts).await;
            summary.committed = outcome.committed;
            summary.failed.extend(outcome.failed);
            summary.chunks_written = outcome.chunks_written;
            if let Some(err) = outcome.abort {
                return summary.fail(&err);
            }

            // Writing: prune notes that left the source set. Notes rejected
            // by validation keep their previous chunks.
            summary.advance(RunState::Writing);
            let mut gone: Vec<&String> = existing
                .keys()
                .filter(|id| !input_ids.contains(*id) && !rejected_ids.contains(*id))
                .collect();
            gone.sort();
            for note_id in gone {
                if let Err(err) = renew_lock(store, opts).await {
                    return summary.fail(&err);
                }
                match store.delete_by_source(&handle, note_id).await {
                    Ok(chunks) => {
                        tracing::debug!(note_id = %note_id, chunks, "pruned note");
                        summary.removed.push(note_id.clone());
                    }
                    Err(err) => summary.failed.push(NoteFailure {
                        note_id: note_id.clone(),
                        code: err.code(),
                        reason: format!("prune failed: {err}"),
                    }),
                }
            }
        }
        None if opts.force_recreate => {
            let mut outcome = NotesOutcome::default();
            let slot = &mut outcome;
            let rebuilt = recreate_collection(store, &spec, |staged| async move {
                *slot = commit_notes(store, provider, &staged, pending, opts).await;
                match &slot.abort {
                    Some(err) => Err(err.clone()),
                    None => renew_lock(store, opts).await,
                }
            })
            .await;

            summary.failed.extend(outcome.failed);
            match rebuilt {
                Ok(_) => {
                    summary.committed = outcome.committed;
                    summary.chunks_written = outcome.chunks_written;
                    summary.advance(RunState::Writing);
                }
                Err(err) => return summary.fail(&err),
            }
        }
        None => {
            // First build: the collection stays invisible until at least
            // one note is committed.
            let staged = match store.stage_collection(&spec).await {
                Ok(h) => h,
                Err(err) => return summary.fail(&err),
            };
            let outcome = commit_notes(store, provider, &staged, pending, opts).await;
            summary.failed.extend(outcome.failed);

            if outcome.committed.is_empty() {
                discard_quietly(store, &staged).await;
                let err = outcome
                    .abort
                    .unwrap_or_else(|| Error::store("no note could be written"));
                return summary.fail(&err);
            }

            // Committed notes are published even when the run aborted, so the
            // next run resumes from them.
            let promoted = match renew_lock(store, opts).await {
                Ok(()) => store.promote_staged(&staged).await.map(|_| ()),
                Err(err) => Err(err),
            };
            if let Err(err) = promoted {
                discard_quietly(store, &staged).await;
                return summary.fail(&err);
            }
            summary.committed = outcome.committed;
            summary.chunks_written = outcome.chunks_written;
            tracing::info!(collection = %opts.collection, "created collection");

            if let Some(err) = outcome.abort {
                return summary.fail(&err);
            }
            summary.advance(RunState::Writing);
        }
    }

    summary.advance(RunState::Committed);
    summary
}

async fn renew_lock<S: VectorStore + ?Sized>(store: &S, opts: &IndexOptions) -> Result<()> {
    store.renew_write_lock(&opts.collection, &opts.owner).await
}

async fn discard_quietly<S: VectorStore + ?Sized>(store: &S, staged: &CollectionHandle) {
    if let Err(err) = store.discard_staged(staged).await {
        tracing::warn!(collection = %staged.name, error = %err, "failed to discard staged generation");
    }
}

/// Embed and commit each pending note, at most `opts.concurrency` at a time.
async fn commit_notes<S: VectorStore + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    handle: &CollectionHandle,
    pending: Vec<PendingNote>,
    opts: &IndexOptions,
) -> NotesOutcome {
    let aborted = AtomicBool::new(false);
    let aborted = &aborted;

    let mut results: Vec<(usize, NoteOutcome)> = stream::iter(pending.into_iter().enumerate())
        .map(|(i, note)| async move {
            (i, commit_note(store, provider, handle, note, opts, aborted).await)
        })
        .buffer_unordered(opts.concurrency.max(1))
        .collect()
        .await;
    results.sort_by_key(|(i, _)| *i);

    let mut outcome = NotesOutcome::default();
    let mut not_started = Vec::new();
    for (_, result) in results {
        match result {
            NoteOutcome::Committed { note_id, chunks } => {
                outcome.committed.push(note_id);
                outcome.chunks_written += chunks;
            }
            NoteOutcome::Failed(failure) => outcome.failed.push(failure),
            NoteOutcome::Aborted(err) => {
                if outcome.abort.is_none() {
                    outcome.abort = Some(err);
                }
            }
            NoteOutcome::NotStarted(note_id) => not_started.push(note_id),
        }
    }

    if let Some(err) = &outcome.abort {
        outcome.failed.extend(not_started.into_iter().map(|note_id| NoteFailure {
            note_id,
            code: err.code(),
            reason: "not indexed: run aborted".to_string(),
        }));
    }
    outcome
}

async fn commit_note<S: VectorStore + ?Sized>(
    store: &S,
    provider: &dyn EmbeddingProvider,
    handle: &CollectionHandle,
    note: PendingNote,
    opts: &IndexOptions,
    aborted: &AtomicBool,
) -> NoteOutcome {
    let note_id = note.record.note_id.clone();
    if aborted.load(Ordering::SeqCst) {
        return NoteOutcome::NotStarted(note_id);
    }

    let texts: Vec<String> = note.chunks.iter().map(|c| c.text.clone()).collect();
    let vectors = match embed_texts(provider, &texts).await {
        Ok(v) => v,
        Err(err) => {
            aborted.store(true, Ordering::SeqCst);
            tracing::error!(note_id = %note_id, error = %err, "embedding failed, aborting run");
            return NoteOutcome::Aborted(Error::Provider(err));
        }
    };

    // A run that lost its lease must not write.
    if let Err(err) = renew_lock(store, opts).await {
        aborted.store(true, Ordering::SeqCst);
        tracing::error!(note_id = %note_id, error = %err, "write lock lost, aborting run");
        return NoteOutcome::Aborted(err);
    }

    let embedded: Vec<EmbeddedChunk> = note
        .chunks
        .into_iter()
        .zip(vectors)
        .map(|(chunk, vector)| EmbeddedChunk { chunk, vector })
        .collect();

    match store.replace_note(handle, &note.record, &embedded).await {
        Ok(()) => {
            tracing::debug!(note_id = %note_id, chunks = embedded.len(), "committed note");
            NoteOutcome::Committed {
                note_id,
                chunks: embedded.len(),
            }
        }
        Err(err) => {
            tracing::warn!(note_id = %note_id, error = %err, "note commit failed");
            NoteOutcome::Failed(NoteFailure {
                note_id,
                code: err.code(),
                reason: err.to_string(),
            })
        }
    }
}
