//! In-memory [`VectorStore`] implementation for tests and embedding hosts.
//!
//! Every generation is an `Arc<RwLock<Generation>>`; the collection map
//! holds the name → generation pointer. A query clones the current `Arc`
//! and reads from it, so promoting a staged build never disturbs a query
//! already in flight. Vector search is brute-force cosine similarity.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::embedding::cosine_similarity;
use crate::error::{Error, Result};
use crate::models::{
    Chunk, CollectionHandle, CollectionInfo, CollectionSpec, CreationMode, EmbeddedChunk,
    NoteRecord, SearchFilters, SearchResult,
};
use crate::retrieval::compare_results;

use super::VectorStore;

struct StoredChunk {
    chunk: Chunk,
    vector: Vec<f32>,
}

struct Generation {
    name: String,
    description: String,
    embedding_model: String,
    dims: usize,
    mode: CreationMode,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    notes: BTreeMap<String, NoteRecord>,
    chunks: BTreeMap<String, StoredChunk>,
}

impl Generation {
    fn new(spec: &CollectionSpec) -> Self {
        let now = Utc::now();
        Self {
            name: spec.name.clone(),
            description: spec.description.clone(),
            embedding_model: spec.embedding_model.clone(),
            dims: spec.dims,
            mode: spec.mode,
            created_at: now,
            updated_at: now,
            notes: BTreeMap::new(),
            chunks: BTreeMap::new(),
        }
    }

    fn info(&self) -> CollectionInfo {
        CollectionInfo {
            name: self.name.clone(),
            description: self.description.clone(),
            embedding_model: self.embedding_model.clone(),
            dims: self.dims,
            mode: self.mode,
            note_count: self.notes.len(),
            chunk_count: self.chunks.len(),
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }

    fn check_dims(&self, chunks: &[EmbeddedChunk]) -> Result<()> {
        match chunks.iter().find(|c| c.vector.len() != self.dims) {
            Some(bad) => Err(Error::DimensionMismatch {
                collection: self.name.clone(),
                stored: self.dims,
                requested: bad.vector.len(),
            }),
            None => Ok(()),
        }
    }

    fn insert(&mut self, chunks: &[EmbeddedChunk]) {
        for ec in chunks {
            self.chunks.insert(
                ec.chunk.id.clone(),
                StoredChunk {
                    chunk: ec.chunk.clone(),
                    vector: ec.vector.clone(),
                },
            );
        }
        self.updated_at = Utc::now();
    }

    fn remove_note_chunks(&mut self, note_id: &str) -> usize {
        let before = self.chunks.len();
        self.chunks.retain(|_, sc| sc.chunk.note_id != note_id);
        before - self.chunks.len()
    }
}

type GenerationRef = Arc<RwLock<Generation>>;

#[derive(Default)]
struct State {
    /// Collection name → live generation id.
    live: HashMap<String, String>,
    generations: HashMap<String, GenerationRef>,
    /// Collection name → owner of its writer lock.
    locks: HashMap<String, String>,
}

impl State {
    fn live_generation(&self, name: &str) -> Option<GenerationRef> {
        self.live
            .get(name)
            .and_then(|id| self.generations.get(id))
            .cloned()
    }
}

/// In-memory vector store.
#[derive(Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn read_state(&self) -> Result<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(Error::store)
    }

    fn write_state(&self) -> Result<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(Error::store)
    }

    fn generation(&self, handle: &CollectionHandle) -> Result<GenerationRef> {
        self.read_state()?
            .generations
            .get(&handle.generation)
            .cloned()
            .ok_or_else(|| Error::NotFound {
                collection: handle.name.clone(),
            })
    }
}

fn read_gen(generation: &GenerationRef) -> Result<RwLockReadGuard<'_, Generation>> {
    generation.read().map_err(Error::store)
}

fn write_gen(generation: &GenerationRef) -> Result<RwLockWriteGuard<'_, Generation>> {
    generation.write().map_err(Error::store)
}

#[async_trait]
impl VectorStore for InMemoryStore {
    async fn create_or_open_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle> {
        let mut state = self.write_state()?;

        if let Some(id) = state.live.get(&spec.name).cloned() {
            if let Some(existing) = state.generations.get(&id) {
                let mut g = write_gen(existing)?;
                if g.dims != spec.dims {
                    return Err(Error::DimensionMismatch {
                        collection: spec.name.clone(),
                        stored: g.dims,
                        requested: spec.dims,
                    });
                }
                if !spec.description.is_empty() {
                    g.description = spec.description.clone();
                }
                return Ok(CollectionHandle {
                    name: spec.name.clone(),
                    generation: id,
                    dims: g.dims,
                    staged: false,
                });
            }
        }

        let id = uuid::Uuid::new_v4().to_string();
        state
            .generations
            .insert(id.clone(), Arc::new(RwLock::new(Generation::new(spec))));
        state.live.insert(spec.name.clone(), id.clone());
        tracing::debug!(collection = %spec.name, dims = spec.dims, "created collection");

        Ok(CollectionHandle {
            name: spec.name.clone(),
            generation: id,
            dims: spec.dims,
            staged: false,
        })
    }

    async fn collection_info(&self, name: &str) -> Result<Option<CollectionInfo>> {
        let generation = self.read_state()?.live_generation(name);
        match generation {
            Some(g) => Ok(Some(read_gen(&g)?.info())),
            None => Ok(None),
        }
    }

    async fn list_collections(&self) -> Result<Vec<CollectionInfo>> {
        let live: Vec<GenerationRef> = {
            let state = self.read_state()?;
            state
                .live
                .keys()
                .filter_map(|name| state.live_generation(name))
                .collect()
        };
        let mut infos = live
            .iter()
            .map(|g| read_gen(g).map(|g| g.info()))
            .collect::<Result<Vec<_>>>()?;
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(infos)
    }

    async fn upsert_chunks(
        &self,
        handle: &CollectionHandle,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let generation = self.generation(handle)?;
        let mut g = write_gen(&generation)?;
        g.check_dims(chunks)?;
        g.insert(chunks);
        Ok(())
    }

    async fn replace_note(
        &self,
        handle: &CollectionHandle,
        record: &NoteRecord,
        chunks: &[EmbeddedChunk],
    ) -> Result<()> {
        let generation = self.generation(handle)?;
        let mut g = write_gen(&generation)?;
        g.check_dims(chunks)?;
        g.remove_note_chunks(&record.note_id);
        g.insert(chunks);
        g.notes.insert(record.note_id.clone(), record.clone());
        Ok(())
    }

    async fn delete_by_source(&self, handle: &CollectionHandle, note_id: &str) -> Result<usize> {
        let generation = self.generation(handle)?;
        let mut g = write_gen(&generation)?;
        let removed = g.remove_note_chunks(note_id);
        g.notes.remove(note_id);
        g.updated_at = Utc::now();
        Ok(removed)
    }

    async fn note_records(&self, handle: &CollectionHandle) -> Result<HashMap<String, NoteRecord>> {
        let generation = self.generation(handle)?;
        let g = read_gen(&generation)?;
        Ok(g.notes
            .values()
            .map(|r| (r.note_id.clone(), r.clone()))
            .collect())
    }

    async fn update_note_record(
        &self,
        handle: &CollectionHandle,
        record: &NoteRecord,
    ) -> Result<()> {
        let generation = self.generation(handle)?;
        let mut g = write_gen(&generation)?;
        if let Some(stored) = g.notes.get_mut(&record.note_id) {
            *stored = record.clone();
        }
        Ok(())
    }

    async fn query(
        &self,
        collection: &str,
        vector: &[f32],
        k: usize,
        filters: &SearchFilters,
    ) -> Result<Vec<SearchResult>> {
        let generation =
            self.read_state()?
                .live_generation(collection)
                .ok_or_else(|| Error::NotFound {
                    collection: collection.to_string(),
                })?;
        let g = read_gen(&generation)?;

        if vector.len() != g.dims {
            return Err(Error::DimensionMismatch {
                collection: collection.to_string(),
                stored: g.dims,
                requested: vector.len(),
            });
        }

        let mut results: Vec<SearchResult> = g
            .chunks
            .values()
            .filter_map(|sc| {
                let note = g.notes.get(&sc.chunk.note_id);
                if !filters.is_empty() {
                    let (tags, updated_at) = match note {
                        Some(n) => (n.tags.as_slice(), n.updated_at),
                        None => (&[][..], DateTime::<Utc>::default()),
                    };
                    if !filters.matches(&sc.chunk.note_id, tags, updated_at) {
                        return None;
                    }
                }
                Some(SearchResult {
                    chunk_id: sc.chunk.id.clone(),
                    collection: collection.to_string(),
                    note_id: sc.chunk.note_id.clone(),
                    note_title: note.map(|n| n.title.clone()).unwrap_or_default(),
                    position: sc.chunk.position,
                    text: sc.chunk.text.clone(),
                    score: cosine_similarity(vector, &sc.vector) as f64,
                })
            })
            .collect();

        results.sort_by(compare_results);
        results.truncate(k);
        Ok(results)
    }

    async fn stage_collection(&self, spec: &CollectionSpec) -> Result<CollectionHandle> {
        let id = uuid::Uuid::new_v4().to_string();
        self.write_state()?
            .generations
            .insert(id.clone(), Arc::new(RwLock::new(Generation::new(spec))));
        Ok(CollectionHandle {
            name: spec.name.clone(),
            generation: id,
            dims: spec.dims,
            staged: true,
        })
    }

    async fn promote_staged(&self, handle: &CollectionHandle) -> Result<CollectionInfo> {
        if !handle.staged {
            return Err(Error::store(format!(
                "cannot promote the live generation of {}",
                handle.name
            )));
        }
        let mut state = self.write_state()?;
        let staged = state
            .generations
            .get(&handle.generation)
            .cloned()
            .ok_or_else(|| Error::store(format!("unknown staged generation for {}", handle.name)))?;

        let previous = state.live.insert(handle.name.clone(), handle.generation.clone());
        let mut g = write_gen(&staged)?;
        if let Some(old_id) = previous.filter(|id| *id != handle.generation) {
            if let Some(old) = state.generations.remove(&old_id) {
                g.created_at = read_gen(&old)?.created_at;
            }
        }
        g.updated_at = Utc::now();
        Ok(g.info())
    }

    async fn discard_staged(&self, handle: &CollectionHandle) -> Result<()> {
        if !handle.staged {
            return Ok(());
        }
        let mut state = self.write_state()?;
        if state.live.get(&handle.name) != Some(&handle.generation) {
            state.generations.remove(&handle.generation);
        }
        Ok(())
    }

    async fn acquire_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        let mut state = self.write_state()?;
        match state.locks.get(collection) {
            Some(holder) if holder != owner => Err(Error::Busy {
                collection: collection.to_string(),
            }),
            _ => {
                state
                    .locks
                    .insert(collection.to_string(), owner.to_string());
                Ok(())
            }
        }
    }

    async fn renew_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        let state = self.read_state()?;
        if state.locks.get(collection).map(String::as_str) == Some(owner) {
            Ok(())
        } else {
            Err(Error::Busy {
                collection: collection.to_string(),
            })
        }
    }

    async fn release_write_lock(&self, collection: &str, owner: &str) -> Result<()> {
        let mut state = self.write_state()?;
        if state.locks.get(collection).map(String::as_str) == Some(owner) {
            state.locks.remove(collection);
        }
        Ok(())
    }
}
