//! Core data models shared by the pipeline, the stores, and the server.
//!
//! These types represent the notes, chunks, collections, and search hits
//! that flow through indexing and retrieval.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// A validated note document, as produced by an extractor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub content: String,
    #[serde(default)]
    pub tags: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

/// Where a chunk sits inside its note.
///
/// Offsets count chars, not bytes; `char_end` is exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkPosition {
    pub index: usize,
    pub char_start: usize,
    pub char_end: usize,
}

impl ChunkPosition {
    /// True when the two char ranges share at least one char.
    pub fn overlaps(&self, other: &ChunkPosition) -> bool {
        self.char_start < other.char_end && other.char_start < self.char_end
    }
}

/// A slice of a note's text; the unit of embedding and retrieval.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    /// Deterministic id derived from note id, index, and text hash.
    pub id: String,
    pub note_id: String,
    pub position: ChunkPosition,
    pub text: String,
    /// SHA-256 hex of `text`.
    pub hash: String,
}

/// Note-level fields copied onto every stored chunk so a search hit can
/// be cited and filtered without a second lookup.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NoteRecord {
    pub note_id: String,
    pub title: String,
    pub tags: Vec<String>,
    pub updated_at: DateTime<Utc>,
    /// Hash over title, content, tags, and chunking parameters.
    pub content_hash: String,
}

/// A chunk paired with its vector, ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedChunk {
    pub chunk: Chunk,
    pub vector: Vec<f32>,
}

/// How a collection's current generation was built.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CreationMode {
    Incremental,
    ForceRecreate,
}

impl CreationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreationMode::Incremental => "incremental",
            CreationMode::ForceRecreate => "force_recreate",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "incremental" => Some(CreationMode::Incremental),
            "force_recreate" => Some(CreationMode::ForceRecreate),
            _ => None,
        }
    }
}

/// What a caller asks for when opening or recreating a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSpec {
    pub name: String,
    pub description: String,
    pub embedding_model: String,
    pub dims: usize,
    pub mode: CreationMode,
}

/// Write handle for one generation of a collection.
///
/// Live handles come from `create_or_open_collection`; staged handles from
/// `stage_collection`. Writes go to `generation`, which readers cannot see
/// until the handle's generation is the one the collection name points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionHandle {
    pub name: String,
    pub generation: String,
    pub dims: usize,
    pub staged: bool,
}

/// Collection metadata as reported by the registry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CollectionInfo {
    pub name: String,
    pub description: String,
    pub embedding_model: String,
    pub dims: usize,
    pub mode: CreationMode,
    pub note_count: usize,
    pub chunk_count: usize,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Optional restrictions applied inside a collection query.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SearchFilters {
    /// Keep chunks whose note carries at least one of these tags.
    #[serde(default)]
    pub tags: Vec<String>,
    /// Keep chunks belonging to one of these notes.
    #[serde(default)]
    pub note_ids: Vec<String>,
    /// Keep chunks whose note was updated on or after this date.
    #[serde(default)]
    pub updated_since: Option<NaiveDate>,
}

impl SearchFilters {
    pub fn is_empty(&self) -> bool {
        self.tags.is_empty() && self.note_ids.is_empty() && self.updated_since.is_none()
    }

    /// Evaluate the filters against a stored note's fields.
    pub fn matches(&self, note_id: &str, tags: &[String], updated_at: DateTime<Utc>) -> bool {
        if !self.note_ids.is_empty() && !self.note_ids.iter().any(|n| n == note_id) {
            return false;
        }
        if !self.tags.is_empty() && !self.tags.iter().any(|t| tags.contains(t)) {
            return false;
        }
        if let Some(since) = self.updated_since {
            if updated_at.date_naive() < since {
                return false;
            }
        }
        true
    }
}

/// One hit from a single collection query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchResult {
    pub chunk_id: String,
    pub collection: String,
    pub note_id: String,
    pub note_title: String,
    pub position: ChunkPosition,
    pub text: String,
    /// Cosine similarity in `[-1.0, 1.0]`.
    pub score: f64,
}
