//! # notectx core
//!
//! Runtime-agnostic logic for notectx: note validation, chunking, the
//! embedding provider trait, the vector store trait with an in-memory
//! backend, the collection registry, the indexing pipeline, and context
//! retrieval/assembly.
//!
//! This crate contains no sqlx, HTTP client, or filesystem I/O. The
//! application crate supplies a SQLite store and HTTP embedding providers
//! through the [`store::VectorStore`] and [`embedding::EmbeddingProvider`]
//! traits.

pub mod chunk;
pub mod embedding;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod registry;
pub mod retrieval;
pub mod store;
pub mod validate;

#[cfg(test)]
mod testing;

pub use error::{Error, ProviderError, ProviderErrorKind, Result, ValidationError};
