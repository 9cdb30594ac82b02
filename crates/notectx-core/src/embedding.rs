//! Embedding provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait that all embedding backends
//! implement, the batching helpers the pipeline calls ([`embed_texts`],
//! [`embed_query`]), and pure helpers for vector serialization and
//! similarity computation.
//!
//! Concrete HTTP providers (OpenAI-compatible, Ollama) live in the
//! `notectx` application crate. A provider instance is always passed in
//! explicitly; nothing here holds global state.

use async_trait::async_trait;

use crate::error::ProviderError;

/// Default upper bound on texts per backend request.
pub const DEFAULT_MAX_BATCH: usize = 64;

/// A backend that turns texts into vectors.
///
/// Implementations handle their own retry and rate limiting and report
/// failures as [`ProviderError`]s classified as transient or fatal.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the model identifier (e.g. `"nomic-embed-text"`).
    fn model_name(&self) -> &str;

    /// Returns the embedding vector dimensionality (e.g. `768`).
    fn dims(&self) -> usize;

    /// Largest batch the backend accepts in one request.
    fn max_batch_size(&self) -> usize {
        DEFAULT_MAX_BATCH
    }

    /// Embed one batch of at most [`max_batch_size`](Self::max_batch_size)
    /// texts. Output order must match input order.
    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError>;
}

/// Embed any number of texts, splitting into backend-sized sub-batches.
///
/// Sub-batches are sent one after another, so the returned vectors line up
/// with `texts` index for index. Every response is checked for count and
/// dimensionality; a mismatch is a fatal provider error.
pub async fn embed_texts(
    provider: &dyn EmbeddingProvider,
    texts: &[String],
) -> Result<Vec<Vec<f32>>, ProviderError> {
    let batch_size = provider.max_batch_size().max(1);
    let dims = provider.dims();
    let mut vectors = Vec::with_capacity(texts.len());

    for batch in texts.chunks(batch_size) {
        let out = provider.embed_batch(batch).await?;
        if out.len() != batch.len() {
            return Err(ProviderError::fatal(format!(
                "provider returned {} vectors for {} inputs",
                out.len(),
                batch.len()
            )));
        }
        if let Some(bad) = out.iter().find(|v| v.len() != dims) {
            return Err(ProviderError::fatal(format!(
                "provider returned a {}-dim vector, expected {} (model {})",
                bad.len(),
                dims,
                provider.model_name()
            )));
        }
        vectors.extend(out);
    }

    Ok(vectors)
}

/// Embed a single query text.
pub async fn embed_query(
    provider: &dyn EmbeddingProvider,
    text: &str,
) -> Result<Vec<f32>, ProviderError> {
    let results = embed_texts(provider, &[text.to_string()]).await?;
    results
        .into_iter()
        .next()
        .ok_or_else(|| ProviderError::fatal("Empty embedding response"))
}

/// Encode a float vector as a BLOB (little-endian f32 bytes).
///
/// # Example
///
/// ```rust
/// use notectx_core::embedding::{vec_to_blob, blob_to_vec};
///
/// let v = vec![1.0f32, -2.5, 3.125];
/// let blob = vec_to_blob(&v);
/// assert_eq!(blob.len(), 12); // 3 × 4 bytes
/// assert_eq!(blob_to_vec(&blob), v);
/// ```
pub fn vec_to_blob(vec: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vec.len() * 4);
    for &v in vec {
        bytes.extend_from_slice(&v.to_le_bytes());
    }
    bytes
}

/// Decode a BLOB back into a float vector.
pub fn blob_to_vec(blob: &[u8]) -> Vec<f32> {
    blob.chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors, vectors of
/// different lengths, and zero vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}
