//! Deterministic embedders for unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use sha2::{Digest, Sha256};

use crate::embedding::EmbeddingProvider;
use crate::error::ProviderError;

/// Bag-of-words embedder: every lowercase word adds 1.0 to a bucket chosen
/// by hashing the word.
pub struct HashEmbedder {
    pub dims: usize,
    pub calls: AtomicUsize,
    pub texts_embedded: AtomicUsize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            calls: AtomicUsize::new(0),
            texts_embedded: AtomicUsize::new(0),
        }
    }

    pub fn vector(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dims];
        for word in text.split_whitespace() {
            let word = word
                .trim_matches(|c: char| !c.is_alphanumeric())
                .to_lowercase();
            if word.is_empty() {
                continue;
            }
            let digest = Sha256::digest(word.as_bytes());
            let bucket = u32::from_le_bytes([digest[0], digest[1], digest[2], digest[3]]) as usize;
            v[bucket % self.dims] += 1.0;
        }
        v
    }
}

#[async_trait]
impl EmbeddingProvider for HashEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn dims(&self) -> usize {
        self.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.texts_embedded.fetch_add(texts.len(), Ordering::SeqCst);
        Ok(texts.iter().map(|t| self.vector(t)).collect())
    }
}

/// Returns the same vector for every input.
pub struct ConstEmbedder(pub Vec<f32>);

#[async_trait]
impl EmbeddingProvider for ConstEmbedder {
    fn model_name(&self) -> &str {
        "const-test"
    }

    fn dims(&self) -> usize {
        self.0.len()
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Ok(texts.iter().map(|_| self.0.clone()).collect())
    }
}

/// Hash embedder that fails any batch containing `marker`.
pub struct ScriptedEmbedder {
    pub inner: HashEmbedder,
    pub marker: String,
    pub error: ProviderError,
}

impl ScriptedEmbedder {
    pub fn new(dims: usize, marker: &str, error: ProviderError) -> Self {
        Self {
            inner: HashEmbedder::new(dims),
            marker: marker.to_string(),
            error,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for ScriptedEmbedder {
    fn model_name(&self) -> &str {
        "scripted-test"
    }

    fn dims(&self) -> usize {
        self.inner.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        if texts.iter().any(|t| t.contains(&self.marker)) {
            return Err(self.error.clone());
        }
        self.inner.embed_batch(texts).await
    }
}

/// Hash embedder that sleeps before every batch.
pub struct SlowEmbedder {
    pub inner: HashEmbedder,
    pub delay: Duration,
}

impl SlowEmbedder {
    pub fn new(dims: usize, delay: Duration) -> Self {
        Self {
            inner: HashEmbedder::new(dims),
            delay,
        }
    }
}

#[async_trait]
impl EmbeddingProvider for SlowEmbedder {
    fn model_name(&self) -> &str {
        "hash-test"
    }

    fn dims(&self) -> usize {
        self.inner.dims
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        tokio::time::sleep(self.delay).await;
        self.inner.embed_batch(texts).await
    }
}
