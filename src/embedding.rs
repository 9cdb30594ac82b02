//! HTTP embedding providers.
//!
//! Concrete implementations of [`EmbeddingProvider`]:
//! - **[`DisabledProvider`]**: fails every request; used when no provider is configured.
//! - **[`OpenAiCompatProvider`]**: `POST {base_url}/v1/embeddings`, for the
//!   `openai`, `lmstudio`, and `generic-http` provider types.
//! - **[`OllamaProvider`]**: `POST {base_url}/api/embed` on an Ollama instance.
//!
//! Use [`create_provider`] to build the right one from configuration. The
//! returned provider is passed explicitly to the pipeline and the server.
//!
//! # Request gate
//!
//! Every HTTP request waits on a [`RequestGate`]: a `governor` rate limiter
//! (`requests_per_minute`) and a semaphore (`concurrency`) shared by all
//! callers of the same provider instance.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - Network errors and timeouts → retry
//! - Other HTTP 4xx (bad key, unknown model) → fail immediately as Fatal
//! - Malformed response bodies → Fatal
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)
//!
//! Exhausting `max_retries` surfaces a Transient [`ProviderError`].

use anyhow::{bail, Result};
use async_trait::async_trait;
use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use serde_json::Value;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, SemaphorePermit};

use notectx_core::embedding::EmbeddingProvider;
use notectx_core::error::ProviderError;

use crate::config::{ProviderConfig, ProviderType, RateLimitConfig};

/// Embedding provider used when `provider.type = "disabled"`.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    fn dims(&self) -> usize {
        0
    }

    async fn embed_batch(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        Err(ProviderError::fatal(
            "Embedding provider is disabled; set [provider] in the config",
        ))
    }
}

/// Rate limit and concurrency cap shared by every request of one provider.
pub struct RequestGate {
    limiter: DefaultDirectRateLimiter,
    permits: Semaphore,
}

impl RequestGate {
    pub fn new(config: &RateLimitConfig) -> Self {
        let per_minute = NonZeroU32::new(config.requests_per_minute).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: RateLimiter::direct(Quota::per_minute(per_minute)),
            permits: Semaphore::new(config.concurrency.max(1)),
        }
    }

    /// Wait for a concurrency slot, then for rate-limit capacity.
    async fn acquire(&self) -> Result<SemaphorePermit<'_>, ProviderError> {
        let permit = self
            .permits
            .acquire()
            .await
            .map_err(|_| ProviderError::fatal("request gate closed"))?;
        self.limiter.until_ready().await;
        Ok(permit)
    }
}

/// Retry schedule for transient failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay * (1u32 << (attempt.saturating_sub(1)).min(5))
    }
}

/// Shared HTTP plumbing: client, endpoint, auth, gate, and retry loop.
struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    gate: RequestGate,
    retry: RetryPolicy,
    label: &'static str,
}

impl HttpTransport {
    fn new(
        config: &ProviderConfig,
        endpoint: String,
        api_key: Option<String>,
        label: &'static str,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            api_key,
            gate: RequestGate::new(&config.rate_limit),
            retry: RetryPolicy {
                max_retries: config.max_retries,
                base_delay: Duration::from_secs(1),
            },
            label,
        })
    }

    /// POST `body` and return the decoded JSON response, retrying
    /// transient failures.
    async fn post(&self, body: &Value) -> Result<Value, ProviderError> {
        let mut last_err = None;

        for attempt in 0..=self.retry.max_retries {
            if attempt > 0 {
                let delay = self.retry.delay(attempt);
                tracing::warn!(
                    provider = self.label,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = ?last_err,
                    "retrying embedding request"
                );
                tokio::time::sleep(delay).await;
            }

            let _permit = self.gate.acquire().await?;
            let mut request = self.client.post(&self.endpoint).json(body);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return response.json::<Value>().await.map_err(|e| {
                            ProviderError::fatal(format!(
                                "Invalid {} response body: {}",
                                self.label, e
                            ))
                        });
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error, retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        last_err = Some(format!("{} API error {}: {}", self.label, status, body_text));
                        continue;
                    }

                    // Client error (not 429), don't retry
                    return Err(ProviderError::fatal(format!(
                        "{} API error {}: {}",
                        self.label, status, body_text
                    )));
                }
                Err(e) => {
                    last_err = Some(format!(
                        "{} connection error ({}): {}",
                        self.label, self.endpoint, e
                    ));
                }
            }
        }

        Err(ProviderError::transient(format!(
            "giving up after {} attempts: {}",
            self.retry.max_retries + 1,
            last_err.unwrap_or_else(|| "unknown error".to_string())
        )))
    }
}

/// OpenAI-compatible `/v1/embeddings` provider (OpenAI, LM Studio, and
/// generic HTTP embedding servers).
pub struct OpenAiCompatProvider {
    transport: HttpTransport,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OpenAiCompatProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let model = required_model(config)?;
        let dims = required_dims(config)?;
        let api_key = config.api_key();
        if config.kind == ProviderType::Openai && api_key.is_none() {
            bail!("provider.api_key (or NOTECTX_API_KEY / OPENAI_API_KEY) required for OpenAI");
        }
        let endpoint = embeddings_endpoint(&config.base_url());
        Ok(Self {
            transport: HttpTransport::new(config, endpoint, api_key, "OpenAI-compatible")?,
            model,
            dims,
            batch_size: config.batch_size,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport.retry = retry;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiCompatProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self.transport.post(&body).await?;
        parse_openai_response(&json)
    }
}

/// Embedding provider for a local Ollama instance.
///
/// Requires Ollama to be running with the model pulled
/// (e.g. `ollama pull nomic-embed-text`).
pub struct OllamaProvider {
    transport: HttpTransport,
    model: String,
    dims: usize,
    batch_size: usize,
}

impl OllamaProvider {
    pub fn new(config: &ProviderConfig) -> Result<Self> {
        let model = required_model(config)?;
        let dims = required_dims(config)?;
        let endpoint = format!("{}/api/embed", config.base_url().trim_end_matches('/'));
        Ok(Self {
            transport: HttpTransport::new(config, endpoint, config.api_key(), "Ollama")?,
            model,
            dims,
            batch_size: config.batch_size,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.transport.retry = retry;
        self
    }
}

#[async_trait]
impl EmbeddingProvider for OllamaProvider {
    fn model_name(&self) -> &str {
        &self.model
    }

    fn dims(&self) -> usize {
        self.dims
    }

    fn max_batch_size(&self) -> usize {
        self.batch_size
    }

    async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
        let body = serde_json::json!({
            "model": self.model,
            "input": texts,
        });
        let json = self.transport.post(&body).await?;
        parse_ollama_response(&json)
    }
}

fn required_model(config: &ProviderConfig) -> Result<String> {
    match config.embedding_model.as_deref() {
        Some(m) if !m.trim().is_empty() => Ok(m.to_string()),
        _ => bail!(
            "provider.embedding_model required for provider '{}'",
            config.kind.as_str()
        ),
    }
}

fn required_dims(config: &ProviderConfig) -> Result<usize> {
    match config.dims {
        Some(d) if d > 0 => Ok(d),
        _ => bail!(
            "provider.dims required for provider '{}'",
            config.kind.as_str()
        ),
    }
}

/// Resolve the embeddings URL for an OpenAI-compatible base URL.
///
/// `http://host` → `http://host/v1/embeddings`, `http://host/v1` →
/// `http://host/v1/embeddings`, and a URL already ending in `/embeddings`
/// is used as is.
pub fn embeddings_endpoint(base_url: &str) -> String {
    let normalized = base_url.trim_end_matches('/');
    if normalized.ends_with("/embeddings") {
        return normalized.to_string();
    }
    if has_version_suffix(normalized) {
        return format!("{normalized}/embeddings");
    }
    format!("{normalized}/v1/embeddings")
}

fn has_version_suffix(base_url: &str) -> bool {
    let Some(last_segment) = base_url.rsplit('/').next() else {
        return false;
    };
    let Some(rest) = last_segment.strip_prefix('v') else {
        return false;
    };
    !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit())
}

fn parse_vector(value: &Value, what: &str) -> Result<Vec<f32>, ProviderError> {
    value
        .as_array()
        .ok_or_else(|| ProviderError::fatal(format!("Invalid {what} response: embedding is not an array")))?
        .iter()
        .map(|v| {
            v.as_f64()
                .map(|f| f as f32)
                .ok_or_else(|| ProviderError::fatal(format!("Invalid {what} response: non-numeric value")))
        })
        .collect()
}

/// Extract `data[].embedding`, ordered by each item's `index`.
fn parse_openai_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| ProviderError::fatal("Invalid OpenAI response: missing data array"))?;

    let mut indexed = Vec::with_capacity(data.len());
    for (pos, item) in data.iter().enumerate() {
        let index = item
            .get("index")
            .and_then(|i| i.as_u64())
            .map(|i| i as usize)
            .unwrap_or(pos);
        let embedding = item
            .get("embedding")
            .ok_or_else(|| ProviderError::fatal("Invalid OpenAI response: missing embedding"))?;
        indexed.push((index, parse_vector(embedding, "OpenAI")?));
    }

    indexed.sort_by_key(|(i, _)| *i);
    Ok(indexed.into_iter().map(|(_, v)| v).collect())
}

/// Extract the `embeddings` array of an Ollama `/api/embed` response.
fn parse_ollama_response(json: &Value) -> Result<Vec<Vec<f32>>, ProviderError> {
    json.get("embeddings")
        .and_then(|e| e.as_array())
        .ok_or_else(|| ProviderError::fatal("Invalid Ollama response: missing embeddings array"))?
        .iter()
        .map(|v| parse_vector(v, "Ollama"))
        .collect()
}

/// Create the appropriate [`EmbeddingProvider`] based on configuration.
///
/// | `provider.type` | Provider |
/// |-----------------|----------|
/// | `"disabled"` | [`DisabledProvider`] |
/// | `"ollama"` | [`OllamaProvider`] |
/// | `"openai"`, `"lmstudio"`, `"generic-http"` | [`OpenAiCompatProvider`] |
pub fn create_provider(config: &ProviderConfig) -> Result<Arc<dyn EmbeddingProvider>> {
    let provider: Arc<dyn EmbeddingProvider> = match config.kind {
        ProviderType::Disabled => Arc::new(DisabledProvider),
        ProviderType::Ollama => Arc::new(OllamaProvider::new(config)?),
        ProviderType::Openai | ProviderType::Lmstudio | ProviderType::GenericHttp => {
            Arc::new(OpenAiCompatProvider::new(config)?)
        }
    };
    tracing::debug!(
        provider = config.kind.as_str(),
        model = provider.model_name(),
        dims = provider.dims(),
        "embedding provider ready"
    );
    Ok(provider)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::State;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::{Json, Router};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_embeddings_endpoint() {
        assert_eq!(
            embeddings_endpoint("https://api.openai.com"),
            "https://api.openai.com/v1/embeddings"
        );
        assert_eq!(
            embeddings_endpoint("http://localhost:1234/v1/"),
            "http://localhost:1234/v1/embeddings"
        );
        assert_eq!(
            embeddings_endpoint("http://gw/api/v2"),
            "http://gw/api/v2/embeddings"
        );
        assert_eq!(
            embeddings_endpoint("http://gw/custom/embeddings"),
            "http://gw/custom/embeddings"
        );
    }

    #[test]
    fn test_parse_openai_orders_by_index() {
        let json = serde_json::json!({
            "data": [
                {"index": 1, "embedding": [0.0, 1.0]},
                {"index": 0, "embedding": [1.0, 0.0]}
            ]
        });
        let vecs = parse_openai_response(&json).unwrap();
        assert_eq!(vecs, vec![vec![1.0, 0.0], vec![0.0, 1.0]]);
        assert!(!parse_openai_response(&serde_json::json!({})).unwrap_err().is_transient());
    }

    #[test]
    fn test_parse_ollama() {
        let json = serde_json::json!({"embeddings": [[0.5, 0.25]]});
        assert_eq!(parse_ollama_response(&json).unwrap(), vec![vec![0.5, 0.25]]);
        let bad = serde_json::json!({"embeddings": [["x"]]});
        assert!(parse_ollama_response(&bad).is_err());
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = RetryPolicy {
            max_retries: 10,
            base_delay: Duration::from_secs(1),
        };
        let secs: Vec<u64> = (1..=8).map(|a| policy.delay(a).as_secs()).collect();
        assert_eq!(secs, vec![1, 2, 4, 8, 16, 32, 32, 32]);
    }

    #[tokio::test]
    async fn test_disabled_provider_is_fatal() {
        let err = DisabledProvider
            .embed_batch(&["x".to_string()])
            .await
            .unwrap_err();
        assert!(!err.is_transient());
    }

    #[derive(Clone)]
    struct Script {
        calls: Arc<AtomicUsize>,
        fail_first: usize,
        fail_status: StatusCode,
    }

    async fn scripted_embed(
        State(script): State<Script>,
        Json(body): Json<Value>,
    ) -> Result<Json<Value>, StatusCode> {
        let call = script.calls.fetch_add(1, Ordering::SeqCst);
        if call < script.fail_first {
            return Err(script.fail_status);
        }
        let n = body["input"].as_array().map(|a| a.len()).unwrap_or(0);
        let embeddings: Vec<Vec<f32>> = (0..n).map(|i| vec![i as f32, 1.0]).collect();
        Ok(Json(serde_json::json!({ "embeddings": embeddings })))
    }

    async fn spawn_ollama(script: Script) -> String {
        let app = Router::new()
            .route("/api/embed", post(scripted_embed))
            .with_state(script);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn ollama_config(base_url: String) -> ProviderConfig {
        ProviderConfig {
            kind: ProviderType::Ollama,
            base_url: Some(base_url),
            embedding_model: Some("nomic-embed-text".into()),
            dims: Some(2),
            max_retries: 3,
            ..ProviderConfig::default()
        }
    }

    fn fast_retry() -> RetryPolicy {
        RetryPolicy {
            max_retries: 3,
            base_delay: Duration::from_millis(5),
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let url = spawn_ollama(Script {
            calls: calls.clone(),
            fail_first: 2,
            fail_status: StatusCode::SERVICE_UNAVAILABLE,
        })
        .await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_retry(fast_retry());

        let vecs = provider
            .embed_batch(&["a".to_string(), "b".to_string()])
            .await
            .unwrap();
        assert_eq!(vecs, vec![vec![0.0, 1.0], vec![1.0, 1.0]]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_exhausted_retries_are_transient() {
        let calls = Arc::new(AtomicUsize::new(0));
        let url = spawn_ollama(Script {
            calls: calls.clone(),
            fail_first: usize::MAX,
            fail_status: StatusCode::TOO_MANY_REQUESTS,
        })
        .await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_retry(fast_retry());

        let err = provider.embed_batch(&["a".to_string()]).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn test_client_errors_are_fatal_without_retry() {
        let calls = Arc::new(AtomicUsize::new(0));
        let url = spawn_ollama(Script {
            calls: calls.clone(),
            fail_first: usize::MAX,
            fail_status: StatusCode::UNAUTHORIZED,
        })
        .await;
        let provider = OllamaProvider::new(&ollama_config(url))
            .unwrap()
            .with_retry(fast_retry());

        let err = provider.embed_batch(&["a".to_string()]).await.unwrap_err();
        assert!(!err.is_transient());
        assert!(err.message.contains("401"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_create_provider_requires_model_and_dims() {
        let mut config = ProviderConfig {
            kind: ProviderType::GenericHttp,
            base_url: Some("http://localhost:9".into()),
            ..ProviderConfig::default()
        };
        assert!(create_provider(&config).is_err());
        config.embedding_model = Some("bge-small".into());
        config.dims = Some(384);
        let provider = create_provider(&config).unwrap();
        assert_eq!(provider.model_name(), "bge-small");
        assert_eq!(provider.dims(), 384);
        assert_eq!(provider.max_batch_size(), 64);
    }
}
