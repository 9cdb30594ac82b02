//! Tools exposed to agents over HTTP and MCP.
//!
//! A [`Tool`] is a named, schema-described operation. The server lists
//! registered tools at `GET /tools/list` and on the MCP `tools/list` call,
//! and dispatches `POST /tools/{name}` and MCP `tools/call` to
//! [`Tool::execute`].
//!
//! ```text
//! ┌──────────────────────────────┐
//! │         ToolRegistry         │
//! │  ┌────────┐ ┌─────────────┐  │
//! │  │ search │ │ collections │  │
//! │  └────────┘ └─────────────┘  │
//! └──────────────┬───────────────┘
//!                ▼
//!   run_server() → HTTP API + /mcp
//! ```
//!
//! Errors returned by tools are `anyhow` errors. When the root cause is a
//! [`notectx_core::Error`], the server reports its machine code and picks
//! the HTTP status from it.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

use notectx_core::embedding::EmbeddingProvider;
use notectx_core::error::Error;
use notectx_core::registry::CollectionRegistry;
use notectx_core::retrieval::{retrieve, ContextResponse, SearchRequest};
use notectx_core::store::VectorStore;

use crate::config::RetrievalConfig;

/// A tool that agents can discover and call.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Route name (`POST /tools/{name}`) and MCP tool name.
    fn name(&self) -> &str;

    /// One-line description for agent discovery.
    fn description(&self) -> &str;

    /// Whether this tool ships with notectx. Defaults to `false`.
    fn is_builtin(&self) -> bool {
        false
    }

    /// JSON Schema (`type: "object"`) describing the parameters.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool. `params` is always a JSON object.
    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value>;

    /// Text shown to MCP clients for a successful result.
    fn render_text(&self, result: &Value) -> String {
        serde_json::to_string_pretty(result).unwrap_or_default()
    }
}

/// Tool metadata as listed by `GET /tools/list`.
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub builtin: bool,
    pub parameters: Value,
}

impl ToolInfo {
    pub fn from_tool(tool: &dyn Tool) -> Self {
        Self {
            name: tool.name().to_string(),
            description: tool.description().to_string(),
            builtin: tool.is_builtin(),
            parameters: tool.parameters_schema(),
        }
    }
}

/// Shared state handed to every tool invocation.
///
/// Holds the store and the embedding provider explicitly; the same
/// instances serve every request.
pub struct ToolContext {
    store: Arc<dyn VectorStore>,
    provider: Arc<dyn EmbeddingProvider>,
    retrieval: RetrievalConfig,
}

impl ToolContext {
    pub fn new(
        store: Arc<dyn VectorStore>,
        provider: Arc<dyn EmbeddingProvider>,
        retrieval: RetrievalConfig,
    ) -> Self {
        Self {
            store,
            provider,
            retrieval,
        }
    }

    /// Run a context retrieval. Equivalent to `notectx search`.
    pub async fn search(&self, req: &SearchRequest) -> Result<ContextResponse> {
        let response = retrieve(
            self.store.as_ref(),
            self.provider.as_ref(),
            req,
            &self.retrieval.params(),
        )
        .await?;
        Ok(response)
    }

    pub fn default_max_results(&self) -> usize {
        self.retrieval.max_results
    }

    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }
}

/// Built-in context retrieval tool.
pub struct SearchTool;

#[async_trait]
impl Tool for SearchTool {
    fn name(&self) -> &str {
        "search"
    }

    fn description(&self) -> &str {
        "Retrieve cited context from indexed notes"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "What to look for" },
                "collection": {
                    "description": "Collection name, \"all\", or a list of names",
                    "oneOf": [
                        { "type": "string" },
                        { "type": "array", "items": { "type": "string" } }
                    ],
                    "default": "all"
                },
                "max_results": { "type": "integer", "minimum": 1, "description": "Max context items" },
                "filters": {
                    "type": "object",
                    "properties": {
                        "tags": { "type": "array", "items": { "type": "string" }, "description": "Keep notes with any of these tags" },
                        "note_ids": { "type": "array", "items": { "type": "string" }, "description": "Keep only these notes" },
                        "updated_since": { "type": "string", "description": "Only notes updated on or after this date (YYYY-MM-DD)" }
                    }
                }
            },
            "required": ["query"]
        })
    }

    async fn execute(&self, params: Value, ctx: &ToolContext) -> Result<Value> {
        let has_limit = params.get("max_results").is_some_and(|v| !v.is_null());
        let mut req: SearchRequest = serde_json::from_value(params)
            .map_err(|e| Error::InvalidOptions(format!("invalid search parameters: {e}")))?;
        if req.query.trim().is_empty() {
            return Err(Error::InvalidOptions("query must not be empty".into()).into());
        }
        if !has_limit {
            req.max_results = ctx.default_max_results();
        }

        let response = ctx.search(&req).await?;
        let context = response.render();
        let mut value = serde_json::to_value(&response)?;
        if let Value::Object(map) = &mut value {
            map.insert("context".to_string(), Value::String(context));
        }
        Ok(value)
    }

    fn render_text(&self, result: &Value) -> String {
        match result.get("context").and_then(|c| c.as_str()) {
            Some(text) => text.to_string(),
            None => serde_json::to_string_pretty(result).unwrap_or_default(),
        }
    }
}

/// Built-in collection listing tool.
pub struct CollectionsTool;

#[async_trait]
impl Tool for CollectionsTool {
    fn name(&self) -> &str {
        "collections"
    }

    fn description(&self) -> &str {
        "List indexed note collections with their model and counts"
    }

    fn is_builtin(&self) -> bool {
        true
    }

    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {}
        })
    }

    async fn execute(&self, _params: Value, ctx: &ToolContext) -> Result<Value> {
        let collections = CollectionRegistry::new(ctx.store()).list().await?;
        Ok(serde_json::json!({ "collections": collections }))
    }
}

/// Registry of tools served by the HTTP and MCP endpoints.
pub struct ToolRegistry {
    tools: Vec<Box<dyn Tool>>,
}

impl ToolRegistry {
    /// Create an empty tool registry.
    pub fn new() -> Self {
        Self { tools: Vec::new() }
    }

    /// Create a registry with the built-in `search` and `collections` tools.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(SearchTool));
        registry.register(Box::new(CollectionsTool));
        registry
    }

    /// Register a tool. A later tool with the same name is never reached.
    pub fn register(&mut self, tool: Box<dyn Tool>) {
        self.tools.push(tool);
    }

    pub fn tools(&self) -> &[Box<dyn Tool>] {
        &self.tools
    }

    pub fn find(&self, name: &str) -> Option<&dyn Tool> {
        self.tools
            .iter()
            .find(|t| t.name() == name)
            .map(|t| t.as_ref())
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use notectx_core::chunk::{chunk_note, ChunkParams};
    use notectx_core::error::ProviderError;
    use notectx_core::models::{CollectionSpec, CreationMode, EmbeddedChunk, NoteRecord};
    use notectx_core::store::memory::InMemoryStore;
    use notectx_core::validate::validate_note;

    /// Embeds every text to the same unit vector.
    pub(crate) struct FixedEmbedder;

    #[async_trait]
    impl EmbeddingProvider for FixedEmbedder {
        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dims(&self) -> usize {
            2
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, ProviderError> {
            Ok(texts.iter().map(|_| vec![1.0, 0.0]).collect())
        }
    }

    /// Context over an in-memory store holding one `bear` collection with
    /// two short notes.
    pub(crate) async fn seeded_context() -> ToolContext {
        let store = InMemoryStore::new();
        let handle = store
            .create_or_open_collection(&CollectionSpec {
                name: "bear".into(),
                description: "Bear notes".into(),
                embedding_model: "fixed".into(),
                dims: 2,
                mode: CreationMode::Incremental,
            })
            .await
            .unwrap();

        for (id, title, content) in [
            ("n1", "Deploy checklist", "Run migrations before the rollout."),
            ("n2", "Groceries", "Eggs, flour, and coffee."),
        ] {
            let note = validate_note(serde_json::json!({
                "id": id,
                "title": title,
                "content": content,
                "tags": ["t"],
                "updated_at": "2024-03-02T10:30:00Z"
            }))
            .unwrap();
            let params = ChunkParams::default();
            let chunks: Vec<EmbeddedChunk> = chunk_note(&note, &params)
                .into_iter()
                .map(|chunk| EmbeddedChunk {
                    chunk,
                    vector: vec![1.0, 0.0],
                })
                .collect();
            let record = NoteRecord {
                note_id: note.id.clone(),
                title: note.title.clone(),
                tags: note.tags.clone(),
                updated_at: note.updated_at,
                content_hash: format!("h-{id}"),
            };
            store.replace_note(&handle, &record, &chunks).await.unwrap();
        }

        ToolContext::new(
            Arc::new(store),
            Arc::new(FixedEmbedder),
            RetrievalConfig::default(),
        )
    }

    #[test]
    fn test_builtins_registered() {
        let registry = ToolRegistry::with_builtins();
        assert_eq!(registry.len(), 2);
        assert!(registry.find("search").unwrap().is_builtin());
        assert!(registry.find("collections").is_some());
        assert!(registry.find("get").is_none());
    }

    #[tokio::test]
    async fn test_search_tool_returns_rendered_context() {
        let ctx = seeded_context().await;
        let result = SearchTool
            .execute(
                serde_json::json!({ "query": "deploy", "collection": "bear", "max_results": 1 }),
                &ctx,
            )
            .await
            .unwrap();

        assert_eq!(result["items"].as_array().unwrap().len(), 1);
        assert_eq!(result["collections_searched"], serde_json::json!(["bear"]));
        let text = SearchTool.render_text(&result);
        assert!(text.starts_with("[1] "));
        assert!(text.contains("collection: bear"));
    }

    #[tokio::test]
    async fn test_search_tool_rejects_bad_params() {
        let ctx = seeded_context().await;
        let err = SearchTool
            .execute(serde_json::json!({ "query": "  " }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "validation");

        let err = SearchTool
            .execute(serde_json::json!({ "max_results": 3 }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "validation");
    }

    #[tokio::test]
    async fn test_search_tool_unknown_collection() {
        let ctx = seeded_context().await;
        let err = SearchTool
            .execute(serde_json::json!({ "query": "x", "collection": "wiki" }), &ctx)
            .await
            .unwrap_err();
        assert_eq!(err.downcast_ref::<Error>().unwrap().code(), "not_found");
    }

    #[tokio::test]
    async fn test_collections_tool() {
        let ctx = seeded_context().await;
        let result = CollectionsTool
            .execute(serde_json::json!({}), &ctx)
            .await
            .unwrap();
        let list = result["collections"].as_array().unwrap();
        assert_eq!(list.len(), 1);
        assert_eq!(list[0]["name"], "bear");
        assert_eq!(list[0]["note_count"], 2);
    }
}
