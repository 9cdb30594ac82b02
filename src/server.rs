//! MCP-compatible HTTP server.
//!
//! Exposes the notectx tools over a plain JSON HTTP API and over the MCP
//! Streamable HTTP transport, so Cursor, Claude, and other agents can pull
//! cited note context.
//!
//! # Endpoints
//!
//! | Method | Path | Description |
//! |--------|------|-------------|
//! | `GET`  | `/health` | Health check (returns version) |
//! | `GET`  | `/tools/list` | List all registered tools with schemas |
//! | `POST` | `/tools/{name}` | Call a registered tool by name |
//! | `*`    | `/mcp` | MCP JSON-RPC (Streamable HTTP) |
//!
//! # Error Contract
//!
//! ```json
//! { "error": { "code": "not_found", "message": "search: collection not found: wiki" } }
//! ```
//!
//! | Code | Status |
//! |------|--------|
//! | `validation`, `dimension_mismatch` | 400 |
//! | `not_found` | 404 |
//! | `busy` | 409 |
//! | `provider_transient`, `provider_fatal` | 502 |
//! | `store`, `internal` | 500 |
//!
//! # CORS
//!
//! All origins, methods, and headers are permitted.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use rmcp::transport::streamable_http_server::{
    session::local::LocalSessionManager, StreamableHttpServerConfig, StreamableHttpService,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};

use notectx_core::error::Error;
use notectx_core::store::VectorStore;

use crate::config::Config;
use crate::embedding::create_provider;
use crate::mcp::McpBridge;
use crate::sqlite_store::SqliteStore;
use crate::tools::{ToolContext, ToolInfo, ToolRegistry};

/// Shared application state passed to all route handlers.
#[derive(Clone)]
pub struct AppState {
    ctx: Arc<ToolContext>,
    tools: Arc<ToolRegistry>,
}

impl AppState {
    pub fn new(ctx: Arc<ToolContext>, tools: Arc<ToolRegistry>) -> Self {
        Self { ctx, tools }
    }
}

/// Starts the HTTP server on `[server].bind` and runs until the process
/// is terminated. Used by `notectx serve mcp`.
pub async fn run_server(config: &Config) -> anyhow::Result<()> {
    let store: Arc<dyn VectorStore> = Arc::new(SqliteStore::open(config).await?);
    let provider = create_provider(&config.provider)?;
    if !config.provider.is_enabled() {
        tracing::warn!("embedding provider disabled; the search tool will fail until [provider] is set");
    }

    let ctx = Arc::new(ToolContext::new(store, provider, config.retrieval.clone()));
    let state = AppState::new(ctx, Arc::new(ToolRegistry::with_builtins()));
    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&config.server.bind).await?;
    println!("MCP server listening on http://{}", config.server.bind);
    println!("  MCP endpoint: http://{}/mcp", config.server.bind);
    tracing::info!(bind = %config.server.bind, "server started");

    axum::serve(listener, app).await?;
    Ok(())
}

/// Build the router: REST tool routes, the `/mcp` service, and CORS.
pub fn build_router(state: AppState) -> Router {
    let bridge = McpBridge::new(state.ctx.clone(), state.tools.clone());
    let mcp_service = StreamableHttpService::new(
        move || Ok(bridge.clone()),
        LocalSessionManager::default().into(),
        StreamableHttpServerConfig::default(),
    );

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handle_health))
        .route("/tools/list", get(handle_list_tools))
        .route("/tools/{name}", post(handle_tool_call))
        .with_state(state)
        .nest_service("/mcp", mcp_service)
        .layer(cors)
}

// ============ Error response ============

#[derive(Serialize)]
struct ErrorBody {
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: String,
    message: String,
}

/// Error that converts into the JSON error envelope.
#[derive(Debug)]
pub struct AppError {
    status: StatusCode,
    code: String,
    message: String,
}

impl AppError {
    fn new(status: StatusCode, code: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            code: code.to_string(),
            message: message.into(),
        }
    }

    /// Map a tool error to a status using the core error code, when the
    /// root cause is a core [`Error`].
    fn from_tool(tool_name: &str, err: anyhow::Error) -> Self {
        let message = format!("{}: {}", tool_name, err);
        match err.downcast_ref::<Error>() {
            Some(core) => {
                let code = core.code();
                Self::new(status_for(code), code, message)
            }
            None => Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", message),
        }
    }
}

/// HTTP status for a core error code.
pub fn status_for(code: &str) -> StatusCode {
    match code {
        "validation" | "dimension_mismatch" => StatusCode::BAD_REQUEST,
        "not_found" => StatusCode::NOT_FOUND,
        "busy" => StatusCode::CONFLICT,
        "provider_transient" | "provider_fatal" => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            error: ErrorDetail {
                code: self.code,
                message: self.message,
            },
        };
        (self.status, Json(body)).into_response()
    }
}

// ============ GET /health ============

#[derive(Serialize)]
struct HealthResponse {
    status: String,
    version: String,
}

async fn handle_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

// ============ GET /tools/list ============

#[derive(Serialize)]
struct ToolListResponse {
    tools: Vec<ToolInfo>,
}

async fn handle_list_tools(State(state): State<AppState>) -> Json<ToolListResponse> {
    let tools = state
        .tools
        .tools()
        .iter()
        .map(|t| ToolInfo::from_tool(t.as_ref()))
        .collect();
    Json(ToolListResponse { tools })
}

// ============ POST /tools/{name} ============

/// Unified tool dispatch. Returns `{ "result": ... }` on success.
async fn handle_tool_call(
    State(state): State<AppState>,
    Path(name): Path<String>,
    Json(params): Json<serde_json::Value>,
) -> Result<Json<serde_json::Value>, AppError> {
    let tool = state.tools.find(&name).ok_or_else(|| {
        AppError::new(
            StatusCode::NOT_FOUND,
            "not_found",
            format!("no tool registered with name: {}", name),
        )
    })?;

    if !params.is_object() {
        return Err(AppError::new(
            StatusCode::BAD_REQUEST,
            "validation",
            "tool parameters must be a JSON object",
        ));
    }

    let result = tool
        .execute(params, &state.ctx)
        .await
        .map_err(|e| {
            tracing::warn!(tool = %name, error = %e, "tool call failed");
            AppError::from_tool(&name, e)
        })?;

    Ok(Json(serde_json::json!({ "result": result })))
}
