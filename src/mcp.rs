//! MCP JSON-RPC protocol bridge.
//!
//! Adapts the [`ToolRegistry`] to the MCP Streamable HTTP endpoint served
//! at `/mcp`, so MCP clients can discover and call the same tools as the
//! REST API via `list_tools` / `call_tool`.

use std::borrow::Cow;
use std::sync::Arc;

use rmcp::model::*;
use rmcp::{ErrorData as McpError, ServerHandler};

use notectx_core::error::Error;

use crate::tools::{ToolContext, ToolRegistry};

/// Bridges the tool registry to the MCP JSON-RPC protocol.
///
/// Each MCP session receives a clone of this struct (everything is
/// behind `Arc`), so all sessions share one store and one provider.
#[derive(Clone)]
pub struct McpBridge {
    ctx: Arc<ToolContext>,
    tools: Arc<ToolRegistry>,
}

impl McpBridge {
    pub fn new(ctx: Arc<ToolContext>, tools: Arc<ToolRegistry>) -> Self {
        Self { ctx, tools }
    }

    /// Convert a notectx tool into an rmcp `Tool` descriptor.
    fn to_mcp_tool(tool: &dyn crate::tools::Tool) -> Tool {
        let input_schema: Arc<serde_json::Map<String, serde_json::Value>> =
            match tool.parameters_schema() {
                serde_json::Value::Object(map) => Arc::new(map),
                _ => Arc::new(serde_json::Map::new()),
            };

        Tool {
            name: Cow::Owned(tool.name().to_string()),
            title: None,
            description: Some(Cow::Owned(tool.description().to_string())),
            input_schema,
            output_schema: None,
            annotations: Some(ToolAnnotations::new().read_only(true)),
            execution: None,
            icons: None,
            meta: None,
        }
    }
}

/// Error text for a failed tool call, prefixed with the core error code.
fn error_text(err: &anyhow::Error) -> String {
    match err.downcast_ref::<Error>() {
        Some(core) => format!("[{}] {}", core.code(), core),
        None => err.to_string(),
    }
}

impl ServerHandler for McpBridge {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            protocol_version: ProtocolVersion::LATEST,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "notectx".to_string(),
                title: Some("notectx".to_string()),
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(
                "notectx serves cited context from indexed personal notes. \
                 Use the collections tool to see what is indexed and the search \
                 tool to retrieve context for a question."
                    .to_string(),
            ),
        }
    }

    fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> impl std::future::Future<Output = Result<ListToolsResult, McpError>> + Send + '_ {
        let tools: Vec<Tool> = self
            .tools
            .tools()
            .iter()
            .map(|t| Self::to_mcp_tool(t.as_ref()))
            .collect();
        std::future::ready(Ok(ListToolsResult::with_all_items(tools)))
    }

    fn get_tool(&self, name: &str) -> Option<Tool> {
        self.tools.find(name).map(Self::to_mcp_tool)
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        _context: rmcp::service::RequestContext<rmcp::RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let tool = self.tools.find(&request.name).ok_or_else(|| {
            McpError::new(
                ErrorCode::METHOD_NOT_FOUND,
                format!("no tool registered with name: {}", request.name),
                None,
            )
        })?;

        let params = request
            .arguments
            .map(serde_json::Value::Object)
            .unwrap_or(serde_json::Value::Object(serde_json::Map::new()));

        match tool.execute(params, &self.ctx).await {
            Ok(result) => Ok(CallToolResult::success(vec![Content::text(
                tool.render_text(&result),
            )])),
            Err(e) => {
                tracing::warn!(tool = %request.name, error = %e, "MCP tool call failed");
                Ok(CallToolResult::error(vec![Content::text(error_text(&e))]))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tests::seeded_context;

    #[tokio::test]
    async fn test_tool_descriptors() {
        let bridge = McpBridge::new(
            Arc::new(seeded_context().await),
            Arc::new(ToolRegistry::with_builtins()),
        );
        let search = bridge.get_tool("search").unwrap();
        assert_eq!(search.name, "search");
        assert_eq!(
            search.input_schema.get("required"),
            Some(&serde_json::json!(["query"]))
        );
        assert!(bridge.get_tool("missing").is_none());
    }

    #[test]
    fn test_error_text_carries_code() {
        let err: anyhow::Error = Error::NotFound {
            collection: "wiki".into(),
        }
        .into();
        assert!(error_text(&err).starts_with("[not_found] "));
        assert_eq!(error_text(&anyhow::anyhow!("boom")), "boom");
    }
}
