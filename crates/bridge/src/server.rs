//! MCP server glue: exposes an [`ODataToolSource`] through rmcp's `ServerHandler`.
//!
//! rmcp owns the JSON-RPC framing and the handshake. It also cancels the request context when
//! `notifications/cancelled` arrives. That token is handed to the executor, so a cancelled call
//! aborts its upstream request.

use odata_mcp_tools::error::{ExecutionError, ODataToolsError};
use odata_mcp_tools::source::ODataToolSource;
use rmcp::model::{
    CallToolRequestParams, CallToolResult, Implementation, ListToolsResult,
    PaginatedRequestParams, ServerCapabilities, ServerInfo,
};
use rmcp::service::RequestContext;
use rmcp::{ErrorData as McpError, RoleServer, ServerHandler};
use serde_json::Value;

#[derive(Clone)]
pub struct ODataMcpServer {
    source: ODataToolSource,
}

impl ODataMcpServer {
    #[must_use]
    pub fn new(source: ODataToolSource) -> Self {
        Self { source }
    }
}

impl ServerHandler for ODataMcpServer {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: env!("CARGO_PKG_NAME").to_string(),
                title: None,
                version: env!("CARGO_PKG_VERSION").to_string(),
                description: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Tools for the OData service '{}'. List operations accept filter, select, \
                 orderby, top and skip.",
                self.source.name()
            )),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParams>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = self.source.list_tools().await.map_err(to_mcp_error)?;
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParams,
        context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let arguments = Value::Object(request.arguments.unwrap_or_default());
        self.source
            .call_tool_with_cancel(&request.name, arguments, &context.ct)
            .await
            .map_err(to_mcp_error)
    }
}

fn to_mcp_error(e: ODataToolsError) -> McpError {
    match e {
        ODataToolsError::Execution(e @ ExecutionError::UnknownOperation(_)) => {
            McpError::invalid_params(e.to_string(), None)
        }
        e => McpError::internal_error(e.to_string(), None),
    }
}
