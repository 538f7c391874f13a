//! MCP server implementation using rmcp.
//!
//! Exposes the execution engine as two MCP tools: `execute` runs a snippet
//! and returns the execution result as JSON, `list_languages` describes the
//! allow-listed languages.

use std::sync::Arc;

use rmcp::handler::server::router::tool::ToolRouter;
use rmcp::handler::server::wrapper::Parameters;
use rmcp::model::{CallToolResult, Content, Implementation, ServerCapabilities, ServerInfo};
use rmcp::schemars;
use rmcp::transport::stdio;
use rmcp::{tool, tool_handler, tool_router, ErrorData as McpError, ServerHandler, ServiceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::orchestrator::{ExecutionRequest, Orchestrator};
use crate::result::ExecutionResponse;

/// MCP server for code execution.
#[derive(Clone)]
pub struct CodeExecServer {
    orchestrator: Arc<Orchestrator>,
    tool_router: ToolRouter<Self>,
}

/// Parameters for the execute tool.
#[derive(Debug, Deserialize, JsonSchema)]
pub struct ExecuteParams {
    #[schemars(description = "Language id or alias (e.g. 'python', 'js', 'cpp', 'rhai')")]
    pub language: String,

    #[schemars(description = "Source code to execute")]
    pub code: String,

    #[schemars(description = "Text written to the program's standard input")]
    #[serde(default)]
    pub stdin: Option<String>,

    #[schemars(description = "Source file name; must carry the language's extension")]
    #[serde(default)]
    pub filename: Option<String>,

    #[schemars(description = "Run-step timeout in milliseconds")]
    #[serde(default)]
    pub timeout_ms: Option<u64>,
}

impl From<ExecuteParams> for ExecutionRequest {
    fn from(params: ExecuteParams) -> Self {
        let mut request = Self::new(params.language, params.code);
        request.stdin = params.stdin;
        request.filename = params.filename;
        request.timeout_ms = params.timeout_ms;
        request
    }
}

fn to_json<T: Serialize>(value: &T) -> Result<String, McpError> {
    serde_json::to_string_pretty(value)
        .map_err(|e| McpError::internal_error(format!("Failed to encode result: {e}"), None))
}

#[tool_router]
impl CodeExecServer {
    pub fn new(orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            orchestrator,
            tool_router: Self::tool_router(),
        }
    }

    /// Execute a snippet in an isolated workspace.
    #[tool(description = "Execute source code in an isolated, time-limited workspace")]
    async fn execute(
        &self,
        Parameters(params): Parameters<ExecuteParams>,
    ) -> Result<CallToolResult, McpError> {
        info!(language = %params.language, code_len = params.code.len(), "Executing code");

        let result = self.orchestrator.submit(params.into()).await;
        let response = ExecutionResponse::from(result);
        let body = to_json(&response)?;

        if response.success {
            Ok(CallToolResult::success(vec![Content::text(body)]))
        } else {
            Ok(CallToolResult::error(vec![Content::text(body)]))
        }
    }

    /// Describe the languages this server accepts.
    #[tool(description = "List supported languages, their aliases and default timeouts")]
    async fn list_languages(&self) -> Result<CallToolResult, McpError> {
        let body = to_json(&self.orchestrator.registry().summaries())?;
        Ok(CallToolResult::success(vec![Content::text(body)]))
    }
}

#[tool_handler]
impl ServerHandler for CodeExecServer {
    fn get_info(&self) -> ServerInfo {
        let languages: Vec<_> = self
            .orchestrator
            .registry()
            .profiles()
            .map(|p| p.id.as_str())
            .collect();

        ServerInfo {
            protocol_version: rmcp::model::ProtocolVersion::V_2024_11_05,
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            server_info: Implementation {
                name: "code-exec-daemon".into(),
                version: env!("CARGO_PKG_VERSION").into(),
                title: None,
                icons: None,
                website_url: None,
            },
            instructions: Some(format!(
                "Execute code in isolated, time-limited workspaces.\n\
                 Supported languages: {languages:?}\n\
                 \n\
                 Use the 'execute' tool with:\n\
                 - language: one of {languages:?} (aliases accepted)\n\
                 - code: the source to run\n\
                 - stdin, filename, timeout_ms: optional"
            )),
        }
    }
}

/// Serve the execution engine over stdio.
pub async fn serve_stdio(orchestrator: Arc<Orchestrator>) -> anyhow::Result<()> {
    let server = CodeExecServer::new(orchestrator);

    info!("Starting MCP server on stdio");

    let service = server
        .serve(stdio())
        .await
        .map_err(|e| anyhow::anyhow!("Failed to start MCP server: {e}"))?;

    service
        .waiting()
        .await
        .map_err(|e| anyhow::anyhow!("MCP server error: {e}"))?;

    Ok(())
}
