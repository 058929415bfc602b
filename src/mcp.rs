//! MCP Protocol Handler
//!
//! JSON-RPC 2.0 over stdio for the Model Context Protocol. One request per
//! line in, one response per line out; notifications get no response. All
//! logging goes to stderr so stdout carries nothing but protocol frames.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::tools::ToolRegistry;

const PROTOCOL_VERSION: &str = "2024-11-05";

/// JSON-RPC 2.0 Request
#[derive(Debug, Clone, Deserialize)]
pub struct McpRequest {
    #[allow(dead_code)]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default)]
    pub params: Value,
    pub id: Option<Value>,
}

impl McpRequest {
    /// Notifications carry no id and expect no response.
    fn is_notification(&self) -> bool {
        self.id.is_none()
    }
}

/// JSON-RPC 2.0 Response
#[derive(Debug, Clone, Serialize)]
pub struct McpResponse {
    pub jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<McpError>,
    pub id: Option<Value>,
}

/// JSON-RPC 2.0 Error
#[derive(Debug, Clone, Serialize)]
pub struct McpError {
    pub code: i32,
    pub message: String,
}

impl McpResponse {
    pub fn success(id: Option<Value>, result: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            result: Some(result),
            error: None,
            id,
        }
    }

    pub fn error(id: Option<Value>, code: i32, message: impl Into<String>) -> Self {
        Self {
            jsonrpc: "2.0",
            result: None,
            error: Some(McpError {
                code,
                message: message.into(),
            }),
            id,
        }
    }
}

/// MCP Error Codes
pub mod error_codes {
    // JSON-RPC standard errors
    pub const PARSE_ERROR: i32 = -32700;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;

    // MCP custom errors (-32000 to -32099)
    pub const TOOL_EXECUTION_ERROR: i32 = -32001;
}

/// MCP server speaking JSON-RPC over stdio.
pub struct McpServer {
    tools: Arc<ToolRegistry>,
}

impl McpServer {
    pub fn new(config: Config) -> Self {
        let tools = Arc::new(ToolRegistry::new(Arc::new(config)));
        Self { tools }
    }

    /// Read requests from stdin until EOF, writing one response per line.
    pub async fn run(&self) -> anyhow::Result<()> {
        let stdin = tokio::io::stdin();
        let mut stdout = tokio::io::stdout();
        let mut reader = BufReader::new(stdin);
        let mut line = String::new();

        info!("MCP server ready, waiting for requests...");

        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                info!("Client disconnected (EOF)");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            debug!("← {}", trimmed);

            let response = match serde_json::from_str::<McpRequest>(trimmed) {
                Ok(request) => self.dispatch(request).await,
                Err(e) => {
                    error!("Parse error: {}", e);
                    Some(McpResponse::error(
                        None,
                        error_codes::PARSE_ERROR,
                        format!("Parse error: {}", e),
                    ))
                }
            };

            if let Some(response) = response {
                let payload = serde_json::to_string(&response)?;
                debug!("→ {}", payload);
                stdout.write_all(payload.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }

        // Client is gone; release any cached runtimes before exiting.
        self.tools.shutdown().await;
        Ok(())
    }

    async fn dispatch(&self, request: McpRequest) -> Option<McpResponse> {
        if request.is_notification() {
            debug!("Notification: {}", request.method);
            return None;
        }

        let response = match request.method.as_str() {
            "initialize" => McpResponse::success(
                request.id,
                json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {
                        "tools": { "listChanged": false }
                    },
                    "serverInfo": {
                        "name": "colab-exec-mcp",
                        "version": env!("CARGO_PKG_VERSION")
                    }
                }),
            ),
            "ping" => McpResponse::success(request.id, json!({})),
            "shutdown" => {
                info!("Shutdown requested, releasing runtimes");
                self.tools.shutdown().await;
                McpResponse::success(request.id, json!({}))
            }
            "tools/list" => McpResponse::success(
                request.id,
                json!({ "tools": self.tools.list_definitions() }),
            ),
            "tools/call" => self.call_tool(request.id, request.params).await,
            method => {
                warn!("Unknown method: {}", method);
                McpResponse::error(
                    request.id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {}", method),
                )
            }
        };
        Some(response)
    }

    async fn call_tool(&self, id: Option<Value>, params: Value) -> McpResponse {
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            return McpResponse::error(id, error_codes::INVALID_PARAMS, "Missing 'name' parameter");
        };
        let arguments = params.get("arguments").cloned().unwrap_or_else(|| json!({}));

        match self.tools.call(name, arguments).await {
            Ok(result) => McpResponse::success(
                id,
                json!({
                    "content": [{ "type": "text", "text": result }]
                }),
            ),
            Err(e) => McpResponse::error(
                id,
                error_codes::TOOL_EXECUTION_ERROR,
                format!("Tool '{}' failed: {:#}", name, e),
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_server() -> McpServer {
        // from_env with no overrides gives harmless defaults for protocol tests
        McpServer::new(Config::from_env().unwrap())
    }

    #[tokio::test]
    async fn initialize_reports_identity() {
        let server = test_server();
        let request: McpRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"initialize","params":{},"id":1}"#,
        )
        .unwrap();

        let response = server.dispatch(request).await.unwrap();
        let result = response.result.unwrap();
        assert_eq!(result["serverInfo"]["name"], "colab-exec-mcp");
        assert_eq!(result["protocolVersion"], PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn notifications_get_no_response() {
        let server = test_server();
        let request: McpRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"notifications/initialized"}"#,
        )
        .unwrap();
        assert!(server.dispatch(request).await.is_none());
    }

    #[tokio::test]
    async fn unknown_method_is_an_error() {
        let server = test_server();
        let request: McpRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"bogus","id":7}"#).unwrap();

        let response = server.dispatch(request).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::METHOD_NOT_FOUND);
        assert_eq!(response.id, Some(json!(7)));
    }

    #[tokio::test]
    async fn tools_list_is_exposed() {
        let server = test_server();
        let request: McpRequest =
            serde_json::from_str(r#"{"jsonrpc":"2.0","method":"tools/list","id":2}"#).unwrap();

        let response = server.dispatch(request).await.unwrap();
        let tools = response.result.unwrap()["tools"].as_array().unwrap().len();
        assert_eq!(tools, 3);
    }

    #[tokio::test]
    async fn tool_call_requires_name() {
        let server = test_server();
        let request: McpRequest = serde_json::from_str(
            r#"{"jsonrpc":"2.0","method":"tools/call","params":{"arguments":{}},"id":3}"#,
        )
        .unwrap();

        let response = server.dispatch(request).await.unwrap();
        assert_eq!(response.error.unwrap().code, error_codes::INVALID_PARAMS);
    }
}
