//! MCP Tool Registry
//!
//! Defines and executes the three Colab execution tools: inline code, local
//! file, and notebook-style execution with artifact download.

use anyhow::{anyhow, bail, Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::artifacts::ArtifactRetriever;
use crate::auth::AuthFlow;
use crate::colab::{Accelerator, ColabClient, RuntimeApi};
use crate::config::Config;
use crate::credentials::CredentialStore;
use crate::error::BridgeError;
use crate::execute::{Dispatcher, ExecutionRequest, ExecutionResult};
use crate::session::SessionRegistry;

/// Tool definition for MCP
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Tool registry wiring the bridge components together
pub struct ToolRegistry {
    config: Arc<Config>,
    sessions: SessionRegistry,
    dispatcher: Dispatcher,
    artifacts: ArtifactRetriever,
}

impl ToolRegistry {
    /// Create new tool registry
    pub fn new(config: Arc<Config>) -> Self {
        let api: Arc<dyn RuntimeApi> = Arc::new(ColabClient::new());
        let store = CredentialStore::new(config.token_path.clone());
        let auth = AuthFlow::new(store, config.consent_timeout);
        let sessions = SessionRegistry::new(api.clone(), auth.clone(), (*config).clone());
        let dispatcher = Dispatcher::new(api.clone(), auth);
        let artifacts = ArtifactRetriever::new(api);

        Self {
            config,
            sessions,
            dispatcher,
            artifacts,
        }
    }

    /// Release cached runtimes; called on shutdown.
    pub async fn shutdown(&self) {
        self.sessions.shutdown().await;
    }

    /// List all tool definitions
    pub fn list_definitions(&self) -> Vec<ToolDefinition> {
        let accelerator_schema = json!({
            "type": "string",
            "description": "GPU type: \"T4\" (free-tier) or \"L4\" (premium). Default: \"T4\".",
            "default": "T4"
        });
        let timeout_schema = json!({
            "type": "integer",
            "description": "Max execution time in seconds. Default: 300.",
            "default": 300
        });

        vec![
            ToolDefinition {
                name: "colab_execute".to_string(),
                description: "Execute Python code on a Google Colab GPU runtime and return per-cell output".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "Python code to execute on the Colab GPU runtime"
                        },
                        "accelerator": accelerator_schema,
                        "timeout": timeout_schema
                    },
                    "required": ["code"]
                }),
            },
            ToolDefinition {
                name: "colab_execute_file".to_string(),
                description: "Execute a local Python file on a Google Colab GPU runtime".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "file_path": {
                            "type": "string",
                            "description": "Path to a local .py file to execute on Colab"
                        },
                        "accelerator": accelerator_schema,
                        "timeout": timeout_schema
                    },
                    "required": ["file_path"]
                }),
            },
            ToolDefinition {
                name: "colab_execute_notebook".to_string(),
                description: "Execute Python code on Colab GPU and download generated artifacts (images, CSVs, models) to a local directory".to_string(),
                input_schema: json!({
                    "type": "object",
                    "properties": {
                        "code": {
                            "type": "string",
                            "description": "Python code to execute on the Colab GPU runtime"
                        },
                        "output_dir": {
                            "type": "string",
                            "description": "Local directory to extract generated artifacts into"
                        },
                        "accelerator": accelerator_schema,
                        "timeout": timeout_schema
                    },
                    "required": ["code", "output_dir"]
                }),
            },
        ]
    }

    /// Execute a tool call
    pub async fn call(&self, name: &str, args: Value) -> Result<String> {
        info!("Tool call: {}", name);

        match name {
            "colab_execute" => {
                let code = required_str(&args, "code")?;
                let result = self.run(code.to_string(), &args).await?;
                Ok(render_result(&result, None).to_string())
            }
            "colab_execute_file" => {
                let file_path = required_str(&args, "file_path")?;
                let path = PathBuf::from(shellexpand::tilde(file_path).into_owned());
                let code = std::fs::read_to_string(&path)
                    .with_context(|| format!("Cannot read file: {}", path.display()))?;
                let result = self.run(code, &args).await?;
                Ok(render_result(&result, None).to_string())
            }
            "colab_execute_notebook" => {
                let code = required_str(&args, "code")?;
                let output_dir = required_str(&args, "output_dir")?;
                let output_dir = PathBuf::from(shellexpand::tilde(output_dir).into_owned());

                let accelerator = parse_accelerator(&args)?;
                let request = ExecutionRequest {
                    code: code.to_string(),
                    accelerator,
                    timeout: self.parse_timeout(&args),
                };

                let mut handle = self.sessions.acquire(accelerator).await.map_err(with_advice)?;
                let result = self
                    .dispatcher
                    .execute(handle.session_mut(), &request)
                    .await
                    .map_err(with_advice)?;

                // Artifact failure must not discard the execution result.
                let (artifact_files, artifact_error) = match self
                    .artifacts
                    .collect(&self.dispatcher, handle.session_mut(), &output_dir)
                    .await
                {
                    Ok(files) => (files, None),
                    Err(e) => {
                        warn!("Artifact collection failed: {}", e);
                        (Vec::new(), Some(format!("{e}. {}", e.advice())))
                    }
                };

                let mut payload = render_result(&result, Some(artifact_files));
                if let Some(err) = artifact_error {
                    payload["artifact_error"] = Value::String(err);
                }
                Ok(payload.to_string())
            }
            _ => bail!("Unknown tool: {name}"),
        }
    }

    async fn run(&self, code: String, args: &Value) -> Result<ExecutionResult> {
        let accelerator = parse_accelerator(args)?;
        let request = ExecutionRequest {
            code,
            accelerator,
            timeout: self.parse_timeout(args),
        };

        let mut handle = self.sessions.acquire(accelerator).await.map_err(with_advice)?;
        self.dispatcher
            .execute(handle.session_mut(), &request)
            .await
            .map_err(with_advice)
    }

    fn parse_timeout(&self, args: &Value) -> Duration {
        args.get("timeout")
            .and_then(Value::as_u64)
            .map(Duration::from_secs)
            .unwrap_or(self.config.default_exec_timeout)
    }
}

fn required_str<'a>(args: &'a Value, key: &str) -> Result<&'a str> {
    args.get(key)
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| anyhow!("Missing required parameter: {key}"))
}

fn parse_accelerator(args: &Value) -> Result<Accelerator> {
    let raw = args
        .get("accelerator")
        .and_then(Value::as_str)
        .unwrap_or("T4");
    Accelerator::parse(raw).ok_or_else(|| anyhow!("Unknown accelerator: {raw} (expected T4 or L4)"))
}

/// Attach the actionable hint so the MCP client sees both what failed and
/// what to do about it.
fn with_advice(e: BridgeError) -> anyhow::Error {
    let advice = e.advice();
    anyhow!("{e}. {advice}")
}

fn render_result(result: &ExecutionResult, artifact_files: Option<Vec<String>>) -> Value {
    let mut payload = json!({
        "cells": result.cells,
        "status": result.status.as_str(),
    });
    if let Some(files) = artifact_files {
        payload["artifact_files"] = json!(files);
    }
    payload
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execute::{CellOutput, ExecutionStatus};

    #[test]
    fn definitions_cover_the_three_tools() {
        let config = Arc::new(Config {
            token_path: PathBuf::from("/tmp/token.json"),
            consent_timeout: Duration::from_secs(120),
            session_create_timeout: Duration::from_secs(180),
            default_exec_timeout: Duration::from_secs(300),
            keepalive_interval: Duration::from_secs(60),
            busy_policy: crate::config::BusyPolicy::Queue,
        });
        let registry = ToolRegistry::new(config);
        let names: Vec<String> = registry
            .list_definitions()
            .into_iter()
            .map(|d| d.name)
            .collect();
        assert_eq!(
            names,
            vec!["colab_execute", "colab_execute_file", "colab_execute_notebook"]
        );
    }

    #[test]
    fn render_includes_artifacts_only_for_notebook() {
        let result = ExecutionResult {
            cells: vec![CellOutput {
                stdout: "2".into(),
                stderr: String::new(),
                error: None,
            }],
            status: ExecutionStatus::Ok,
        };

        let plain = render_result(&result, None);
        assert_eq!(plain["status"], "ok");
        assert_eq!(plain["cells"][0]["stdout"], "2");
        assert!(plain.get("artifact_files").is_none());

        let with_files = render_result(&result, Some(vec!["model.pt".into()]));
        assert_eq!(with_files["artifact_files"][0], "model.pt");
    }

    #[test]
    fn accelerator_defaults_and_validates() {
        assert_eq!(
            parse_accelerator(&json!({})).unwrap(),
            Accelerator::T4
        );
        assert_eq!(
            parse_accelerator(&json!({"accelerator": "l4"})).unwrap(),
            Accelerator::L4
        );
        assert!(parse_accelerator(&json!({"accelerator": "H100"})).is_err());
    }
}
