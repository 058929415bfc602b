//! Execution Dispatcher
//!
//! Submits code to a session's kernel over the Jupyter channels WebSocket
//! and assembles per-cell structured output. The caller's timeout is a hard
//! ceiling on the wait: when it elapses the kernel gets a best-effort
//! interrupt, the partial output is still returned with `status=timeout`,
//! and the session stays cached for the next request.

use futures_util::{SinkExt, StreamExt};
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::AuthFlow;
use crate::cells::{self, CellPlan};
use crate::colab::{Accelerator, RuntimeApi, EPHEMERAL_AUTH_TYPES};
use crate::error::BridgeError;
use crate::session::ColabSession;

static ANSI_ESCAPES: Lazy<Regex> = Lazy::new(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());

/// One unit of code to run, immutable once submitted.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    pub code: String,
    pub accelerator: Accelerator,
    pub timeout: Duration,
}

/// Structured result of one cell.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CellOutput {
    pub stdout: String,
    pub stderr: String,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Ok,
    Error,
    Timeout,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
            Self::Timeout => "timeout",
        }
    }
}

/// Result of one execution request; cells appear in submission order.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    pub cells: Vec<CellOutput>,
    pub status: ExecutionStatus,
}

/// Raw output harvested from the kernel message stream.
#[derive(Debug, Default)]
struct StreamCapture {
    stdout: String,
    stderr: String,
    error_trace: Option<String>,
    timed_out: bool,
}

/// Dispatches execution requests onto a live session.
pub struct Dispatcher {
    api: Arc<dyn RuntimeApi>,
    auth: Arc<AuthFlow>,
}

impl Dispatcher {
    pub fn new(api: Arc<dyn RuntimeApi>, auth: Arc<AuthFlow>) -> Self {
        Self { api, auth }
    }

    /// Run code on the session's kernel and collect per-cell output.
    pub async fn execute(
        &self,
        session: &mut ColabSession,
        request: &ExecutionRequest,
    ) -> Result<ExecutionResult, BridgeError> {
        let plan = cells::wrap(&request.code);
        debug!(
            "Executing {} cell(s) on {} (timeout {}s)",
            plan.count,
            session.endpoint,
            request.timeout.as_secs()
        );

        let capture = self.pump_kernel(session, &plan, request.timeout).await?;
        session.touch();

        if capture.timed_out {
            info!("Execution timed out, interrupting kernel on {}", session.endpoint);
            if let Err(e) = self
                .api
                .interrupt_kernel(&session.proxy, &session.kernel_id)
                .await
            {
                warn!("Kernel interrupt failed: {}", e);
                session.suspect = true;
            }
        }

        Ok(assemble_result(&plan, capture))
    }

    /// Drive the channels WebSocket until the kernel goes idle or the
    /// deadline passes.
    async fn pump_kernel(
        &self,
        session: &ColabSession,
        plan: &CellPlan,
        timeout: Duration,
    ) -> Result<StreamCapture, BridgeError> {
        let client_session_id = Uuid::new_v4().simple().to_string();
        let ws_url = format!(
            "{}/api/kernels/{}/channels?session_id={}",
            websocket_base(&session.proxy.url),
            session.kernel_id,
            client_session_id
        );

        let mut ws_request = ws_url
            .into_client_request()
            .map_err(|e| BridgeError::remote(format!("bad websocket request: {e}")))?;
        let headers = ws_request.headers_mut();
        headers.insert(
            "X-Colab-Runtime-Proxy-Token",
            HeaderValue::from_str(&session.proxy.token)
                .map_err(|e| BridgeError::remote(format!("bad proxy token: {e}")))?,
        );
        headers.insert("X-Colab-Client-Agent", HeaderValue::from_static("vscode"));

        let (ws, _) = connect_async(ws_request)
            .await
            .map_err(|e| BridgeError::remote(format!("kernel channel connect failed: {e}")))?;
        let (mut sink, mut stream) = ws.split();

        let msg_id = Uuid::new_v4().simple().to_string();
        let execute_msg = json!({
            "header": {
                "msg_id": msg_id,
                "msg_type": "execute_request",
                "username": "colab-exec",
                "session": client_session_id,
                "version": "5.3",
            },
            "parent_header": {},
            "metadata": {},
            "content": {
                "code": plan.wrapped,
                "silent": false,
                "store_history": true,
                "user_expressions": {},
                "allow_stdin": false,
                "stop_on_error": true,
            },
            "channel": "shell",
        });
        sink.send(Message::Text(execute_msg.to_string()))
            .await
            .map_err(|e| BridgeError::remote(format!("execute_request send failed: {e}")))?;

        let deadline = Instant::now() + timeout;
        let mut capture = StreamCapture::default();

        loop {
            let frame = match tokio::time::timeout_at(deadline, stream.next()).await {
                Err(_) => {
                    capture.timed_out = true;
                    break;
                }
                Ok(None) => {
                    return Err(BridgeError::remote(
                        "kernel channel closed before execution finished",
                    ));
                }
                Ok(Some(Err(e))) => {
                    return Err(BridgeError::remote(format!("kernel channel error: {e}")));
                }
                Ok(Some(Ok(frame))) => frame,
            };

            let text = match frame {
                Message::Text(text) => text,
                Message::Close(_) => {
                    return Err(BridgeError::remote(
                        "kernel channel closed before execution finished",
                    ));
                }
                _ => continue,
            };
            let Ok(msg) = serde_json::from_str::<Value>(&text) else {
                continue;
            };

            let msg_type = msg
                .get("msg_type")
                .and_then(Value::as_str)
                .or_else(|| msg.pointer("/header/msg_type").and_then(Value::as_str))
                .unwrap_or("");

            // Colab ephemeral-auth challenges arrive outside the parent
            // message chain and must be answered to unblock the kernel.
            if msg_type == "colab_request" {
                if let Some(reply) = self
                    .answer_auth_challenge(session, &client_session_id, &msg, &mut capture)
                    .await
                {
                    sink.send(Message::Text(reply.to_string())).await.ok();
                }
                continue;
            }

            if msg.pointer("/parent_header/msg_id").and_then(Value::as_str) != Some(&msg_id) {
                continue;
            }

            let content = msg.get("content").cloned().unwrap_or_else(|| json!({}));
            match msg_type {
                "stream" => {
                    let text = content.get("text").and_then(Value::as_str).unwrap_or("");
                    match content.get("name").and_then(Value::as_str) {
                        Some("stderr") => capture.stderr.push_str(text),
                        _ => capture.stdout.push_str(text),
                    }
                }
                "execute_result" | "display_data" => {
                    if let Some(text) = content.pointer("/data/text~1plain").and_then(Value::as_str)
                    {
                        if !text.is_empty() {
                            capture.stdout.push_str(text);
                            capture.stdout.push('\n');
                        }
                    }
                }
                "error" => {
                    capture.error_trace = Some(format_error_trace(&content));
                }
                "status" => {
                    if content.get("execution_state").and_then(Value::as_str) == Some("idle") {
                        break;
                    }
                }
                _ => {}
            }
        }

        sink.close().await.ok();
        Ok(capture)
    }

    /// Reply to a `colab_request` auth challenge, propagating credentials
    /// for ephemeral auth types and reporting anything else as an error.
    async fn answer_auth_challenge(
        &self,
        session: &ColabSession,
        client_session_id: &str,
        msg: &Value,
        capture: &mut StreamCapture,
    ) -> Option<Value> {
        let metadata = msg.get("metadata")?;
        if metadata.get("colab_request_type").and_then(Value::as_str) != Some("request_auth") {
            return None;
        }
        let colab_msg_id = metadata.get("colab_msg_id")?.clone();
        let auth_type = msg
            .pointer("/content/request/authType")
            .and_then(Value::as_str)
            .unwrap_or("")
            .to_ascii_lowercase();

        let error_text = match self.auth.cached_access_token() {
            None => Some("missing auth context for credentials propagation".to_string()),
            Some(_) if !EPHEMERAL_AUTH_TYPES.contains(&auth_type.as_str()) => {
                Some(format!("unsupported auth type: {auth_type}"))
            }
            Some(token) => {
                match self
                    .api
                    .propagate_credentials(&token, &session.endpoint, &auth_type, true)
                    .await
                {
                    Ok(dry) if dry.get("success").and_then(Value::as_bool) == Some(true) => self
                        .api
                        .propagate_credentials(&token, &session.endpoint, &auth_type, false)
                        .await
                        .err()
                        .map(|e| format!("{auth_type} propagation failed: {e}")),
                    Ok(dry) => match dry.get("unauthorizedRedirectUri").and_then(Value::as_str) {
                        Some(uri) => Some(format!(
                            "{auth_type} requires interactive browser consent: {uri}"
                        )),
                        None => Some(format!("{auth_type} dry-run failed: {dry}")),
                    },
                    Err(e) => Some(format!("{auth_type} propagation failed: {e}")),
                }
            }
        };

        if let Some(err) = &error_text {
            capture
                .stderr
                .push_str(&format!("[colab-exec] Warning: {err}\n"));
        }
        Some(make_input_reply(client_session_id, colab_msg_id, error_text))
    }
}

fn websocket_base(proxy_url: &str) -> String {
    if let Some(rest) = proxy_url.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = proxy_url.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        proxy_url.to_string()
    }
}

fn format_error_trace(content: &Value) -> String {
    let ename = content.get("ename").and_then(Value::as_str).unwrap_or("Error");
    let evalue = content.get("evalue").and_then(Value::as_str).unwrap_or("");
    let mut trace = format!("{ename}: {evalue}\n");
    if let Some(lines) = content.get("traceback").and_then(Value::as_array) {
        for line in lines.iter().filter_map(Value::as_str) {
            trace.push_str(&ANSI_ESCAPES.replace_all(line, ""));
            trace.push('\n');
        }
    }
    trace
}

fn make_input_reply(client_session_id: &str, colab_msg_id: Value, err: Option<String>) -> Value {
    let mut value = json!({
        "type": "colab_reply",
        "colab_msg_id": colab_msg_id,
    });
    if let Some(err) = err {
        value["error"] = Value::String(err);
    }
    json!({
        "header": {
            "msg_id": Uuid::new_v4().simple().to_string(),
            "msg_type": "input_reply",
            "session": client_session_id,
            "date": chrono::Utc::now().format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
            "username": "username",
            "version": "5.0",
        },
        "content": {"value": value},
        "channel": "stdin",
        "metadata": {},
        "parent_header": {},
    })
}

/// Cut the merged capture into per-cell outputs. The merged stderr and any
/// error trace attach to the cell that was running when execution stopped
/// (the first started-but-incomplete cell), or to the last cell otherwise.
fn assemble_result(plan: &CellPlan, capture: StreamCapture) -> ExecutionResult {
    let parsed = cells::parse(&capture.stdout, plan.count);

    let failing = parsed
        .iter()
        .position(|c| c.started && !c.completed)
        .unwrap_or(plan.count.saturating_sub(1));

    let mut outputs: Vec<CellOutput> = parsed
        .into_iter()
        .map(|c| CellOutput {
            stdout: c.stdout,
            ..Default::default()
        })
        .collect();

    if let Some(slot) = outputs.get_mut(failing) {
        slot.stderr = capture.stderr;
        slot.error = capture.error_trace.clone();
    }

    let status = if capture.timed_out {
        ExecutionStatus::Timeout
    } else if capture.error_trace.is_some() {
        ExecutionStatus::Error
    } else {
        ExecutionStatus::Ok
    };

    ExecutionResult {
        cells: outputs,
        status,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capture(stdout: &str, stderr: &str, error: Option<&str>, timed_out: bool) -> StreamCapture {
        StreamCapture {
            stdout: stdout.to_string(),
            stderr: stderr.to_string(),
            error_trace: error.map(str::to_string),
            timed_out,
        }
    }

    #[test]
    fn single_cell_ok() {
        let plan = cells::wrap("print(1+1)");
        let merged = "===CELL_START_0===\n2\n===CELL_END_0===\n";
        let result = assemble_result(&plan, capture(merged, "", None, false));

        assert_eq!(result.status, ExecutionStatus::Ok);
        assert_eq!(result.cells.len(), 1);
        assert_eq!(result.cells[0].stdout, "2");
        assert!(result.cells[0].error.is_none());
    }

    #[test]
    fn error_attaches_to_failing_cell_and_preserves_earlier_output() {
        let plan = cells::wrap("print('a')\n\nraise ValueError('boom')\n\nprint('c')");
        let merged = "===CELL_START_0===\na\n===CELL_END_0===\n===CELL_START_1===\n";
        let result = assemble_result(
            &plan,
            capture(merged, "", Some("ValueError: boom\nTraceback..."), false),
        );

        assert_eq!(result.status, ExecutionStatus::Error);
        assert_eq!(result.cells[0].stdout, "a");
        assert!(result.cells[0].error.is_none());
        assert!(result.cells[1].error.as_deref().unwrap().contains("ValueError"));
        assert!(result.cells[2].stdout.is_empty());
        assert!(result.cells[2].error.is_none());
    }

    #[test]
    fn timeout_keeps_partial_output() {
        let plan = cells::wrap("print('x')\n\nimport time; time.sleep(10)");
        let merged = "===CELL_START_0===\nx\n===CELL_END_0===\n===CELL_START_1===\npartial\n";
        let result = assemble_result(&plan, capture(merged, "", None, true));

        assert_eq!(result.status, ExecutionStatus::Timeout);
        assert_eq!(result.cells[0].stdout, "x");
        assert_eq!(result.cells[1].stdout, "partial");
    }

    #[test]
    fn stderr_lands_on_last_cell_when_all_complete() {
        let plan = cells::wrap("import warnings\n\nwarnings.warn('careful')");
        let merged = "===CELL_START_0===\n===CELL_END_0===\n===CELL_START_1===\n===CELL_END_1===\n";
        let result = assemble_result(&plan, capture(merged, "UserWarning: careful\n", None, false));

        assert_eq!(result.status, ExecutionStatus::Ok);
        assert!(result.cells[0].stderr.is_empty());
        assert!(result.cells[1].stderr.contains("careful"));
    }

    #[test]
    fn ansi_codes_are_stripped_from_traces() {
        let content = json!({
            "ename": "ValueError",
            "evalue": "boom",
            "traceback": ["\u{1b}[0;31mValueError\u{1b}[0m: boom"],
        });
        let trace = format_error_trace(&content);
        assert!(!trace.contains('\u{1b}'));
        assert!(trace.contains("ValueError: boom"));
    }

    #[test]
    fn websocket_base_scheme_swap() {
        assert_eq!(websocket_base("https://proxy.example"), "wss://proxy.example");
        assert_eq!(websocket_base("http://proxy.example"), "ws://proxy.example");
    }

    #[test]
    fn input_reply_carries_error() {
        let reply = make_input_reply("sess", json!(7), Some("nope".into()));
        assert_eq!(reply["channel"], "stdin");
        assert_eq!(reply["content"]["value"]["colab_msg_id"], 7);
        assert_eq!(reply["content"]["value"]["error"], "nope");

        let ok = make_input_reply("sess", json!(8), None);
        assert!(ok["content"]["value"].get("error").is_none());
    }
}
