//! Colab API Client
//!
//! The raw HTTPS surface of the remote service: runtime assignment and
//! release on the Colab control plane (XSSI-prefixed JSON, two-step XSRF
//! dance), and the Jupyter API exposed by the per-runtime proxy (session
//! creation, kernel probe/interrupt, file download). Session logic talks to
//! this through the `RuntimeApi` trait so it can be tested against a
//! scripted fake.

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::BridgeError;

const COLAB_API: &str = "https://colab.research.google.com";
const CLIENT_AGENT: &str = "vscode";

/// Auth challenge types the bridge can answer without a browser.
pub const EPHEMERAL_AUTH_TYPES: [&str; 2] = ["dfs_ephemeral", "auth_user_ephemeral"];

/// GPU tier requested from Colab.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Accelerator {
    T4,
    L4,
}

impl Accelerator {
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_uppercase().as_str() {
            "T4" => Some(Self::T4),
            "L4" => Some(Self::L4),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::T4 => "T4",
            Self::L4 => "L4",
        }
    }

    /// L4 is only offered on the high-memory shape.
    fn requires_highmem(&self) -> bool {
        matches!(self, Self::L4)
    }
}

impl std::fmt::Display for Accelerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Address and token of a runtime's Jupyter proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProxyInfo {
    pub url: String,
    pub token: String,
}

/// Result of a runtime assignment.
#[derive(Debug, Clone)]
pub struct RuntimeAssignment {
    /// Opaque runtime endpoint id, used for unassign/keep-alive
    pub endpoint: String,
    pub proxy: ProxyInfo,
    /// Colab handed back an assignment that already existed
    pub reused: bool,
}

/// Remote operations the session manager and dispatcher depend on.
#[async_trait]
pub trait RuntimeApi: Send + Sync {
    async fn assign_runtime(
        &self,
        token: &str,
        accelerator: Accelerator,
    ) -> Result<RuntimeAssignment, BridgeError>;

    async fn unassign_runtime(&self, token: &str, endpoint: &str) -> Result<(), BridgeError>;

    async fn keep_alive(&self, token: &str, endpoint: &str) -> Result<(), BridgeError>;

    /// One Jupyter session-creation attempt; fails until the runtime is up.
    async fn create_kernel(&self, proxy: &ProxyInfo) -> Result<String, BridgeError>;

    /// Lightweight liveness check for an existing kernel.
    async fn probe_kernel(&self, proxy: &ProxyInfo, kernel_id: &str) -> Result<bool, BridgeError>;

    async fn interrupt_kernel(&self, proxy: &ProxyInfo, kernel_id: &str)
        -> Result<(), BridgeError>;

    /// Download a file from the runtime's content root.
    async fn download_file(&self, proxy: &ProxyInfo, path: &str) -> Result<Vec<u8>, BridgeError>;

    /// Answer an ephemeral auth challenge by propagating user credentials.
    async fn propagate_credentials(
        &self,
        token: &str,
        endpoint: &str,
        auth_type: &str,
        dry_run: bool,
    ) -> Result<Value, BridgeError>;
}

/// `RuntimeApi` backed by the real Colab service.
#[derive(Clone)]
pub struct ColabClient {
    http: Client,
    base: String,
}

impl ColabClient {
    pub fn new() -> Self {
        Self::with_base(COLAB_API)
    }

    pub fn with_base(base: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            base: base.into(),
        }
    }

    fn control_get(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .get(format!("{}{}", self.base, path))
            .header("Accept", "application/json")
            .header("X-Colab-Client-Agent", CLIENT_AGENT)
    }

    fn control_post(&self, path: &str) -> reqwest::RequestBuilder {
        self.http
            .post(format!("{}{}", self.base, path))
            .header("Accept", "application/json")
            .header("X-Colab-Client-Agent", CLIENT_AGENT)
    }

    fn proxy_request(&self, builder: reqwest::RequestBuilder, proxy: &ProxyInfo) -> reqwest::RequestBuilder {
        builder
            .header("X-Colab-Runtime-Proxy-Token", &proxy.token)
            .header("X-Colab-Client-Agent", CLIENT_AGENT)
    }
}

impl Default for ColabClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a notebook hash in the shape Colab expects: a uuid with
/// underscores, dot-padded to 44 characters.
fn notebook_hash() -> String {
    let mut h = Uuid::new_v4().to_string().replace('-', "_");
    while h.len() < 44 {
        h.push('.');
    }
    h
}

/// Colab prefixes JSON bodies with `)]}'` against XSSI; strip and parse.
fn strip_xssi(text: &str) -> Result<Value, BridgeError> {
    let body = if text.starts_with(")]}'") {
        match text.find('\n') {
            Some(i) => &text[i + 1..],
            None => "",
        }
    } else {
        text
    };
    serde_json::from_str(body)
        .map_err(|e| BridgeError::remote(format!("malformed Colab response: {e}")))
}

/// Map a non-2xx control-plane response onto the error taxonomy, passing
/// quota messages through verbatim.
fn classify_failure(status: StatusCode, body: &str) -> BridgeError {
    let lower = body.to_ascii_lowercase();
    if status == StatusCode::TOO_MANY_REQUESTS
        || lower.contains("quota")
        || lower.contains("usage limit")
    {
        BridgeError::QuotaExceeded(body.trim().chars().take(500).collect())
    } else {
        BridgeError::Remote {
            status: status.as_u16(),
            message: body.trim().chars().take(500).collect(),
        }
    }
}

fn assignment_params(nbh: &str, accelerator: Accelerator) -> Vec<(&'static str, String)> {
    let mut params = vec![
        ("nbh", nbh.to_string()),
        ("authuser", "0".to_string()),
        ("variant", "GPU".to_string()),
        ("accelerator", accelerator.as_str().to_string()),
    ];
    if accelerator.requires_highmem() {
        params.push(("shape", "hm".to_string()));
    }
    params
}

fn parse_assignment(data: &Value) -> Option<(String, ProxyInfo)> {
    let endpoint = data.get("endpoint")?.as_str()?.to_string();
    let proxy_info = data.get("runtimeProxyInfo")?;
    let url = proxy_info
        .get("url")?
        .as_str()?
        .trim_end_matches('/')
        .to_string();
    let token = proxy_info.get("token")?.as_str()?.to_string();
    if endpoint.is_empty() || url.is_empty() || token.is_empty() {
        return None;
    }
    Some((endpoint, ProxyInfo { url, token }))
}

fn xsrf_token(data: &Value) -> Option<String> {
    data.get("token")
        .or_else(|| data.get("xsrfToken"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[async_trait]
impl RuntimeApi for ColabClient {
    async fn assign_runtime(
        &self,
        token: &str,
        accelerator: Accelerator,
    ) -> Result<RuntimeAssignment, BridgeError> {
        let nbh = notebook_hash();
        let params = assignment_params(&nbh, accelerator);

        info!("Requesting {} runtime from Colab", accelerator);

        // Step 1: GET yields either an existing assignment or an XSRF token.
        let resp = self
            .control_get("/tun/m/assign")
            .query(&params)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        let data = strip_xssi(&text)?;

        if let Some((endpoint, proxy)) = parse_assignment(&data) {
            info!("Reusing existing runtime assignment: endpoint={}", endpoint);
            return Ok(RuntimeAssignment {
                endpoint,
                proxy,
                reused: true,
            });
        }

        let xsrf = xsrf_token(&data)
            .ok_or_else(|| BridgeError::remote("no XSRF token in assign response"))?;

        // Step 2: POST with the XSRF token creates the assignment.
        let resp = self
            .control_post("/tun/m/assign")
            .query(&params)
            .bearer_auth(token)
            .header("X-Goog-Colab-Token", xsrf)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        let data = strip_xssi(&text)?;

        let (endpoint, proxy) = parse_assignment(&data)
            .ok_or_else(|| BridgeError::remote("incomplete assignment response"))?;
        info!("Runtime allocated: endpoint={}", endpoint);

        Ok(RuntimeAssignment {
            endpoint,
            proxy,
            reused: false,
        })
    }

    async fn unassign_runtime(&self, token: &str, endpoint: &str) -> Result<(), BridgeError> {
        let path = format!("/tun/m/unassign/{endpoint}");
        let params = [("authuser", "0")];

        let resp = self
            .control_get(&path)
            .query(&params)
            .bearer_auth(token)
            .timeout(Duration::from_secs(20))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        let xsrf = xsrf_token(&strip_xssi(&text)?).unwrap_or_default();

        let resp = self
            .control_post(&path)
            .query(&params)
            .bearer_auth(token)
            .header("X-Goog-Colab-Token", xsrf)
            .timeout(Duration::from_secs(20))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }
        info!("Runtime {} released", endpoint);
        Ok(())
    }

    async fn keep_alive(&self, token: &str, endpoint: &str) -> Result<(), BridgeError> {
        self.control_get(&format!("/tun/m/{endpoint}/keep-alive/"))
            .query(&[("authuser", "0")])
            .bearer_auth(token)
            .header("X-Colab-Tunnel", "Google")
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        Ok(())
    }

    async fn create_kernel(&self, proxy: &ProxyInfo) -> Result<String, BridgeError> {
        let body = json!({
            "kernel": {"name": "python3"},
            "name": "colab-exec",
            "path": "colab-exec",
            "type": "notebook",
        });

        let resp = self
            .proxy_request(self.http.post(format!("{}/api/sessions", proxy.url)), proxy)
            .json(&body)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }

        let data: Value = resp.json().await?;
        data.pointer("/kernel/id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| BridgeError::remote("session response carried no kernel id"))
    }

    async fn probe_kernel(&self, proxy: &ProxyInfo, kernel_id: &str) -> Result<bool, BridgeError> {
        let resp = self
            .proxy_request(
                self.http
                    .get(format!("{}/api/kernels/{}", proxy.url, kernel_id)),
                proxy,
            )
            .timeout(Duration::from_secs(10))
            .send()
            .await;

        match resp {
            Ok(r) => Ok(r.status().is_success()),
            Err(e) => {
                debug!("Kernel probe failed: {}", e);
                Ok(false)
            }
        }
    }

    async fn interrupt_kernel(
        &self,
        proxy: &ProxyInfo,
        kernel_id: &str,
    ) -> Result<(), BridgeError> {
        let resp = self
            .proxy_request(
                self.http
                    .post(format!("{}/api/kernels/{}/interrupt", proxy.url, kernel_id)),
                proxy,
            )
            .timeout(Duration::from_secs(10))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }
        Ok(())
    }

    async fn download_file(&self, proxy: &ProxyInfo, path: &str) -> Result<Vec<u8>, BridgeError> {
        let resp = self
            .proxy_request(
                self.http
                    .get(format!("{}/files/{}", proxy.url, path))
                    .query(&[("download", "1")]),
                proxy,
            )
            .timeout(Duration::from_secs(120))
            .send()
            .await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp.text().await.unwrap_or_default();
            return Err(classify_failure(status, &text));
        }
        Ok(resp.bytes().await?.to_vec())
    }

    async fn propagate_credentials(
        &self,
        token: &str,
        endpoint: &str,
        auth_type: &str,
        dry_run: bool,
    ) -> Result<Value, BridgeError> {
        let path = format!("/tun/m/credentials-propagation/{endpoint}");
        let dry = if dry_run { "true" } else { "false" };
        let params = [
            ("authuser", "0"),
            ("authtype", auth_type),
            ("version", "2"),
            ("dryrun", dry),
            ("propagate", "true"),
            ("record", "false"),
        ];

        let resp = self
            .control_get(&path)
            .query(&params)
            .bearer_auth(token)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            return Err(classify_failure(status, &text));
        }
        let xsrf = xsrf_token(&strip_xssi(&text)?).ok_or_else(|| {
            BridgeError::remote("no XSRF token from credentials propagation")
        })?;

        let resp = self
            .control_post(&path)
            .query(&params)
            .bearer_auth(token)
            .header("X-Goog-Colab-Token", xsrf)
            .timeout(Duration::from_secs(30))
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            warn!("Credential propagation rejected ({})", status);
            return Err(classify_failure(status, &text));
        }
        strip_xssi(&text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notebook_hash_shape() {
        let h = notebook_hash();
        assert_eq!(h.len(), 44);
        assert!(!h.contains('-'));
        assert!(h.ends_with("........"));
    }

    #[test]
    fn strip_xssi_prefix() {
        let data = strip_xssi(")]}'\n{\"token\": \"abc\"}").unwrap();
        assert_eq!(data["token"], "abc");

        let plain = strip_xssi("{\"token\": \"abc\"}").unwrap();
        assert_eq!(plain["token"], "abc");

        assert!(strip_xssi(")]}'").is_err());
    }

    #[test]
    fn quota_failures_are_classified() {
        let err = classify_failure(
            StatusCode::FORBIDDEN,
            "You cannot currently connect to a GPU due to usage limits",
        );
        assert!(matches!(err, BridgeError::QuotaExceeded(_)));

        let err = classify_failure(StatusCode::TOO_MANY_REQUESTS, "slow down");
        assert!(matches!(err, BridgeError::QuotaExceeded(_)));

        let err = classify_failure(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        assert!(matches!(err, BridgeError::Remote { status: 500, .. }));
    }

    #[test]
    fn assignment_requires_complete_proxy_info() {
        let full = json!({
            "endpoint": "m-s-abc123",
            "runtimeProxyInfo": {"url": "https://proxy.example/", "token": "pt"}
        });
        let (endpoint, proxy) = parse_assignment(&full).unwrap();
        assert_eq!(endpoint, "m-s-abc123");
        assert_eq!(proxy.url, "https://proxy.example");

        let partial = json!({"endpoint": "m-s-abc123", "runtimeProxyInfo": {"url": ""}});
        assert!(parse_assignment(&partial).is_none());
    }

    #[test]
    fn l4_requests_highmem_shape() {
        let params = assignment_params("nbh", Accelerator::L4);
        assert!(params.iter().any(|(k, v)| *k == "shape" && v == "hm"));
        let params = assignment_params("nbh", Accelerator::T4);
        assert!(!params.iter().any(|(k, _)| *k == "shape"));
    }

    #[test]
    fn accelerator_parsing() {
        assert_eq!(Accelerator::parse("t4"), Some(Accelerator::T4));
        assert_eq!(Accelerator::parse("L4"), Some(Accelerator::L4));
        assert_eq!(Accelerator::parse("A100"), None);
    }
}
