//! Auth Flow Controller
//!
//! Produces a valid OAuth2 credential: cached token if still good, a single
//! refresh-token exchange if not, and a full browser consent flow as the
//! last resort. The consent flow binds an ephemeral local listener for the
//! redirect and holds it only for the duration of the wait.

use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpListener;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::credentials::{Credential, CredentialStore};
use crate::error::BridgeError;

const AUTH_ENDPOINT: &str = "https://accounts.google.com/o/oauth2/v2/auth";
const TOKEN_ENDPOINT: &str = "https://oauth2.googleapis.com/token";

// OAuth2 client credentials from the Colab VS Code extension
// (google.colab@0.3.0). Intentionally public; the extension names them
// "ClientNotSoSecret".
const CLIENT_ID: &str =
    "1014160490159-cvot3bea7tgkp72a4m29h20d9ddo6bne.apps.googleusercontent.com";
const CLIENT_SECRET: &str = "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";

const SCOPES: [&str; 3] = [
    "https://www.googleapis.com/auth/colaboratory",
    "profile",
    "email",
];

const CONSENT_PAGE: &str = "<!DOCTYPE html>\
<html><head><meta charset=\"utf-8\"><title>colab-exec</title></head>\
<body style=\"font-family: sans-serif; text-align: center; padding: 50px;\">\
<h1>Authentication successful!</h1><p>You can close this tab.</p>\
</body></html>";

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    expires_in: i64,
    #[serde(default)]
    scope: Option<String>,
}

impl TokenResponse {
    fn into_credential(self, fallback_refresh: Option<String>) -> Credential {
        let scopes = self
            .scope
            .as_deref()
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_else(|| SCOPES.iter().map(|s| s.to_string()).collect());
        let refresh = self
            .refresh_token
            .or(fallback_refresh)
            .unwrap_or_default();
        Credential::new(self.access_token, refresh, self.expires_in, scopes)
    }
}

/// Obtains and refreshes credentials, backed by the on-disk store.
pub struct AuthFlow {
    store: CredentialStore,
    http: reqwest::Client,
    consent_timeout: Duration,
    token_endpoint: String,
    // Refresh must not run twice concurrently: a half-refreshed credential
    // is never persisted, and the second waiter picks up the first's result.
    refresh_lock: tokio::sync::Mutex<()>,
}

impl AuthFlow {
    pub fn new(store: CredentialStore, consent_timeout: Duration) -> Arc<Self> {
        Self::with_token_endpoint(store, consent_timeout, TOKEN_ENDPOINT.to_string())
    }

    /// Token endpoint override, used to exercise the refresh path against a
    /// local fake.
    pub fn with_token_endpoint(
        store: CredentialStore,
        consent_timeout: Duration,
        token_endpoint: String,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            http: reqwest::Client::new(),
            consent_timeout,
            token_endpoint,
            refresh_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// A valid access token, if one is cached; never touches the network.
    pub fn cached_access_token(&self) -> Option<String> {
        self.store
            .load()
            .filter(Credential::is_valid)
            .map(|c| c.access_token)
    }

    /// Return a valid credential, refreshing or re-consenting as needed.
    pub async fn obtain_credential(&self) -> Result<Credential, BridgeError> {
        if let Some(cred) = self.store.load() {
            if cred.is_valid() {
                debug!(
                    "Using cached credential ({}s remaining)",
                    cred.remaining_seconds()
                );
                return Ok(cred);
            }

            let _guard = self.refresh_lock.lock().await;

            // Another task may have refreshed while we waited for the lock.
            if let Some(cred) = self.store.load() {
                if cred.is_valid() {
                    return Ok(cred);
                }
                if !cred.refresh_token.is_empty() {
                    match self.refresh(&cred).await {
                        Ok(fresh) => return Ok(fresh),
                        Err(e) => {
                            warn!("Token refresh failed ({}), falling back to consent", e);
                            self.store.clear()?;
                        }
                    }
                }
            }
            return self.interactive_consent().await;
        }

        let _guard = self.refresh_lock.lock().await;
        if let Some(cred) = self.store.load() {
            if cred.is_valid() {
                return Ok(cred);
            }
        }
        self.interactive_consent().await
    }

    /// Exactly one refresh-token exchange.
    async fn refresh(&self, stale: &Credential) -> Result<Credential, BridgeError> {
        info!("Access token expiring, refreshing");
        let resp = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("refresh_token", stale.refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| BridgeError::AuthFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::AuthFailed(body.chars().take(300).collect()));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::AuthFailed(e.to_string()))?;
        let cred = token.into_credential(Some(stale.refresh_token.clone()));
        self.store.save(&cred)?;
        Ok(cred)
    }

    /// Full browser consent: local callback listener, bounded wait, code
    /// exchange.
    async fn interactive_consent(&self) -> Result<Credential, BridgeError> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let port = listener.local_addr()?.port();
        let redirect_uri = format!("http://127.0.0.1:{port}");
        let state = Uuid::new_v4().simple().to_string();

        let consent_url = format!(
            "{}?response_type=code&client_id={}&redirect_uri={}&scope={}&state={}&access_type=offline&prompt=consent",
            AUTH_ENDPOINT,
            CLIENT_ID,
            percent_encode(&redirect_uri),
            percent_encode(&SCOPES.join(" ")),
            state,
        );

        // stderr, not stdout: stdout carries the MCP protocol.
        eprintln!("[colab-exec] Open this URL in your browser to authorize:");
        eprintln!("[colab-exec]   {consent_url}");
        info!("Waiting for OAuth redirect on port {}", port);

        let code = tokio::time::timeout(
            self.consent_timeout,
            wait_for_code(&listener, &state),
        )
        .await
        .map_err(|_| BridgeError::AuthTimeout)??;

        let resp = self
            .http
            .post(&self.token_endpoint)
            .form(&[
                ("code", code.as_str()),
                ("client_id", CLIENT_ID),
                ("client_secret", CLIENT_SECRET),
                ("redirect_uri", redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| BridgeError::AuthFailed(e.to_string()))?;

        if !resp.status().is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(BridgeError::AuthFailed(body.chars().take(300).collect()));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| BridgeError::AuthFailed(e.to_string()))?;
        let cred = token.into_credential(None);
        self.store.save(&cred)?;
        info!("Authentication complete, credential cached");
        Ok(cred)
    }
}

/// Accept connections until one carries the authorization code. Browsers
/// also fetch favicons and may retry; everything gets a response so the tab
/// does not hang.
async fn wait_for_code(listener: &TcpListener, expected_state: &str) -> Result<String, BridgeError> {
    loop {
        let (stream, _) = listener.accept().await?;
        let mut stream = BufReader::new(stream);
        let mut request_line = String::new();
        stream.read_line(&mut request_line).await?;

        let response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            CONSENT_PAGE.len(),
            CONSENT_PAGE
        );

        match parse_redirect(&request_line) {
            Some(RedirectParams { code: Some(code), state, error: None }) => {
                stream.get_mut().write_all(response.as_bytes()).await?;
                if state.as_deref() != Some(expected_state) {
                    return Err(BridgeError::AuthFailed(
                        "state mismatch in OAuth redirect".into(),
                    ));
                }
                return Ok(code);
            }
            Some(RedirectParams { error: Some(error), .. }) => {
                stream.get_mut().write_all(response.as_bytes()).await?;
                return Err(BridgeError::AuthFailed(error));
            }
            _ => {
                // Not the redirect (favicon etc.), respond and keep waiting.
                stream.get_mut().write_all(response.as_bytes()).await?;
            }
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct RedirectParams {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
}

/// Pull `code`/`state`/`error` out of the request line of the redirect,
/// e.g. `GET /?state=abc&code=4%2F0Axyz HTTP/1.1`.
fn parse_redirect(request_line: &str) -> Option<RedirectParams> {
    let target = request_line.split_whitespace().nth(1)?;
    let query = target.split_once('?')?.1;

    let mut params = RedirectParams::default();
    for pair in query.split('&') {
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        let value = percent_decode(value);
        match key {
            "code" => params.code = Some(value),
            "state" => params.state = Some(value),
            "error" => params.error = Some(value),
            _ => {}
        }
    }
    Some(params)
}

fn percent_decode(s: &str) -> String {
    let bytes = s.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' => {
                let hex = bytes.get(i + 1..i + 3).and_then(|h| {
                    std::str::from_utf8(h)
                        .ok()
                        .and_then(|h| u8::from_str_radix(h, 16).ok())
                });
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn percent_encode(s: &str) -> String {
    let mut out = String::with_capacity(s.len() * 2);
    for b in s.bytes() {
        match b {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(b as char)
            }
            _ => out.push_str(&format!("%{b:02X}")),
        }
    }
    out
}
