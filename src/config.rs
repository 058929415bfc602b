//! Configuration management

use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;

/// Policy when a second tool call wants an accelerator whose session is
/// currently executing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusyPolicy {
    /// Wait for the in-flight execution to finish, then reuse the session.
    Queue,
    /// Fail immediately with `SessionBusy`.
    Reject,
}

/// Server configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Path of the OAuth token cache file
    pub token_path: PathBuf,

    /// How long to wait for the browser consent redirect
    pub consent_timeout: Duration,

    /// Ceiling on runtime provisioning (allocation + kernel readiness)
    pub session_create_timeout: Duration,

    /// Default execution timeout when the caller does not pass one
    pub default_exec_timeout: Duration,

    /// Interval between runtime keep-alive pings
    pub keepalive_interval: Duration,

    /// Behavior when the requested accelerator's session is in use
    pub busy_policy: BusyPolicy,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let token_path = std::env::var("COLAB_EXEC_TOKEN_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::config_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("colab-exec")
                    .join("token.json")
            });

        let consent_timeout = env_secs("COLAB_EXEC_CONSENT_TIMEOUT", 120);
        let session_create_timeout = env_secs("COLAB_EXEC_SESSION_TIMEOUT", 180);
        let default_exec_timeout = env_secs("COLAB_EXEC_DEFAULT_TIMEOUT", 300);
        let keepalive_interval = env_secs("COLAB_EXEC_KEEPALIVE_INTERVAL", 60);

        let busy_policy = match std::env::var("COLAB_EXEC_BUSY_POLICY").as_deref() {
            Ok("reject") => BusyPolicy::Reject,
            _ => BusyPolicy::Queue,
        };

        Ok(Self {
            token_path,
            consent_timeout,
            session_create_timeout,
            default_exec_timeout,
            keepalive_interval,
            busy_policy,
        })
    }
}

fn env_secs(var: &str, default: u64) -> Duration {
    Duration::from_secs(
        std::env::var(var)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default),
    )
}
