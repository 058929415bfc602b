//! Bridge error taxonomy
//!
//! Every failure a caller can see maps to one of these kinds, so the tool
//! layer can tell a retryable condition (quota, congestion) apart from one
//! that needs user action (re-consent).

use thiserror::Error;

/// Errors surfaced by the session and execution bridge.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("Timed out waiting for browser consent")]
    AuthTimeout,

    #[error("Authentication failed: {0}")]
    AuthFailed(String),

    #[error("Timed out waiting for the runtime to become ready")]
    SessionTimeout,

    #[error("A session for this accelerator is already in use")]
    SessionBusy,

    #[error("GPU quota exhausted: {0}")]
    QuotaExceeded(String),

    #[error("Remote service error (HTTP {status}): {message}")]
    Remote { status: u16, message: String },

    #[error("Artifact retrieval failed: {0}")]
    ArtifactRetrieval(String),

    #[error("Local I/O error: {0}")]
    LocalIo(#[from] std::io::Error),
}

impl BridgeError {
    /// Remote failure without a meaningful HTTP status (websocket drop,
    /// malformed body, connection reset).
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            status: 0,
            message: message.into(),
        }
    }

    /// Short actionable hint appended to tool error messages.
    pub fn advice(&self) -> &'static str {
        match self {
            Self::AuthTimeout => "Re-run the tool and complete the browser consent within the time limit.",
            Self::AuthFailed(_) => "Delete the local token file and authenticate again.",
            Self::SessionTimeout => "Colab is congested; retry in a few minutes.",
            Self::SessionBusy => "Another execution holds this accelerator; wait for it to finish.",
            Self::QuotaExceeded(_) => "GPU quota is exhausted; retry later or switch accounts.",
            Self::Remote { .. } => "Transient remote failure; retry. If it persists, Colab may have changed its API.",
            Self::ArtifactRetrieval(_) => "Execution output is intact; retry artifact collection.",
            Self::LocalIo(_) => "Check local disk space and permissions.",
        }
    }
}

impl From<reqwest::Error> for BridgeError {
    fn from(e: reqwest::Error) -> Self {
        Self::Remote {
            status: e.status().map(|s| s.as_u16()).unwrap_or(0),
            message: e.to_string(),
        }
    }
}
