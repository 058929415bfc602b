//! Credential Store
//!
//! Persists the OAuth2 token pair to a single local file. The file is the
//! only durable state this server owns: it is written atomically, readable
//! only by the owning user, and a corrupt or unreadable file is treated as
//! "no credential" so the worst case is a fresh consent flow.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{debug, warn};

use crate::error::BridgeError;

/// Token must have at least this much validity left to be handed out.
pub const VALIDITY_MARGIN_SECS: i64 = 60;

/// OAuth2 token pair plus metadata, as cached on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credential {
    /// Bearer token for Colab API requests
    pub access_token: String,
    /// Long-lived token used to mint new access tokens
    pub refresh_token: String,
    /// Absolute unix timestamp when the access token expires
    pub expiry: i64,
    /// Scopes granted at consent time
    pub scopes: Vec<String>,
}

impl Credential {
    /// Build a credential from a token response, stamping the expiry.
    pub fn new(
        access_token: String,
        refresh_token: String,
        expires_in: i64,
        scopes: Vec<String>,
    ) -> Self {
        let expiry = chrono::Utc::now().timestamp().saturating_add(expires_in);
        Self {
            access_token,
            refresh_token,
            expiry,
            scopes,
        }
    }

    /// Usable without a refresh: expiry is at least the margin away.
    pub fn is_valid(&self) -> bool {
        self.remaining_seconds() >= VALIDITY_MARGIN_SECS
    }

    /// Remaining validity in seconds (0 if already expired).
    pub fn remaining_seconds(&self) -> i64 {
        self.expiry
            .saturating_sub(chrono::Utc::now().timestamp())
            .max(0)
    }
}

/// File-backed store for the single credential this process owns.
pub struct CredentialStore {
    path: PathBuf,
}

impl CredentialStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Load the cached credential.
    ///
    /// Any failure to read or parse the file is downgraded to `None`: the
    /// caller re-authenticates instead of crashing on a stale cache.
    pub fn load(&self) -> Option<Credential> {
        let data = match std::fs::read_to_string(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("Token cache unreadable ({}), re-authenticating", e);
                return None;
            }
        };

        match serde_json::from_str(&data) {
            Ok(cred) => Some(cred),
            Err(e) => {
                warn!("Token cache corrupt ({}), re-authenticating", e);
                None
            }
        }
    }

    /// Persist the credential, atomically and owner-readable only.
    pub fn save(&self, cred: &Credential) -> Result<(), BridgeError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let data = serde_json::to_string_pretty(cred)
            .map_err(|e| BridgeError::LocalIo(std::io::Error::other(e)))?;

        // Write via temp file + rename so a crash never leaves a torn token
        // file; the old credential stays valid until the new one is complete.
        let temp_path = self.path.with_extension("tmp");
        std::fs::write(&temp_path, &data)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&temp_path, std::fs::Permissions::from_mode(0o600))?;
        }

        std::fs::rename(&temp_path, &self.path)?;
        debug!("Token cache written to {}", self.path.display());
        Ok(())
    }

    /// Drop the cached credential (used when a refresh token is revoked).
    pub fn clear(&self) -> Result<(), BridgeError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}
