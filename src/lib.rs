//! Colab Exec MCP Server
//!
//! All-Rust Model Context Protocol server that runs Python code on Google
//! Colab GPU runtimes.
//!
//! # Features
//!
//! - **MCP Protocol**: JSON-RPC 2.0 over stdio
//! - **OAuth2**: cached token file, silent refresh, browser consent fallback
//! - **Session Reuse**: one cached runtime per accelerator kind (T4/L4)
//! - **Structured Results**: per-cell stdout/stderr/error in submission order
//! - **Artifacts**: zip bundle download with path-traversal-safe extraction
//!
//! # Architecture
//!
//! ```text
//! MCP host ──► MCP Protocol ──► Tools ──► Dispatcher ──► Colab runtime
//!                (stdio)          │            │          (Jupyter WS)
//!                                 │            ├── SessionRegistry (T4/L4)
//!                                 │            │      └── AuthFlow ── token file
//!                                 │            └── Cells (wrap/parse)
//!                                 └── ArtifactRetriever (zip download)
//! ```

pub mod artifacts;
pub mod auth;
pub mod backoff;
pub mod cells;
pub mod colab;
pub mod config;
pub mod credentials;
pub mod error;
pub mod execute;
pub mod mcp;
pub mod session;
pub mod tools;

pub use artifacts::{extract_archive, ArtifactRetriever};
pub use auth::AuthFlow;
pub use colab::{Accelerator, ColabClient, ProxyInfo, RuntimeApi};
pub use config::{BusyPolicy, Config};
pub use credentials::{Credential, CredentialStore};
pub use error::BridgeError;
pub use execute::{CellOutput, Dispatcher, ExecutionRequest, ExecutionResult, ExecutionStatus};
pub use mcp::{McpRequest, McpResponse, McpServer};
pub use session::{ColabSession, SessionHandle, SessionRegistry, SessionState};
