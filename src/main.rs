//! Colab Exec MCP Server - Entry Point
//!
//! Runs as an MCP server over stdio. All logs go to stderr as JSON so
//! stdout stays reserved for protocol frames.

use colab_exec_mcp::{Config, McpServer};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment
    dotenvy::dotenv().ok();

    let args: Vec<String> = std::env::args().collect();
    if args.iter().any(|a| a == "--help" || a == "-h") {
        println!("Colab Exec MCP Server v{}", env!("CARGO_PKG_VERSION"));
        println!();
        println!("Usage: colab-exec-mcp");
        println!();
        println!("Runs as an MCP server (stdio). Environment variables:");
        println!("  COLAB_EXEC_TOKEN_PATH        OAuth token cache file");
        println!("  COLAB_EXEC_CONSENT_TIMEOUT   Browser consent wait, seconds (default: 120)");
        println!("  COLAB_EXEC_SESSION_TIMEOUT   Runtime provisioning ceiling, seconds (default: 180)");
        println!("  COLAB_EXEC_DEFAULT_TIMEOUT   Default execution timeout, seconds (default: 300)");
        println!("  COLAB_EXEC_BUSY_POLICY       queue | reject (default: queue)");
        println!("  RUST_LOG                     Log level (default: info)");
        return Ok(());
    }

    let log_level = std::env::var("RUST_LOG")
        .map(|s| match s.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        })
        .unwrap_or(Level::INFO);

    // Stdio carries the MCP protocol; log to stderr as JSON.
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .json()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Colab Exec MCP Server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    let server = McpServer::new(config);
    server.run().await?;

    Ok(())
}
