//! code-exec-daemon
//!
//! MCP server that runs untrusted code snippets in isolated, time-limited
//! workspaces. Configuration comes from `--config`, `RUNNER_CONFIG` and
//! `RUNNER_*` overrides.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use code_exec_daemon::{config::Config, events::TracingObserver, mcp, orchestrator::Orchestrator};

#[derive(Parser, Debug)]
#[command(name = "code-exec-daemon")]
#[command(about = "MCP server for isolated multi-language code execution")]
struct Args {
    /// Run in stdio mode (for MCP clients)
    #[arg(long)]
    stdio: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// JSON configuration file (overrides RUNNER_CONFIG)
    #[arg(long)]
    config: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging (stderr so stdout is free for MCP protocol)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    if !args.stdio {
        anyhow::bail!("Only --stdio mode is currently supported");
    }

    let config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    let orchestrator = Arc::new(
        Orchestrator::new(&config)
            .context("Failed to initialize execution engine")?
            .with_observer(Arc::new(TracingObserver)),
    );

    info!(
        languages = ?orchestrator.registry().profiles().map(|p| p.id.as_str()).collect::<Vec<_>>(),
        max_concurrent = config.limits.max_concurrent,
        workspace_root = %config.workspace.root.display(),
        "Loaded configuration"
    );

    if config.workspace.reclaim_stale {
        orchestrator.workspaces().reclaim_stale().await;
    }

    let served = mcp::serve_stdio(Arc::clone(&orchestrator)).await;

    orchestrator.shutdown().await;
    served
}
