//! code-exec-daemon library
//!
//! Runs untrusted snippets in many languages with bounded resources:
//! - Language registry built once from the built-in catalogue and configuration
//! - Orchestrator driving validation, admission, compile and run steps
//! - Process backend (own process group, capped output) and an in-process
//!   Rhai sandbox
//! - Concurrency limiter with a bounded FIFO queue
//! - Per-execution workspaces with deferred cleanup
//! - MCP server implementation using rmcp

pub mod backend;
pub mod config;
pub mod error;
pub mod events;
pub mod limiter;
pub mod mcp;
pub mod orchestrator;
pub mod registry;
pub mod result;
pub mod workspace;
