//! CLI argument parsing.
//!
//! Uses clap derive macros with a global-flag-plus-subcommand shape.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

fn default_claude_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/.claude"),
        |dirs| dirs.home_dir().join(".claude"),
    )
}

/// Observability aggregation service for Claude Code agents
#[derive(Parser, Debug)]
#[command(name = "sentinel")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Port to bind the HTTP/WebSocket server on
    #[arg(long, env = "PORT", default_value_t = 3001, global = true)]
    pub port: u16,

    /// Bearer token required on inbound requests (omit to disable auth)
    #[arg(long, env = "AUTH_TOKEN", global = true)]
    pub auth_token: Option<String>,

    /// Root directory watched for teams/tasks/projects (default: ~/.claude)
    #[arg(long, env = "CLAUDE_CONFIG_DIR", default_value_os_t = default_claude_dir(), global = true)]
    pub claude_dir: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "RUST_LOG", default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the aggregation service (default when no subcommand is given)
    Serve,

    /// Post a single hook event JSON (read from stdin) to a running service.
    ///
    /// Thin client for manual testing without the real agent runtime attached.
    Hook {
        /// Base URL of the running service
        #[arg(long, default_value = "http://127.0.0.1:3001")]
        url: String,
    },
}
