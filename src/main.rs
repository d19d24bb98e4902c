// Clippy configuration: enable pedantic but allow overly strict lints
#![allow(clippy::missing_errors_doc)] // Internal functions don't need # Errors docs
#![allow(clippy::missing_panics_doc)] // Internal functions don't need # Panics docs
#![allow(clippy::must_use_candidate)] // Not all getters need #[must_use]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::doc_markdown)] // Don't require backticks around WezTerm, JSON, etc.
#![allow(clippy::too_many_lines)] // Some functions are naturally long
#![allow(clippy::struct_excessive_bools)] // Config structs can have multiple bool fields
#![allow(clippy::similar_names)]
#![allow(clippy::cast_possible_truncation)] // We're careful with our casts
#![allow(clippy::cast_sign_loss)] // Timestamp conversions are safe
#![allow(clippy::cast_precision_loss)] // Duration to f64 precision loss is acceptable
#![allow(clippy::significant_drop_tightening)] // Lock guard drops are intentional
#![allow(clippy::redundant_closure_for_method_calls)] // Sometimes closures are clearer
#![allow(clippy::if_not_else)] // Negative conditions can be clearer for early returns
#![allow(clippy::match_same_arms)] // Explicit arms are clearer than combined patterns
#![allow(clippy::single_match_else)] // match with else is fine for Result handling
#![allow(clippy::manual_let_else)] // if-let is clearer for multi-line error handling
#![allow(clippy::items_after_statements)] // Helper closures can be defined inline
#![allow(clippy::option_if_let_else)] // if-let is more readable for Option handling
#![allow(clippy::unnecessary_wraps)] // Some functions return Result for consistency
#![allow(clippy::needless_pass_by_value)] // PathBuf by value is fine for config loading
#![allow(clippy::trivially_copy_pass_by_ref)] // &self on Copy types follows Rust conventions
#![allow(clippy::cast_possible_wrap)] // Timestamp u64->i64 won't overflow until year 292 billion
#![allow(clippy::assigning_clones)] // .clone() is clearer than .clone_from() in most cases

//! sentinel - observability aggregation service for Claude Code agents
//!
//! Watches `~/.claude/{teams,tasks,projects}` and the hook event stream,
//! derives live agent/task/session state, and serves it over HTTP and
//! WebSocket for a separate dashboard client to render.
//!
//! Usage:
//!   sentinel                        # run the service (default)
//!   sentinel hook --url <base>      # forward one hook JSON payload from stdin

mod cli;
mod config;
mod errors;
mod gitprobe;
mod guard;
mod hook_client;
mod hooks;
mod model;
mod parsers;
mod server;
mod state;
mod watcher;

use clap::Parser;
use cli::{Cli, Commands};
use color_eyre::Result;
use config::AppConfig;
use gitprobe::TokioGitExecutor;
use hooks::HookHandler;
use server::AppState;
use state::StateManager;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use watcher::Watcher;

/// Get the log directory path
fn get_log_dir() -> PathBuf {
    directories::BaseDirs::new().map_or_else(
        || PathBuf::from("/tmp/sentinel/logs"),
        |dirs| dirs.cache_dir().join("sentinel").join("logs"),
    )
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Some(Commands::Hook { url }) = cli.command {
        return hook_client::post_hook_from_stdin(&url).await;
    }

    color_eyre::install()?;

    let log_dir = get_log_dir();
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = tracing_appender::rolling::daily(&log_dir, "sentinel.log");
    let (non_blocking, _guard) = tracing_appender::non_blocking(file_appender);

    let log_filter = format!("sentinel={}", cli.log_level);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_filter))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_writer(non_blocking),
        )
        .init();

    tracing::info!("Starting sentinel v{}", env!("CARGO_PKG_VERSION"));
    tracing::info!("Log directory: {:?}", log_dir);
    tracing::debug!("Watching: {:?}", cli.claude_dir);

    let config = AppConfig::from_cli(&cli);

    let state = StateManager::new();
    let executor: Arc<dyn gitprobe::GitExecutor> = Arc::new(TokioGitExecutor);
    let hooks = HookHandler::new(state.clone(), executor.clone());
    let watcher = Watcher::new(state.clone(), executor, &config);

    let cancel = CancellationToken::new();
    let watcher_cancel = cancel.clone();
    let watcher_for_task = watcher.clone();
    let watcher_handle = tokio::spawn(async move {
        if let Err(e) = watcher_for_task.start(watcher_cancel).await {
            tracing::error!("watcher stopped: {}", e);
        }
    });

    let app = server::router(AppState {
        state,
        hooks,
        auth_token: config.auth_token.clone(),
    });

    let addr = format!("127.0.0.1:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutting down");
            cancel.cancel();
        })
        .await?;

    watcher_handle.abort();
    Ok(())
}
