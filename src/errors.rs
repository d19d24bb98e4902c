//! Structured error types.
//!
//! Uses thiserror for ergonomic error definitions. Per the error-handling
//! design, these are caught and logged at each component's boundary; they
//! never propagate into StateManager, whose public methods are infallible.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("missing required field: {0}")]
    MissingField(&'static str),
    #[error("git command timed out after {0:?}")]
    GitTimeout(std::time::Duration),
    #[error("git command failed: {0}")]
    GitFailed(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum WatcherError {
    #[error("failed to watch {path}: {source}")]
    Watch {
        path: std::path::PathBuf,
        #[source]
        source: notify::Error,
    },
    #[error("io error reading {path}: {source}")]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Error, Debug)]
pub enum HookError {
    #[error("empty session_id")]
    EmptySessionId,
    #[error("unknown hook event name: {0}")]
    UnknownEvent(String),
}
