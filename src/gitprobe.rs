//! Async git probing behind an injectable executor trait, matching a
//! shelling-out style but made async and bounded. Every invocation is
//! wrapped in a 3s timeout; status results are cached per-cwd for 30s.

use crate::errors::ParseError;
use async_trait::async_trait;
use once_cell::sync::Lazy;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};

const GIT_TIMEOUT: Duration = Duration::from_secs(3);
const STATUS_CACHE_TTL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GitStatus {
    pub ahead: u32,
    pub behind: u32,
    pub has_upstream: bool,
    pub is_dirty: bool,
}

#[derive(Debug, Clone, Default)]
pub struct GitWorktreeInfo {
    pub worktree: Option<String>,
}

/// Runs a git subprocess and returns its trimmed stdout. Implemented against
/// `tokio::process::Command` in production; swapped for a canned map in tests
/// so the core never shells out.
#[async_trait]
pub trait GitExecutor: Send + Sync {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, ParseError>;
}

pub struct TokioGitExecutor;

#[async_trait]
impl GitExecutor for TokioGitExecutor {
    async fn run(&self, cwd: &Path, args: &[&str]) -> Result<String, ParseError> {
        let fut = tokio::process::Command::new("git")
            .args(args)
            .current_dir(cwd)
            .output();

        let output = tokio::time::timeout(GIT_TIMEOUT, fut)
            .await
            .map_err(|_| ParseError::GitTimeout(GIT_TIMEOUT))??;

        if !output.status.success() {
            return Err(ParseError::GitFailed(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

struct CacheEntry {
    status: GitStatus,
    at: Instant,
}

static STATUS_CACHE: Lazy<Mutex<HashMap<PathBuf, CacheEntry>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

pub fn clear_git_status_cache(cwd: &Path) {
    STATUS_CACHE.lock().unwrap().remove(cwd);
}

/// Compares `--git-dir` with `--git-common-dir`; when they differ, this cwd
/// is a worktree and `git rev-parse --show-toplevel` names it.
pub async fn detect_git_worktree(
    executor: &dyn GitExecutor,
    cwd: &Path,
) -> GitWorktreeInfo {
    let git_dir = executor.run(cwd, &["rev-parse", "--git-dir"]).await.ok();
    let common_dir = executor
        .run(cwd, &["rev-parse", "--git-common-dir"])
        .await
        .ok();

    match (git_dir, common_dir) {
        (Some(gd), Some(cd)) if gd != cd => {
            let toplevel = executor
                .run(cwd, &["rev-parse", "--show-toplevel"])
                .await
                .ok();
            GitWorktreeInfo { worktree: toplevel }
        }
        _ => GitWorktreeInfo { worktree: None },
    }
}

/// Runs the upstream check, status, and ahead/behind count; returns a
/// 30s-cached result keyed by `cwd`. A cache hit skips all subprocess calls.
pub async fn detect_git_status(executor: &dyn GitExecutor, cwd: &Path) -> GitStatus {
    if let Some(entry) = STATUS_CACHE.lock().unwrap().get(cwd) {
        if entry.at.elapsed() < STATUS_CACHE_TTL {
            return entry.status.clone();
        }
    }

    let has_upstream = executor
        .run(cwd, &["rev-parse", "--verify", "@{u}"])
        .await
        .is_ok();

    let is_dirty = executor
        .run(cwd, &["status", "--porcelain"])
        .await
        .map(|out| !out.is_empty())
        .unwrap_or(false);

    let (ahead, behind) = if has_upstream {
        executor
            .run(
                cwd,
                &["rev-list", "--left-right", "--count", "@{u}...HEAD"],
            )
            .await
            .ok()
            .and_then(|out| {
                let mut parts = out.split_whitespace();
                let behind: u32 = parts.next()?.parse().ok()?;
                let ahead: u32 = parts.next()?.parse().ok()?;
                Some((ahead, behind))
            })
            .unwrap_or((0, 0))
    } else {
        (0, 0)
    };

    let status = GitStatus {
        ahead,
        behind,
        has_upstream,
        is_dirty,
    };

    STATUS_CACHE.lock().unwrap().insert(
        cwd.to_path_buf(),
        CacheEntry {
            status: status.clone(),
            at: Instant::now(),
        },
    );

    status
}

/// `git branch --show-current`, used to refresh a continued session's
/// possibly-stale JSONL-reported branch.
pub async fn detect_current_branch(executor: &dyn GitExecutor, cwd: &Path) -> Option<String> {
    executor
        .run(cwd, &["branch", "--show-current"])
        .await
        .ok()
        .filter(|s| !s.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::Mutex as AsyncMutex;

    struct FakeExecutor {
        responses: AsyncMutex<StdHashMap<String, Result<String, String>>>,
    }

    impl FakeExecutor {
        fn new(responses: Vec<(&str, Result<&str, &str>)>) -> Self {
            let map = responses
                .into_iter()
                .map(|(k, v)| {
                    (
                        k.to_string(),
                        v.map(str::to_string).map_err(str::to_string),
                    )
                })
                .collect();
            Self {
                responses: AsyncMutex::new(map),
            }
        }
    }

    #[async_trait]
    impl GitExecutor for FakeExecutor {
        async fn run(&self, _cwd: &Path, args: &[&str]) -> Result<String, ParseError> {
            let key = args.join(" ");
            let responses = self.responses.lock().await;
            match responses.get(&key) {
                Some(Ok(out)) => Ok(out.clone()),
                Some(Err(e)) => Err(ParseError::GitFailed(e.clone())),
                None => Err(ParseError::GitFailed(format!("unmocked: {key}"))),
            }
        }
    }

    #[tokio::test]
    async fn detect_worktree_when_dirs_differ() {
        let exec = FakeExecutor::new(vec![
            ("rev-parse --git-dir", Ok("/repo/.git/worktrees/feature")),
            ("rev-parse --git-common-dir", Ok("/repo/.git")),
            ("rev-parse --show-toplevel", Ok("/repo-worktrees/feature")),
        ]);
        let info = detect_git_worktree(&exec, Path::new("/repo-worktrees/feature")).await;
        assert_eq!(info.worktree.as_deref(), Some("/repo-worktrees/feature"));
    }

    #[tokio::test]
    async fn detect_worktree_none_when_dirs_match() {
        let exec = FakeExecutor::new(vec![
            ("rev-parse --git-dir", Ok(".git")),
            ("rev-parse --git-common-dir", Ok(".git")),
        ]);
        let info = detect_git_worktree(&exec, Path::new("/repo")).await;
        assert!(info.worktree.is_none());
    }

    #[tokio::test]
    async fn detect_status_parses_ahead_behind_and_caches() {
        let cwd = PathBuf::from("/tmp/test-repo-status-cache");
        clear_git_status_cache(&cwd);
        let exec = FakeExecutor::new(vec![
            ("rev-parse --verify @{u}", Ok("abc123")),
            ("status --porcelain", Ok(" M src/main.rs")),
            ("rev-list --left-right --count @{u}...HEAD", Ok("2\t5")),
        ]);
        let status = detect_git_status(&exec, &cwd).await;
        assert_eq!(status.behind, 2);
        assert_eq!(status.ahead, 5);
        assert!(status.has_upstream);
        assert!(status.is_dirty);

        let exec_unreachable = FakeExecutor::new(vec![]);
        let cached = detect_git_status(&exec_unreachable, &cwd).await;
        assert_eq!(cached, status);
    }

    #[tokio::test]
    async fn detect_status_no_upstream_skips_ahead_behind() {
        let cwd = PathBuf::from("/tmp/test-repo-no-upstream");
        clear_git_status_cache(&cwd);
        let exec = FakeExecutor::new(vec![
            ("rev-parse --verify @{u}", Err("no upstream")),
            ("status --porcelain", Ok("")),
        ]);
        let status = detect_git_status(&exec, &cwd).await;
        assert!(!status.has_upstream);
        assert!(!status.is_dirty);
        assert_eq!(status.ahead, 0);
        assert_eq!(status.behind, 0);
    }
}
